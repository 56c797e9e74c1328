//! Session core error types.

/// Transport-level failures: refused, reset, timed out, or not open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("Transport is not open")]
    NotOpen,
}

/// Failures of a single correlated request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("Request {request_id} timed out")]
    Timeout { request_id: String },

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    /// Correlation id already in flight; the session is no longer trustworthy.
    #[error("Duplicate correlation id: {0}")]
    DuplicateId(String),

    #[error("Could not encode request: {0}")]
    Encode(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Precondition: the device has never been issued a token.
    #[error("Device has no token; pair it first")]
    MissingToken,

    #[error("Login rejected: {message}")]
    Rejected { message: String },

    #[error("Authorization denied on the device")]
    Denied,

    #[error(transparent)]
    Request(#[from] CorrelatorError),
}

impl AuthError {
    /// Failures caused by the transport rather than by the device's answer.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Errors surfaced to callers of the session and registry APIs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Request(#[from] CorrelatorError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Session for device {0} is not connected")]
    NotConnected(String),

    #[error("Reconnect attempts exhausted for device {0}")]
    MaxAttemptsExceeded(String),

    #[error("Unknown device: {0}")]
    DeviceNotFound(String),

    /// The session task has stopped (device removed or registry shut down).
    #[error("Session for device {0} has shut down")]
    SessionClosed(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl From<notibridge_core::Error> for SessionError {
    fn from(e: notibridge_core::Error) -> Self {
        Self::Store(e.to_string())
    }
}
