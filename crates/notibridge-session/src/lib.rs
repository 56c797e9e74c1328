//! NotiBridge session core.
//!
//! Maintains one authenticated duplex session per paired companion device,
//! correlates requests with responses, reconnects with backoff, and keeps
//! a filtered notification view per device.

pub mod auth;
pub mod correlator;
pub mod error;
pub mod events;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::{AuthError, CorrelatorError, SessionError, TransportError};
pub use events::{ConnectionState, DeviceView, SessionEvent, SessionStatus};
pub use reconnect::ReconnectPolicy;
pub use registry::SessionRegistry;
pub use session::SessionHandle;
pub use transport::{
    CloseReason, Connector, DefaultConnector, FrameSender, MemoryConnector, MemoryPeer,
    TransportEvent, TransportSession,
};
