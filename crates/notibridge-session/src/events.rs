//! Observable session state.

use std::sync::Arc;

use serde::Serialize;

use notibridge_core::{Counts, Device, Notification};

/// Lifecycle state of one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never started.
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport open, login in flight.
    Authenticating,
    Connected,
    /// Not connected; a retry may be scheduled.
    Disconnected,
    /// Reconnect attempts exhausted; only a manual reconnect leaves this state.
    Failed,
}

impl ConnectionState {
    /// Connecting, authenticating, or connected.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating | Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a session's connection status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Most recent failure, cleared on a successful login.
    pub last_error: Option<String>,
    /// Retries scheduled since the last successful login.
    pub reconnect_attempt: u32,
    /// Delay of the currently scheduled retry.
    pub retry_in_ms: Option<u64>,
    /// Set by a manual disconnect; suppresses automatic reconnects.
    pub manual_disconnect: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            last_error: None,
            reconnect_attempt: 0,
            retry_in_ms: None,
            manual_disconnect: false,
        }
    }
}

/// Consistent snapshot of one device's notifications.
///
/// `visible` is always the filtered form of `notifications` under the rule
/// set that was current when the snapshot was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub device: String,
    pub notifications: Vec<Notification>,
    pub visible: Vec<Notification>,
    pub counts: Counts,
}

/// Change notification broadcast by the registry.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        device: String,
        status: SessionStatus,
    },
    ViewChanged {
        device: String,
        view: Arc<DeviceView>,
    },
    /// Persisted device record changed (token refresh, last-used time, edits).
    DeviceUpdated(Device),
    DeviceRemoved {
        device: String,
    },
}

impl SessionEvent {
    /// Uuid of the device this event concerns.
    pub fn device(&self) -> &str {
        match self {
            Self::StateChanged { device, .. }
            | Self::ViewChanged { device, .. }
            | Self::DeviceRemoved { device } => device,
            Self::DeviceUpdated(d) => &d.uuid,
        }
    }
}
