use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportState::Closed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::New => write!(f, "new"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Failed => write!(f, "failed"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                TransportState::Failed
            }
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

/// Shared connection state of one transport. Clones observe the same state.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<TransportState>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(TransportState::New);
        Self {
            status: Arc::new(status),
        }
    }

    pub fn current(&self) -> TransportState {
        *self.status.borrow()
    }

    /// Closed is terminal: later updates are ignored.
    pub fn update_state(&self, state: TransportState) {
        self.status.send_if_modified(|current| {
            if current.is_closed() || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    pub fn update_peer_state(&self, state: RTCPeerConnectionState) {
        self.update_state(state.into());
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.status.subscribe()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
