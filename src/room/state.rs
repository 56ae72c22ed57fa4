use serde::Serialize;
use std::fmt;

/// Lifecycle of a room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
}

impl SessionState {
    /// Whether server events are being reconciled.
    pub fn accepts_events(&self) -> bool {
        matches!(self, SessionState::Joining | SessionState::Joined)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// Known remote peers, in arrival order, never containing the local peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    peers: Vec<String>,
}

impl Roster {
    pub fn reset(&mut self, local_peer: &str, peer_ids: impl IntoIterator<Item = String>) {
        self.peers.clear();
        for peer_id in peer_ids {
            self.add(local_peer, peer_id);
        }
    }

    pub fn add(&mut self, local_peer: &str, peer_id: String) -> bool {
        if peer_id == local_peer || self.peers.contains(&peer_id) {
            return false;
        }
        self.peers.push(peer_id);
        true
    }

    pub fn remove(&mut self, peer_id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|id| id != peer_id);
        self.peers.len() != before
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }
}
