use tokio::sync::mpsc;

use crate::consumer::ConsumerKey;
use crate::media::TrackRef;
use crate::rtp::MediaKind;

/// Presentation side of the session. Implementations must not block.
pub trait RenderSink: Send + Sync {
    fn on_consumer_added(&self, key: &ConsumerKey, kind: MediaKind, track: &TrackRef);

    fn on_consumer_removed(&self, key: &ConsumerKey);

    fn on_roster_changed(&self, peer_ids: &[String]);
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    ConsumerAdded {
        key: ConsumerKey,
        kind: MediaKind,
        track: TrackRef,
    },
    ConsumerRemoved {
        key: ConsumerKey,
    },
    RosterChanged(Vec<String>),
}

/// Forwards every callback as a [`RenderEvent`] on an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RenderEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RenderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: RenderEvent) {
        // Receiver gone means nobody is rendering anymore.
        let _ = self.tx.send(event);
    }
}

impl RenderSink for ChannelSink {
    fn on_consumer_added(&self, key: &ConsumerKey, kind: MediaKind, track: &TrackRef) {
        self.emit(RenderEvent::ConsumerAdded {
            key: key.clone(),
            kind,
            track: track.clone(),
        });
    }

    fn on_consumer_removed(&self, key: &ConsumerKey) {
        self.emit(RenderEvent::ConsumerRemoved { key: key.clone() });
    }

    fn on_roster_changed(&self, peer_ids: &[String]) {
        self.emit(RenderEvent::RosterChanged(peer_ids.to_vec()));
    }
}
