use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::{Roster, SessionState};
use crate::config::CaptureConfig;
use crate::consumer::{ConsumeOutcome, Consumer, ConsumerKey, ConsumerRegistry};
use crate::device::{CapabilityNegotiator, Device};
use crate::engine::MediaEngine;
use crate::error::{CapabilityError, Error, Result};
use crate::media::MediaSource;
use crate::producer::{Producer, ProducerRegistry, ProducerRole};
use crate::signaling::{ProducerInfo, ServerEvent, Signaling, SignalingChannel};
use crate::sink::RenderSink;
use crate::transport::{RecvTransportHandle, SendTransportHandle, TransportManager, TransportSnapshot};

/// Everything that exists only while a room is joined.
struct ActiveRoom {
    signaling: Signaling,
    device: Device,
    send: SendTransportHandle,
    recv: RecvTransportHandle,
}

struct SessionInner {
    peer_id: String,
    channel: Arc<dyn SignalingChannel>,
    engine: Arc<dyn MediaEngine>,
    source: Arc<dyn MediaSource>,
    sink: Arc<dyn RenderSink>,
    capture: CaptureConfig,
    state: watch::Sender<SessionState>,
    active: Mutex<Option<Arc<ActiveRoom>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    roster: Mutex<Roster>,
    producers: ProducerRegistry,
    consumers: ConsumerRegistry,
}

/// Client side of one room membership at a time.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<SessionInner>,
}

impl RoomSession {
    pub fn new(
        peer_id: impl Into<String>,
        channel: Arc<dyn SignalingChannel>,
        engine: Arc<dyn MediaEngine>,
        source: Arc<dyn MediaSource>,
        sink: Arc<dyn RenderSink>,
        capture: CaptureConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(SessionInner {
                peer_id: peer_id.into(),
                channel,
                engine,
                source,
                consumers: ConsumerRegistry::new(sink.clone()),
                sink,
                capture,
                state,
                active: Mutex::new(None),
                pump: Mutex::new(None),
                roster: Mutex::new(Roster::default()),
                producers: ProducerRegistry::new(),
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub async fn room_id(&self) -> Option<String> {
        self.active_room()
            .await
            .map(|room| room.signaling.room_id().to_owned())
    }

    pub async fn roster(&self) -> Vec<String> {
        self.inner.roster.lock().await.peers().to_vec()
    }

    pub async fn producers(&self) -> Vec<Producer> {
        self.inner.producers.producers().await
    }

    pub async fn consumers(&self) -> Vec<Consumer> {
        self.inner.consumers.consumers().await
    }

    /// Producer ids consumed from a remote peer.
    pub async fn peer_producers(&self, peer_id: &str) -> Vec<String> {
        self.inner.consumers.producers_of(peer_id).await
    }

    pub async fn device(&self) -> Option<Device> {
        self.active_room().await.map(|room| room.device.clone())
    }

    /// Send transport first, then recv. Empty when not in a room.
    pub async fn transports(&self) -> Vec<TransportSnapshot> {
        match self.active_room().await {
            Some(room) => vec![room.send.snapshot(), room.recv.snapshot()],
            None => Vec::new(),
        }
    }

    async fn active_room(&self) -> Option<Arc<ActiveRoom>> {
        self.inner.active.lock().await.clone()
    }

    async fn is_current(&self, room: &Arc<ActiveRoom>) -> bool {
        match self.inner.active.lock().await.as_ref() {
            Some(active) => Arc::ptr_eq(active, room),
            None => false,
        }
    }

    /// Move from `from` to `to`. Returns the observed state on mismatch.
    fn transition(&self, from: SessionState, to: SessionState) -> std::result::Result<(), SessionState> {
        let mut observed = from;
        let moved = self.inner.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                observed = *state;
                false
            }
        });
        if moved {
            debug!(peer_id = %self.inner.peer_id, %from, %to, "session state changed");
            Ok(())
        } else {
            Err(observed)
        }
    }

    fn set_state(&self, to: SessionState) {
        self.inner.state.send_replace(to);
    }

    /// Join `room_id`: negotiate, open both transports, publish the mic and
    /// consume everything already in the room. On failure nothing stays alive.
    pub async fn join(&self, room_id: &str) -> Result<()> {
        if room_id.trim().is_empty() {
            return Err(Error::EmptyRoomId);
        }
        self.transition(SessionState::Idle, SessionState::Joining)
            .map_err(|state| Error::InvalidState {
                operation: "join",
                state,
            })?;

        let signaling = Signaling::new(self.inner.channel.clone(), room_id, &self.inner.peer_id);
        info!(%room_id, peer_id = %self.inner.peer_id, "joining room");

        let mut accepted = false;
        match self.run_join(&signaling, &mut accepted).await {
            Ok(()) => {
                self.set_state(SessionState::Joined);
                {
                    let roster = self.inner.roster.lock().await;
                    self.inner.sink.on_roster_changed(roster.peers());
                }
                info!(%room_id, peer_id = %self.inner.peer_id, "joined room");
                Ok(())
            }
            Err(e) => {
                error!(%room_id, "join failed: {}", e);
                self.teardown(false).await;
                if accepted {
                    if let Err(leave_err) = signaling.leave_room().await {
                        debug!(%room_id, "leave-room after failed join: {}", leave_err);
                    }
                }
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    async fn run_join(&self, signaling: &Signaling, accepted: &mut bool) -> Result<()> {
        let response = signaling.join_room().await?;
        *accepted = true;
        self.inner
            .roster
            .lock()
            .await
            .reset(&self.inner.peer_id, response.peer_ids);

        let device = CapabilityNegotiator::new(self.inner.engine.native_capabilities())
            .negotiate(&response.router_capabilities)?;

        let manager = TransportManager::new(self.inner.engine.clone(), signaling.clone());
        let send = manager
            .create_send_transport(&device, response.send_transport_options)
            .await?;
        let recv = match manager
            .create_recv_transport(&device, response.recv_transport_options)
            .await
        {
            Ok(recv) => recv,
            Err(e) => {
                send.close().await;
                return Err(e.into());
            }
        };
        let room = Arc::new(ActiveRoom {
            signaling: signaling.clone(),
            device,
            send,
            recv,
        });
        *self.inner.active.lock().await = Some(room.clone());

        // Subscribed before the backfill; duplicates are absorbed by consumer keys.
        let events = signaling.subscribe();
        let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), events));
        *self.inner.pump.lock().await = Some(pump);

        self.produce(&room, ProducerRole::Mic).await?;

        for info in response.existing_producers {
            self.consume_remote(&room, info).await;
        }
        Ok(())
    }

    /// Leave the room. Teardown happens whatever the server answers.
    pub async fn leave(&self) {
        if let Err(state) = self.transition(SessionState::Joined, SessionState::Leaving) {
            debug!(%state, "leave ignored, session not joined");
            return;
        }
        if let Some(room) = self.active_room().await {
            if let Err(e) = room.signaling.leave_room().await {
                warn!(room_id = room.signaling.room_id(), "leave-room failed: {}", e);
            }
        }
        self.teardown(true).await;
        self.set_state(SessionState::Idle);
        info!(peer_id = %self.inner.peer_id, "left room");
    }

    async fn teardown(&self, publish_roster: bool) {
        let room = self.inner.active.lock().await.take();
        if let Some(pump) = self.inner.pump.lock().await.take() {
            pump.abort();
        }
        self.inner.consumers.remove_all().await;
        {
            let mut roster = self.inner.roster.lock().await;
            roster.clear();
            if publish_roster {
                self.inner.sink.on_roster_changed(roster.peers());
            }
        }
        self.inner.producers.remove_all().await;
        if let Some(room) = room {
            room.send.close().await;
            room.recv.close().await;
        }
    }

    pub async fn start_camera(&self) -> Result<Producer> {
        self.start_producer(ProducerRole::Camera).await
    }

    pub async fn stop_camera(&self) -> bool {
        self.stop_producer(ProducerRole::Camera).await
    }

    pub async fn start_screen_share(&self) -> Result<Producer> {
        self.start_producer(ProducerRole::Screen).await
    }

    pub async fn stop_screen_share(&self) -> bool {
        self.stop_producer(ProducerRole::Screen).await
    }

    /// Start (or restart) the producer for `role`. Requires a joined session.
    pub async fn start_producer(&self, role: ProducerRole) -> Result<Producer> {
        let state = self.state();
        let room = match (state, self.active_room().await) {
            (SessionState::Joined, Some(room)) => room,
            _ => {
                return Err(Error::InvalidState {
                    operation: "start producer",
                    state,
                })
            }
        };
        let producer = self.produce(&room, role).await?;
        if !self.is_current(&room).await {
            // Left while producing; do not outlive the room.
            self.inner.producers.remove_local_producer(role).await;
            return Err(Error::InvalidState {
                operation: "start producer",
                state: self.state(),
            });
        }
        Ok(producer)
    }

    pub async fn stop_producer(&self, role: ProducerRole) -> bool {
        self.inner.producers.remove_local_producer(role).await
    }

    async fn produce(&self, room: &ActiveRoom, role: ProducerRole) -> Result<Producer> {
        let kind = role.kind();
        if !room.device.can_produce(kind) {
            return Err(CapabilityError::CannotProduce(kind).into());
        }
        let constraints = match role {
            ProducerRole::Mic => None,
            ProducerRole::Camera => Some(&self.inner.capture.camera),
            ProducerRole::Screen => Some(&self.inner.capture.screen),
        };
        let track = self.inner.source.acquire(role, constraints).await?;
        match self
            .inner
            .producers
            .add_local_producer(&room.send, role, track.clone())
            .await
        {
            Ok(producer) => Ok(producer),
            Err(e) => {
                track.stop();
                Err(e)
            }
        }
    }

    /// Consume one remote producer. Failures are logged and do not end the session.
    async fn consume_remote(&self, room: &Arc<ActiveRoom>, info: ProducerInfo) {
        if info.peer_id == self.inner.peer_id {
            return;
        }
        let result = self
            .inner
            .consumers
            .consume(
                &room.recv,
                &room.signaling,
                &room.device,
                &info.peer_id,
                &info.producer_id,
                info.kind,
            )
            .await;
        match result {
            Ok(ConsumeOutcome::Consumed(consumer)) => {
                if !self.is_current(room).await {
                    // Only this room's consumer; a later room may hold the same key.
                    self.inner.consumers.remove_consumer(&consumer).await;
                }
            }
            Ok(ConsumeOutcome::Skipped) => {}
            Err(e) => warn!(peer_id = %info.peer_id, producer_id = %info.producer_id, "consume failed: {}", e),
        }
    }

    /// Reconcile one server event with local state.
    pub async fn handle_event(&self, event: ServerEvent) {
        let state = self.state();
        if !state.accepts_events() {
            debug!(%state, ?event, "dropping event outside a room");
            return;
        }
        let publish = state == SessionState::Joined;
        match event {
            ServerEvent::NewPeer { peer_id } => {
                let mut roster = self.inner.roster.lock().await;
                if roster.add(&self.inner.peer_id, peer_id.clone()) {
                    info!(%peer_id, "peer joined");
                    if publish {
                        self.inner.sink.on_roster_changed(roster.peers());
                    }
                }
            }
            ServerEvent::PeerLeft { peer_id } => {
                {
                    let mut roster = self.inner.roster.lock().await;
                    if roster.remove(&peer_id) {
                        info!(%peer_id, "peer left");
                        if publish {
                            self.inner.sink.on_roster_changed(roster.peers());
                        }
                    }
                }
                self.inner.consumers.remove_peer(&peer_id).await;
            }
            ServerEvent::NewProducer(info) => {
                let Some(room) = self.active_room().await else {
                    return;
                };
                debug!(peer_id = %info.peer_id, producer_id = %info.producer_id, kind = %info.kind, "new producer");
                let session = self.clone();
                tokio::spawn(async move {
                    session.consume_remote(&room, info).await;
                });
            }
            ServerEvent::ProducerClosed {
                producer_id,
                peer_id,
            } => {
                let key = ConsumerKey::new(peer_id, producer_id);
                if self.inner.consumers.remove(&key).await {
                    debug!(%key, "remote producer closed");
                }
            }
        }
    }
}

/// One task per joined room, dispatching events in arrival order.
async fn pump_events(session: Weak<SessionInner>, mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = session.upgrade() else {
                    break;
                };
                RoomSession { inner }.handle_event(event).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                error!(
                    skipped,
                    "event stream lagged, dropped events may leave producers unconsumed or stale peers in the roster"
                );
            }
            Err(RecvError::Closed) => {
                info!("signaling event stream ended");
                break;
            }
        }
    }
}
