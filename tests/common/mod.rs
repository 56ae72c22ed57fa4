//! In-memory signaling, media engine and media source for session tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify, Semaphore};

use sfu_client::connection::TransportState;
use sfu_client::engine::{
    continuation, settle, AppData, ConsumerParameters, EngineConsumer, EngineProducer,
    EngineTransport, HandshakeRequest, HandshakeSink, MediaEngine, TransportDirection,
};
use sfu_client::error::{EngineError, SignalingError};
use sfu_client::media::{LocalTrack, MediaSource, MediaTrack, TrackRef, VideoConstraints};
use sfu_client::rtp::{
    DtlsParameters, DtlsRole, MediaKind, RtpCapabilities, RtpParameters, TransportOptions,
};
use sfu_client::signaling::{Method, ProducerInfo, ServerEvent, SignalingChannel};
use sfu_client::sink::{ChannelSink, RenderEvent};
use sfu_client::config::CaptureConfig;
use sfu_client::{ProducerRole, RoomSession};

pub const LOCAL_PEER: &str = "peer1";

/// Give spawned consume work time to finish.
pub async fn settle_tasks() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn router_capabilities() -> Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000
            }
        ],
        "headerExtensions": []
    })
}

fn transport_options(id: &str) -> Value {
    json!({
        "id": id,
        "iceParameters": { "usernameFragment": format!("{}-ufrag", id), "password": "secret" },
        "iceCandidates": [{
            "foundation": "udpcandidate",
            "priority": 1076302079,
            "ip": "127.0.0.1",
            "protocol": "udp",
            "port": 40000,
            "type": "host"
        }],
        "dtlsParameters": {
            "role": "auto",
            "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }]
        }
    })
}

/// `existing` entries are (peer id, producer id, kind).
pub fn join_response(peer_ids: &[&str], existing: &[(&str, &str, &str)]) -> Value {
    let producers: Vec<Value> = existing
        .iter()
        .map(|(peer_id, producer_id, kind)| {
            json!({ "peerId": peer_id, "producerId": producer_id, "kind": kind })
        })
        .collect();
    json!({
        "sendTransportOptions": transport_options("send-transport"),
        "recvTransportOptions": transport_options("recv-transport"),
        "routerCapabilities": router_capabilities(),
        "peerIds": peer_ids,
        "existingProducers": producers
    })
}

pub fn new_producer(peer_id: &str, producer_id: &str, kind: MediaKind) -> ServerEvent {
    ServerEvent::NewProducer(ProducerInfo {
        producer_id: producer_id.to_owned(),
        peer_id: peer_id.to_owned(),
        kind,
    })
}

pub struct FakeSignaling {
    join_response: Mutex<Value>,
    requests: Mutex<Vec<(Method, Value)>>,
    overrides: Mutex<HashMap<Method, Value>>,
    triggers: Mutex<Vec<(Method, ServerEvent)>>,
    kinds: Mutex<HashMap<String, MediaKind>>,
    events: broadcast::Sender<ServerEvent>,
    next_id: AtomicU64,
}

impl FakeSignaling {
    pub fn new(join_response: Value) -> Arc<Self> {
        let mut kinds = HashMap::new();
        if let Some(existing) = join_response["existingProducers"].as_array() {
            for producer in existing {
                let kind = serde_json::from_value(producer["kind"].clone()).unwrap();
                kinds.insert(producer["producerId"].as_str().unwrap().to_owned(), kind);
            }
        }
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            join_response: Mutex::new(join_response),
            requests: Mutex::new(Vec::new()),
            overrides: Mutex::new(HashMap::new()),
            triggers: Mutex::new(Vec::new()),
            kinds: Mutex::new(kinds),
            events,
            next_id: AtomicU64::new(1),
        })
    }

    /// Answer every `method` request with `response` from now on.
    pub fn respond_with(&self, method: Method, response: Value) {
        self.overrides.lock().unwrap().insert(method, response);
    }

    /// Emit `event` once, when the next `method` request arrives.
    pub fn emit_on(&self, method: Method, event: ServerEvent) {
        self.remember(&event);
        self.triggers.lock().unwrap().push((method, event));
    }

    pub fn emit(&self, event: ServerEvent) {
        self.remember(&event);
        let _ = self.events.send(event);
    }

    fn remember(&self, event: &ServerEvent) {
        if let ServerEvent::NewProducer(info) = event {
            self.kinds
                .lock()
                .unwrap()
                .insert(info.producer_id.clone(), info.kind);
        }
    }

    pub fn requests(&self) -> Vec<(Method, Value)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| *m == method)
            .count()
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn request(&self, method: Method, data: Value) -> Result<Value, SignalingError> {
        self.requests.lock().unwrap().push((method, data.clone()));

        let fired: Vec<ServerEvent> = {
            let mut triggers = self.triggers.lock().unwrap();
            let (fire, keep): (Vec<_>, Vec<_>) = triggers.drain(..).partition(|(m, _)| *m == method);
            *triggers = keep;
            fire.into_iter().map(|(_, event)| event).collect()
        };
        for event in fired {
            let _ = self.events.send(event);
        }
        tokio::task::yield_now().await;

        if let Some(response) = self.overrides.lock().unwrap().get(&method) {
            return Ok(response.clone());
        }
        let response = match method {
            Method::JoinRoom => self.join_response.lock().unwrap().clone(),
            Method::LeaveRoom | Method::ConnectTransport => json!({}),
            Method::Produce => json!({ "producerId": format!("local-{}", self.next()) }),
            Method::Consume => {
                let producer_id = data["producerId"].as_str().unwrap_or_default().to_owned();
                let kind = self
                    .kinds
                    .lock()
                    .unwrap()
                    .get(&producer_id)
                    .copied()
                    .unwrap_or(MediaKind::Video);
                json!({
                    "consumerData": {
                        "id": format!("consumer-{}", self.next()),
                        "producerId": producer_id,
                        "kind": kind,
                        "rtpParameters": { "encodings": [{ "ssrc": 1000 + self.next() }] }
                    }
                })
            }
        };
        Ok(response)
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// Holds every request for one method until a permit is released.
pub struct Gate {
    method: Method,
    permits: Semaphore,
    arrived: Notify,
}

impl Gate {
    pub fn new(method: Method) -> Arc<Self> {
        Arc::new(Self {
            method,
            permits: Semaphore::new(0),
            arrived: Notify::new(),
        })
    }

    /// Wait until a gated request is parked.
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    pub fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }
}

pub struct GatedSignaling {
    inner: Arc<FakeSignaling>,
    gate: Arc<Gate>,
}

#[async_trait]
impl SignalingChannel for GatedSignaling {
    async fn request(&self, method: Method, data: Value) -> Result<Value, SignalingError> {
        if method == self.gate.method {
            self.gate.arrived.notify_one();
            self.gate
                .permits
                .acquire()
                .await
                .map_err(|_| SignalingError::Closed)?
                .forget();
        }
        self.inner.request(method, data).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.subscribe()
    }
}

#[derive(Default)]
pub struct EngineLog {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    closed_producers: Mutex<Vec<String>>,
    closed_consumers: Mutex<Vec<String>>,
    resumes: Mutex<HashMap<String, usize>>,
}

pub struct FakeEngine {
    log: Arc<EngineLog>,
    capabilities: RtpCapabilities,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(EngineLog::default()),
            capabilities: serde_json::from_value(router_capabilities()).unwrap(),
        })
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.log.transports.lock().unwrap().clone()
    }

    pub fn open_transports(&self) -> usize {
        self.transports().iter().filter(|t| !t.is_closed()).count()
    }

    pub fn closed_producers(&self) -> Vec<String> {
        self.log.closed_producers.lock().unwrap().clone()
    }

    pub fn closed_consumers(&self) -> Vec<String> {
        self.log.closed_consumers.lock().unwrap().clone()
    }

    pub fn resumes(&self, consumer_id: &str) -> usize {
        self.log
            .resumes
            .lock()
            .unwrap()
            .get(consumer_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn native_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
        _capabilities: &RtpCapabilities,
        handshakes: HandshakeSink,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        let (state, _) = watch::channel(TransportState::New);
        let transport = Arc::new(FakeTransport {
            id: options.id,
            direction,
            handshakes,
            dtls_parameters: options.dtls_parameters,
            connected: tokio::sync::Mutex::new(false),
            state,
            closed: AtomicBool::new(false),
            log: self.log.clone(),
        });
        self.log.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub struct FakeTransport {
    id: String,
    direction: TransportDirection,
    handshakes: HandshakeSink,
    dtls_parameters: DtlsParameters,
    connected: tokio::sync::Mutex<bool>,
    state: watch::Sender<TransportState>,
    closed: AtomicBool,
    log: Arc<EngineLog>,
}

impl FakeTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(());
        }
        self.state.send_replace(TransportState::Connecting);
        let (reply, settlement) = continuation();
        self.handshakes
            .send(HandshakeRequest::Connect {
                transport_id: self.id.clone(),
                dtls_parameters: DtlsParameters {
                    role: DtlsRole::Client,
                    fingerprints: self.dtls_parameters.fingerprints.clone(),
                },
                reply,
            })
            .map_err(|_| EngineError::Closed)?;
        if let Err(reason) = settle(settlement).await {
            self.state.send_replace(TransportState::Failed);
            return Err(EngineError::ConnectRejected(reason));
        }
        self.state.send_replace(TransportState::Connected);
        *connected = true;
        Ok(())
    }
}

#[async_trait]
impl EngineTransport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn connection_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    async fn produce(
        &self,
        track: LocalTrack,
        app_data: AppData,
    ) -> Result<Box<dyn EngineProducer>, EngineError> {
        self.ensure_connected().await?;
        let (reply, settlement) = continuation();
        self.handshakes
            .send(HandshakeRequest::Produce {
                transport_id: self.id.clone(),
                kind: track.kind(),
                rtp_parameters: RtpParameters::default(),
                app_data,
                reply,
            })
            .map_err(|_| EngineError::Closed)?;
        let id = settle(settlement)
            .await
            .map_err(EngineError::ProduceRejected)?;
        Ok(Box::new(FakeProducer {
            id,
            kind: track.kind(),
            log: self.log.clone(),
        }))
    }

    async fn consume(
        &self,
        parameters: &ConsumerParameters,
    ) -> Result<Box<dyn EngineConsumer>, EngineError> {
        self.ensure_connected().await?;
        Ok(Box::new(FakeConsumer {
            id: parameters.id.clone(),
            producer_id: parameters.producer_id.clone(),
            kind: parameters.kind,
            ssrc: parameters.rtp_parameters.first_ssrc(),
            paused: AtomicBool::new(true),
            log: self.log.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.send_replace(TransportState::Closed);
    }
}

struct FakeProducer {
    id: String,
    kind: MediaKind,
    log: Arc<EngineLog>,
}

#[async_trait]
impl EngineProducer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        self.log.closed_producers.lock().unwrap().push(self.id.clone());
    }
}

struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    ssrc: Option<u32>,
    paused: AtomicBool,
    log: Arc<EngineLog>,
}

#[async_trait]
impl EngineConsumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> TrackRef {
        TrackRef {
            id: format!("track-{}", self.id),
            kind: self.kind,
            ssrc: self.ssrc,
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.paused.store(false, Ordering::SeqCst);
        *self
            .log
            .resumes
            .lock()
            .unwrap()
            .entry(self.id.clone())
            .or_default() += 1;
        Ok(())
    }

    async fn close(&self) {
        self.log.closed_consumers.lock().unwrap().push(self.id.clone());
    }
}

pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    ended: watch::Sender<bool>,
}

impl FakeTrack {
    pub fn is_stopped(&self) -> bool {
        *self.ended.borrow()
    }

    /// Simulate the capture side ending the track.
    pub fn end(&self) {
        self.ended.send_replace(true);
    }
}

impl fmt::Debug for FakeTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTrack").field("id", &self.id).finish()
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.ended.send_replace(true);
    }

    fn ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }
}

#[derive(Default)]
pub struct FakeSource {
    tracks: Mutex<Vec<(ProducerRole, Arc<FakeTrack>)>>,
    constraints: Mutex<Vec<Option<VideoConstraints>>>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tracks(&self, role: ProducerRole) -> Vec<Arc<FakeTrack>> {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, track)| track.clone())
            .collect()
    }

    pub fn constraints(&self) -> Vec<Option<VideoConstraints>> {
        self.constraints.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSource for FakeSource {
    async fn acquire(
        &self,
        role: ProducerRole,
        constraints: Option<&VideoConstraints>,
    ) -> sfu_client::Result<LocalTrack> {
        let mut tracks = self.tracks.lock().unwrap();
        let (ended, _) = watch::channel(false);
        let track = Arc::new(FakeTrack {
            id: format!("{}-track-{}", role, tracks.len() + 1),
            kind: role.kind(),
            ended,
        });
        tracks.push((role, track.clone()));
        self.constraints.lock().unwrap().push(constraints.copied());
        Ok(track)
    }
}

pub struct Harness {
    pub session: RoomSession,
    pub signaling: Arc<FakeSignaling>,
    pub engine: Arc<FakeEngine>,
    pub source: Arc<FakeSource>,
    pub render: tokio::sync::mpsc::UnboundedReceiver<RenderEvent>,
}

impl Harness {
    pub fn new(join_response: Value) -> Self {
        Self::build(join_response, None, CaptureConfig::default())
    }

    pub fn with_capture(join_response: Value, capture: CaptureConfig) -> Self {
        Self::build(join_response, None, capture)
    }

    /// Session whose `method` requests wait on the returned gate.
    pub fn gated(join_response: Value, method: Method) -> (Self, Arc<Gate>) {
        let gate = Gate::new(method);
        let harness = Self::build(join_response, Some(gate.clone()), CaptureConfig::default());
        (harness, gate)
    }

    fn build(join_response: Value, gate: Option<Arc<Gate>>, capture: CaptureConfig) -> Self {
        let signaling = FakeSignaling::new(join_response);
        let channel: Arc<dyn SignalingChannel> = match gate {
            Some(gate) => Arc::new(GatedSignaling {
                inner: signaling.clone(),
                gate,
            }) as Arc<dyn SignalingChannel>,
            None => signaling.clone() as Arc<dyn SignalingChannel>,
        };
        let engine = FakeEngine::new();
        let source = FakeSource::new();
        let (sink, render) = ChannelSink::new();
        let session = RoomSession::new(
            LOCAL_PEER,
            channel,
            engine.clone(),
            source.clone(),
            Arc::new(sink),
            capture,
        );
        Self {
            session,
            signaling,
            engine,
            source,
            render,
        }
    }

    pub fn drain_render(&mut self) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.render.try_recv() {
            events.push(event);
        }
        events
    }
}
