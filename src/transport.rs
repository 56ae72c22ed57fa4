//! Send/recv transport lifecycle and the signaling side of their handshakes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::TransportState;
use crate::device::Device;
use crate::engine::{
    AppData, ConsumerParameters, EngineConsumer, EngineProducer, EngineTransport,
    HandshakeRequest, MediaEngine, TransportDirection,
};
use crate::error::{EngineError, TransportNegotiationError};
use crate::media::LocalTrack;
use crate::rtp::TransportOptions;
use crate::signaling::Signaling;

/// Point-in-time view of one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub id: String,
    pub direction: TransportDirection,
    pub state: TransportState,
}

pub struct TransportManager {
    engine: Arc<dyn MediaEngine>,
    signaling: Signaling,
}

impl TransportManager {
    pub fn new(engine: Arc<dyn MediaEngine>, signaling: Signaling) -> Self {
        Self { engine, signaling }
    }

    pub async fn create_send_transport(
        &self,
        device: &Device,
        options: TransportOptions,
    ) -> Result<SendTransportHandle, TransportNegotiationError> {
        let handle = self.create(TransportDirection::Send, device, options).await?;
        Ok(SendTransportHandle(handle))
    }

    pub async fn create_recv_transport(
        &self,
        device: &Device,
        options: TransportOptions,
    ) -> Result<RecvTransportHandle, TransportNegotiationError> {
        let handle = self.create(TransportDirection::Recv, device, options).await?;
        Ok(RecvTransportHandle(handle))
    }

    async fn create(
        &self,
        direction: TransportDirection,
        device: &Device,
        options: TransportOptions,
    ) -> Result<TransportHandle, TransportNegotiationError> {
        let (handshakes, requests) = mpsc::unbounded_channel();
        let transport = self
            .engine
            .create_transport(direction, options, device.rtp_capabilities(), handshakes)
            .await?;
        let driver = tokio::spawn(drive_handshakes(self.signaling.clone(), requests));
        info!(
            transport_id = transport.id(),
            %direction,
            room_id = self.signaling.room_id(),
            "transport created"
        );
        Ok(TransportHandle {
            transport,
            driver,
            closed: AtomicBool::new(false),
        })
    }
}

/// Fulfils the engine's handshake continuations through signaling.
async fn drive_handshakes(
    signaling: Signaling,
    mut requests: mpsc::UnboundedReceiver<HandshakeRequest>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            HandshakeRequest::Connect {
                transport_id,
                dtls_parameters,
                reply,
            } => match signaling
                .connect_transport(&transport_id, &dtls_parameters)
                .await
            {
                Ok(()) => {
                    info!(%transport_id, "transport connected");
                    reply.succeed(());
                }
                Err(e) => {
                    warn!(%transport_id, "connect-transport failed: {}", e);
                    reply.fail(e);
                }
            },
            HandshakeRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
                reply,
            } => match signaling
                .produce(&transport_id, kind, &rtp_parameters, &app_data)
                .await
            {
                Ok(producer_id) => {
                    debug!(%transport_id, %producer_id, role = %app_data.role, "produce acknowledged");
                    reply.succeed(producer_id);
                }
                Err(e) => {
                    warn!(%transport_id, role = %app_data.role, "produce failed: {}", e);
                    reply.fail(e);
                }
            },
        }
    }
    debug!("handshake driver finished");
}

struct TransportHandle {
    transport: Arc<dyn EngineTransport>,
    driver: JoinHandle<()>,
    closed: AtomicBool,
}

impl TransportHandle {
    fn id(&self) -> &str {
        self.transport.id()
    }

    fn state(&self) -> TransportState {
        if self.is_closed() {
            return TransportState::Closed;
        }
        *self.transport.connection_state().borrow()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            id: self.id().to_owned(),
            direction: self.transport.direction(),
            state: self.state(),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportNegotiationError> {
        if self.is_closed() {
            return Err(TransportNegotiationError::Closed {
                transport_id: self.id().to_owned(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.driver.abort();
        self.transport.close().await;
        info!(transport_id = self.id(), direction = %self.transport.direction(), "transport closed");
    }

    fn negotiation_error(&self, error: EngineError) -> TransportNegotiationError {
        let transport_id = self.id().to_owned();
        match error {
            EngineError::ConnectRejected(reason) => {
                TransportNegotiationError::Connect { transport_id, reason }
            }
            EngineError::ProduceRejected(reason) => {
                TransportNegotiationError::Produce { transport_id, reason }
            }
            EngineError::Closed => TransportNegotiationError::Closed { transport_id },
            other => TransportNegotiationError::Engine(other),
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Outbound transport. Exactly one per joined room.
pub struct SendTransportHandle(TransportHandle);

impl SendTransportHandle {
    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn state(&self) -> TransportState {
        self.0.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.0.transport.connection_state()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        self.0.snapshot()
    }

    /// Runs the connect handshake on first use, then the produce handshake.
    pub async fn produce(
        &self,
        track: LocalTrack,
        app_data: AppData,
    ) -> Result<Box<dyn EngineProducer>, TransportNegotiationError> {
        self.0.ensure_open()?;
        self.0
            .transport
            .produce(track, app_data)
            .await
            .map_err(|e| self.0.negotiation_error(e))
    }

    pub async fn close(&self) {
        self.0.close().await
    }
}

/// Inbound transport. Exactly one per joined room.
pub struct RecvTransportHandle(TransportHandle);

impl RecvTransportHandle {
    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn state(&self) -> TransportState {
        self.0.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.0.transport.connection_state()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        self.0.snapshot()
    }

    pub async fn consume(
        &self,
        parameters: &ConsumerParameters,
    ) -> Result<Box<dyn EngineConsumer>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.0.transport.consume(parameters).await
    }

    pub async fn close(&self) {
        self.0.close().await
    }
}
