//! Media engine seam.
//!
//! The engine turns server transport options into live transports. Anything
//! that needs the signaling server (connect and produce handshakes) is
//! surfaced as a [`HandshakeRequest`] on the channel handed to
//! [`MediaEngine::create_transport`]; the engine parks until the continuation
//! is settled.

pub mod rtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::TransportState;
use crate::error::EngineError;
use crate::media::{LocalTrack, TrackRef};
use crate::producer::ProducerRole;
use crate::rtp::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Recv => write!(f, "recv"),
        }
    }
}

/// Correlation context attached to a produce request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    pub role: ProducerRole,
    pub correlation_id: String,
}

/// Server parameters for a consumer, as returned by `consume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParameters {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Success/failure pair for one handshake. Dropping it unsettled counts as failure.
pub struct Continuation<T> {
    tx: oneshot::Sender<Result<T, String>>,
}

impl<T> Continuation<T> {
    pub fn succeed(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail(self, reason: impl fmt::Display) {
        let _ = self.tx.send(Err(reason.to_string()));
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation").finish_non_exhaustive()
    }
}

pub type Settlement<T> = oneshot::Receiver<Result<T, String>>;

pub fn continuation<T>() -> (Continuation<T>, Settlement<T>) {
    let (tx, rx) = oneshot::channel();
    (Continuation { tx }, rx)
}

/// Wait for a continuation to be settled.
pub async fn settle<T>(settlement: Settlement<T>) -> Result<T, String> {
    settlement
        .await
        .unwrap_or_else(|_| Err("handshake abandoned without a response".to_owned()))
}

#[derive(Debug)]
pub enum HandshakeRequest {
    Connect {
        transport_id: String,
        dtls_parameters: DtlsParameters,
        reply: Continuation<()>,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
        reply: Continuation<String>,
    },
}

pub type HandshakeSink = mpsc::UnboundedSender<HandshakeRequest>;

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Codecs and header extensions the engine can handle.
    fn native_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
        capabilities: &RtpCapabilities,
        handshakes: HandshakeSink,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &str;

    fn direction(&self) -> TransportDirection;

    fn connection_state(&self) -> watch::Receiver<TransportState>;

    /// Send `track`. The first use of the transport runs the connect handshake.
    async fn produce(
        &self,
        track: LocalTrack,
        app_data: AppData,
    ) -> Result<Box<dyn EngineProducer>, EngineError>;

    /// Bind a receiver for a server-side consumer. Starts paused.
    async fn consume(
        &self,
        parameters: &ConsumerParameters,
    ) -> Result<Box<dyn EngineConsumer>, EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    async fn close(&self);
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> TrackRef;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_continuation_is_a_failure() {
        let (reply, settlement) = continuation::<()>();
        drop(reply);
        assert!(settle(settlement).await.is_err());
    }

    #[tokio::test]
    async fn continuation_carries_value_or_reason() {
        let (reply, settlement) = continuation::<String>();
        reply.succeed("producer-1".to_owned());
        assert_eq!(settle(settlement).await.unwrap(), "producer-1");

        let (reply, settlement) = continuation::<String>();
        reply.fail("router rejected rtp parameters");
        assert_eq!(
            settle(settlement).await.unwrap_err(),
            "router rejected rtp parameters"
        );
    }
}
