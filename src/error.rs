use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::consumer::ConsumerKey;
use crate::rtp::MediaKind;

/// Failure of a single signaling request or of the channel carrying it.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    Closed,
    #[error("request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("request `{method}` rejected: {reason}")]
    Rejected { method: String, reason: String },
    #[error("malformed `{method}` response: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),
}

/// The local media engine cannot satisfy the router.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("no codec offered by the router is supported locally")]
    NoCommonCodec,
    #[error("device cannot produce {0}")]
    CannotProduce(MediaKind),
}

#[derive(Debug, Error)]
pub enum TransportNegotiationError {
    #[error("connect handshake failed on transport {transport_id}: {reason}")]
    Connect { transport_id: String, reason: String },
    #[error("produce handshake failed on transport {transport_id}: {reason}")]
    Produce { transport_id: String, reason: String },
    #[error("transport {transport_id} is closed")]
    Closed { transport_id: String },
    #[error("media engine error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("consume of {key} rejected: {source}")]
    Rejected {
        key: ConsumerKey,
        #[source]
        source: SignalingError,
    },
    #[error("consume of {key} failed in the media engine: {source}")]
    Engine {
        key: ConsumerKey,
        #[source]
        source: EngineError,
    },
    #[error("consume of {key} cancelled by teardown")]
    Cancelled { key: ConsumerKey },
}

/// Failures raised by a [`crate::engine::MediaEngine`] implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("connect handshake rejected: {0}")]
    ConnectRejected(String),
    #[error("produce handshake rejected: {0}")]
    ProduceRejected(String),
    #[error("sdp error: {0}")]
    Sdp(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    TransportNegotiation(#[from] TransportNegotiationError),
    #[error(transparent)]
    Consume(#[from] ConsumeError),
    #[error("media capture failed: {0}")]
    Capture(String),
    #[error("track kind {track} does not match role {role}")]
    KindMismatch { role: String, track: MediaKind },
    #[error("room id must not be empty")]
    EmptyRoomId,
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::room::SessionState,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
