//! Signaling seam and the typed request layer on top of it.

pub mod protocol;
pub mod ws;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::{AppData, ConsumerParameters};
use crate::error::SignalingError;
use crate::rtp::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};

pub use protocol::{JoinRoomResponse, Method, ProducerInfo, ServerEvent};
pub use ws::WsSignalingClient;

/// Correlated request/response plus server events.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send `method` and wait for its correlated response payload.
    async fn request(&self, method: Method, data: Value) -> Result<Value, SignalingError>;

    /// Events received after this call.
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

/// Typed signaling for one room membership.
#[derive(Clone)]
pub struct Signaling {
    channel: Arc<dyn SignalingChannel>,
    room_id: String,
    peer_id: String,
}

impl Signaling {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        room_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            room_id: room_id.into(),
            peer_id: peer_id.into(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.channel.subscribe()
    }

    async fn call<Req, Resp>(&self, method: Method, request: &Req) -> Result<Resp, SignalingError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = self.call_raw(method, request).await?;
        serde_json::from_value(data).map_err(|source| SignalingError::Decode {
            method: method.to_string(),
            source,
        })
    }

    async fn call_raw<Req>(&self, method: Method, request: &Req) -> Result<Value, SignalingError>
    where
        Req: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(request)?;
        debug!(%method, room_id = %self.room_id, "signaling request");
        let data = self.channel.request(method, payload).await?;
        if let Some(reason) = protocol::error_reason(&data) {
            return Err(SignalingError::Rejected {
                method: method.to_string(),
                reason,
            });
        }
        Ok(data)
    }

    pub async fn join_room(&self) -> Result<JoinRoomResponse, SignalingError> {
        self.call(
            Method::JoinRoom,
            &protocol::JoinRoomRequest {
                room_id: &self.room_id,
                peer_id: &self.peer_id,
            },
        )
        .await
    }

    pub async fn leave_room(&self) -> Result<(), SignalingError> {
        self.call_raw(
            Method::LeaveRoom,
            &protocol::RoomScoped {
                room_id: &self.room_id,
                peer_id: &self.peer_id,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), SignalingError> {
        self.call_raw(
            Method::ConnectTransport,
            &protocol::ConnectTransportRequest {
                transport_id,
                dtls_parameters,
                room_id: &self.room_id,
                peer_id: &self.peer_id,
            },
        )
        .await
        .map(|_| ())
    }

    /// Returns the server-issued producer id.
    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
        app_data: &AppData,
    ) -> Result<String, SignalingError> {
        let response: protocol::ProduceResponse = self
            .call(
                Method::Produce,
                &protocol::ProduceRequest {
                    transport_id,
                    kind,
                    rtp_parameters,
                    room_id: &self.room_id,
                    peer_id: &self.peer_id,
                    app_data,
                },
            )
            .await?;
        Ok(response.into_producer_id())
    }

    pub async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerParameters, SignalingError> {
        let response: protocol::ConsumeResponse = self
            .call(
                Method::Consume,
                &protocol::ConsumeRequest {
                    transport_id,
                    producer_id,
                    room_id: &self.room_id,
                    peer_id: &self.peer_id,
                    rtp_capabilities,
                },
            )
            .await?;
        Ok(response.consumer_data)
    }
}
