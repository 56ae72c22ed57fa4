use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::engine::{AppData, ConsumerParameters};
use crate::rtp::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions};

/// Requests the client issues to the SFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    JoinRoom,
    LeaveRoom,
    ConnectTransport,
    Produce,
    Consume,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::JoinRoom => "join-room",
            Method::LeaveRoom => "leave-room",
            Method::ConnectTransport => "connect-transport",
            Method::Produce => "produce",
            Method::Consume => "consume",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Request {
        id: u64,
        method: Method,
        #[serde(default)]
        data: Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        data: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
}

/// Server-pushed notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NewPeer { peer_id: String },
    PeerLeft { peer_id: String },
    NewProducer(ProducerInfo),
    ProducerClosed { producer_id: String, peer_id: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerPayload {
    peer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerClosedPayload {
    producer_id: String,
    peer_id: String,
}

impl ServerEvent {
    /// Decode a named event. `Ok(None)` for events the client does not handle.
    pub fn decode(event: &str, data: Value) -> Result<Option<Self>, serde_json::Error> {
        let event = match event {
            "new-peer" => {
                let p: PeerPayload = serde_json::from_value(data)?;
                ServerEvent::NewPeer { peer_id: p.peer_id }
            }
            "peer-left" => {
                let p: PeerPayload = serde_json::from_value(data)?;
                ServerEvent::PeerLeft { peer_id: p.peer_id }
            }
            "new-producer" => ServerEvent::NewProducer(serde_json::from_value(data)?),
            "producer-closed" => {
                let p: ProducerClosedPayload = serde_json::from_value(data)?;
                ServerEvent::ProducerClosed {
                    producer_id: p.producer_id,
                    peer_id: p.peer_id,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest<'a> {
    pub room_id: &'a str,
    pub peer_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub send_transport_options: TransportOptions,
    pub recv_transport_options: TransportOptions,
    #[serde(alias = "rtpCapabilities")]
    pub router_capabilities: RtpCapabilities,
    #[serde(default)]
    pub peer_ids: Vec<String>,
    #[serde(default)]
    pub existing_producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomScoped<'a> {
    pub room_id: &'a str,
    pub peer_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest<'a> {
    pub transport_id: &'a str,
    pub dtls_parameters: &'a DtlsParameters,
    pub room_id: &'a str,
    pub peer_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest<'a> {
    pub transport_id: &'a str,
    pub kind: MediaKind,
    pub rtp_parameters: &'a RtpParameters,
    pub room_id: &'a str,
    pub peer_id: &'a str,
    pub app_data: &'a AppData,
}

/// The produce ack comes as a bare id or wrapped in an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProduceResponse {
    Bare(String),
    #[serde(rename_all = "camelCase")]
    Keyed { producer_id: String },
    Id { id: String },
}

impl ProduceResponse {
    pub fn into_producer_id(self) -> String {
        match self {
            ProduceResponse::Bare(id)
            | ProduceResponse::Keyed { producer_id: id }
            | ProduceResponse::Id { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest<'a> {
    pub transport_id: &'a str,
    pub producer_id: &'a str,
    pub room_id: &'a str,
    pub peer_id: &'a str,
    pub rtp_capabilities: &'a RtpCapabilities,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub consumer_data: ConsumerParameters,
}

/// Reason carried by an error response, if any.
pub fn error_reason(data: &Value) -> Option<String> {
    match data.get("error")? {
        Value::Null => None,
        Value::String(reason) => Some(reason.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        ),
        other => Some(other.to_string()),
    }
}
