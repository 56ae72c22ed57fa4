//! Client-side orchestration for joining an SFU room: capability negotiation,
//! one send and one recv transport, local producers and remote consumers kept
//! in step with server events.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod device;
pub mod engine;
pub mod error;
pub mod media;
pub mod producer;
pub mod room;
pub mod rtp;
pub mod signaling;
pub mod sink;
pub mod transport;

pub use config::ClientConfig;
pub use consumer::{ConsumeOutcome, Consumer, ConsumerKey, ConsumerRegistry};
pub use device::{CapabilityNegotiator, Device};
pub use error::{Error, Result};
pub use producer::{Producer, ProducerRegistry, ProducerRole};
pub use room::{RoomSession, SessionState};
pub use sink::{ChannelSink, RenderEvent, RenderSink};
pub use transport::{RecvTransportHandle, SendTransportHandle, TransportManager};
