//! [`MediaEngine`] built on webrtc-rs.
//!
//! The SFU speaks parameters (ICE, DTLS, RTP) while webrtc-rs speaks SDP, so
//! every transport is one `RTCPeerConnection` whose remote answer is
//! synthesized from the server's transport options.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MediaEngine as RtcMediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8,
};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::{
    continuation, settle, AppData, ConsumerParameters, EngineConsumer, EngineProducer,
    EngineTransport, HandshakeRequest, HandshakeSink, MediaEngine, TransportDirection,
};
use crate::connection::{ConnectionMonitor, TransportState};
use crate::error::EngineError;
use crate::media::{LocalTrack, TrackRef};
use crate::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension,
    RtpHeaderExtensionParameters, RtpParameters, TransportOptions,
};

const MID_EXTENSION_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
const MID_EXTENSION_ID: u16 = 1;

struct LocalCodec {
    kind: MediaKind,
    mime_type: &'static str,
    payload_type: u8,
    clock_rate: u32,
    channels: u16,
    fmtp: &'static str,
}

const LOCAL_CODECS: &[LocalCodec] = &[
    LocalCodec {
        kind: MediaKind::Audio,
        mime_type: MIME_TYPE_OPUS,
        payload_type: 111,
        clock_rate: 48000,
        channels: 2,
        fmtp: "minptime=10;useinbandfec=1",
    },
    LocalCodec {
        kind: MediaKind::Video,
        mime_type: MIME_TYPE_VP8,
        payload_type: 96,
        clock_rate: 90000,
        channels: 0,
        fmtp: "",
    },
    LocalCodec {
        kind: MediaKind::Video,
        mime_type: MIME_TYPE_H264,
        payload_type: 102,
        clock_rate: 90000,
        channels: 0,
        fmtp: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
    },
];

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn parse_fmtp(line: &str) -> Map<String, Value> {
    line.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| {
            let value = value
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(value));
            (key.trim().to_owned(), value)
        })
        .collect()
}

pub struct RtcEngine {
    ice_servers: Vec<String>,
    remote_tracks: Arc<Mutex<HashMap<u32, Arc<TrackRemote>>>>,
}

impl RtcEngine {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            remote_tracks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remote webrtc-rs track behind a consumer, once media has started flowing.
    pub async fn remote_track(&self, track: &TrackRef) -> Option<Arc<TrackRemote>> {
        let ssrc = track.ssrc?;
        self.remote_tracks.lock().await.get(&ssrc).cloned()
    }

    fn rtc_media_engine(capabilities: &RtpCapabilities) -> Result<RtcMediaEngine, EngineError> {
        let mut media_engine = RtcMediaEngine::default();
        for codec in capabilities.codecs.iter().filter(|c| !c.is_rtx()) {
            let Some(payload_type) = codec.preferred_payload_type else {
                warn!(mime_type = %codec.mime_type, "skipping codec without payload type");
                continue;
            };
            media_engine.register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: codec.mime_type.clone(),
                        clock_rate: codec.clock_rate,
                        channels: codec.channels.unwrap_or(0),
                        sdp_fmtp_line: codec.fmtp_line(),
                        rtcp_feedback: vec![],
                    },
                    payload_type,
                    ..Default::default()
                },
                codec_type(codec.kind),
            )?;
        }

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            media_engine.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: MID_EXTENSION_URI.to_owned(),
                },
                kind,
                None,
            )?;
        }
        Ok(media_engine)
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    fn native_capabilities(&self) -> RtpCapabilities {
        let codecs = LOCAL_CODECS
            .iter()
            .map(|codec| RtpCodecCapability {
                kind: codec.kind,
                mime_type: codec.mime_type.to_owned(),
                preferred_payload_type: Some(codec.payload_type),
                clock_rate: codec.clock_rate,
                channels: (codec.channels > 0).then_some(codec.channels),
                parameters: parse_fmtp(codec.fmtp),
                rtcp_feedback: vec![],
            })
            .collect();
        let header_extensions = [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .map(|kind| RtpHeaderExtension {
                kind: Some(kind),
                uri: MID_EXTENSION_URI.to_owned(),
                preferred_id: Some(MID_EXTENSION_ID),
                direction: None,
            })
            .collect();
        RtpCapabilities {
            codecs,
            header_extensions,
        }
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
        capabilities: &RtpCapabilities,
        handshakes: HandshakeSink,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        debug!(transport_id = %options.id, %direction, "creating webrtc transport");

        let mut media_engine = Self::rtc_media_engine(capabilities)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let monitor = ConnectionMonitor::new();
        let state_monitor = monitor.clone();
        let transport_id = options.id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let monitor = state_monitor.clone();
                let transport_id = transport_id.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Failed => {
                            error!(%transport_id, "transport failed")
                        }
                        _ => debug!(%transport_id, %state, "transport state changed"),
                    }
                    monitor.update_peer_state(state);
                })
            },
        ));

        if direction == TransportDirection::Recv {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                let init = RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                };
                peer_connection
                    .add_transceiver_from_kind(kind, Some(init))
                    .await?;
            }

            let remote_tracks = self.remote_tracks.clone();
            peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                let remote_tracks = remote_tracks.clone();
                Box::pin(async move {
                    info!(
                        ssrc = track.ssrc(),
                        kind = %track.kind(),
                        "remote track started"
                    );
                    remote_tracks.lock().await.insert(track.ssrc(), track);
                })
            }));
        }

        Ok(Arc::new(RtcTransport {
            id: options.id.clone(),
            direction,
            peer_connection,
            options,
            codecs: capabilities.codecs.clone(),
            handshakes,
            monitor,
            connected: Mutex::new(false),
            remote: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RemoteSsrc {
    consumer_id: String,
    kind: MediaKind,
    ssrc: u32,
}

pub struct RtcTransport {
    id: String,
    direction: TransportDirection,
    peer_connection: Arc<RTCPeerConnection>,
    options: TransportOptions,
    codecs: Vec<RtpCodecCapability>,
    handshakes: HandshakeSink,
    monitor: ConnectionMonitor,
    /// Held for the duration of a negotiation; `true` once connected.
    connected: Mutex<bool>,
    remote: Arc<Mutex<Vec<RemoteSsrc>>>,
    closed: AtomicBool,
}

impl RtcTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Offer/answer round. The first round runs the connect handshake.
    async fn negotiate(&self, connected: &mut bool) -> Result<(), EngineError> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| EngineError::Sdp("no local description".to_owned()))?;

        if !*connected {
            self.monitor.update_state(TransportState::Connecting);
            let dtls_parameters = DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![extract_fingerprint(&local.sdp)?],
            };
            let (reply, settlement) = continuation();
            self.handshakes
                .send(HandshakeRequest::Connect {
                    transport_id: self.id.clone(),
                    dtls_parameters,
                    reply,
                })
                .map_err(|_| EngineError::Closed)?;
            if let Err(reason) = settle(settlement).await {
                self.monitor.update_state(TransportState::Failed);
                return Err(EngineError::ConnectRejected(reason));
            }
        }

        let remote = self.remote.lock().await.clone();
        let answer = remote_answer(&local.sdp, &self.options, self.direction, &self.codecs, &remote)?;
        self.peer_connection
            .set_remote_description(RTCSessionDescription::answer(answer)?)
            .await?;

        if !*connected {
            for candidate in &self.options.ice_candidates {
                self.peer_connection
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate: candidate.to_sdp_candidate(),
                        ..Default::default()
                    })
                    .await?;
            }
            *connected = true;
            debug!(transport_id = %self.id, "transport parameters applied");
        }
        Ok(())
    }

    fn codec_for(&self, kind: MediaKind) -> Result<&RtpCodecCapability, EngineError> {
        self.codecs
            .iter()
            .find(|c| c.kind == kind && !c.is_rtx())
            .ok_or_else(|| EngineError::Unsupported(format!("no negotiated {} codec", kind)))
    }
}

#[async_trait]
impl EngineTransport for RtcTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn connection_state(&self) -> watch::Receiver<TransportState> {
        self.monitor.subscribe()
    }

    async fn produce(
        &self,
        track: LocalTrack,
        app_data: AppData,
    ) -> Result<Box<dyn EngineProducer>, EngineError> {
        self.ensure_open()?;
        if self.direction != TransportDirection::Send {
            return Err(EngineError::Unsupported("produce on a recv transport".to_owned()));
        }
        let kind = track.kind();
        let codec = self.codec_for(kind)?.clone();
        let rtc_track = track.rtc_track().ok_or_else(|| {
            EngineError::Unsupported(format!("track {} has no webrtc backing", track.id()))
        })?;

        let sender = self.peer_connection.add_track(rtc_track).await?;
        let rtcp_sender = sender.clone();
        let transport_id = self.id.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_sender.read(&mut rtcp_buf).await {}
            debug!(%transport_id, "rtcp reader stopped");
        });

        let mut connected = self.connected.lock().await;
        if let Err(e) = self.negotiate(&mut connected).await {
            let _ = self.peer_connection.remove_track(&sender).await;
            return Err(e);
        }
        drop(connected);

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| EngineError::Sdp("no local description".to_owned()))?;
        let section = media_sections(&local.sdp)
            .into_iter()
            .find(|s| s.track_id.as_deref() == Some(track.id()))
            .ok_or_else(|| EngineError::Sdp(format!("track {} missing from offer", track.id())))?;

        let rtp_parameters = RtpParameters {
            mid: Some(section.mid),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or_default(),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            header_extensions: vec![RtpHeaderExtensionParameters {
                uri: MID_EXTENSION_URI.to_owned(),
                id: MID_EXTENSION_ID,
                encrypt: false,
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: section.ssrc,
                rid: None,
            }],
            rtcp: RtcpParameters {
                cname: section.cname,
                reduced_size: true,
            },
        };

        let (reply, settlement) = continuation();
        self.handshakes
            .send(HandshakeRequest::Produce {
                transport_id: self.id.clone(),
                kind,
                rtp_parameters,
                app_data,
                reply,
            })
            .map_err(|_| EngineError::Closed)?;

        match settle(settlement).await {
            Ok(id) => Ok(Box::new(RtcProducer {
                id,
                kind,
                peer_connection: self.peer_connection.clone(),
                sender,
                closed: AtomicBool::new(false),
            })),
            Err(reason) => {
                let _ = self.peer_connection.remove_track(&sender).await;
                Err(EngineError::ProduceRejected(reason))
            }
        }
    }

    async fn consume(
        &self,
        parameters: &ConsumerParameters,
    ) -> Result<Box<dyn EngineConsumer>, EngineError> {
        self.ensure_open()?;
        if self.direction != TransportDirection::Recv {
            return Err(EngineError::Unsupported("consume on a send transport".to_owned()));
        }
        let ssrc = parameters
            .rtp_parameters
            .first_ssrc()
            .ok_or_else(|| EngineError::Sdp(format!("consumer {} has no ssrc", parameters.id)))?;

        self.remote.lock().await.push(RemoteSsrc {
            consumer_id: parameters.id.clone(),
            kind: parameters.kind,
            ssrc,
        });

        let mut connected = self.connected.lock().await;
        if let Err(e) = self.negotiate(&mut connected).await {
            self.remote
                .lock()
                .await
                .retain(|r| r.consumer_id != parameters.id);
            return Err(e);
        }

        Ok(Box::new(RtcConsumer {
            id: parameters.id.clone(),
            producer_id: parameters.producer_id.clone(),
            kind: parameters.kind,
            track: TrackRef {
                id: parameters.id.clone(),
                kind: parameters.kind,
                ssrc: Some(ssrc),
            },
            paused: AtomicBool::new(true),
            remote: self.remote.clone(),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor.update_state(TransportState::Closed);
        if let Err(e) = self.peer_connection.close().await {
            warn!(transport_id = %self.id, "error closing peer connection: {}", e);
        }
        info!(transport_id = %self.id, "transport closed");
    }
}

pub struct RtcProducer {
    id: String,
    kind: MediaKind,
    peer_connection: Arc<RTCPeerConnection>,
    sender: Arc<RTCRtpSender>,
    closed: AtomicBool,
}

#[async_trait]
impl EngineProducer for RtcProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.peer_connection.remove_track(&self.sender).await {
            debug!(producer_id = %self.id, "remove_track on close: {}", e);
        }
    }
}

pub struct RtcConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track: TrackRef,
    paused: AtomicBool,
    remote: Arc<Mutex<Vec<RemoteSsrc>>>,
}

#[async_trait]
impl EngineConsumer for RtcConsumer {
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
        self.track.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        // The ssrc stays out of the next renegotiation.
        self.remote.lock().await.retain(|r| r.consumer_id != self.id);
    }
}

/// One `m=` section of a local offer.
#[derive(Debug, Clone, PartialEq)]
struct MediaSection {
    kind: String,
    mid: String,
    track_id: Option<String>,
    ssrc: Option<u32>,
    cname: Option<String>,
}

fn media_sections(sdp: &str) -> Vec<MediaSection> {
    let mut sections: Vec<MediaSection> = Vec::new();
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            sections.push(MediaSection {
                kind: rest.split_whitespace().next().unwrap_or_default().to_owned(),
                mid: String::new(),
                track_id: None,
                ssrc: None,
                cname: None,
            });
            continue;
        }
        let Some(section) = sections.last_mut() else {
            continue;
        };
        if let Some(mid) = line.strip_prefix("a=mid:") {
            section.mid = mid.trim().to_owned();
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            section.track_id = msid.split_whitespace().nth(1).map(str::to_owned);
        } else if let Some(ssrc_line) = line.strip_prefix("a=ssrc:") {
            let mut parts = ssrc_line.splitn(2, ' ');
            let ssrc = parts.next().and_then(|s| s.parse::<u32>().ok());
            if section.ssrc.is_none() {
                section.ssrc = ssrc;
            }
            if let Some(cname) = parts.next().and_then(|attr| attr.strip_prefix("cname:")) {
                section.cname.get_or_insert_with(|| cname.trim().to_owned());
            }
        }
    }
    sections
}

fn extract_fingerprint(sdp: &str) -> Result<DtlsFingerprint, EngineError> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("a=fingerprint:"))
        .and_then(|value| value.split_once(' '))
        .map(|(algorithm, value)| DtlsFingerprint {
            algorithm: algorithm.to_ascii_lowercase(),
            value: value.trim().to_owned(),
        })
        .ok_or_else(|| EngineError::Sdp("no fingerprint in local description".to_owned()))
}

/// Remote answer for `offer`, built from the server's transport options.
fn remote_answer(
    offer: &str,
    options: &TransportOptions,
    direction: TransportDirection,
    codecs: &[RtpCodecCapability],
    remote: &[RemoteSsrc],
) -> Result<String, EngineError> {
    // webrtc-rs only checks SHA-256.
    let fingerprint = options
        .dtls_parameters
        .fingerprints
        .iter()
        .find(|fp| fp.algorithm.eq_ignore_ascii_case("sha-256"))
        .ok_or_else(|| EngineError::Sdp("no sha-256 fingerprint from server".to_owned()))?;

    let setup = match options.dtls_parameters.role {
        DtlsRole::Client => "active",
        DtlsRole::Server | DtlsRole::Auto => "passive",
    };
    let media_direction = match direction {
        TransportDirection::Send => "recvonly",
        TransportDirection::Recv => "sendonly",
    };

    let sections = media_sections(offer);
    let mids: Vec<&str> = sections.iter().map(|s| s.mid.as_str()).collect();
    let ice = &options.ice_parameters;

    let mut sdp = format!(
        "v=0\r\n\
         o=- 0 0 IN IP4 0.0.0.0\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=group:BUNDLE {}\r\n",
        mids.join(" ")
    );
    if ice.ice_lite {
        sdp.push_str("a=ice-lite\r\n");
    }

    let mut ssrcs_written = [false, false];
    for section in &sections {
        let kind: MediaKind = section.kind.parse().map_err(EngineError::Sdp)?;
        let codec = codecs
            .iter()
            .find(|c| c.kind == kind && !c.is_rtx())
            .ok_or_else(|| EngineError::Sdp(format!("no negotiated {} codec", kind)))?;
        let payload_type = codec.preferred_payload_type.unwrap_or_default();
        let rtpmap = match codec.channels {
            Some(channels) if channels > 1 => {
                format!("{}/{}/{}", codec.codec_name(), codec.clock_rate, channels)
            }
            _ => format!("{}/{}", codec.codec_name(), codec.clock_rate),
        };

        sdp.push_str(&format!(
            "m={kind} 9 UDP/TLS/RTP/SAVPF {payload_type}\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=rtcp:9 IN IP4 0.0.0.0\r\n\
             a=rtcp-mux\r\n\
             a=mid:{mid}\r\n\
             a={media_direction}\r\n\
             a=ice-ufrag:{ufrag}\r\n\
             a=ice-pwd:{pwd}\r\n\
             a=rtpmap:{payload_type} {rtpmap}\r\n",
            mid = section.mid,
            ufrag = ice.username_fragment,
            pwd = ice.password,
        ));
        let fmtp = codec.fmtp_line();
        if !fmtp.is_empty() {
            sdp.push_str(&format!("a=fmtp:{payload_type} {fmtp}\r\n"));
        }
        sdp.push_str(&format!(
            "a=extmap:{MID_EXTENSION_ID} {MID_EXTENSION_URI}\r\n\
             a=fingerprint:{} {}\r\n\
             a=setup:{setup}\r\n",
            fingerprint.algorithm, fingerprint.value,
        ));

        // All consumers of a kind ride on the first section of that kind.
        let slot = match kind {
            MediaKind::Audio => 0,
            MediaKind::Video => 1,
        };
        if direction == TransportDirection::Recv && !ssrcs_written[slot] {
            for r in remote.iter().filter(|r| r.kind == kind) {
                sdp.push_str(&format!("a=ssrc:{} cname:{}\r\n", r.ssrc, r.consumer_id));
            }
            ssrcs_written[slot] = true;
        }
    }
    Ok(sdp)
}
