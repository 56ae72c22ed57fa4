//! Local track acquisition seam and remote track references.
//!
//! Capturing from real devices is the job of whoever implements
//! [`MediaSource`]. The session only needs a track of a declared kind.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};
use crate::producer::ProducerRole;
use crate::rtp::MediaKind;

/// Handle to a local media track owned by the capture side.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Stop capturing. Idempotent.
    fn stop(&self);

    /// Flips to `true` once the track has ended, locally or at the source.
    fn ended(&self) -> watch::Receiver<bool>;

    /// The webrtc-rs track backing this handle, if any.
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

pub type LocalTrack = Arc<dyn MediaTrack>;

/// Reference to a remote track delivered by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    pub id: String,
    pub kind: MediaKind,
    pub ssrc: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub ideal: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: Range,
    pub height: Range,
    pub frame_rate: Range,
}

impl VideoConstraints {
    pub fn camera() -> Self {
        Self {
            width: Range { ideal: 640, max: 1280 },
            height: Range { ideal: 480, max: 720 },
            frame_rate: Range { ideal: 30, max: 60 },
        }
    }

    pub fn screen() -> Self {
        Self {
            width: Range { ideal: 1280, max: 1920 },
            height: Range { ideal: 720, max: 1080 },
            frame_rate: Range { ideal: 15, max: 30 },
        }
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a track for `role`. Video roles carry their constraints.
    async fn acquire(
        &self,
        role: ProducerRole,
        constraints: Option<&VideoConstraints>,
    ) -> Result<LocalTrack>;
}

/// Track backed by a webrtc-rs sample track. Media is written by the caller.
pub struct SampleTrack {
    track: Arc<TrackLocalStaticSample>,
    kind: MediaKind,
    ended: watch::Sender<bool>,
}

impl SampleTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let track_id = format!("{}-{:08x}", kind, rand::thread_rng().gen::<u32>());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track_id,
            stream_id.to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        Self { track, kind, ended }
    }

    /// Write side for whoever feeds encoded samples.
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

impl fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.track.id())
            .field("kind", &self.kind)
            .finish()
    }
}

impl MediaTrack for SampleTrack {
    fn id(&self) -> &str {
        self.track.id()
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

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
    }
}

/// Source that hands out fresh [`SampleTrack`]s per request.
pub struct SampleSource {
    stream_id: String,
}

impl SampleSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl MediaSource for SampleSource {
    async fn acquire(
        &self,
        role: ProducerRole,
        constraints: Option<&VideoConstraints>,
    ) -> Result<LocalTrack> {
        if role.kind() == MediaKind::Video && constraints.is_none() {
            return Err(Error::Capture(format!("{} requires video constraints", role)));
        }
        let track = SampleTrack::new(role.kind(), &self.stream_id);
        debug!(%role, track_id = track.id(), ?constraints, "acquired sample track");
        Ok(Arc::new(track))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sample_track_stop_signals_ended() {
        let source = SampleSource::new("stream-test");
        let track = source.acquire(ProducerRole::Mic, None).await.unwrap();
        assert_eq!(track.kind(), MediaKind::Audio);
        assert!(track.rtc_track().is_some());

        let mut ended = track.ended();
        track.stop();
        ended.changed().await.unwrap();
        assert!(*ended.borrow());
    }

    #[tokio::test]
    async fn video_roles_need_constraints() {
        let source = SampleSource::new("stream-test");
        assert!(source.acquire(ProducerRole::Camera, None).await.is_err());
        let camera = VideoConstraints::camera();
        let track = source
            .acquire(ProducerRole::Camera, Some(&camera))
            .await
            .unwrap();
        assert_eq!(track.kind(), MediaKind::Video);
    }
}
