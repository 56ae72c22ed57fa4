//! Capability negotiation between the local media engine and the SFU router.

use std::collections::HashSet;
use tracing::{debug, info};

use crate::error::CapabilityError;
use crate::rtp::{MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability};

/// Capability snapshot for one session. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    router: RtpCapabilities,
    negotiated: RtpCapabilities,
}

impl Device {
    /// Capabilities sent with `consume` requests.
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.negotiated
    }

    pub fn router_capabilities(&self) -> &RtpCapabilities {
        &self.router
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.negotiated.media_codec(kind).is_some()
    }
}

pub struct CapabilityNegotiator {
    local: RtpCapabilities,
}

impl CapabilityNegotiator {
    pub fn new(local: RtpCapabilities) -> Self {
        Self { local }
    }

    /// Intersect router and local capabilities. Router payload types and
    /// parameters win; feedback is limited to what both sides know.
    pub fn negotiate(&self, router: &RtpCapabilities) -> Result<Device, CapabilityError> {
        let mut codecs: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|codec| !codec.is_rtx())
            .filter_map(|codec| {
                let local = self.local.codecs.iter().find(|l| codec_matches(l, codec))?;
                let mut codec = codec.clone();
                codec.rtcp_feedback = common_feedback(&codec.rtcp_feedback, &local.rtcp_feedback);
                Some(codec)
            })
            .collect();

        if codecs.is_empty() {
            return Err(CapabilityError::NoCommonCodec);
        }

        let kept: HashSet<u8> = codecs
            .iter()
            .filter_map(|c| c.preferred_payload_type)
            .collect();
        let rtx: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|c| c.is_rtx() && c.apt().map_or(false, |apt| kept.contains(&apt)))
            .cloned()
            .collect();
        codecs.extend(rtx);

        let header_extensions = router
            .header_extensions
            .iter()
            .filter(|ext| self.local.header_extensions.iter().any(|l| l.uri == ext.uri))
            .cloned()
            .collect();

        let negotiated = RtpCapabilities {
            codecs,
            header_extensions,
        };
        for codec in &negotiated.codecs {
            debug!(
                mime_type = %codec.mime_type,
                payload_type = ?codec.preferred_payload_type,
                "negotiated codec"
            );
        }
        info!(
            codecs = negotiated.codecs.len(),
            audio = negotiated.media_codec(MediaKind::Audio).is_some(),
            video = negotiated.media_codec(MediaKind::Video).is_some(),
            "device loaded"
        );

        Ok(Device {
            router: router.clone(),
            negotiated,
        })
    }
}

fn codec_matches(local: &RtpCodecCapability, remote: &RtpCodecCapability) -> bool {
    if local.kind != remote.kind
        || !local.mime_type.eq_ignore_ascii_case(&remote.mime_type)
        || local.clock_rate != remote.clock_rate
    {
        return false;
    }
    match local.kind {
        MediaKind::Audio => local.channels.unwrap_or(1) == remote.channels.unwrap_or(1),
        MediaKind::Video => true,
    }
}

fn common_feedback(remote: &[RtcpFeedback], local: &[RtcpFeedback]) -> Vec<RtcpFeedback> {
    if local.is_empty() {
        return remote.to_vec();
    }
    remote
        .iter()
        .filter(|fb| local.contains(fb))
        .cloned()
        .collect()
}
