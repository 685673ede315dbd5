//! Process-wide codec set every router is created with

use serde_json::{json, Map};

use crate::rtp::{MediaKind, RtcpFeedback, RtpCodecCapability};

/// One audio codec and one video codec, negotiated once for every room
#[must_use]
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = Map::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), json!(1000));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
            rtcp_feedback: vec![
                RtcpFeedback::new("nack", ""),
                RtcpFeedback::new("nack", "pli"),
                RtcpFeedback::new("ccm", "fir"),
                RtcpFeedback::new("goog-remb", ""),
                RtcpFeedback::new("transport-cc", ""),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_codec_per_kind() {
        let codecs = media_codecs();
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs.iter().filter(|c| c.kind == MediaKind::Audio).count(), 1);
        assert_eq!(codecs.iter().filter(|c| c.kind == MediaKind::Video).count(), 1);
        assert_eq!(codecs[1].parameters["x-google-start-bitrate"], 1000);
    }
}
