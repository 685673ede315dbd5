//! RTP, ICE and DTLS parameter types exchanged with clients
//!
//! The relay never interprets most of these values; it hands them between the
//! client's local media stack and the media engine verbatim. They serialize to
//! the camelCase JSON understood by mediasoup-compatible clients. Only the
//! fields needed for codec matching are typed; the rest is carried as JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTCP feedback mechanism supported by a codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    pub fn new(kind: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameter: parameter.into(),
        }
    }
}

/// Codec supported by a router or a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Whether a negotiated codec can be served by this capability
    #[must_use]
    pub fn matches(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && (self.kind == MediaKind::Video || self.channels.unwrap_or(1) == codec.channels.unwrap_or(1))
    }

    #[must_use]
    pub fn is_rtx(&self) -> bool {
        is_rtx_mime(&self.mime_type)
    }
}

/// Capabilities of a router (what it accepts) or of a client (what it can decode)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// First capability able to carry the given codec
    #[must_use]
    pub fn find_codec(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|cap| cap.matches(codec))
    }
}

/// Codec negotiated for one RTP stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    #[must_use]
    pub fn is_rtx(&self) -> bool {
        is_rtx_mime(&self.mime_type)
    }
}

/// Full RTP send/receive parameters of a producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

impl RtpParameters {
    /// Media codecs, RTX excluded
    pub fn media_codecs(&self) -> impl Iterator<Item = &RtpCodecParameters> {
        self.codecs.iter().filter(|codec| !codec.is_rtx())
    }
}

fn is_rtx_mime(mime_type: &str) -> bool {
    mime_type
        .rsplit('/')
        .next()
        .is_some_and(|subtype| subtype.eq_ignore_ascii_case("rtx"))
}

/// ICE parameters of a server-side transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// ICE candidate gathered by a server-side transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters of either side of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// DTLS state of a transport as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// STUN/TURN server handed to browsers for their own ICE agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_capabilities() {
        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [
                {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2,
                 "preferredPayloadType": 100},
                {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000,
                 "rtcpFeedback": [{"type": "nack"}, {"type": "nack", "parameter": "pli"}]},
                {"kind": "video", "mimeType": "video/rtx", "clockRate": 90000,
                 "parameters": {"apt": 101}}
            ],
            "headerExtensions": []
        }))
        .unwrap();

        assert_eq!(caps.codecs.len(), 3);
        assert!(caps.codecs[2].is_rtx());
        assert_eq!(caps.codecs[1].rtcp_feedback[1].parameter, "pli");
    }

    #[test]
    fn test_codec_matching_is_case_insensitive() {
        let cap = RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: Some(101),
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        };
        let codec = RtpCodecParameters {
            mime_type: "video/vp8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        };
        assert!(cap.matches(&codec));

        let h264 = RtpCodecParameters {
            mime_type: "video/H264".to_string(),
            ..codec
        };
        assert!(!cap.matches(&h264));
    }

    #[test]
    fn test_rtp_parameters_keep_unknown_sections() {
        let params: RtpParameters = serde_json::from_value(json!({
            "mid": "0",
            "codecs": [{"mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2}],
            "encodings": [{"ssrc": 1111}],
            "rtcp": {"cname": "abc"}
        }))
        .unwrap();

        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["encodings"][0]["ssrc"], 1111);
        assert_eq!(value["rtcp"]["cname"], "abc");
        assert_eq!(params.media_codecs().count(), 1);
    }
}
