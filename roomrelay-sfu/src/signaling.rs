//! Signaling message vocabulary
//!
//! Client frames carry a request id and one request; every request is answered
//! with exactly one response frame carrying the same id (unless the peer has
//! already disconnected). Push events share the same outbound stream.
//!
//! ```json
//! {"requestId": 7, "request": {"action": "createTransport", "direction": "recv"}}
//! {"type": "response", "requestId": 7, "ok": true, "data": {"id": "…", "iceParameters": {…}}}
//! {"type": "newProducer", "producerId": "…"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SfuError;
use crate::notifier::PeerEvent;
use crate::rtp::{
    DtlsParameters, IceCandidate, IceParameters, IceServer, MediaKind, RtpCapabilities,
    RtpParameters,
};
use crate::types::{ConsumerId, ProducerId, RoomId, TransportDirection, TransportId};

/// One inbound client frame
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    pub request_id: u64,
    pub request: ClientRequest,
}

impl ClientEnvelope {
    /// Best-effort request id of a frame that failed to parse
    #[must_use]
    pub fn salvage_request_id(raw: &str) -> u64 {
        serde_json::from_str::<serde_json::Value>(raw)
            .ok()
            .and_then(|v| v.get("requestId").and_then(serde_json::Value::as_u64))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    Join { room_id: RoomId },

    #[serde(rename_all = "camelCase")]
    CreateTransport { direction: TransportDirection },

    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        transport_id: Option<TransportId>,
    },

    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    ListProducers,

    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        transport_id: TransportId,
    },

    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
}

impl ClientRequest {
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::ListProducers => "listProducers",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resumeConsumer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    pub room_id: RoomId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportReply {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceReply {
    pub producer_id: ProducerId,
    /// Whether other peers in the room were already producing
    pub others_exist: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeReply {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Successful result of a request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Joined(JoinReply),
    Transport(TransportReply),
    Produced(ProduceReply),
    Producers(Vec<ProducerId>),
    Consumed(ConsumeReply),
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// One outbound server frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Reply>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    #[serde(rename_all = "camelCase")]
    NewProducer { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
}

impl ServerMessage {
    #[must_use]
    pub fn success(request_id: u64, reply: Reply) -> Self {
        Self::Response {
            request_id,
            ok: true,
            data: Some(reply),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(request_id: u64, err: &SfuError) -> Self {
        Self::Response {
            request_id,
            ok: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }

    /// Response to a frame that could not be parsed
    #[must_use]
    pub fn bad_request(request_id: u64, message: impl Into<String>) -> Self {
        Self::Response {
            request_id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: "badRequest".to_string(),
                message: message.into(),
            }),
        }
    }
}

impl From<PeerEvent> for ServerMessage {
    fn from(event: PeerEvent) -> Self {
        match event {
            PeerEvent::NewProducer { producer_id } => Self::NewProducer { producer_id },
            PeerEvent::ProducerClosed { producer_id } => Self::ProducerClosed { producer_id },
        }
    }
}
