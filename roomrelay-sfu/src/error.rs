use thiserror::Error;

use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportDirection, TransportId};

/// Failures reported by a media engine implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Worker has died")]
    WorkerDead,

    #[error("Engine object closed: {0}")]
    Closed(String),

    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    #[error("Unsupported RTP parameters: {0}")]
    UnsupportedRtp(String),

    #[error("Invalid DTLS parameters: {0}")]
    InvalidDtls(String),

    #[error("Engine request failed: {0}")]
    Request(String),
}

/// Errors surfaced by the relay to a single requesting peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfuError {
    #[error("Peer {0} has not joined a room")]
    NotJoined(PeerId),

    #[error("Peer already joined room {0}")]
    AlreadyJoined(RoomId),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Maximum number of rooms reached")]
    RoomLimitReached,

    #[error("No {direction} transport found{}", .id.as_ref().map(|id| format!(" with id {id}")).unwrap_or_default())]
    TransportNotFound {
        direction: TransportDirection,
        id: Option<TransportId>,
    },

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Already producing {0}")]
    AlreadyProducing(String),

    #[error("Client RTP capabilities cannot consume producer {0}")]
    CannotConsume(ProducerId),

    #[error("Media engine unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),
}

impl SfuError {
    /// Stable machine-readable code sent to clients alongside the message
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotJoined(_) => "notJoined",
            Self::AlreadyJoined(_) => "alreadyJoined",
            Self::RoomNotFound(_) => "roomNotFound",
            Self::RoomFull(_) => "roomFull",
            Self::RoomLimitReached => "roomLimitReached",
            Self::TransportNotFound { .. } => "transportNotFound",
            Self::ProducerNotFound(_) => "producerNotFound",
            Self::ConsumerNotFound(_) => "consumerNotFound",
            Self::AlreadyProducing(_) => "alreadyProducing",
            Self::CannotConsume(_) => "cannotConsume",
            Self::WorkerUnavailable(_) => "workerUnavailable",
            Self::Engine(_) => "engineError",
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
