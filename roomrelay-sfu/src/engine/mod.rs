//! Media engine adapter boundary
//!
//! The relay never touches RTP itself. It drives an external media engine that
//! owns workers, routers, WebRTC transports, producers and consumers, and reacts
//! to the lifecycle events that engine emits. This module defines that boundary
//! as an object-safe trait family so the orchestration logic is engine-agnostic:
//!
//! - [`local::LocalEngine`]: in-process engine with the full lifecycle semantics
//!   and no packet forwarding. Default engine and the double used by tests.
//! - `mediasoup::MediasoupEngine` (feature `mediasoup`): adapter over the native
//!   mediasoup worker.
//!
//! Event hooks take boxed callbacks. Implementations must invoke them without
//! holding internal locks, since handlers call back into the engine.

pub mod local;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};

use crate::error::EngineError;
use crate::rtp::{
    DtlsParameters, DtlsState, IceCandidate, IceParameters, MediaKind, RtpCapabilities,
    RtpCodecCapability, RtpParameters,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId};

pub use local::LocalEngine;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// One-shot lifecycle callback
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Worker death callback, receives a human readable reason
pub type DeathCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Repeating DTLS state callback
pub type DtlsStateCallback = Arc<dyn Fn(DtlsState) + Send + Sync + 'static>;

/// Forget children that were dropped or already closed
pub(crate) fn prune<T>(children: &mut Vec<Weak<T>>, is_closed: impl Fn(&T) -> bool) {
    children.retain(|child| child.upgrade().is_some_and(|child| !is_closed(&*child)));
}

/// Worker log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
    Debug,
    #[default]
    Warn,
    Error,
    None,
}

/// Settings for the process-wide worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSettings {
    pub log_level: WorkerLogLevel,
}

/// Network binding options for WebRTC transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportListenOptions {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub port_range: Option<RangeInclusive<u16>>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

/// Entry point of a media engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>>;
}

/// A media worker able to host isolated routers
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> String;

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn MediaRouter>>;

    /// Invoked once if the worker terminates unexpectedly
    fn on_dead(&self, callback: DeathCallback);
}

/// Isolated routing context; one per room
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with the given capabilities can consume the producer
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &TransportListenOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>>;

    /// Close the router and everything created on it
    fn close(&self);

    fn closed(&self) -> bool;
}

/// ICE/DTLS secured media channel
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    /// Complete the DTLS handshake with the client's parameters
    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>>;

    fn on_dtls_state_change(&self, callback: DtlsStateCallback);

    /// Invoked once when the transport closes for any reason
    fn on_close(&self, callback: CloseCallback);

    fn close(&self);

    fn closed(&self) -> bool;
}

/// Inbound media track
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Invoked once if the producer's transport closes
    fn on_transport_close(&self, callback: CloseCallback);

    /// Close the producer; every consumer of it is notified by the engine
    fn close(&self);

    fn closed(&self) -> bool;
}

/// Outbound media track bound to one producer
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;

    /// Invoked once if the consumed producer closes
    fn on_producer_close(&self, callback: CloseCallback);

    /// Invoked once if the consumer's transport closes
    fn on_transport_close(&self, callback: CloseCallback);

    fn close(&self);

    fn closed(&self) -> bool;
}
