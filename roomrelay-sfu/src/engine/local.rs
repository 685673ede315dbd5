//! In-process media engine
//!
//! Implements the complete object lifecycle of a mediasoup-style engine
//! (workers, routers, transports, producers, consumers and their close
//! propagation) without moving any RTP. Useful for running the signaling layer
//! standalone and as the deterministic double behind the relay's tests.
//!
//! Close propagation follows the native engine:
//! - closing a router closes its transports
//! - closing a transport closes its producers and consumers
//! - closing a producer (directly or through its transport) notifies every
//!   consumer of it with a producer-close event

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    prune, CloseCallback, DeathCallback, DtlsStateCallback, EngineResult, MediaConsumer,
    MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker,
    TransportListenOptions, WorkerSettings,
};
use crate::error::EngineError;
use crate::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceParameters, MediaKind,
    Protocol, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId};

/// Engine-wide bookkeeping shared by every object
#[derive(Default)]
struct Registry {
    workers_created: AtomicUsize,
    routers_created: AtomicUsize,
    next_port: AtomicU32,
    workers: Mutex<Vec<Weak<LocalWorker>>>,
    routers: DashMap<RouterId, Weak<LocalRouter>>,
    transports: DashMap<TransportId, Weak<LocalTransport>>,
    producers: DashMap<ProducerId, Weak<LocalProducer>>,
    consumers: DashMap<ConsumerId, Weak<LocalConsumer>>,
}

/// In-process media engine
#[derive(Clone, Default)]
pub struct LocalEngine {
    registry: Arc<Registry>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers ever created
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.registry.workers_created.load(Ordering::SeqCst)
    }

    /// Number of routers ever created
    #[must_use]
    pub fn router_count(&self) -> usize {
        self.registry.routers_created.load(Ordering::SeqCst)
    }

    /// Number of routers currently open
    #[must_use]
    pub fn open_router_count(&self) -> usize {
        self.registry.routers.len()
    }

    #[must_use]
    pub fn router(&self, id: &RouterId) -> Option<Arc<LocalRouter>> {
        self.registry.routers.get(id).and_then(|r| r.upgrade())
    }

    #[must_use]
    pub fn transport(&self, id: &TransportId) -> Option<Arc<LocalTransport>> {
        self.registry.transports.get(id).and_then(|t| t.upgrade())
    }

    #[must_use]
    pub fn producer(&self, id: &ProducerId) -> Option<Arc<LocalProducer>> {
        self.registry.producers.get(id).and_then(|p| p.upgrade())
    }

    #[must_use]
    pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<LocalConsumer>> {
        self.registry.consumers.get(id).and_then(|c| c.upgrade())
    }

    /// Terminate every worker as if its process had crashed
    pub fn kill_workers(&self, reason: &str) {
        let workers: Vec<_> = self
            .registry
            .workers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for worker in workers {
            worker.kill(reason);
        }
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>> {
        let n = self.registry.workers_created.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = Arc::new(LocalWorker {
            id: format!("local-worker-{n}"),
            registry: Arc::clone(&self.registry),
            dead: AtomicBool::new(false),
            state: Mutex::new(WorkerState::default()),
        });
        self.registry.workers.lock().push(Arc::downgrade(&worker));
        debug!(worker_id = %worker.id, log_level = ?settings.log_level, "Local worker created");
        Ok(worker)
    }
}

#[derive(Default)]
struct WorkerState {
    on_dead: Vec<DeathCallback>,
    routers: Vec<Weak<LocalRouter>>,
}

pub struct LocalWorker {
    id: String,
    registry: Arc<Registry>,
    dead: AtomicBool,
    state: Mutex<WorkerState>,
}

impl LocalWorker {
    /// Simulate abnormal termination: routers close and death callbacks fire
    pub fn kill(&self, reason: &str) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        let (callbacks, routers) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.on_dead),
                std::mem::take(&mut state.routers),
            )
        };
        warn!(worker_id = %self.id, reason, "Local worker died");
        for router in routers.iter().filter_map(Weak::upgrade) {
            router.close();
        }
        for callback in callbacks {
            callback(reason.to_string());
        }
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaWorker for LocalWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn MediaRouter>> {
        if self.is_dead() {
            return Err(EngineError::WorkerDead);
        }

        let id = RouterId::new(Uuid::new_v4().to_string());
        let router = Arc::new_cyclic(|me| LocalRouter {
            id: id.clone(),
            me: me.clone(),
            registry: Arc::clone(&self.registry),
            capabilities: finalize_capabilities(media_codecs),
            closed: AtomicBool::new(false),
            producers: DashMap::new(),
            transports: Mutex::new(Vec::new()),
        });

        self.registry.routers_created.fetch_add(1, Ordering::SeqCst);
        self.registry.routers.insert(id, Arc::downgrade(&router));
        let mut state = self.state.lock();
        prune(&mut state.routers, LocalRouter::closed);
        state.routers.push(Arc::downgrade(&router));
        drop(state);
        Ok(router)
    }

    fn on_dead(&self, callback: DeathCallback) {
        if self.is_dead() {
            callback("worker already dead".to_string());
            return;
        }
        self.state.lock().on_dead.push(callback);
    }
}

/// Assign payload types and add an RTX codec per video codec, as a router does
fn finalize_capabilities(media_codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let mut next_payload_type: u8 = 100;
    let mut codecs = Vec::with_capacity(media_codecs.len() * 2);

    for codec in media_codecs {
        let payload_type = codec.preferred_payload_type.unwrap_or_else(|| {
            let pt = next_payload_type;
            next_payload_type += 1;
            pt
        });
        codecs.push(RtpCodecCapability {
            preferred_payload_type: Some(payload_type),
            ..codec.clone()
        });

        if codec.kind == MediaKind::Video {
            let mut parameters = Map::new();
            parameters.insert("apt".to_string(), json!(payload_type));
            codecs.push(RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/rtx".to_string(),
                preferred_payload_type: Some(next_payload_type),
                clock_rate: codec.clock_rate,
                channels: None,
                parameters,
                rtcp_feedback: Vec::new(),
            });
            next_payload_type += 1;
        }
    }

    RtpCapabilities {
        codecs,
        header_extensions: Vec::new(),
    }
}

pub struct LocalRouter {
    id: RouterId,
    me: Weak<LocalRouter>,
    registry: Arc<Registry>,
    capabilities: RtpCapabilities,
    closed: AtomicBool,
    producers: DashMap<ProducerId, Weak<LocalProducer>>,
    transports: Mutex<Vec<Weak<LocalTransport>>>,
}

impl LocalRouter {
    fn live_producer(&self, producer_id: &ProducerId) -> Option<Arc<LocalProducer>> {
        self.producers
            .get(producer_id)
            .and_then(|p| p.upgrade())
            .filter(|p| !p.is_closed())
    }

    fn next_port(&self, options: &TransportListenOptions) -> u16 {
        let n = self.registry.next_port.fetch_add(1, Ordering::SeqCst);
        match &options.port_range {
            Some(range) => {
                let span = u32::from(range.end().saturating_sub(*range.start())) + 1;
                // n % span < span <= u16::MAX + 1, so the sum stays within the range
                range.start() + u16::try_from(n % span).unwrap_or(0)
            }
            None => 10000 + u16::try_from(n % 50000).unwrap_or(0),
        }
    }
}

#[async_trait]
impl MediaRouter for LocalRouter {
    fn id(&self) -> RouterId {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.live_producer(producer_id) else {
            return false;
        };
        let compatible = producer
            .rtp_parameters
            .media_codecs()
            .any(|codec| rtp_capabilities.find_codec(codec).is_some());
        compatible
    }

    async fn create_webrtc_transport(
        &self,
        options: &TransportListenOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        if self.closed() {
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Request(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }
        let router = self
            .me
            .upgrade()
            .ok_or_else(|| EngineError::Closed(format!("router {}", self.id)))?;

        let address = options
            .announced_address
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());
        let port = self.next_port(options);
        let mut ice_candidates = Vec::new();
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (1_076_302_079, 1_076_276_479)
        } else {
            (1_076_276_479, 1_076_302_079)
        };
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                address: address.clone(),
                protocol: Protocol::Udp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                address,
                protocol: Protocol::Tcp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }

        let id = TransportId::new(Uuid::new_v4().to_string());
        let transport = Arc::new(LocalTransport {
            id: id.clone(),
            registry: Arc::clone(&self.registry),
            router,
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
            state: Mutex::new(TransportState::default()),
        });

        self.registry.transports.insert(id, Arc::downgrade(&transport));
        let mut transports = self.transports.lock();
        prune(&mut *transports, LocalTransport::closed);
        transports.push(Arc::downgrade(&transport));
        drop(transports);
        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.routers.remove(&self.id);
        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports.iter().filter_map(Weak::upgrade) {
            transport.close();
        }
        debug!(router_id = %self.id, "Local router closed");
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn random_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

struct TransportState {
    closed: bool,
    dtls_state: DtlsState,
    remote_dtls: Option<DtlsParameters>,
    next_mid: u32,
    dtls_callbacks: Vec<DtlsStateCallback>,
    close_callbacks: Vec<CloseCallback>,
    producers: Vec<Weak<LocalProducer>>,
    consumers: Vec<Weak<LocalConsumer>>,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            closed: false,
            dtls_state: DtlsState::New,
            remote_dtls: None,
            next_mid: 0,
            dtls_callbacks: Vec::new(),
            close_callbacks: Vec::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
        }
    }
}

pub struct LocalTransport {
    id: TransportId,
    registry: Arc<Registry>,
    router: Arc<LocalRouter>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    state: Mutex<TransportState>,
}

impl LocalTransport {
    #[must_use]
    pub fn dtls_state(&self) -> DtlsState {
        self.state.lock().dtls_state
    }

    /// Report a DTLS state transition to every registered listener
    pub fn set_dtls_state(&self, dtls_state: DtlsState) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.dtls_state = dtls_state;
            state.dtls_callbacks.clone()
        };
        for callback in callbacks {
            callback(dtls_state);
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.state.lock().closed {
            Err(EngineError::Closed(format!("transport {}", self.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidDtls("no fingerprints".to_string()));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::Closed(format!("transport {}", self.id)));
            }
            if state.remote_dtls.is_some() {
                return Err(EngineError::Request("connect() already called".to_string()));
            }
            state.remote_dtls = Some(dtls_parameters);
        }
        self.set_dtls_state(DtlsState::Connecting);
        self.set_dtls_state(DtlsState::Connected);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        self.ensure_open()?;

        let mut media_codecs = rtp_parameters.media_codecs().peekable();
        if media_codecs.peek().is_none() {
            return Err(EngineError::UnsupportedRtp("no media codecs".to_string()));
        }
        for codec in media_codecs {
            let supported = self
                .router
                .capabilities
                .codecs
                .iter()
                .any(|cap| cap.kind == kind && cap.matches(codec));
            if !supported {
                return Err(EngineError::UnsupportedRtp(format!(
                    "{kind} codec {} not supported by router",
                    codec.mime_type
                )));
            }
        }

        let id = ProducerId::new(Uuid::new_v4().to_string());
        let producer = Arc::new(LocalProducer {
            id: id.clone(),
            kind,
            rtp_parameters,
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            state: Mutex::new(ProducerState::default()),
        });

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::Closed(format!("transport {}", self.id)));
            }
            prune(&mut state.producers, LocalProducer::is_closed);
            state.producers.push(Arc::downgrade(&producer));
        }
        self.router.producers.insert(id.clone(), Arc::downgrade(&producer));
        self.registry.producers.insert(id, Arc::downgrade(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;

        let producer = self
            .router
            .live_producer(producer_id)
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.to_string()))?;
        if !self.router.can_consume(producer_id, rtp_capabilities) {
            return Err(EngineError::UnsupportedRtp(format!(
                "no compatible codec to consume producer {producer_id}"
            )));
        }

        let mid = {
            let mut state = self.state.lock();
            let mid = state.next_mid;
            state.next_mid += 1;
            mid
        };
        let rtp_parameters = consumer_parameters(&producer.rtp_parameters, rtp_capabilities, mid);

        let id = ConsumerId::new(Uuid::new_v4().to_string());
        let consumer = Arc::new(LocalConsumer {
            id: id.clone(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters,
            registry: Arc::clone(&self.registry),
            state: Mutex::new(ConsumerState {
                paused,
                ..Default::default()
            }),
        });

        if !producer.attach(&consumer) {
            return Err(EngineError::UnknownProducer(producer_id.to_string()));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                consumer.shutdown(CloseCause::Local);
                return Err(EngineError::Closed(format!("transport {}", self.id)));
            }
            prune(&mut state.consumers, LocalConsumer::is_closed);
            state.consumers.push(Arc::downgrade(&consumer));
        }
        self.registry.consumers.insert(id, Arc::downgrade(&consumer));
        Ok(consumer)
    }

    fn on_dtls_state_change(&self, callback: DtlsStateCallback) {
        self.state.lock().dtls_callbacks.push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            callback();
            return;
        }
        state.close_callbacks.push(callback);
    }

    fn close(&self) {
        let (callbacks, producers, consumers) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.dtls_state = DtlsState::Closed;
            state.dtls_callbacks.clear();
            (
                std::mem::take(&mut state.close_callbacks),
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };
        self.registry.transports.remove(&self.id);
        debug!(transport_id = %self.id, "Local transport closed");

        for producer in producers.iter().filter_map(Weak::upgrade) {
            producer.shutdown(CloseCause::TransportClosed);
        }
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.shutdown(CloseCause::TransportClosed);
        }
        for callback in callbacks {
            callback();
        }
    }

    fn closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Consumer-side RTP parameters: producer codecs re-mapped to client payload types
fn consumer_parameters(
    producer: &RtpParameters,
    capabilities: &RtpCapabilities,
    mid: u32,
) -> RtpParameters {
    let codecs = producer
        .media_codecs()
        .filter_map(|codec| {
            capabilities.find_codec(codec).map(|cap| RtpCodecParameters {
                mime_type: cap.mime_type.clone(),
                payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: cap.rtcp_feedback.clone(),
            })
        })
        .collect();

    let cname = producer
        .rtcp
        .as_ref()
        .and_then(|rtcp| rtcp.get("cname"))
        .and_then(|cname| cname.as_str())
        .map_or_else(|| nanoid::nanoid!(8), str::to_string);
    // Low 32 bits of a random UUID
    #[allow(clippy::cast_possible_truncation)]
    let ssrc = Uuid::new_v4().as_u128() as u32;

    RtpParameters {
        mid: Some(mid.to_string()),
        codecs,
        header_extensions: Vec::new(),
        encodings: vec![json!({ "ssrc": ssrc })],
        rtcp: Some(json!({ "cname": cname, "reducedSize": true })),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseCause {
    Local,
    TransportClosed,
    ProducerClosed,
}

#[derive(Default)]
struct ProducerState {
    closed: bool,
    transport_close_callbacks: Vec<CloseCallback>,
    consumers: Vec<Weak<LocalConsumer>>,
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    registry: Arc<Registry>,
    router: Arc<LocalRouter>,
    state: Mutex<ProducerState>,
}

impl LocalProducer {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Consumers currently bound to this producer
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state
            .lock()
            .consumers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .count()
    }

    fn attach(&self, consumer: &Arc<LocalConsumer>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        prune(&mut state.consumers, LocalConsumer::is_closed);
        state.consumers.push(Arc::downgrade(consumer));
        true
    }

    fn shutdown(&self, cause: CloseCause) {
        let (callbacks, consumers) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let callbacks = std::mem::take(&mut state.transport_close_callbacks);
            (
                if cause == CloseCause::TransportClosed {
                    callbacks
                } else {
                    Vec::new()
                },
                std::mem::take(&mut state.consumers),
            )
        };
        self.router.producers.remove(&self.id);
        self.registry.producers.remove(&self.id);
        debug!(producer_id = %self.id, ?cause, "Local producer closed");

        for callback in callbacks {
            callback();
        }
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.shutdown(CloseCause::ProducerClosed);
        }
    }
}

impl MediaProducer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn on_transport_close(&self, callback: CloseCallback) {
        let mut state = self.state.lock();
        if !state.closed {
            state.transport_close_callbacks.push(callback);
        }
    }

    fn close(&self) {
        self.shutdown(CloseCause::Local);
    }

    fn closed(&self) -> bool {
        self.is_closed()
    }
}

#[derive(Default)]
struct ConsumerState {
    closed: Option<CloseCause>,
    paused: bool,
    resume_count: usize,
    producer_close_callbacks: Vec<CloseCallback>,
    transport_close_callbacks: Vec<CloseCallback>,
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    registry: Arc<Registry>,
    state: Mutex<ConsumerState>,
}

impl LocalConsumer {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    /// How many times the consumer actually transitioned from paused to flowing
    #[must_use]
    pub fn resume_count(&self) -> usize {
        self.state.lock().resume_count
    }

    fn shutdown(&self, cause: CloseCause) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(cause);
            let producer_close = std::mem::take(&mut state.producer_close_callbacks);
            let transport_close = std::mem::take(&mut state.transport_close_callbacks);
            match cause {
                CloseCause::ProducerClosed => producer_close,
                CloseCause::TransportClosed => transport_close,
                CloseCause::Local => Vec::new(),
            }
        };
        self.registry.consumers.remove(&self.id);
        debug!(consumer_id = %self.id, ?cause, "Local consumer closed");

        for callback in callbacks {
            callback();
        }
    }

    fn register(&self, trigger: CloseCause, callback: CloseCallback) {
        let mut state = self.state.lock();
        let closed = state.closed;
        match closed {
            Some(cause) if cause == trigger => {
                drop(state);
                callback();
            }
            Some(_) => {}
            None => match trigger {
                CloseCause::ProducerClosed => state.producer_close_callbacks.push(callback),
                CloseCause::TransportClosed => state.transport_close_callbacks.push(callback),
                CloseCause::Local => {}
            },
        }
    }
}

#[async_trait]
impl MediaConsumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.state.lock().paused
    }

    async fn resume(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        if state.paused {
            state.paused = false;
            state.resume_count += 1;
        }
        Ok(())
    }

    fn on_producer_close(&self, callback: CloseCallback) {
        self.register(CloseCause::ProducerClosed, callback);
    }

    fn on_transport_close(&self, callback: CloseCallback) {
        self.register(CloseCause::TransportClosed, callback);
    }

    fn close(&self) {
        self.shutdown(CloseCause::Local);
    }

    fn closed(&self) -> bool {
        self.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::media_codecs;
    use std::net::{IpAddr, Ipv4Addr};

    fn listen_options() -> TransportListenOptions {
        TransportListenOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_address: None,
            port_range: Some(40000..=40010),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..Default::default()
        }
    }

    async fn router(engine: &LocalEngine) -> Arc<dyn MediaRouter> {
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        worker.create_router(&media_codecs()).await.unwrap()
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_router_capabilities_include_rtx() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let caps = router.rtp_capabilities();

        assert_eq!(caps.codecs.len(), 3);
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
        assert!(caps.codecs[2].is_rtx());
        assert_eq!(caps.codecs[2].parameters["apt"], 101);
        assert_eq!(engine.router_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_candidates_follow_options() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let mut options = listen_options();
        options.announced_address = Some("203.0.113.7".to_string());
        let transport = router.create_webrtc_transport(&options).await.unwrap();

        let candidates = transport.ice_candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].protocol, Protocol::Udp);
        assert!(candidates[0].priority > candidates[1].priority);
        assert_eq!(candidates[0].address, "203.0.113.7");
        assert!((40000..=40010).contains(&candidates[0].port));
        assert_eq!(transport.dtls_parameters().fingerprints[0].value.len(), 32 * 3 - 1);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let transport = router.create_webrtc_transport(&listen_options()).await.unwrap();

        transport.connect(client_dtls()).await.unwrap();
        assert_eq!(engine.transport(&transport.id()).unwrap().dtls_state(), DtlsState::Connected);
        assert!(transport.connect(client_dtls()).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_rejects_unsupported_codec() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let transport = router.create_webrtc_transport(&listen_options()).await.unwrap();

        let mut params = vp8_parameters();
        params.codecs[0].mime_type = "video/H264".to_string();
        let err = transport.produce(MediaKind::Video, params).await.err().unwrap();
        assert!(matches!(err, EngineError::UnsupportedRtp(_)));

        let err = transport
            .produce(MediaKind::Audio, vp8_parameters())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnsupportedRtp(_)));
    }

    #[tokio::test]
    async fn test_consumer_paused_until_resumed() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();

        let caps = router.rtp_capabilities();
        assert!(router.can_consume(&producer.id(), &caps));
        let consumer = recv.consume(&producer.id(), &caps, true).await.unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.rtp_parameters().codecs[0].payload_type, 101);

        consumer.resume().await.unwrap();
        consumer.resume().await.unwrap();
        assert!(!consumer.paused());
        assert_eq!(engine.consumer(&consumer.id()).unwrap().resume_count(), 1);
    }

    #[tokio::test]
    async fn test_cannot_consume_without_matching_codec() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();

        let mut caps = router.rtp_capabilities();
        caps.codecs.retain(|c| c.kind == MediaKind::Audio);
        assert!(!router.can_consume(&producer.id(), &caps));
        assert!(recv.consume(&producer.id(), &caps, true).await.is_err());
        assert!(!router.can_consume(&ProducerId::from("missing"), &router.rtp_capabilities()));
    }

    #[tokio::test]
    async fn test_producer_close_notifies_consumers() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), &router.rtp_capabilities(), true)
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        consumer.on_producer_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        producer.close();
        producer.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(consumer.closed());
        assert!(!router.can_consume(&producer.id(), &router.rtp_capabilities()));
    }

    #[tokio::test]
    async fn test_transport_close_cascades() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), &router.rtp_capabilities(), true)
            .await
            .unwrap();

        let transport_closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&transport_closed);
        producer.on_transport_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let producer_closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&producer_closed);
        consumer.on_producer_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        send.close();
        assert!(producer.closed());
        assert_eq!(transport_closed.load(Ordering::SeqCst), 1);
        assert_eq!(producer_closed.load(Ordering::SeqCst), 1);
        assert!(engine.transport(&send.id()).is_none());
    }

    #[tokio::test]
    async fn test_late_callback_registration_fires_immediately() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), &router.rtp_capabilities(), true)
            .await
            .unwrap();
        producer.close();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        consumer.on_producer_close(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_worker_death() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();

        let reason = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&reason);
        worker.on_dead(Box::new(move |r: String| *slot.lock() = Some(r)));

        engine.kill_workers("segfault");
        assert_eq!(reason.lock().as_deref(), Some("segfault"));
        assert!(router.closed());
        assert!(worker.create_router(&media_codecs()).await.is_err());
        assert_eq!(engine.open_router_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_children_are_pruned() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        for _ in 0..32 {
            worker.create_router(&media_codecs()).await.unwrap().close();
        }
        let router = worker.create_router(&media_codecs()).await.unwrap();
        let local_worker = engine.registry.workers.lock()[0].upgrade().unwrap();
        assert_eq!(local_worker.state.lock().routers.len(), 1);

        for _ in 0..32 {
            router
                .create_webrtc_transport(&listen_options())
                .await
                .unwrap()
                .close();
        }
        let send = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&listen_options()).await.unwrap();
        let local_router = engine.router(&router.id()).unwrap();
        assert_eq!(local_router.transports.lock().len(), 2);

        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();
        let caps = router.rtp_capabilities();
        for _ in 0..32 {
            recv.consume(&producer.id(), &caps, true).await.unwrap().close();
        }
        let consumer = recv.consume(&producer.id(), &caps, true).await.unwrap();

        let local_recv = engine.transport(&recv.id()).unwrap();
        assert_eq!(local_recv.state.lock().consumers.len(), 1);
        let local_producer = engine.producer(&producer.id()).unwrap();
        assert_eq!(local_producer.state.lock().consumers.len(), 1);
        assert_eq!(local_producer.consumer_count(), 1);
        assert!(!consumer.closed());
    }
}
