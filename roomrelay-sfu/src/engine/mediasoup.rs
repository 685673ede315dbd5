//! Adapter over the native mediasoup worker
//!
//! Parameter types cross the boundary through their JSON form: both sides use
//! the same camelCase wire representation that clients send and receive.

use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel as NativeLogLevel, WorkerSettings as NativeWorkerSettings};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::{
    prune, CloseCallback, DeathCallback, DtlsStateCallback, EngineResult, MediaConsumer,
    MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker,
    TransportListenOptions, WorkerLogLevel, WorkerSettings,
};
use crate::error::EngineError;
use crate::rtp;
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId};

fn convert<T: Serialize, U: DeserializeOwned>(value: &T) -> EngineResult<U> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| EngineError::Request(format!("parameter conversion failed: {e}")))
}

fn request_error(error: impl std::fmt::Display) -> EngineError {
    EngineError::Request(error.to_string())
}

/// Close callback shared by the native hook and the adapter's own close path,
/// whichever runs first fires it
type OnceCallback = Arc<Mutex<Option<CloseCallback>>>;

fn once(callback: CloseCallback) -> OnceCallback {
    Arc::new(Mutex::new(Some(callback)))
}

fn fire(callback: &OnceCallback) {
    let callback = callback.lock().take();
    if let Some(callback) = callback {
        callback();
    }
}

fn fire_all(callbacks: &Mutex<Vec<OnceCallback>>) {
    let callbacks = std::mem::take(&mut *callbacks.lock());
    for callback in &callbacks {
        fire(callback);
    }
}

fn native_kind(kind: rtp::MediaKind) -> MediaKind {
    match kind {
        rtp::MediaKind::Audio => MediaKind::Audio,
        rtp::MediaKind::Video => MediaKind::Video,
    }
}

fn relay_kind(kind: MediaKind) -> rtp::MediaKind {
    match kind {
        MediaKind::Audio => rtp::MediaKind::Audio,
        MediaKind::Video => rtp::MediaKind::Video,
    }
}

fn relay_dtls_state(state: DtlsState) -> rtp::DtlsState {
    match state {
        DtlsState::New => rtp::DtlsState::New,
        DtlsState::Connecting => rtp::DtlsState::Connecting,
        DtlsState::Connected => rtp::DtlsState::Connected,
        DtlsState::Failed => rtp::DtlsState::Failed,
        DtlsState::Closed => rtp::DtlsState::Closed,
    }
}

/// Media engine backed by mediasoup worker processes
pub struct MediasoupEngine {
    manager: WorkerManager,
}

impl MediasoupEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            manager: WorkerManager::new(),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    fn name(&self) -> &'static str {
        "mediasoup"
    }

    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>> {
        let mut native = NativeWorkerSettings::default();
        native.log_level = match settings.log_level {
            WorkerLogLevel::Debug => NativeLogLevel::Debug,
            WorkerLogLevel::Warn => NativeLogLevel::Warn,
            WorkerLogLevel::Error => NativeLogLevel::Error,
            WorkerLogLevel::None => NativeLogLevel::None,
        };

        let worker = self
            .manager
            .create_worker(native)
            .await
            .map_err(request_error)?;
        debug!(worker_id = %worker.id(), "mediasoup worker created");
        Ok(Arc::new(MediasoupWorker { worker }))
    }
}

struct MediasoupWorker {
    worker: Worker,
}

#[async_trait]
impl MediaWorker for MediasoupWorker {
    fn id(&self) -> String {
        self.worker.id().to_string()
    }

    async fn create_router(
        &self,
        media_codecs: &[rtp::RtpCodecCapability],
    ) -> EngineResult<Arc<dyn MediaRouter>> {
        if self.worker.closed() {
            return Err(EngineError::WorkerDead);
        }
        let codecs: Vec<RtpCodecCapability> = convert(&media_codecs)?;
        let router = self
            .worker
            .create_router(RouterOptions::new(codecs))
            .await
            .map_err(request_error)?;
        Ok(Arc::new(MediasoupRouter {
            id: RouterId::new(router.id().to_string()),
            router: Mutex::new(Some(router)),
            transports: Mutex::new(Vec::new()),
        }))
    }

    fn on_dead(&self, callback: DeathCallback) {
        self.worker
            .on_dead(move |reason| callback(format!("{reason:?}")))
            .detach();
    }
}

/// A native object closes once its last handle drops, and children hold
/// handles to their parents. Closing an adapter therefore drops its own handle
/// and closes every child adapter it created.
struct MediasoupRouter {
    id: RouterId,
    router: Mutex<Option<Router>>,
    transports: Mutex<Vec<Weak<MediasoupTransport>>>,
}

impl MediasoupRouter {
    fn router(&self) -> EngineResult<Router> {
        self.router
            .lock()
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("router {}", self.id)))
    }
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> RouterId {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> rtp::RtpCapabilities {
        self.router()
            .ok()
            .and_then(|router| convert(router.rtp_capabilities()).ok())
            .unwrap_or_default()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &rtp::RtpCapabilities) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let (Ok(producer_id), Ok(capabilities)) = (
            convert::<_, mediasoup::producer::ProducerId>(&producer_id.as_str()),
            convert::<_, RtpCapabilities>(rtp_capabilities),
        ) else {
            return false;
        };
        router.can_consume(&producer_id, &capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: &TransportListenOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        let router = self.router()?;
        let listen_info = |protocol| ListenInfo {
            protocol,
            ip: options.listen_ip,
            announced_address: options.announced_address.clone(),
            expose_internal_ip: false,
            port: None,
            port_range: options.port_range.clone(),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        };

        let listen_infos = match (options.enable_udp, options.enable_tcp) {
            (true, true) => WebRtcTransportListenInfos::new(listen_info(Protocol::Udp))
                .insert(listen_info(Protocol::Tcp)),
            (true, false) => WebRtcTransportListenInfos::new(listen_info(Protocol::Udp)),
            (false, true) => WebRtcTransportListenInfos::new(listen_info(Protocol::Tcp)),
            (false, false) => {
                return Err(EngineError::Request(
                    "at least one of UDP or TCP must be enabled".to_string(),
                ))
            }
        };
        let mut transport_options = WebRtcTransportOptions::new(listen_infos);
        transport_options.enable_udp = options.enable_udp;
        transport_options.enable_tcp = options.enable_tcp;
        transport_options.prefer_udp = options.prefer_udp;

        let transport = router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(request_error)?;
        drop(router);

        let transport = Arc::new(MediasoupTransport {
            id: TransportId::new(transport.id().to_string()),
            transport: Mutex::new(Some(transport)),
            close_callbacks: Mutex::new(Vec::new()),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });

        let mut transports = self.transports.lock();
        if self.router.lock().is_none() {
            drop(transports);
            transport.close();
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }
        prune(&mut *transports, MediasoupTransport::closed);
        transports.push(Arc::downgrade(&transport));
        drop(transports);
        Ok(transport)
    }

    fn close(&self) {
        let Some(router) = self.router.lock().take() else {
            return;
        };
        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports.iter().filter_map(Weak::upgrade) {
            transport.close();
        }
        drop(router);
        debug!(router_id = %self.id, "mediasoup router closed");
    }

    fn closed(&self) -> bool {
        self.router.lock().as_ref().map_or(true, Router::closed)
    }
}

struct MediasoupTransport {
    id: TransportId,
    transport: Mutex<Option<WebRtcTransport>>,
    close_callbacks: Mutex<Vec<OnceCallback>>,
    producers: Mutex<Vec<Weak<MediasoupProducer>>>,
    consumers: Mutex<Vec<Weak<MediasoupConsumer>>>,
}

impl MediasoupTransport {
    fn transport(&self) -> EngineResult<WebRtcTransport> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| self.closed_error())
    }

    fn closed_error(&self) -> EngineError {
        EngineError::Closed(format!("transport {}", self.id))
    }

    fn is_open(&self) -> bool {
        self.transport.lock().is_some()
    }
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> rtp::IceParameters {
        self.transport()
            .ok()
            .and_then(|t| convert(t.ice_parameters()).ok())
            .unwrap_or_else(|| rtp::IceParameters {
                username_fragment: String::new(),
                password: String::new(),
                ice_lite: true,
            })
    }

    fn ice_candidates(&self) -> Vec<rtp::IceCandidate> {
        self.transport()
            .ok()
            .and_then(|t| convert(t.ice_candidates()).ok())
            .unwrap_or_default()
    }

    fn dtls_parameters(&self) -> rtp::DtlsParameters {
        self.transport()
            .ok()
            .and_then(|t| convert(&t.dtls_parameters()).ok())
            .unwrap_or(rtp::DtlsParameters {
                role: rtp::DtlsRole::Auto,
                fingerprints: Vec::new(),
            })
    }

    async fn connect(&self, dtls_parameters: rtp::DtlsParameters) -> EngineResult<()> {
        let transport = self.transport()?;
        let dtls_parameters: DtlsParameters = convert(&dtls_parameters)
            .map_err(|e| EngineError::InvalidDtls(e.to_string()))?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(request_error)
    }

    async fn produce(
        &self,
        kind: rtp::MediaKind,
        rtp_parameters: rtp::RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        let transport = self.transport()?;
        let rtp_parameters: RtpParameters = convert(&rtp_parameters)
            .map_err(|e| EngineError::UnsupportedRtp(e.to_string()))?;
        let producer = transport
            .produce(ProducerOptions::new(native_kind(kind), rtp_parameters))
            .await
            .map_err(|e| EngineError::UnsupportedRtp(e.to_string()))?;
        drop(transport);

        let producer = Arc::new(MediasoupProducer {
            id: ProducerId::new(producer.id().to_string()),
            kind,
            producer: Mutex::new(Some(producer)),
            transport_close: Mutex::new(Vec::new()),
        });

        let mut producers = self.producers.lock();
        if !self.is_open() {
            drop(producers);
            producer.close();
            return Err(self.closed_error());
        }
        prune(&mut *producers, MediasoupProducer::closed);
        producers.push(Arc::downgrade(&producer));
        drop(producers);
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &rtp::RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        let transport = self.transport()?;
        let native_id: mediasoup::producer::ProducerId = convert(&producer_id.as_str())
            .map_err(|_| EngineError::UnknownProducer(producer_id.to_string()))?;
        let capabilities: RtpCapabilities = convert(rtp_capabilities)?;

        let mut options = ConsumerOptions::new(native_id, capabilities);
        options.paused = paused;
        let consumer = transport.consume(options).await.map_err(request_error)?;
        drop(transport);

        let consumer = Arc::new(MediasoupConsumer {
            id: ConsumerId::new(consumer.id().to_string()),
            producer_id: producer_id.clone(),
            kind: relay_kind(consumer.kind()),
            rtp_parameters: convert(consumer.rtp_parameters()).unwrap_or_default(),
            consumer: Mutex::new(Some(consumer)),
            transport_close: Mutex::new(Vec::new()),
        });

        let mut consumers = self.consumers.lock();
        if !self.is_open() {
            drop(consumers);
            consumer.close();
            return Err(self.closed_error());
        }
        prune(&mut *consumers, MediasoupConsumer::closed);
        consumers.push(Arc::downgrade(&consumer));
        drop(consumers);
        Ok(consumer)
    }

    fn on_dtls_state_change(&self, callback: DtlsStateCallback) {
        if let Ok(transport) = self.transport() {
            transport
                .on_dtls_state_change(move |state| callback(relay_dtls_state(state)))
                .detach();
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        let callback = once(callback);
        match self.transport.lock().as_ref() {
            Some(transport) => {
                let native = Arc::clone(&callback);
                transport.on_close(move || fire(&native)).detach();
                self.close_callbacks.lock().push(callback);
            }
            None => fire(&callback),
        }
    }

    fn close(&self) {
        let Some(transport) = self.transport.lock().take() else {
            return;
        };
        let producers = std::mem::take(&mut *self.producers.lock());
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for producer in producers.iter().filter_map(Weak::upgrade) {
            producer.close_with_transport();
        }
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close_with_transport();
        }
        drop(transport);
        debug!(transport_id = %self.id, "mediasoup transport closed");
        fire_all(&self.close_callbacks);
    }

    fn closed(&self) -> bool {
        self.transport
            .lock()
            .as_ref()
            .map_or(true, |t| t.closed())
    }
}

struct MediasoupProducer {
    id: ProducerId,
    kind: rtp::MediaKind,
    producer: Mutex<Option<Producer>>,
    transport_close: Mutex<Vec<OnceCallback>>,
}

impl MediasoupProducer {
    fn close_with_transport(&self) {
        let Some(producer) = self.producer.lock().take() else {
            return;
        };
        drop(producer);
        fire_all(&self.transport_close);
    }
}

impl MediaProducer for MediasoupProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> rtp::MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> rtp::RtpParameters {
        self.producer
            .lock()
            .as_ref()
            .and_then(|p| convert(p.rtp_parameters()).ok())
            .unwrap_or_default()
    }

    fn on_transport_close(&self, callback: CloseCallback) {
        let producer = self.producer.lock();
        if let Some(producer) = producer.as_ref() {
            let callback = once(callback);
            let native = Arc::clone(&callback);
            producer.on_transport_close(move || fire(&native)).detach();
            self.transport_close.lock().push(callback);
        }
    }

    fn close(&self) {
        let producer = self.producer.lock().take();
        drop(producer);
        self.transport_close.lock().clear();
    }

    fn closed(&self) -> bool {
        self.producer.lock().as_ref().map_or(true, Producer::closed)
    }
}

struct MediasoupConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: rtp::MediaKind,
    rtp_parameters: rtp::RtpParameters,
    consumer: Mutex<Option<Consumer>>,
    transport_close: Mutex<Vec<OnceCallback>>,
}

impl MediasoupConsumer {
    fn close_with_transport(&self) {
        let Some(consumer) = self.consumer.lock().take() else {
            return;
        };
        drop(consumer);
        fire_all(&self.transport_close);
    }
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> rtp::MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> rtp::RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.consumer.lock().as_ref().map_or(false, Consumer::paused)
    }

    async fn resume(&self) -> EngineResult<()> {
        let consumer = self
            .consumer
            .lock()
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("consumer {}", self.id)))?;
        consumer.resume().await.map_err(request_error)
    }

    fn on_producer_close(&self, callback: CloseCallback) {
        if let Some(consumer) = self.consumer.lock().as_ref() {
            consumer.on_producer_close(callback).detach();
        }
    }

    fn on_transport_close(&self, callback: CloseCallback) {
        let consumer = self.consumer.lock();
        if let Some(consumer) = consumer.as_ref() {
            let callback = once(callback);
            let native = Arc::clone(&callback);
            consumer.on_transport_close(move || fire(&native)).detach();
            self.transport_close.lock().push(callback);
        }
    }

    fn close(&self) {
        let consumer = self.consumer.lock().take();
        drop(consumer);
        self.transport_close.lock().clear();
    }

    fn closed(&self) -> bool {
        self.consumer.lock().as_ref().map_or(true, Consumer::closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::media_codecs;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn listen_options() -> TransportListenOptions {
        TransportListenOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_address: None,
            port_range: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }

    #[tokio::test]
    async fn test_router_close_closes_transports() {
        let engine = MediasoupEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        let transport = router.create_webrtc_transport(&listen_options()).await.unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        transport.on_close(Box::new(move || flag.store(true, Ordering::SeqCst)));

        router.close();
        assert!(router.closed());
        assert!(transport.closed());
        assert!(fired.load(Ordering::SeqCst));
        assert!(transport
            .produce(rtp::MediaKind::Audio, rtp::RtpParameters::default())
            .await
            .is_err());
    }
}
