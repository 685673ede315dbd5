//! Disconnects that land while an engine call is in flight
//!
//! The gated engine wraps the in-process engine and parks the first call of
//! one kind right after the engine created the object, so the test can
//! disconnect the peer at exactly that point.
//!
//! Run with: cargo test --test disconnect_races

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use roomrelay_sfu::engine::{
    CloseCallback, DeathCallback, DtlsStateCallback, EngineResult, MediaConsumer, MediaProducer,
    MediaRouter, MediaTransport, MediaWorker, TransportListenOptions,
};
use roomrelay_sfu::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters,
};
use roomrelay_sfu::{
    ConsumerId, LocalEngine, MediaEngine, PeerId, ProducerId, Relay, RelayStats, RoomId, RouterId,
    SfuConfig, SfuError, TransportDirection, TransportId, WorkerSettings,
};
use serde_json::Map;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Router,
    Transport,
    Produce,
    Consume,
}

#[derive(Default)]
struct Gate {
    armed: Mutex<Option<Step>>,
    parked_id: Mutex<Option<String>>,
    parked: Notify,
    release: Notify,
}

impl Gate {
    fn arm(&self, step: Step) {
        *self.armed.lock() = Some(step);
    }

    async fn pass(&self, step: Step, id: String) {
        let hit = {
            let mut armed = self.armed.lock();
            if *armed == Some(step) {
                *armed = None;
                true
            } else {
                false
            }
        };
        if hit {
            *self.parked_id.lock() = Some(id);
            self.parked.notify_one();
            self.release.notified().await;
        }
    }

    /// Wait until a call is parked; returns the id of the object it created
    async fn wait_parked(&self) -> String {
        self.parked.notified().await;
        self.parked_id.lock().clone().unwrap()
    }

    fn open(&self) {
        self.release.notify_one();
    }
}

struct GatedEngine {
    inner: LocalEngine,
    gate: Arc<Gate>,
}

#[async_trait]
impl MediaEngine for GatedEngine {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>> {
        let inner = self.inner.create_worker(settings).await?;
        Ok(Arc::new(GatedWorker {
            inner,
            gate: Arc::clone(&self.gate),
        }))
    }
}

struct GatedWorker {
    inner: Arc<dyn MediaWorker>,
    gate: Arc<Gate>,
}

#[async_trait]
impl MediaWorker for GatedWorker {
    fn id(&self) -> String {
        self.inner.id()
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn MediaRouter>> {
        let inner = self.inner.create_router(media_codecs).await?;
        self.gate.pass(Step::Router, inner.id().to_string()).await;
        Ok(Arc::new(GatedRouter {
            inner,
            gate: Arc::clone(&self.gate),
        }))
    }

    fn on_dead(&self, callback: DeathCallback) {
        self.inner.on_dead(callback);
    }
}

struct GatedRouter {
    inner: Arc<dyn MediaRouter>,
    gate: Arc<Gate>,
}

#[async_trait]
impl MediaRouter for GatedRouter {
    fn id(&self) -> RouterId {
        self.inner.id()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer_id, rtp_capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: &TransportListenOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        let inner = self.inner.create_webrtc_transport(options).await?;
        self.gate.pass(Step::Transport, inner.id().to_string()).await;
        Ok(Arc::new(GatedTransport {
            inner,
            gate: Arc::clone(&self.gate),
        }))
    }

    fn close(&self) {
        self.inner.close();
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }
}

struct GatedTransport {
    inner: Arc<dyn MediaTransport>,
    gate: Arc<Gate>,
}

#[async_trait]
impl MediaTransport for GatedTransport {
    fn id(&self) -> TransportId {
        self.inner.id()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.inner.ice_parameters()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.inner.ice_candidates()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.inner.dtls_parameters()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        self.inner.connect(dtls_parameters).await
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        let producer = self.inner.produce(kind, rtp_parameters).await?;
        self.gate.pass(Step::Produce, producer.id().to_string()).await;
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        let consumer = self.inner.consume(producer_id, rtp_capabilities, paused).await?;
        self.gate.pass(Step::Consume, consumer.id().to_string()).await;
        Ok(consumer)
    }

    fn on_dtls_state_change(&self, callback: DtlsStateCallback) {
        self.inner.on_dtls_state_change(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.inner.on_close(callback);
    }

    fn close(&self) {
        self.inner.close();
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }
}

struct Harness {
    engine: LocalEngine,
    gate: Arc<Gate>,
    relay: Arc<Relay>,
}

impl Harness {
    fn new(config: SfuConfig) -> Self {
        let engine = LocalEngine::new();
        let gate = Arc::new(Gate::default());
        let relay = Relay::new(
            Arc::new(GatedEngine {
                inner: engine.clone(),
                gate: Arc::clone(&gate),
            }),
            WorkerSettings::default(),
            config,
        );
        Self { engine, gate, relay }
    }

    fn connect(&self, id: &str) -> (PeerId, mpsc::Receiver<roomrelay_sfu::PeerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let peer_id = PeerId::from(id);
        self.relay.connect(peer_id.clone(), tx);
        (peer_id, rx)
    }

    async fn join(&self, peer_id: &PeerId, room: &str) {
        self.relay
            .join(peer_id, RoomId::from(room))
            .await
            .unwrap()
            .unwrap();
    }

    async fn transport(&self, peer_id: &PeerId, direction: TransportDirection) -> TransportId {
        self.relay
            .create_transport(peer_id, direction)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    /// Disconnect and wait until the session is evicted, without awaiting cleanup
    async fn evict(&self, peer_id: &PeerId) -> tokio::task::JoinHandle<()> {
        let relay = Arc::clone(&self.relay);
        let id = peer_id.clone();
        let cleanup = tokio::spawn(async move {
            relay.disconnect(&id).await;
        });
        while self.relay.sessions().get(peer_id).is_some() {
            tokio::task::yield_now().await;
        }
        cleanup
    }
}

fn opus() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_disconnect_during_join_removes_created_room() {
    let h = Harness::new(SfuConfig::default());
    let (a, _rx) = h.connect("a");

    h.gate.arm(Step::Router);
    let relay = Arc::clone(&h.relay);
    let peer = a.clone();
    let join = tokio::spawn(async move { relay.join(&peer, RoomId::from("r1")).await });
    let router_id = RouterId::new(h.gate.wait_parked().await);

    let cleanup = h.evict(&a).await;
    h.gate.open();

    assert_eq!(join.await.unwrap(), Ok(None));
    cleanup.await.unwrap();
    assert!(h.engine.router(&router_id).is_none());
    assert_eq!(h.relay.stats(), RelayStats::default());
    assert!(h.relay.registry().find(&a).is_none());
}

#[tokio::test]
async fn test_disconnect_during_create_transport_closes_it() {
    let h = Harness::new(SfuConfig::default());
    let (a, _rx_a) = h.connect("a");
    let (b, _rx_b) = h.connect("b");
    h.join(&a, "r1").await;
    h.join(&b, "r1").await;

    h.gate.arm(Step::Transport);
    let relay = Arc::clone(&h.relay);
    let peer = a.clone();
    let create = tokio::spawn(async move {
        relay.create_transport(&peer, TransportDirection::Recv).await
    });
    let transport_id = TransportId::new(h.gate.wait_parked().await);

    h.evict(&a).await.await.unwrap();
    h.gate.open();

    assert_eq!(create.await.unwrap(), Ok(None));
    assert!(h.engine.transport(&transport_id).is_none());
    let stats = h.relay.stats();
    assert_eq!((stats.rooms, stats.peers, stats.transports), (1, 1, 0));
}

#[tokio::test]
async fn test_disconnect_during_produce_closes_producer_silently() {
    let h = Harness::new(SfuConfig::default());
    let (a, _rx_a) = h.connect("a");
    let (b, mut rx_b) = h.connect("b");
    h.join(&a, "r1").await;
    h.join(&b, "r1").await;
    h.transport(&a, TransportDirection::Send).await;

    h.gate.arm(Step::Produce);
    let relay = Arc::clone(&h.relay);
    let peer = a.clone();
    let produce = tokio::spawn(async move { relay.produce(&peer, MediaKind::Audio, opus()).await });
    let producer_id = ProducerId::new(h.gate.wait_parked().await);

    h.evict(&a).await.await.unwrap();
    h.gate.open();

    assert_eq!(produce.await.unwrap(), Ok(None));
    assert!(h.engine.producer(&producer_id).is_none());
    assert!(rx_b.try_recv().is_err());
    assert!(h.relay.list_producers(&b).unwrap().unwrap().is_empty());
    assert_eq!(h.relay.stats().producers, 0);
}

#[tokio::test]
async fn test_disconnect_during_consume_closes_consumer() {
    let h = Harness::new(SfuConfig::default());
    let (a, _rx_a) = h.connect("a");
    let (b, _rx_b) = h.connect("b");
    h.join(&a, "r1").await;
    h.join(&b, "r1").await;
    h.transport(&a, TransportDirection::Send).await;
    let produced = h
        .relay
        .produce(&a, MediaKind::Audio, opus())
        .await
        .unwrap()
        .unwrap();
    let recv = h.transport(&b, TransportDirection::Recv).await;
    let caps = h.relay.registry().find(&b).unwrap().router().rtp_capabilities();

    h.gate.arm(Step::Consume);
    let relay = Arc::clone(&h.relay);
    let peer = b.clone();
    let producer_id = produced.producer_id.clone();
    let consume =
        tokio::spawn(async move { relay.consume(&peer, producer_id, caps, recv).await });
    let consumer_id = ConsumerId::new(h.gate.wait_parked().await);

    h.evict(&b).await.await.unwrap();
    h.gate.open();

    assert_eq!(consume.await.unwrap(), Ok(None));
    assert!(h.engine.consumer(&consumer_id).is_none());
    let producer = h.engine.producer(&produced.producer_id).unwrap();
    assert_eq!(producer.consumer_count(), 0);
    assert_eq!(h.relay.stats().consumers, 0);
}

#[tokio::test]
async fn test_room_limit_holds_across_concurrent_new_rooms() {
    let h = Harness::new(SfuConfig {
        max_rooms: 1,
        ..Default::default()
    });
    let (a, _rx_a) = h.connect("a");
    let (b, _rx_b) = h.connect("b");

    h.gate.arm(Step::Router);
    let relay = Arc::clone(&h.relay);
    let peer = a.clone();
    let first = tokio::spawn(async move { relay.join(&peer, RoomId::from("r1")).await });
    h.gate.wait_parked().await;

    let err = h.relay.join(&b, RoomId::from("r2")).await.unwrap_err();
    assert_eq!(err, SfuError::RoomLimitReached);
    h.gate.open();

    assert!(first.await.unwrap().unwrap().is_some());
    assert_eq!(h.engine.router_count(), 1);
    assert_eq!(h.relay.registry().get_room_ids(), vec![RoomId::from("r1")]);

    // b's failed join released its claim, so it may still join the open room
    h.join(&b, "r1").await;
    assert_eq!(h.relay.stats().peers, 2);
}
