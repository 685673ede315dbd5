//! Transport negotiation protocol handler
//!
//! [`Relay`] implements the per-peer protocol:
//!
//! ```text
//! CONNECTED -> JOINED(room) -> { send transport, recv transports }* -> producing* -> consuming*
//!                                                                  any state -> DISCONNECTED
//! ```
//!
//! Every operation is safe to run concurrently with any other, including the
//! peer's own disconnect. A peer that is gone yields `Ok(None)`: there is
//! nobody left to answer. Anything created for a peer that disappeared while
//! the engine call was in flight is closed instead of registered.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cleanup::{cleanup_peer, CleanupSummary};
use crate::config::SfuConfig;
use crate::engine::{
    MediaConsumer, MediaEngine, MediaProducer, MediaTransport, TransportListenOptions,
    WorkerSettings,
};
use crate::error::{Result, SfuError};
use crate::notifier::{notify_producer_closed, notify_room_of_new_producer, PeerEvent};
use crate::registry::RoomRegistry;
use crate::room::Room;
use crate::rtp::{DtlsParameters, DtlsState, MediaKind, RtpCapabilities, RtpParameters};
use crate::session::{PeerSession, Rejection, SessionStore};
use crate::signaling::{
    ClientRequest, ConsumeReply, JoinReply, ProduceReply, Reply, TransportReply,
};
use crate::stats::RelayStats;
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportDirection, TransportId};
use crate::worker::WorkerSupervisor;

/// The relay core: rooms, peer sessions and the negotiation protocol
pub struct Relay {
    config: SfuConfig,
    transport_options: TransportListenOptions,
    workers: Arc<WorkerSupervisor>,
    registry: RoomRegistry,
    sessions: SessionStore,
}

impl Relay {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        worker_settings: WorkerSettings,
        config: SfuConfig,
    ) -> Arc<Self> {
        let workers = Arc::new(WorkerSupervisor::new(engine, worker_settings));
        let registry = RoomRegistry::new(Arc::clone(&workers), &config);
        Arc::new(Self {
            transport_options: config.transport_options(),
            config,
            workers,
            registry,
            sessions: SessionStore::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerSupervisor> {
        &self.workers
    }

    #[must_use]
    pub const fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats::collect(&self.registry, &self.sessions)
    }

    /// Register a placeholder session for a new connection
    pub fn connect(&self, peer_id: PeerId, sink: mpsc::Sender<PeerEvent>) -> Arc<PeerSession> {
        let session = Arc::new(PeerSession::new(peer_id, sink));
        self.sessions.insert(Arc::clone(&session));
        debug!(peer_id = %session.id(), "Peer connected");
        session
    }

    /// Dispatch one client request
    pub async fn handle(&self, peer_id: &PeerId, request: ClientRequest) -> Result<Option<Reply>> {
        debug!(peer_id = %peer_id, action = request.action(), "Handling request");
        let reply = match request {
            ClientRequest::Join { room_id } => self.join(peer_id, room_id).await?.map(Reply::Joined),
            ClientRequest::CreateTransport { direction } => self
                .create_transport(peer_id, direction)
                .await?
                .map(Reply::Transport),
            ClientRequest::ConnectTransport {
                direction,
                dtls_parameters,
                transport_id,
            } => self
                .connect_transport(peer_id, direction, dtls_parameters, transport_id)
                .await?
                .map(|()| Reply::Ack),
            ClientRequest::Produce {
                kind,
                rtp_parameters,
            } => self
                .produce(peer_id, kind, rtp_parameters)
                .await?
                .map(Reply::Produced),
            ClientRequest::ListProducers => self.list_producers(peer_id)?.map(Reply::Producers),
            ClientRequest::Consume {
                producer_id,
                rtp_capabilities,
                transport_id,
            } => self
                .consume(peer_id, producer_id, rtp_capabilities, transport_id)
                .await?
                .map(Reply::Consumed),
            ClientRequest::ResumeConsumer { consumer_id } => self
                .resume_consumer(peer_id, &consumer_id)
                .await?
                .map(|()| Reply::Ack),
        };
        Ok(reply)
    }

    /// Session and room of a joined peer; `None` if the peer is gone
    fn joined(&self, peer_id: &PeerId) -> Result<Option<(Arc<PeerSession>, Arc<Room>)>> {
        let Some(session) = self.sessions.get(peer_id) else {
            debug!(peer_id = %peer_id, "Peer not found, ignoring request");
            return Ok(None);
        };
        let room_id = session
            .joined_room()
            .ok_or_else(|| SfuError::NotJoined(peer_id.clone()))?;
        let room = self.registry.room(&room_id).ok_or_else(|| {
            warn!(peer_id = %peer_id, room_id = %room_id, "Room not found for peer");
            SfuError::RoomNotFound(room_id)
        })?;
        Ok(Some((session, room)))
    }

    /// Join a room, creating it on first use; replies with the router's capabilities
    pub async fn join(&self, peer_id: &PeerId, room_id: RoomId) -> Result<Option<JoinReply>> {
        let Some(session) = self.sessions.get(peer_id) else {
            debug!(peer_id = %peer_id, "Peer not found, ignoring join");
            return Ok(None);
        };
        session.claim_room(&room_id)?;

        let room = match self.registry.join(&room_id, &session).await {
            Ok(Some(room)) => room,
            Ok(None) => return Ok(None),
            Err(e) => {
                session.release_room(&room_id);
                warn!(peer_id = %peer_id, room_id = %room_id, error = %e, "Join failed");
                return Err(e);
            }
        };

        Ok(Some(JoinReply {
            room_id,
            rtp_capabilities: room.router().rtp_capabilities(),
        }))
    }

    pub async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: TransportDirection,
    ) -> Result<Option<TransportReply>> {
        let Some((session, room)) = self.joined(peer_id)? else {
            return Ok(None);
        };

        let transport = room
            .router()
            .create_webrtc_transport(&self.transport_options)
            .await
            .map_err(|e| {
                error!(peer_id = %peer_id, %direction, error = %e, "Failed to create transport");
                SfuError::from(e)
            })?;
        watch_transport(&session, &transport);

        match session.add_transport(direction, Arc::clone(&transport)) {
            Ok(Some(replaced)) => {
                debug!(
                    peer_id = %peer_id,
                    transport_id = %replaced.id(),
                    "Closing replaced send transport"
                );
                // Producers live on the send transport and go down with it
                for producer_id in session.producer_ids() {
                    if let Some(producer) = session.remove_producer(&producer_id) {
                        producer.close();
                    }
                }
                replaced.close();
            }
            Ok(None) => {}
            Err(_) => {
                debug!(peer_id = %peer_id, "Peer left during transport creation");
                transport.close();
                return Ok(None);
            }
        }

        info!(
            peer_id = %peer_id,
            room_id = %room.id(),
            transport_id = %transport.id(),
            %direction,
            "Created transport"
        );

        Ok(Some(TransportReply {
            id: transport.id(),
            direction,
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
            ice_servers: self.config.ice_servers.clone(),
        }))
    }

    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        transport_id: Option<TransportId>,
    ) -> Result<Option<()>> {
        let Some((session, _room)) = self.joined(peer_id)? else {
            return Ok(None);
        };

        let transport = match direction {
            TransportDirection::Send => session
                .send_transport()
                .filter(|t| transport_id.as_ref().map_or(true, |id| &t.id() == id)),
            TransportDirection::Recv => session.recv_transport(transport_id.as_ref()),
        }
        .ok_or_else(|| SfuError::TransportNotFound {
            direction,
            id: transport_id.clone(),
        })?;

        transport.connect(dtls_parameters).await.map_err(|e| {
            warn!(
                peer_id = %peer_id,
                transport_id = %transport.id(),
                error = %e,
                "Failed to connect transport"
            );
            SfuError::from(e)
        })?;

        debug!(peer_id = %peer_id, transport_id = %transport.id(), %direction, "Transport connected");
        Ok(Some(()))
    }

    pub async fn produce(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Option<ProduceReply>> {
        let Some((session, room)) = self.joined(peer_id)? else {
            return Ok(None);
        };
        if session.has_producer(kind) {
            return Err(SfuError::AlreadyProducing(kind.to_string()));
        }
        let transport = session
            .send_transport()
            .ok_or(SfuError::TransportNotFound {
                direction: TransportDirection::Send,
                id: None,
            })?;

        let producer = transport.produce(kind, rtp_parameters).await.map_err(|e| {
            warn!(peer_id = %peer_id, %kind, error = %e, "Failed to create producer");
            SfuError::from(e)
        })?;
        let producer_id = producer.id();

        match session.add_producer(Arc::clone(&producer)) {
            Ok(()) => {}
            Err(Rejection::PeerRemoved) => {
                debug!(peer_id = %peer_id, "Peer left during produce");
                producer.close();
                return Ok(None);
            }
            Err(Rejection::KindTaken) => {
                producer.close();
                return Err(SfuError::AlreadyProducing(kind.to_string()));
            }
        }
        watch_producer(&session, &producer);
        if producer.closed() {
            session.remove_producer(&producer_id);
            return Err(SfuError::ProducerNotFound(producer_id));
        }

        let others_exist = !room.producer_ids_excluding(peer_id).is_empty();
        info!(
            peer_id = %peer_id,
            room_id = %room.id(),
            producer_id = %producer_id,
            %kind,
            "Created producer"
        );

        // Registered above, so a notified peer's consume always finds it
        notify_room_of_new_producer(&room, peer_id, &producer_id);

        Ok(Some(ProduceReply {
            producer_id,
            others_exist,
        }))
    }

    /// Producers of every other peer in the caller's room
    pub fn list_producers(&self, peer_id: &PeerId) -> Result<Option<Vec<ProducerId>>> {
        let Some((_session, room)) = self.joined(peer_id)? else {
            return Ok(None);
        };
        Ok(Some(room.producer_ids_excluding(peer_id)))
    }

    pub async fn consume(
        &self,
        peer_id: &PeerId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        transport_id: TransportId,
    ) -> Result<Option<ConsumeReply>> {
        let Some((session, room)) = self.joined(peer_id)? else {
            return Ok(None);
        };

        let transport = session
            .recv_transport(Some(&transport_id))
            .ok_or_else(|| SfuError::TransportNotFound {
                direction: TransportDirection::Recv,
                id: Some(transport_id.clone()),
            })?;

        match room.producer_owner(&producer_id) {
            Some(owner) if &owner != peer_id => {}
            _ => return Err(SfuError::ProducerNotFound(producer_id)),
        }

        if !room.router().can_consume(&producer_id, &rtp_capabilities) {
            warn!(
                peer_id = %peer_id,
                producer_id = %producer_id,
                "Client capabilities cannot consume producer"
            );
            return Err(SfuError::CannotConsume(producer_id));
        }

        let consumer = transport
            .consume(&producer_id, &rtp_capabilities, true)
            .await
            .map_err(|e| {
                warn!(
                    peer_id = %peer_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Failed to create consumer"
                );
                SfuError::from(e)
            })?;
        let consumer_id = consumer.id();

        if session.add_consumer(Arc::clone(&consumer)).is_err() {
            debug!(peer_id = %peer_id, "Peer left during consume");
            consumer.close();
            return Ok(None);
        }
        watch_consumer(&session, &consumer);
        if consumer.closed() {
            session.remove_consumer(&consumer_id);
            return Err(SfuError::ProducerNotFound(producer_id));
        }

        info!(
            peer_id = %peer_id,
            room_id = %room.id(),
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Created paused consumer"
        );

        Ok(Some(ConsumeReply {
            consumer_id,
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        }))
    }

    pub async fn resume_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<Option<()>> {
        let Some(session) = self.sessions.get(peer_id) else {
            return Ok(None);
        };
        let consumer = session
            .consumer(consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;

        if !consumer.paused() {
            debug!(peer_id = %peer_id, consumer_id = %consumer_id, "Consumer already resumed");
            return Ok(Some(()));
        }

        consumer.resume().await.map_err(|e| {
            warn!(peer_id = %peer_id, consumer_id = %consumer_id, error = %e, "Failed to resume consumer");
            SfuError::from(e)
        })?;
        debug!(peer_id = %peer_id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(Some(()))
    }

    /// Connection lost: release everything the peer owned
    pub async fn disconnect(&self, peer_id: &PeerId) -> Option<CleanupSummary> {
        cleanup_peer(&self.sessions, &self.registry, peer_id).await
    }
}

/// Close on DTLS "closed" and drop the bookkeeping once the transport is gone
fn watch_transport(session: &Arc<PeerSession>, transport: &Arc<dyn MediaTransport>) {
    let transport_id = transport.id();
    let weak_transport = Arc::downgrade(transport);
    let id = transport_id.clone();
    transport.on_dtls_state_change(Arc::new(move |state: DtlsState| {
        if state == DtlsState::Closed {
            info!(transport_id = %id, "DTLS closed, closing transport");
            if let Some(transport) = weak_transport.upgrade() {
                transport.close();
            }
        }
    }));

    let weak_session = Arc::downgrade(session);
    transport.on_close(Box::new(move || {
        if let Some(session) = weak_session.upgrade() {
            if session.remove_transport(&transport_id).is_some() {
                debug!(peer_id = %session.id(), transport_id = %transport_id, "Transport closed");
            }
        }
    }));
}

fn watch_producer(session: &Arc<PeerSession>, producer: &Arc<dyn MediaProducer>) {
    let producer_id = producer.id();
    let weak_session = Arc::downgrade(session);
    let weak_producer = Arc::downgrade(producer);
    producer.on_transport_close(Box::new(move || {
        debug!(producer_id = %producer_id, "Producer transport closed");
        if let Some(session) = weak_session.upgrade() {
            session.remove_producer(&producer_id);
        }
        if let Some(producer) = weak_producer.upgrade() {
            producer.close();
        }
    }));
}

/// Remote producer closed: tell the consuming peer and forget the consumer
fn watch_consumer(session: &Arc<PeerSession>, consumer: &Arc<dyn MediaConsumer>) {
    let consumer_id = consumer.id();
    let producer_id = consumer.producer_id();
    let weak_session = Arc::downgrade(session);
    let weak_consumer = Arc::downgrade(consumer);
    consumer.on_producer_close(Box::new(move || {
        if let Some(session) = weak_session.upgrade() {
            if session.remove_consumer(&consumer_id).is_some() {
                notify_producer_closed(&session, &producer_id);
                debug!(
                    peer_id = %session.id(),
                    consumer_id = %consumer_id,
                    producer_id = %producer_id,
                    "Remote producer closed"
                );
            }
        }
        if let Some(consumer) = weak_consumer.upgrade() {
            consumer.close();
        }
    }));

    let consumer_id = consumer.id();
    let weak_session = Arc::downgrade(session);
    consumer.on_transport_close(Box::new(move || {
        debug!(consumer_id = %consumer_id, "Consumer transport closed");
        if let Some(session) = weak_session.upgrade() {
            session.remove_consumer(&consumer_id);
        }
    }));
}
