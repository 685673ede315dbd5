//! Peer session store
//!
//! One [`PeerSession`] per live signaling connection. A session owns the
//! engine objects created on behalf of its peer (transports, producers,
//! consumers) until the cleanup coordinator evicts it. Once evicted, every
//! registration attempt is rejected so that an operation racing a disconnect
//! can release what it created instead of leaking it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{MediaConsumer, MediaProducer, MediaTransport};
use crate::error::{Result, SfuError};
use crate::notifier::PeerEvent;
use crate::rtp::MediaKind;
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportDirection, TransportId};

/// Protocol phase of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Connection registered, no room yet
    Connected,
    /// Member of a room
    Joined,
    /// Evicted by the cleanup coordinator
    Disconnected,
}

/// Why a resource could not be registered under a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The peer was evicted while the resource was being created
    PeerRemoved,
    /// The peer already produces this media kind
    KindTaken,
}

/// Everything a peer owned at eviction, in teardown order
#[derive(Default)]
pub struct OwnedResources {
    pub consumers: Vec<Arc<dyn MediaConsumer>>,
    pub producers: Vec<Arc<dyn MediaProducer>>,
    pub transports: Vec<Arc<dyn MediaTransport>>,
}

struct PeerState {
    phase: PeerPhase,
    room: Option<RoomId>,
    send_transport: Option<Arc<dyn MediaTransport>>,
    recv_transports: HashMap<TransportId, Arc<dyn MediaTransport>>,
    producers: HashMap<MediaKind, Arc<dyn MediaProducer>>,
    consumers: HashMap<ConsumerId, Arc<dyn MediaConsumer>>,
}

/// Per-connection state of one peer
pub struct PeerSession {
    id: PeerId,
    sink: mpsc::Sender<PeerEvent>,
    state: Mutex<PeerState>,
}

impl PeerSession {
    #[must_use]
    pub fn new(id: PeerId, sink: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            id,
            sink,
            state: Mutex::new(PeerState {
                phase: PeerPhase::Connected,
                room: None,
                send_transport: None,
                recv_transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn phase(&self) -> PeerPhase {
        self.state.lock().phase
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.phase() == PeerPhase::Disconnected
    }

    /// Room claimed by this peer, joined or joining
    #[must_use]
    pub fn room(&self) -> Option<RoomId> {
        self.state.lock().room.clone()
    }

    /// Room this peer is a member of
    #[must_use]
    pub fn joined_room(&self) -> Option<RoomId> {
        let state = self.state.lock();
        if state.phase == PeerPhase::Joined {
            state.room.clone()
        } else {
            None
        }
    }

    /// Reserve membership of `room_id`; membership never changes once set
    pub fn claim_room(&self, room_id: &RoomId) -> Result<()> {
        let mut state = self.state.lock();
        match &state.room {
            Some(current) if current != room_id => Err(SfuError::AlreadyJoined(current.clone())),
            Some(_) => Ok(()),
            None => {
                state.room = Some(room_id.clone());
                Ok(())
            }
        }
    }

    /// Drop a claim that never turned into membership
    pub fn release_room(&self, room_id: &RoomId) {
        let mut state = self.state.lock();
        if state.phase == PeerPhase::Connected && state.room.as_ref() == Some(room_id) {
            state.room = None;
        }
    }

    /// Called by the registry once the peer is in the room's peer set
    pub(crate) fn mark_joined(&self) -> bool {
        let mut state = self.state.lock();
        match state.phase {
            PeerPhase::Disconnected => false,
            _ => {
                state.phase = PeerPhase::Joined;
                true
            }
        }
    }

    /// Push a one-way event to the peer's connection; dropped when the queue is full
    pub fn notify(&self, event: PeerEvent) -> bool {
        if self.is_removed() {
            return false;
        }
        match self.sink.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(peer_id = %self.id, ?event, "Notification queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    #[must_use]
    pub fn send_transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.state.lock().send_transport.clone()
    }

    /// Receive transport by id, or the only one when no id is given
    #[must_use]
    pub fn recv_transport(&self, id: Option<&TransportId>) -> Option<Arc<dyn MediaTransport>> {
        let state = self.state.lock();
        match id {
            Some(id) => state.recv_transports.get(id).cloned(),
            None if state.recv_transports.len() == 1 => state.recv_transports.values().next().cloned(),
            None => None,
        }
    }

    #[must_use]
    pub fn has_producer(&self, kind: MediaKind) -> bool {
        self.state.lock().producers.contains_key(&kind)
    }

    #[must_use]
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.state.lock().producers.values().map(|p| p.id()).collect()
    }

    #[must_use]
    pub fn owns_producer(&self, producer_id: &ProducerId) -> bool {
        self.state
            .lock()
            .producers
            .values()
            .any(|p| &p.id() == producer_id)
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<dyn MediaConsumer>> {
        self.state.lock().consumers.get(consumer_id).cloned()
    }

    /// Register a transport; a send transport replaces (and returns) the previous one
    pub fn add_transport(
        &self,
        direction: TransportDirection,
        transport: Arc<dyn MediaTransport>,
    ) -> std::result::Result<Option<Arc<dyn MediaTransport>>, Rejection> {
        let mut state = self.state.lock();
        if state.phase == PeerPhase::Disconnected {
            return Err(Rejection::PeerRemoved);
        }
        match direction {
            TransportDirection::Send => Ok(state.send_transport.replace(transport)),
            TransportDirection::Recv => {
                state.recv_transports.insert(transport.id(), transport);
                Ok(None)
            }
        }
    }

    pub fn add_producer(
        &self,
        producer: Arc<dyn MediaProducer>,
    ) -> std::result::Result<(), Rejection> {
        let mut state = self.state.lock();
        if state.phase == PeerPhase::Disconnected {
            return Err(Rejection::PeerRemoved);
        }
        let kind = producer.kind();
        if state.producers.contains_key(&kind) {
            return Err(Rejection::KindTaken);
        }
        state.producers.insert(kind, producer);
        Ok(())
    }

    pub fn add_consumer(
        &self,
        consumer: Arc<dyn MediaConsumer>,
    ) -> std::result::Result<(), Rejection> {
        let mut state = self.state.lock();
        if state.phase == PeerPhase::Disconnected {
            return Err(Rejection::PeerRemoved);
        }
        state.consumers.insert(consumer.id(), consumer);
        Ok(())
    }

    pub fn remove_transport(&self, transport_id: &TransportId) -> Option<Arc<dyn MediaTransport>> {
        let mut state = self.state.lock();
        if state
            .send_transport
            .as_ref()
            .is_some_and(|t| &t.id() == transport_id)
        {
            return state.send_transport.take();
        }
        state.recv_transports.remove(transport_id)
    }

    pub fn remove_producer(&self, producer_id: &ProducerId) -> Option<Arc<dyn MediaProducer>> {
        let mut state = self.state.lock();
        let kind = state
            .producers
            .iter()
            .find(|(_, p)| &p.id() == producer_id)
            .map(|(kind, _)| *kind)?;
        state.producers.remove(&kind)
    }

    pub fn remove_consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<dyn MediaConsumer>> {
        self.state.lock().consumers.remove(consumer_id)
    }

    /// (transports, producers, consumers) currently registered
    #[must_use]
    pub fn resource_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            usize::from(state.send_transport.is_some()) + state.recv_transports.len(),
            state.producers.len(),
            state.consumers.len(),
        )
    }

    /// Mark the session disconnected and hand over everything it owned
    fn evict(&self) -> Option<OwnedResources> {
        let mut state = self.state.lock();
        if state.phase == PeerPhase::Disconnected {
            return None;
        }
        state.phase = PeerPhase::Disconnected;

        let mut transports: Vec<_> = state.send_transport.take().into_iter().collect();
        transports.extend(state.recv_transports.drain().map(|(_, t)| t));
        Some(OwnedResources {
            consumers: state.consumers.drain().map(|(_, c)| c).collect(),
            producers: state.producers.drain().map(|(_, p)| p).collect(),
            transports,
        })
    }
}

/// All live peer sessions keyed by peer id
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<PeerId, Arc<PeerSession>>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a placeholder session for a fresh connection
    pub fn insert(&self, session: Arc<PeerSession>) {
        self.sessions.insert(session.id().clone(), session);
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.get(peer_id).map(|s| Arc::clone(s.value()))
    }

    /// Evict a peer and return what it owned; `None` if already evicted
    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<(Arc<PeerSession>, OwnedResources)> {
        let (_, session) = self.sessions.remove(peer_id)?;
        let resources = session.evict()?;
        Some((session, resources))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every live session
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }
}
