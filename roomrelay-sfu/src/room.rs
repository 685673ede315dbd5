//! Room: one router and the peers routed through it

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::engine::MediaRouter;
use crate::session::PeerSession;
use crate::types::{PeerId, ProducerId, RoomId, RouterId};

pub struct Room {
    id: RoomId,
    router: Arc<dyn MediaRouter>,
    peers: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
    created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(id: RoomId, router: Arc<dyn MediaRouter>) -> Self {
        Self {
            id,
            router,
            peers: RwLock::new(HashMap::new()),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn MediaRouter> {
        &self.router
    }

    /// Membership changes go through the registry, which serializes them per room
    pub(crate) fn add_peer(&self, peer: Arc<PeerSession>) -> bool {
        self.peers.write().insert(peer.id().clone(), peer).is_none()
    }

    pub(crate) fn remove_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.write().remove(peer_id).is_some()
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Snapshot of the current peer set
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<PeerSession>> {
        self.peers.read().values().cloned().collect()
    }

    /// Producers of every peer except `peer_id`
    #[must_use]
    pub fn producer_ids_excluding(&self, peer_id: &PeerId) -> Vec<ProducerId> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.id() != peer_id)
            .flat_map(|peer| peer.producer_ids())
            .collect()
    }

    #[must_use]
    pub fn producer_owner(&self, producer_id: &ProducerId) -> Option<PeerId> {
        self.peers
            .read()
            .values()
            .find(|peer| peer.owns_producer(producer_id))
            .map(|peer| peer.id().clone())
    }

    #[must_use]
    pub fn get_stats(&self) -> RoomStats {
        let peers = self.peers.read();
        RoomStats {
            router_id: self.router.id(),
            peer_count: peers.len(),
            producer_count: peers.values().map(|p| p.resource_counts().1).sum(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("router_id", &self.router.id())
            .field("peer_count", &self.peer_count())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStats {
    pub router_id: RouterId,
    pub peer_count: usize,
    pub producer_count: usize,
    pub created_at: DateTime<Utc>,
}
