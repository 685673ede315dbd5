//! Room registry
//!
//! Maps room ids to live rooms and peers to their room. Creation and removal
//! of a room are serialized per room id through a slot lock: concurrent first
//! joins of the same id create exactly one router, and a join can never land in
//! a room that is being torn down. A slot is retired from the map together with
//! its room, so a waiter holding a retired slot retries with a fresh one.
//!
//! The room limit is enforced by reserving a room before its router is
//! created, so joins of different new ids cannot overshoot it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::codecs::media_codecs;
use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::room::Room;
use crate::rtp::RtpCodecCapability;
use crate::session::PeerSession;
use crate::types::{PeerId, RoomId};
use crate::worker::WorkerSupervisor;

type Slot = Arc<AsyncMutex<Option<Arc<Room>>>>;

pub struct RoomRegistry {
    workers: Arc<WorkerSupervisor>,
    media_codecs: Vec<RtpCodecCapability>,
    max_rooms: usize,
    max_peers_per_room: usize,
    reserved_rooms: AtomicUsize,
    slots: Mutex<HashMap<RoomId, Slot>>,
    rooms: DashMap<RoomId, Arc<Room>>,
    peer_index: DashMap<PeerId, RoomId>,
}

impl RoomRegistry {
    pub fn new(workers: Arc<WorkerSupervisor>, config: &SfuConfig) -> Self {
        info!(
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            "Room registry initialized"
        );
        Self {
            workers,
            media_codecs: media_codecs(),
            max_rooms: config.max_rooms,
            max_peers_per_room: config.max_peers_per_room,
            reserved_rooms: AtomicUsize::new(0),
            slots: Mutex::new(HashMap::new()),
            rooms: DashMap::new(),
            peer_index: DashMap::new(),
        }
    }

    fn slot(&self, room_id: &RoomId) -> Slot {
        Arc::clone(self.slots.lock().entry(room_id.clone()).or_default())
    }

    fn is_current(&self, room_id: &RoomId, slot: &Slot) -> bool {
        self.slots
            .lock()
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn retire(&self, room_id: &RoomId, slot: &Slot) {
        let mut slots = self.slots.lock();
        if slots.get(room_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(room_id);
        }
    }

    /// Put `peer` into the room, creating the room and its router on first use.
    /// Returns `None` if the peer was evicted before it could be added.
    pub async fn join(&self, room_id: &RoomId, peer: &Arc<PeerSession>) -> Result<Option<Arc<Room>>> {
        loop {
            let slot = self.slot(room_id);
            let mut guard = slot.lock().await;
            if !self.is_current(room_id, &slot) {
                continue;
            }

            if peer.is_removed() {
                if guard.is_none() {
                    self.retire(room_id, &slot);
                }
                return Ok(None);
            }

            let room = match guard.as_ref() {
                Some(room) => Arc::clone(room),
                None => match self.create_room(room_id).await {
                    Ok(room) => {
                        *guard = Some(Arc::clone(&room));
                        room
                    }
                    Err(e) => {
                        self.retire(room_id, &slot);
                        return Err(e);
                    }
                },
            };

            if room.contains(peer.id()) {
                debug!(room_id = %room_id, peer_id = %peer.id(), "Peer already in room");
                return Ok(Some(room));
            }

            let peer_count = room.peer_count();
            if self.max_peers_per_room > 0 && peer_count >= self.max_peers_per_room {
                warn!(
                    room_id = %room_id,
                    current_peers = peer_count,
                    max_peers = self.max_peers_per_room,
                    "Peer limit reached for room"
                );
                return Err(SfuError::RoomFull(room_id.clone()));
            }

            room.add_peer(Arc::clone(peer));
            if !peer.mark_joined() {
                room.remove_peer(peer.id());
                debug!(room_id = %room_id, peer_id = %peer.id(), "Peer left while joining");
                if room.is_empty() {
                    self.remove_room(room_id, &slot, &mut guard);
                    drop(guard);
                    room.router().close();
                }
                return Ok(None);
            }
            self.peer_index.insert(peer.id().clone(), room_id.clone());

            info!(
                room_id = %room_id,
                peer_id = %peer.id(),
                peer_count = peer_count + 1,
                "Added peer to room"
            );
            return Ok(Some(room));
        }
    }

    fn reserve_room(&self) -> bool {
        self.reserved_rooms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (self.max_rooms == 0 || n < self.max_rooms).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_room(&self) {
        self.reserved_rooms.fetch_sub(1, Ordering::SeqCst);
    }

    /// Caller holds the room's slot lock
    async fn create_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        if !self.reserve_room() {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::RoomLimitReached);
        }

        let router = match self.workers.get().await {
            Ok(worker) => worker.create_router(&self.media_codecs).await.map_err(|e| {
                error!(room_id = %room_id, error = %e, "Failed to create router");
                SfuError::from(e)
            }),
            Err(e) => Err(e),
        };
        let router = match router {
            Ok(router) => router,
            Err(e) => {
                self.release_room();
                return Err(e);
            }
        };

        let room = Arc::new(Room::new(room_id.clone(), router));
        self.rooms.insert(room_id.clone(), Arc::clone(&room));

        info!(
            room_id = %room_id,
            router_id = %room.router().id(),
            total_rooms = self.rooms.len(),
            "Created new room"
        );
        Ok(room)
    }

    /// Remove a peer from its room and drop the room once empty.
    /// Returns whether the room was removed.
    pub async fn leave(&self, peer_id: &PeerId, room_id: &RoomId) -> bool {
        let Some(slot) = self.slots.lock().get(room_id).cloned() else {
            debug!(room_id = %room_id, "Room not found when removing peer");
            return false;
        };
        let mut guard = slot.lock().await;
        let Some(room) = guard.clone() else {
            return false;
        };

        if room.remove_peer(peer_id) {
            self.peer_index.remove(peer_id);
            info!(room_id = %room_id, peer_id = %peer_id, "Removed peer from room");
        }
        if !room.is_empty() {
            return false;
        }

        self.remove_room(room_id, &slot, &mut guard);
        drop(guard);

        room.router().close();
        info!(
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Removed empty room"
        );
        true
    }

    /// Forget an empty room; caller holds its slot lock and closes the router
    fn remove_room(&self, room_id: &RoomId, slot: &Slot, guard: &mut Option<Arc<Room>>) {
        if guard.take().is_some() {
            self.rooms.remove(room_id);
            self.release_room();
        }
        self.retire(room_id, slot);
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    /// Room the peer currently belongs to
    #[must_use]
    pub fn find(&self, peer_id: &PeerId) -> Option<Arc<Room>> {
        let room_id = self.peer_index.get(peer_id)?.value().clone();
        self.room(&room_id)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn get_room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LocalEngine, WorkerSettings};
    use crate::notifier::PeerEvent;
    use tokio::sync::mpsc;

    fn registry(engine: &LocalEngine, config: &SfuConfig) -> RoomRegistry {
        let workers = Arc::new(WorkerSupervisor::new(
            Arc::new(engine.clone()),
            WorkerSettings::default(),
        ));
        RoomRegistry::new(workers, config)
    }

    fn peer(id: &str) -> Arc<PeerSession> {
        let (tx, _rx) = mpsc::channel::<PeerEvent>(8);
        Arc::new(PeerSession::new(PeerId::from(id), tx))
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let engine = LocalEngine::new();
        let registry = registry(&engine, &SfuConfig::default());
        let r1 = RoomId::from("r1");
        let (a, b) = (peer("a"), peer("b"));

        let room = registry.join(&r1, &a).await.unwrap().unwrap();
        let same = registry.join(&r1, &b).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&room, &same));
        assert_eq!(room.peer_count(), 2);
        assert!(Arc::ptr_eq(&registry.find(b.id()).unwrap(), &room));

        assert!(!registry.leave(a.id(), &r1).await);
        assert!(registry.room(&r1).is_some());
        assert!(registry.leave(b.id(), &r1).await);
        assert!(registry.room(&r1).is_none());
        assert!(registry.find(b.id()).is_none());
        assert!(room.router().closed());
        assert_eq!(engine.router_count(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let engine = LocalEngine::new();
        let registry = registry(&engine, &SfuConfig::default());
        let r1 = RoomId::from("r1");
        let a = peer("a");

        registry.join(&r1, &a).await.unwrap();
        let room = registry.join(&r1, &a).await.unwrap().unwrap();
        assert_eq!(room.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let engine = LocalEngine::new();
        let config = SfuConfig {
            max_rooms: 1,
            ..Default::default()
        };
        let registry = registry(&engine, &config);

        registry.join(&RoomId::from("r1"), &peer("a")).await.unwrap();
        let err = registry.join(&RoomId::from("r2"), &peer("b")).await.unwrap_err();
        assert_eq!(err, SfuError::RoomLimitReached);
        assert_eq!(registry.room_count(), 1);
        assert_eq!(engine.router_count(), 1);
    }

    #[tokio::test]
    async fn test_removed_room_frees_its_reservation() {
        let engine = LocalEngine::new();
        let config = SfuConfig {
            max_rooms: 1,
            ..Default::default()
        };
        let registry = registry(&engine, &config);
        let (r1, r2) = (RoomId::from("r1"), RoomId::from("r2"));
        let a = peer("a");

        registry.join(&r1, &a).await.unwrap();
        assert!(registry.leave(a.id(), &r1).await);
        registry.join(&r2, &peer("b")).await.unwrap().unwrap();
        assert_eq!(registry.get_room_ids(), vec![r2]);
        assert_eq!(engine.router_count(), 2);
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let engine = LocalEngine::new();
        let config = SfuConfig {
            max_peers_per_room: 1,
            ..Default::default()
        };
        let registry = registry(&engine, &config);
        let r1 = RoomId::from("r1");

        registry.join(&r1, &peer("a")).await.unwrap();
        let err = registry.join(&r1, &peer("b")).await.unwrap_err();
        assert_eq!(err, SfuError::RoomFull(r1));
    }

    #[tokio::test]
    async fn test_leave_unknown_room() {
        let engine = LocalEngine::new();
        let registry = registry(&engine, &SfuConfig::default());
        assert!(!registry.leave(&PeerId::from("ghost"), &RoomId::from("nowhere")).await);
    }
}
