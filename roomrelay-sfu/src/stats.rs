//! Relay-wide statistics

use serde::{Deserialize, Serialize};

use crate::registry::RoomRegistry;
use crate::session::SessionStore;

/// Snapshot of live objects across every room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Number of active rooms
    pub rooms: usize,
    /// Number of connected peers, joined or not
    pub peers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

impl RelayStats {
    #[must_use]
    pub fn collect(registry: &RoomRegistry, sessions: &SessionStore) -> Self {
        let mut stats = Self {
            rooms: registry.room_count(),
            peers: sessions.len(),
            ..Self::default()
        };
        for session in sessions.snapshot() {
            let (transports, producers, consumers) = session.resource_counts();
            stats.transports += transports;
            stats.producers += producers;
            stats.consumers += consumers;
        }
        stats
    }
}
