//! Disconnect / cleanup coordinator
//!
//! Runs once per connection loss. Teardown order matters: the peer's consumers
//! go first, then its producers (the engine propagates their closure to every
//! remote consumer, whose handlers notify the owning peers), then transports,
//! and finally room membership. Running it again for the same peer is a no-op.

use tracing::{debug, info};

use crate::registry::RoomRegistry;
use crate::session::SessionStore;
use crate::types::{PeerId, RoomId};

/// What one cleanup run released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    pub peer_id: PeerId,
    pub room_id: Option<RoomId>,
    pub consumers: usize,
    pub producers: usize,
    pub transports: usize,
    pub room_removed: bool,
}

/// Release everything `peer_id` owns. Returns `None` if the peer was already
/// cleaned up or never connected.
pub async fn cleanup_peer(
    sessions: &SessionStore,
    registry: &RoomRegistry,
    peer_id: &PeerId,
) -> Option<CleanupSummary> {
    let Some((session, owned)) = sessions.remove_peer(peer_id) else {
        debug!(peer_id = %peer_id, "Peer already cleaned up");
        return None;
    };

    for consumer in &owned.consumers {
        consumer.close();
    }
    for producer in &owned.producers {
        producer.close();
    }
    for transport in &owned.transports {
        transport.close();
    }

    let room_id = session.room();
    let room_removed = match &room_id {
        Some(room_id) => registry.leave(peer_id, room_id).await,
        None => false,
    };

    info!(
        peer_id = %peer_id,
        room_id = ?room_id.as_ref().map(RoomId::as_str),
        consumers = owned.consumers.len(),
        producers = owned.producers.len(),
        transports = owned.transports.len(),
        room_removed,
        "Peer cleaned up"
    );

    Some(CleanupSummary {
        peer_id: peer_id.clone(),
        room_id,
        consumers: owned.consumers.len(),
        producers: owned.producers.len(),
        transports: owned.transports.len(),
        room_removed,
    })
}
