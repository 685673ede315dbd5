//! Fan-out notifier
//!
//! Best-effort, one-way events pushed to peers over their existing connection.
//! Nothing is acknowledged or retried; a client that missed an event can always
//! reconcile with `listProducers`.

use tracing::debug;

use crate::room::Room;
use crate::session::PeerSession;
use crate::types::{PeerId, ProducerId};

/// Server-initiated event delivered to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Another peer in the room started producing
    NewProducer { producer_id: ProducerId },
    /// A producer this peer consumed has closed
    ProducerClosed { producer_id: ProducerId },
}

/// Tell every other peer in the room about a new producer. Returns how many
/// peers were notified.
pub fn notify_room_of_new_producer(
    room: &Room,
    producing_peer: &PeerId,
    producer_id: &ProducerId,
) -> usize {
    let notified = room
        .peers()
        .iter()
        .filter(|peer| peer.id() != producing_peer)
        .filter(|peer| {
            peer.notify(PeerEvent::NewProducer {
                producer_id: producer_id.clone(),
            })
        })
        .count();

    debug!(
        room_id = %room.id(),
        peer_id = %producing_peer,
        producer_id = %producer_id,
        notified,
        "New producer announced"
    );
    notified
}

/// Tell a consuming peer that the remote producer behind one of its consumers closed
pub fn notify_producer_closed(peer: &PeerSession, producer_id: &ProducerId) -> bool {
    peer.notify(PeerEvent::ProducerClosed {
        producer_id: producer_id.clone(),
    })
}
