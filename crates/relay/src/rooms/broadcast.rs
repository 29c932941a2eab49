use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use formcollab_common::protocol::ws::ServerMessage;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type ConnectionId = u64;

/// Fan-out to the live connections of a room's participants.
///
/// Each connection owns an unbounded channel drained by its socket task, so
/// sending never blocks the caller. Delivery is best effort: a closed
/// channel is skipped and cleaned up when the connection detaches.
#[derive(Debug, Default)]
pub struct Broadcaster {
    connections: RwLock<HashMap<Uuid, HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>>,
    next_connection_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(
        &self,
        participant_id: Uuid,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> ConnectionId {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.write().await.entry(participant_id).or_default().insert(connection_id, sender);
        connection_id
    }

    /// Removes one connection and returns how many the participant still has.
    pub async fn detach(&self, participant_id: Uuid, connection_id: ConnectionId) -> usize {
        let mut guard = self.connections.write().await;
        let Some(participant_connections) = guard.get_mut(&participant_id) else {
            return 0;
        };
        participant_connections.remove(&connection_id);
        let remaining = participant_connections.len();
        if remaining == 0 {
            guard.remove(&participant_id);
        }
        remaining
    }

    /// Drops every connection of a participant from the broadcast set.
    pub async fn remove_participant(&self, participant_id: Uuid) {
        self.connections.write().await.remove(&participant_id);
    }

    /// Sends to every connection except those of `exclude`. Returns the
    /// number of connections the message was handed to.
    pub async fn broadcast(&self, message: &ServerMessage, exclude: Option<Uuid>) -> usize {
        let guard = self.connections.read().await;
        guard
            .iter()
            .filter(|(participant_id, _)| Some(**participant_id) != exclude)
            .flat_map(|(_, participant_connections)| participant_connections.values())
            .filter(|sender| sender.send(message.clone()).is_ok())
            .count()
    }

    /// Sends to every connection of one participant.
    pub async fn send_to(&self, participant_id: Uuid, message: &ServerMessage) -> usize {
        let guard = self.connections.read().await;
        guard
            .get(&participant_id)
            .map(|participant_connections| {
                participant_connections
                    .values()
                    .filter(|sender| sender.send(message.clone()).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn send_to_connection(
        &self,
        participant_id: Uuid,
        connection_id: ConnectionId,
        message: ServerMessage,
    ) -> bool {
        let guard = self.connections.read().await;
        guard
            .get(&participant_id)
            .and_then(|participant_connections| participant_connections.get(&connection_id))
            .is_some_and(|sender| sender.send(message).is_ok())
    }

    pub async fn connection_count(&self, participant_id: Uuid) -> usize {
        self.connections.read().await.get(&participant_id).map_or(0, HashMap::len)
    }

    pub async fn clear(&self) {
        self.connections.write().await.clear();
    }
}
