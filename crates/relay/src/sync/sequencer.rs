use std::collections::HashMap;

use formcollab_common::clock::VectorClock;
use formcollab_common::types::Operation;
use thiserror::Error;
use tracing::{debug, info_span};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("room {room_id} expected sequence {expected}, got {actual}")]
    OutOfOrder { room_id: Uuid, expected: i64, actual: i64 },
}

/// Sequence number and clock proposed for a candidate operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub sequence_number: i64,
    pub vector_clock: VectorClock,
}

/// Per-room counter and clock table. Owned by the room's sequencing lock,
/// so nothing here is atomic.
///
/// `room_clock[p]` is the number of operations accepted from participant
/// `p`; `participant_clocks[p]` is the clock of `p`'s latest accepted
/// operation.
#[derive(Debug, Clone)]
pub struct RoomSequencer {
    room_id: Uuid,
    head: i64,
    room_clock: VectorClock,
    participant_clocks: HashMap<Uuid, VectorClock>,
}

impl RoomSequencer {
    pub fn new(room_id: Uuid) -> Self {
        Self { room_id, head: 0, room_clock: VectorClock::new(), participant_clocks: HashMap::new() }
    }

    /// Rebuilds the counter and clock table from logged operations.
    pub fn hydrate<'a>(
        room_id: Uuid,
        operations: impl IntoIterator<Item = &'a Operation>,
    ) -> Result<Self, SequenceError> {
        let _span = info_span!("relay.sequencer.hydrate", room_id = %room_id).entered();
        let mut sequencer = Self::new(room_id);
        for operation in operations {
            sequencer.commit(operation)?;
        }
        debug!(head = sequencer.head, "sequencer hydrated from log");
        Ok(sequencer)
    }

    pub fn head(&self) -> i64 {
        self.head
    }

    pub fn room_clock(&self) -> &VectorClock {
        &self.room_clock
    }

    pub fn accepted_count(&self, participant_id: Uuid) -> u64 {
        self.room_clock.get(participant_id)
    }

    /// Proposes the next sequence number and clock without committing.
    ///
    /// The client clock is clamped to what the room has accepted, merged
    /// with the participant's previous clock, and the participant's own
    /// entry becomes its accepted count plus one.
    pub fn stamp(&self, participant_id: Uuid, client_clock: &VectorClock) -> Stamp {
        let observed = client_clock.clamped_to(&self.room_clock);
        let mut vector_clock = self
            .participant_clocks
            .get(&participant_id)
            .map(|previous| previous.merged(&observed))
            .unwrap_or(observed);
        vector_clock.set(participant_id, self.accepted_count(participant_id) + 1);
        Stamp { sequence_number: self.head + 1, vector_clock }
    }

    /// Records an accepted operation. Only called after the log append
    /// succeeded.
    pub fn commit(&mut self, operation: &Operation) -> Result<(), SequenceError> {
        let expected = self.head + 1;
        if operation.sequence_number != expected {
            return Err(SequenceError::OutOfOrder {
                room_id: self.room_id,
                expected,
                actual: operation.sequence_number,
            });
        }

        self.head = operation.sequence_number;
        self.room_clock.merge(&operation.vector_clock);
        self.participant_clocks.insert(operation.participant_id, operation.vector_clock.clone());
        Ok(())
    }
}
