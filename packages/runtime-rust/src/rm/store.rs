//! Persistence collaborator for reliable messaging.
//!
//! Every outbound message is persisted as an [`RmMessage`] before its number
//! is considered assigned, and stays retrievable until the destination
//! acknowledges it or the sequence is terminated. Both sides persist an
//! acknowledgement snapshot: the destination so a restart re-acknowledges
//! instead of re-delivering, the source so a restart never hands out a
//! number below one the peer already confirmed.

use causeway_core::{Direction, Message, MessageSnapshot, SequenceId};
use causeway_core::sequence::AckRanges;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A persistence operation failed. The caller's sequence state is left
/// unchanged when this surfaces.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend itself failed (I/O, transaction, corruption).
    #[error("storage backend failure: {reason}")]
    Backend {
        /// Backend-specific detail.
        reason: String,
    },
    /// A record could not be encoded or decoded.
    #[error("record codec failure: {reason}")]
    Codec {
        /// Codec-specific detail.
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn backend(reason: impl Into<String>) -> Self {
        StoreError::Backend {
            reason: reason.into(),
        }
    }

    pub(crate) fn codec(reason: impl ToString) -> Self {
        StoreError::Codec {
            reason: reason.to_string(),
        }
    }
}

/// Which side of a sequence a persisted ack snapshot belongs to.
///
/// The same id never plays both roles on one endpoint, but the store keeps
/// the namespaces separate so recovery can tell them apart without
/// guessing: a source snapshot holds the acks *received* from the peer, a
/// destination snapshot holds the acks *owed* to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceRole {
    /// Sending side.
    Source,
    /// Receiving side.
    Destination,
}

impl SequenceRole {
    /// Stable label used in storage keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceRole::Source => "source",
            SequenceRole::Destination => "destination",
        }
    }
}

/// The persisted form of one sent-but-unacknowledged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmMessage {
    /// Sequence the message belongs to.
    pub sequence_id: SequenceId,
    /// Number assigned within the sequence.
    pub number: u64,
    /// Captured context and payload, sufficient to re-send unchanged.
    pub snapshot: MessageSnapshot,
}

impl RmMessage {
    /// Captures a live outbound message under an already-assigned number.
    #[must_use]
    pub fn capture(sequence_id: SequenceId, number: u64, message: &Message) -> Self {
        Self {
            sequence_id,
            number,
            snapshot: message.snapshot(),
        }
    }

    /// Rebuilds the outbound message exactly as it was captured.
    #[must_use]
    pub fn to_message(&self) -> Message {
        self.snapshot.clone().into_message(Direction::Outbound)
    }
}

/// Storage collaborator for unacknowledged messages and ack snapshots.
///
/// All operations are synchronous; they run under the caller's per-sequence
/// lock so numbering and persistence commit together. Wrapped in
/// `Arc<dyn RmStore>` for sharing across the interceptors and workers.
pub trait RmStore: Send + Sync + 'static {
    /// Persists one message record. Overwrites any record with the same
    /// sequence id and number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record was not durably stored; the
    /// caller must treat the number as never assigned.
    fn store(&self, message: &RmMessage) -> Result<(), StoreError>;

    /// Retrieves a record by sequence id and number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn retrieve(&self, id: &SequenceId, number: u64) -> Result<Option<RmMessage>, StoreError>;

    /// Deletes a record once its number is acknowledged. Deleting an absent
    /// record is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn delete(&self, id: &SequenceId, number: u64) -> Result<(), StoreError>;

    /// All unacknowledged records of a sequence, ascending by number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn list_unacked(&self, id: &SequenceId) -> Result<Vec<RmMessage>, StoreError>;

    /// Persists the acknowledgement ranges of one side of a sequence,
    /// replacing any previous snapshot for that role.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn save_acknowledgement(
        &self,
        role: SequenceRole,
        id: &SequenceId,
        ranges: &AckRanges,
    ) -> Result<(), StoreError>;

    /// Loads previously saved acknowledgement ranges for one role.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn load_acknowledgement(
        &self,
        role: SequenceRole,
        id: &SequenceId,
    ) -> Result<Option<AckRanges>, StoreError>;

    /// Ids of every sequence with any persisted state, for recovery.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn sequence_ids(&self) -> Result<Vec<SequenceId>, StoreError>;

    /// Removes every record and snapshot of a terminated sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn remove_sequence(&self, id: &SequenceId) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_round_trips_to_message() {
        let mut message = Message::with_payload(Direction::Outbound, b"payload".to_vec());
        let id = SequenceId::new("s-1");
        message.set_sequence_id(&id);
        message.set_message_number(7);

        let record = RmMessage::capture(id.clone(), 7, &message);
        assert_eq!(record.sequence_id, id);
        assert_eq!(record.number, 7);

        let rebuilt = record.to_message();
        assert_eq!(rebuilt.direction(), Direction::Outbound);
        assert_eq!(rebuilt.sequence_id(), Some(id));
        assert_eq!(rebuilt.message_number(), Some(7));
        assert_eq!(rebuilt.payload(), b"payload");
    }
}
