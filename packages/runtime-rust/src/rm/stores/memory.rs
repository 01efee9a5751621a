//! In-memory [`RmStore`] implementation backed by [`DashMap`].
//!
//! Provides concurrent access without external locking. Suitable for tests
//! and for deployments that accept losing in-flight state on restart; pair
//! with the `redb` backend when recovery must survive a process restart.

use std::collections::BTreeSet;

use causeway_core::sequence::AckRanges;
use causeway_core::SequenceId;
use dashmap::DashMap;

use crate::rm::store::{RmMessage, RmStore, SequenceRole, StoreError};

/// Volatile store keyed by `(sequence id, message number)`.
pub struct MemoryStore {
    messages: DashMap<(SequenceId, u64), RmMessage>,
    acks: DashMap<(SequenceRole, SequenceId), AckRanges>,
}

impl MemoryStore {
    /// Creates a new, empty `MemoryStore`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            acks: DashMap::new(),
        }
    }

    /// Total persisted message records across all sequences.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.messages.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RmStore for MemoryStore {
    fn store(&self, message: &RmMessage) -> Result<(), StoreError> {
        self.messages.insert(
            (message.sequence_id.clone(), message.number),
            message.clone(),
        );
        Ok(())
    }

    fn retrieve(&self, id: &SequenceId, number: u64) -> Result<Option<RmMessage>, StoreError> {
        Ok(self
            .messages
            .get(&(id.clone(), number))
            .map(|r| r.clone()))
    }

    fn delete(&self, id: &SequenceId, number: u64) -> Result<(), StoreError> {
        self.messages.remove(&(id.clone(), number));
        Ok(())
    }

    fn list_unacked(&self, id: &SequenceId) -> Result<Vec<RmMessage>, StoreError> {
        let mut records: Vec<RmMessage> = self
            .messages
            .iter()
            .filter(|entry| &entry.key().0 == id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.number);
        Ok(records)
    }

    fn save_acknowledgement(
        &self,
        role: SequenceRole,
        id: &SequenceId,
        ranges: &AckRanges,
    ) -> Result<(), StoreError> {
        self.acks.insert((role, id.clone()), ranges.clone());
        Ok(())
    }

    fn load_acknowledgement(
        &self,
        role: SequenceRole,
        id: &SequenceId,
    ) -> Result<Option<AckRanges>, StoreError> {
        Ok(self.acks.get(&(role, id.clone())).map(|r| r.clone()))
    }

    fn sequence_ids(&self) -> Result<Vec<SequenceId>, StoreError> {
        let mut ids: BTreeSet<SequenceId> = self
            .messages
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        ids.extend(self.acks.iter().map(|entry| entry.key().1.clone()));
        Ok(ids.into_iter().collect())
    }

    fn remove_sequence(&self, id: &SequenceId) -> Result<(), StoreError> {
        self.messages.retain(|key, _| &key.0 != id);
        self.acks.remove(&(SequenceRole::Source, id.clone()));
        self.acks.remove(&(SequenceRole::Destination, id.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use causeway_core::{Direction, Message};

    use super::*;

    fn record(id: &SequenceId, number: u64) -> RmMessage {
        let mut message = Message::with_payload(Direction::Outbound, vec![number as u8]);
        message.set_sequence_id(id);
        message.set_message_number(number);
        RmMessage::capture(id.clone(), number, &message)
    }

    #[test]
    fn store_retrieve_delete() {
        let store = MemoryStore::new();
        let id = SequenceId::new("s-1");

        store.store(&record(&id, 1)).unwrap();
        assert_eq!(
            store.retrieve(&id, 1).unwrap().map(|r| r.number),
            Some(1)
        );

        store.delete(&id, 1).unwrap();
        assert!(store.retrieve(&id, 1).unwrap().is_none());

        // Deleting again is a no-op.
        store.delete(&id, 1).unwrap();
    }

    #[test]
    fn list_unacked_is_sorted_and_scoped_to_the_sequence() {
        let store = MemoryStore::new();
        let a = SequenceId::new("s-a");
        let b = SequenceId::new("s-b");

        for n in [3u64, 1, 2] {
            store.store(&record(&a, n)).unwrap();
        }
        store.store(&record(&b, 9)).unwrap();

        let unacked: Vec<u64> = store
            .list_unacked(&a)
            .unwrap()
            .iter()
            .map(|r| r.number)
            .collect();
        assert_eq!(unacked, vec![1, 2, 3]);
    }

    #[test]
    fn acknowledgement_snapshot_round_trips() {
        let store = MemoryStore::new();
        let id = SequenceId::new("s-1");

        assert!(store
            .load_acknowledgement(SequenceRole::Destination, &id)
            .unwrap()
            .is_none());

        let mut ranges = AckRanges::new();
        ranges.insert(1);
        ranges.insert(2);
        ranges.insert(5);
        store
            .save_acknowledgement(SequenceRole::Destination, &id, &ranges)
            .unwrap();

        assert_eq!(
            store
                .load_acknowledgement(SequenceRole::Destination, &id)
                .unwrap(),
            Some(ranges)
        );
        // The other role's namespace is untouched.
        assert!(store
            .load_acknowledgement(SequenceRole::Source, &id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn sequence_ids_covers_both_tables() {
        let store = MemoryStore::new();
        let sender = SequenceId::new("s-out");
        let receiver = SequenceId::new("s-in");

        store.store(&record(&sender, 1)).unwrap();
        store
            .save_acknowledgement(SequenceRole::Destination, &receiver, &AckRanges::new())
            .unwrap();

        let ids = store.sequence_ids().unwrap();
        assert!(ids.contains(&sender));
        assert!(ids.contains(&receiver));
    }

    #[test]
    fn remove_sequence_clears_all_state() {
        let store = MemoryStore::new();
        let id = SequenceId::new("s-1");
        let other = SequenceId::new("s-2");

        store.store(&record(&id, 1)).unwrap();
        store.store(&record(&id, 2)).unwrap();
        store.store(&record(&other, 1)).unwrap();
        store
            .save_acknowledgement(SequenceRole::Source, &id, &AckRanges::new())
            .unwrap();
        store
            .save_acknowledgement(SequenceRole::Destination, &id, &AckRanges::new())
            .unwrap();

        store.remove_sequence(&id).unwrap();

        assert!(store.list_unacked(&id).unwrap().is_empty());
        assert!(store
            .load_acknowledgement(SequenceRole::Source, &id)
            .unwrap()
            .is_none());
        assert!(store
            .load_acknowledgement(SequenceRole::Destination, &id)
            .unwrap()
            .is_none());
        assert_eq!(store.list_unacked(&other).unwrap().len(), 1);
    }
}
