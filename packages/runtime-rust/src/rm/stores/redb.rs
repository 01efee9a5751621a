//! Durable [`RmStore`] implementation backed by [`redb`].
//!
//! A single-file B-tree store. Message records are keyed by
//! `(sequence id, number)` so per-sequence scans are ordered range reads;
//! acknowledgement snapshots live in their own table keyed by
//! `(role, sequence id)`. Values are MsgPack, the same encoding the rest
//! of the runtime uses.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use causeway_core::sequence::AckRanges;
use causeway_core::SequenceId;
use redb::{Database, ReadableTable, TableDefinition};

use crate::rm::store::{RmMessage, RmStore, SequenceRole, StoreError};

/// Unacknowledged message records: `(sequence id, number)` -> MsgPack [`RmMessage`].
const MESSAGES: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("rm_messages");
/// Acknowledgement snapshots: `(role, sequence id)` -> MsgPack [`AckRanges`].
const ACKS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("rm_acks");

fn backend<E: fmt::Display>(err: E) -> StoreError {
    StoreError::backend(err.to_string())
}

/// Durable store for deployments where recovery must survive a restart.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Opens the store at `path`, creating the file and tables on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or its
    /// tables cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend)?;

        // Create both tables up front so read transactions never observe a
        // missing table.
        let txn = db.begin_write().map_err(backend)?;
        {
            txn.open_table(MESSAGES).map_err(backend)?;
            txn.open_table(ACKS).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;

        Ok(Self { db })
    }
}

impl RmStore for RedbStore {
    fn store(&self, message: &RmMessage) -> Result<(), StoreError> {
        let bytes = rmp_serde::to_vec_named(message).map_err(StoreError::codec)?;

        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(backend)?;
            table
                .insert(
                    (message.sequence_id.as_str(), message.number),
                    bytes.as_slice(),
                )
                .map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(())
    }

    fn retrieve(&self, id: &SequenceId, number: u64) -> Result<Option<RmMessage>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(MESSAGES).map_err(backend)?;

        let Some(guard) = table.get((id.as_str(), number)).map_err(backend)? else {
            return Ok(None);
        };
        let record = rmp_serde::from_slice(guard.value()).map_err(StoreError::codec)?;
        Ok(Some(record))
    }

    fn delete(&self, id: &SequenceId, number: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(backend)?;
            table.remove((id.as_str(), number)).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(())
    }

    fn list_unacked(&self, id: &SequenceId) -> Result<Vec<RmMessage>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(MESSAGES).map_err(backend)?;

        let mut records = Vec::new();
        let range = table
            .range((id.as_str(), 0)..=(id.as_str(), u64::MAX))
            .map_err(backend)?;
        for entry in range {
            let (_key, value) = entry.map_err(backend)?;
            records.push(rmp_serde::from_slice(value.value()).map_err(StoreError::codec)?);
        }
        Ok(records)
    }

    fn save_acknowledgement(
        &self,
        role: SequenceRole,
        id: &SequenceId,
        ranges: &AckRanges,
    ) -> Result<(), StoreError> {
        let bytes = rmp_serde::to_vec_named(ranges).map_err(StoreError::codec)?;

        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(ACKS).map_err(backend)?;
            table
                .insert((role.as_str(), id.as_str()), bytes.as_slice())
                .map_err(backend)?;
        }
        txn.commit().map_err(backend)?;
        Ok(())
    }

    fn load_acknowledgement(
        &self,
        role: SequenceRole,
        id: &SequenceId,
    ) -> Result<Option<AckRanges>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(ACKS).map_err(backend)?;

        let Some(guard) = table.get((role.as_str(), id.as_str())).map_err(backend)? else {
            return Ok(None);
        };
        let ranges = rmp_serde::from_slice(guard.value()).map_err(StoreError::codec)?;
        Ok(Some(ranges))
    }

    fn sequence_ids(&self) -> Result<Vec<SequenceId>, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let mut ids: BTreeSet<String> = BTreeSet::new();

        let messages = txn.open_table(MESSAGES).map_err(backend)?;
        for entry in messages.iter().map_err(backend)? {
            let (key, _value) = entry.map_err(backend)?;
            ids.insert(key.value().0.to_owned());
        }

        let acks = txn.open_table(ACKS).map_err(backend)?;
        for entry in acks.iter().map_err(backend)? {
            let (key, _value) = entry.map_err(backend)?;
            ids.insert(key.value().1.to_owned());
        }

        Ok(ids.into_iter().map(SequenceId::new).collect())
    }

    fn remove_sequence(&self, id: &SequenceId) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(backend)?;
            let numbers: Vec<u64> = table
                .range((id.as_str(), 0)..=(id.as_str(), u64::MAX))
                .map_err(backend)?
                .map(|entry| entry.map(|(key, _value)| key.value().1))
                .collect::<Result<_, _>>()
                .map_err(backend)?;
            for number in numbers {
                table.remove((id.as_str(), number)).map_err(backend)?;
            }

            let mut acks = txn.open_table(ACKS).map_err(backend)?;
            for role in [SequenceRole::Source, SequenceRole::Destination] {
                acks.remove((role.as_str(), id.as_str())).map_err(backend)?;
            }
        }
        txn.commit().map_err(backend)?;
        Ok(())
    }
}
