//! Shared owner of every sequence on an endpoint.
//!
//! The [`SequenceManager`] holds both roles in concurrent maps keyed by
//! sequence id: `DashMap` shards protect the maps themselves, and each
//! sequence sits behind its own [`Mutex`] so numbering, persistence, and
//! acknowledgement bookkeeping commit atomically per sequence without a
//! global lock. Map guards are never held across a sequence lock; entries
//! are cloned out first.

use std::sync::Arc;
use std::time::Instant;

use causeway_core::message::keys;
use causeway_core::sequence::{AckRanges, SequenceAcknowledgement, SequenceId};
use causeway_core::{Direction, FaultCode, Message, ProcessingFault};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RmConfig;
use crate::rm::sequence::{
    DestinationSequence, NumberRefusal, Receipt, SequenceState, SourceSequence,
};
use crate::rm::store::{RmMessage, RmStore, SequenceRole, StoreError};

/// Target used when a send names neither a sequence nor a destination
/// endpoint. Single-peer deployments never need to set one.
pub const DEFAULT_TARGET: &str = "default";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of terminating a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// The terminated sequence.
    pub sequence_id: SequenceId,
    /// Numbers assigned but never acknowledged. Non-empty means the peer
    /// may not have received these messages.
    pub unacked: Vec<u64>,
}

impl TerminationReport {
    /// True when every assigned number was acknowledged before
    /// termination.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unacked.is_empty()
    }
}

/// What [`SequenceManager::recover`] rebuilt from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Source sequences restored.
    pub sources: usize,
    /// Destination sequences restored.
    pub destinations: usize,
    /// Unacknowledged messages back under retransmission.
    pub pending_messages: usize,
}

/// What the destination interceptor should do with an accepted message.
#[derive(Debug)]
pub enum InboundDisposition {
    /// Dispatch the arriving message itself.
    DeliverNow,
    /// In-order mode: dispatch these rebuilt messages, in order. The
    /// arriving message is among them.
    DeliverRun(Vec<Message>),
    /// In-order mode: buffered until the gap before it fills. Not
    /// dispatched now.
    Held,
    /// Already received earlier. Re-acknowledged, never re-dispatched.
    Duplicate,
}

// ---------------------------------------------------------------------------
// SequenceManager
// ---------------------------------------------------------------------------

/// Concurrent registry of source and destination sequences backed by an
/// [`RmStore`].
pub struct SequenceManager {
    config: RmConfig,
    store: Arc<dyn RmStore>,
    sources: DashMap<SequenceId, Arc<Mutex<SourceSequence>>>,
    destinations: DashMap<SequenceId, Arc<Mutex<DestinationSequence>>>,
    /// Open source sequence per target endpoint, for sends that name no
    /// explicit sequence.
    by_target: DashMap<String, SequenceId>,
}

impl SequenceManager {
    /// Creates a manager over the given store.
    #[must_use]
    pub fn new(config: RmConfig, store: Arc<dyn RmStore>) -> Self {
        Self {
            config,
            store,
            sources: DashMap::new(),
            destinations: DashMap::new(),
            by_target: DashMap::new(),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &RmConfig {
        &self.config
    }

    // -- source lifecycle --

    /// Establishes a new source sequence toward `target` and returns its
    /// id.
    pub fn create_sequence(&self, target: &str) -> SequenceId {
        let id = SequenceId::new(Uuid::new_v4().to_string());
        let sequence = SourceSequence::new(
            id.clone(),
            target,
            self.config.sequence.expiry,
            self.config.sequence.max_length,
            Instant::now(),
        );
        self.sources
            .insert(id.clone(), Arc::new(Mutex::new(sequence)));
        self.by_target.insert(target.to_owned(), id.clone());
        info!(sequence_id = %id, target, "created source sequence");
        id
    }

    /// Resolves the source sequence an outbound message belongs to.
    ///
    /// A message that already names a sequence must name a known one. A
    /// message without one is routed by its destination endpoint (or
    /// [`DEFAULT_TARGET`]), establishing a sequence on first use and
    /// replacing it once it stops accepting numbers.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault when the named sequence does not
    /// exist.
    pub fn resolve_source(&self, message: &Message) -> Result<SequenceId, ProcessingFault> {
        if let Some(id) = message.sequence_id() {
            if self.sources.contains_key(&id) {
                return Ok(id);
            }
            return Err(ProcessingFault::unknown_sequence(&id));
        }

        let target = message.to().unwrap_or(DEFAULT_TARGET).to_owned();
        if let Some(id) = self.by_target.get(&target).map(|entry| entry.clone()) {
            let usable = self
                .sources
                .get(&id)
                .map(|entry| Arc::clone(entry.value()))
                .is_some_and(|sequence| sequence.lock().state() == SequenceState::Open);
            if usable {
                return Ok(id);
            }
        }
        // Two concurrent first sends toward one target may both create a
        // sequence; the loser's simply drains and is never reused.
        Ok(self.create_sequence(&target))
    }

    /// Assigns the next number of `id` to an outbound message.
    ///
    /// Runs the store-then-commit protocol under the sequence lock: the
    /// record is persisted under the candidate number and only then is the
    /// number committed. A failed store leaves the counter untouched, so
    /// the same number is handed out again later and the sequence stays
    /// gap-free.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault for an unknown id, a
    /// `SequenceClosed`/`SequenceExpired`/`AckTimeout` fault when the
    /// sequence refuses new numbers, and a `Persistence` fault when the
    /// store rejects the record.
    pub fn assign_number(
        &self,
        id: &SequenceId,
        message: &mut Message,
    ) -> Result<u64, ProcessingFault> {
        let sequence = self.source(id)?;
        let mut guard = sequence.lock();
        let now = Instant::now();

        let number = guard
            .candidate_number(now)
            .map_err(|refusal| refusal_fault(id, refusal))?;

        message.set_sequence_id(id);
        message.set_message_number(number);
        let marked_last = !message.is_last() && guard.closes_at(number);
        if marked_last {
            message.mark_last();
        }

        let record = RmMessage::capture(id.clone(), number, message);
        if let Err(err) = self.store.store(&record) {
            message.remove(keys::SEQUENCE_ID);
            message.remove(keys::MESSAGE_NUMBER);
            if marked_last {
                message.remove(keys::LAST_MESSAGE);
            }
            warn!(sequence_id = %id, number, %err, "store rejected outbound record");
            return Err(ProcessingFault::persistence(err.to_string()));
        }

        guard.commit_send(number, now);
        debug!(sequence_id = %id, number, "assigned message number");
        Ok(number)
    }

    /// Applies an acknowledgement to its source sequence.
    ///
    /// Newly confirmed numbers have their persisted records deleted and
    /// are returned. Re-applying an acknowledgement is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault when no source sequence has this
    /// id.
    pub fn record_ack(
        &self,
        ack: &SequenceAcknowledgement,
    ) -> Result<Vec<u64>, ProcessingFault> {
        let sequence = self.source(&ack.id)?;
        let mut guard = sequence.lock();
        let confirmed = guard.record_ack(&ack.ranges);
        if confirmed.is_empty() {
            return Ok(confirmed);
        }

        // Snapshot first: if it fails the records stay put and recovery
        // still sees every number. Deletes are then individually
        // best-effort; a leftover record only causes one redundant
        // retransmission after a restart.
        if let Err(err) = self
            .store
            .save_acknowledgement(SequenceRole::Source, &ack.id, guard.acked())
        {
            warn!(sequence_id = %ack.id, %err, "failed to persist source ack snapshot");
            return Ok(confirmed);
        }
        for &number in &confirmed {
            if let Err(err) = self.store.delete(&ack.id, number) {
                warn!(sequence_id = %ack.id, number, %err, "failed to delete acked record");
            }
        }
        debug!(
            sequence_id = %ack.id,
            confirmed = confirmed.len(),
            pending = guard.pending().len(),
            "recorded acknowledgement"
        );
        Ok(confirmed)
    }

    /// Whether `number` has been acknowledged on source sequence `id`.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault when no source sequence has this
    /// id.
    pub fn is_acked(&self, id: &SequenceId, number: u64) -> Result<bool, ProcessingFault> {
        Ok(self.source(id)?.lock().is_acked(number))
    }

    /// Stops assigning numbers on `id` and returns the highest number
    /// assigned, for the peer's close handshake. Pending messages still
    /// retransmit until acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault when no source sequence has this
    /// id.
    pub fn close_sequence(&self, id: &SequenceId) -> Result<u64, ProcessingFault> {
        let sequence = self.source(id)?;
        let mut guard = sequence.lock();
        guard.close();
        debug!(sequence_id = %id, "closed source sequence");
        Ok(guard.current_number())
    }

    /// Tears down every trace of a sequence, in either role.
    ///
    /// Unacknowledged source-side numbers are reported as possible message
    /// loss; destination-side state is simply discarded. Persisted state
    /// is removed.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault when the id matches neither
    /// role.
    pub fn terminate(&self, id: &SequenceId) -> Result<TerminationReport, ProcessingFault> {
        let source = self.sources.remove(id).map(|(_, sequence)| sequence);
        let destination = self.destinations.remove(id).is_some();
        if source.is_none() && !destination {
            return Err(ProcessingFault::unknown_sequence(id));
        }

        let mut unacked = Vec::new();
        if let Some(sequence) = source {
            let mut guard = sequence.lock();
            unacked = guard.terminate();
            let target = guard.target().to_owned();
            drop(guard);
            self.by_target
                .remove_if(&target, |_, mapped| mapped == id);
        }

        if unacked.is_empty() {
            info!(sequence_id = %id, "terminated sequence");
        } else {
            error!(
                sequence_id = %id,
                lost = ?unacked,
                "terminated sequence with unacknowledged messages"
            );
        }

        if let Err(err) = self.store.remove_sequence(id) {
            warn!(sequence_id = %id, %err, "failed to purge terminated sequence from store");
        }

        Ok(TerminationReport {
            sequence_id: id.clone(),
            unacked,
        })
    }

    /// Lifecycle state of a source sequence, if one exists.
    #[must_use]
    pub fn source_state(&self, id: &SequenceId) -> Option<SequenceState> {
        self.sources
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .map(|sequence| sequence.lock().state())
    }

    /// Unacknowledged numbers per source sequence, for shutdown reporting.
    /// Sequences with nothing pending are omitted.
    #[must_use]
    pub fn unacked_summary(&self) -> Vec<(SequenceId, Vec<u64>)> {
        let mut summary: Vec<(SequenceId, Vec<u64>)> = self
            .snapshot_sources()
            .into_iter()
            .filter_map(|(id, sequence)| {
                let pending = sequence.lock().pending_numbers();
                (!pending.is_empty()).then_some((id, pending))
            })
            .collect();
        summary.sort_by(|a, b| a.0.cmp(&b.0));
        summary
    }

    // -- destination --

    /// Runs sequence bookkeeping for one inbound sequenced message and
    /// decides its delivery.
    ///
    /// Fresh numbers are made durable before they count as received:
    /// the updated ack ranges are persisted first, then recorded in
    /// memory. Duplicates are counted, re-acknowledged, and reported as
    /// [`InboundDisposition::Duplicate`] so the caller discards them from
    /// dispatch.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault for an unknown sequence when
    /// implicit establishment is disabled, a `SequenceExpired` fault past
    /// the sequence's lifetime, an `Application` fault for a sequenced
    /// message without a number, and a `Persistence` fault when the ack
    /// snapshot cannot be saved.
    pub fn accept_inbound(
        &self,
        message: &Message,
    ) -> Result<InboundDisposition, ProcessingFault> {
        let Some(id) = message.sequence_id() else {
            return Err(ProcessingFault::application(
                "inbound message carries no sequence id",
            ));
        };
        let Some(number) = message.message_number() else {
            return Err(ProcessingFault::application(format!(
                "sequenced message on {id} carries no message number"
            )));
        };

        let destination = self.destination(&id)?;
        let mut guard = destination.lock();
        let now = Instant::now();

        if guard.is_expired(now) {
            return Err(ProcessingFault::new(
                FaultCode::SequenceExpired,
                format!("sequence {id} expired"),
            ));
        }

        if guard.received().contains(number) {
            guard.record_receipt(number);
            guard.mark_ack_due(now);
            debug!(sequence_id = %id, number, "duplicate message");
            return Ok(InboundDisposition::Duplicate);
        }

        // Durable before visible: persist the widened ranges, then record
        // the receipt in memory. A failed save faults the message and the
        // retransmission is treated as fresh.
        let mut widened = guard.received().clone();
        widened.insert(number);
        self.store
            .save_acknowledgement(SequenceRole::Destination, &id, &widened)
            .map_err(|err| ProcessingFault::persistence(err.to_string()))?;
        let receipt = guard.record_receipt(number);
        debug_assert_eq!(receipt, Receipt::Fresh);

        if message.is_last() {
            guard.set_last_number(number);
            guard.mark_ack_urgent(now);
        }
        if message.ack_requested() {
            guard.mark_ack_due(now);
        }
        guard.bump_ack_pressure(self.config.acks.batch_threshold, now);

        if !self.config.delivery.in_order {
            return Ok(InboundDisposition::DeliverNow);
        }
        let released = guard.accept_in_order(number, message.snapshot());
        if released.is_empty() {
            debug!(
                sequence_id = %id,
                number,
                buffered = guard.buffered_len(),
                "held out-of-order message"
            );
            return Ok(InboundDisposition::Held);
        }
        let run = released
            .into_iter()
            .map(|(_, snapshot)| snapshot.into_message(Direction::Inbound))
            .collect();
        Ok(InboundDisposition::DeliverRun(run))
    }

    /// Requests a standalone acknowledgement of a destination sequence on
    /// the next flush, regardless of thresholds.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault when no destination sequence has
    /// this id.
    pub fn request_ack(&self, id: &SequenceId) -> Result<(), ProcessingFault> {
        let destination = self
            .destinations
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProcessingFault::unknown_sequence(id))?;
        destination.lock().mark_ack_urgent(Instant::now());
        Ok(())
    }

    /// Handles a close announcement from the peer: records the final
    /// number, if given, and makes the acknowledgement urgent so the peer
    /// learns what arrived before it terminates.
    ///
    /// # Errors
    ///
    /// Returns an `UnknownSequence` fault for an unknown sequence when
    /// implicit establishment is disabled.
    pub fn close_destination(
        &self,
        id: &SequenceId,
        last_number: Option<u64>,
    ) -> Result<(), ProcessingFault> {
        let destination = self.destination(id)?;
        let mut guard = destination.lock();
        if let Some(last) = last_number {
            guard.set_last_number(last);
        }
        guard.mark_ack_urgent(Instant::now());
        debug!(sequence_id = %id, last = ?last_number, "peer closed sequence");
        Ok(())
    }

    /// Terminates a closing source sequence once everything is
    /// acknowledged. Returns whether it was retired.
    pub fn retire_if_complete(&self, id: &SequenceId) -> bool {
        let Some(sequence) = self.sources.get(id).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };
        let complete = {
            let guard = sequence.lock();
            guard.state() == SequenceState::Closing && guard.all_acked()
        };
        // Two racing callers both observe completion; the second terminate
        // finds nothing and is ignored.
        if complete && self.terminate(id).is_ok() {
            debug!(sequence_id = %id, "closed sequence fully acknowledged; retired");
            return true;
        }
        false
    }

    /// Ranges a destination sequence has received, if one exists.
    #[must_use]
    pub fn received_ranges(&self, id: &SequenceId) -> Option<AckRanges> {
        self.destinations
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .map(|destination| destination.lock().received().clone())
    }

    // -- acknowledgement emission --

    /// Takes the oldest due acknowledgement to ride on an outbound
    /// message, clearing its due state.
    #[must_use]
    pub fn due_piggyback_ack(&self, now: Instant) -> Option<SequenceAcknowledgement> {
        let mut oldest: Option<(Instant, Arc<Mutex<DestinationSequence>>)> = None;
        for (_, destination) in self.snapshot_destinations() {
            let due_since = destination.lock().ack_due_since();
            if let Some(since) = due_since {
                if since <= now && oldest.as_ref().map_or(true, |(best, _)| since < *best) {
                    oldest = Some((since, destination));
                }
            }
        }
        oldest.map(|(_, destination)| destination.lock().emit_ack())
    }

    /// Takes every acknowledgement that must now go out standalone: due
    /// longer than the piggyback window, or marked urgent.
    #[must_use]
    pub fn overdue_standalone_acks(&self, now: Instant) -> Vec<SequenceAcknowledgement> {
        let window = self.config.acks.piggyback_window;
        let mut acks = Vec::new();
        for (_, destination) in self.snapshot_destinations() {
            let mut guard = destination.lock();
            let overdue = guard.ack_due_since().is_some_and(|since| {
                guard.ack_is_urgent() || now.saturating_duration_since(since) >= window
            });
            if overdue {
                acks.push(guard.emit_ack());
            }
        }
        acks
    }

    // -- retransmission --

    /// Collects the records due for retransmission, bumping their attempt
    /// counts.
    ///
    /// A sequence whose retransmission budget is exhausted is marked
    /// degraded and logged instead; it keeps its state for operator
    /// action but sends nothing further.
    #[must_use]
    pub fn collect_retransmissions(&self, now: Instant) -> Vec<RmMessage> {
        let policy = &self.config.retransmission;
        let mut due: Vec<(SequenceId, u64)> = Vec::new();

        for (id, sequence) in self.snapshot_sources() {
            let mut guard = sequence.lock();
            if matches!(
                guard.state(),
                SequenceState::Terminated | SequenceState::Degraded
            ) {
                continue;
            }

            let mut exhausted = false;
            let ready: Vec<u64> = guard
                .pending()
                .iter()
                .filter(|(_, record)| {
                    now.saturating_duration_since(record.last_send)
                        >= crate::rm::retransmit::backoff_interval(policy, record.attempts)
                })
                .map(|(&number, record)| {
                    if policy.max_retransmissions > 0
                        && record.attempts > policy.max_retransmissions
                    {
                        exhausted = true;
                    }
                    number
                })
                .collect();

            if exhausted {
                guard.mark_degraded();
                error!(
                    sequence_id = %id,
                    unacked = ?guard.pending_numbers(),
                    budget = policy.max_retransmissions,
                    "retransmission budget exhausted; sequence degraded"
                );
                continue;
            }
            for &number in &ready {
                guard.record_retransmission(number, now);
                due.push((id.clone(), number));
            }
        }

        let mut records = Vec::with_capacity(due.len());
        for (id, number) in due {
            match self.store.retrieve(&id, number) {
                // Deleted by a concurrent ack between the scan and here.
                Ok(None) => {}
                Ok(Some(record)) => records.push(record),
                Err(err) => {
                    warn!(sequence_id = %id, number, %err, "failed to load record for retransmission");
                }
            }
        }
        records
    }

    // -- recovery --

    /// Rebuilds both roles from the store after a restart.
    ///
    /// Source sequences come back from their unacknowledged records plus
    /// the source ack snapshot, so the next number is always above
    /// anything ever assigned. Destination sequences come back from their
    /// ack snapshot and re-acknowledge instead of re-delivering.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`StoreError`] when enumeration or loading
    /// fails.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let now = Instant::now();
        let mut report = RecoveryReport::default();

        for id in self.store.sequence_ids()? {
            let unacked = self.store.list_unacked(&id)?;
            let source_acks = self
                .store
                .load_acknowledgement(SequenceRole::Source, &id)?;
            if !unacked.is_empty() || source_acks.is_some() {
                let target = unacked
                    .first()
                    .and_then(|record| record.to_message().to().map(str::to_owned))
                    .unwrap_or_else(|| DEFAULT_TARGET.to_owned());
                let numbers: Vec<u64> = unacked.iter().map(|record| record.number).collect();
                report.pending_messages += numbers.len();

                let sequence = SourceSequence::restore(
                    id.clone(),
                    target.clone(),
                    &numbers,
                    source_acks.unwrap_or_default(),
                    now,
                );
                self.by_target.insert(target, id.clone());
                self.sources
                    .insert(id.clone(), Arc::new(Mutex::new(sequence)));
                report.sources += 1;
            }

            if let Some(received) = self
                .store
                .load_acknowledgement(SequenceRole::Destination, &id)?
            {
                let destination = DestinationSequence::restore(id.clone(), received, now);
                self.destinations
                    .insert(id.clone(), Arc::new(Mutex::new(destination)));
                report.destinations += 1;
            }
        }

        info!(
            sources = report.sources,
            destinations = report.destinations,
            pending = report.pending_messages,
            "recovered sequence state"
        );
        Ok(report)
    }

    // -- internals --

    fn source(&self, id: &SequenceId) -> Result<Arc<Mutex<SourceSequence>>, ProcessingFault> {
        self.sources
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProcessingFault::unknown_sequence(id))
    }

    fn destination(
        &self,
        id: &SequenceId,
    ) -> Result<Arc<Mutex<DestinationSequence>>, ProcessingFault> {
        if let Some(entry) = self.destinations.get(id) {
            return Ok(Arc::clone(entry.value()));
        }
        if !self.config.delivery.accept_unknown_sequences {
            return Err(ProcessingFault::unknown_sequence(id));
        }
        // First message of a sequence establishes it implicitly.
        let destination = self
            .destinations
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(sequence_id = %id, "established destination sequence");
                Arc::new(Mutex::new(DestinationSequence::new(
                    id.clone(),
                    self.config.sequence.expiry,
                    Instant::now(),
                )))
            })
            .value()
            .clone();
        Ok(destination)
    }

    /// Clones the source entries out so no shard guard is held while
    /// sequence mutexes are taken.
    fn snapshot_sources(&self) -> Vec<(SequenceId, Arc<Mutex<SourceSequence>>)> {
        self.sources
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn snapshot_destinations(&self) -> Vec<(SequenceId, Arc<Mutex<DestinationSequence>>)> {
        self.destinations
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

fn refusal_fault(id: &SequenceId, refusal: NumberRefusal) -> ProcessingFault {
    match refusal {
        NumberRefusal::Closed => ProcessingFault::new(
            FaultCode::SequenceClosed,
            format!("sequence {id} no longer accepts messages"),
        ),
        NumberRefusal::Expired => ProcessingFault::new(
            FaultCode::SequenceExpired,
            format!("sequence {id} expired"),
        ),
        NumberRefusal::Degraded => ProcessingFault::new(
            FaultCode::AckTimeout,
            format!("sequence {id} degraded after exhausting retransmissions"),
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
