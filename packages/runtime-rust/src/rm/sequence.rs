//! Per-sequence state machines for both reliable-messaging roles.
//!
//! [`SourceSequence`] owns the sending side of one sequence: number
//! assignment, the pending (unacknowledged) set with send metadata, and the
//! lifecycle Open -> Closing -> Terminated (or Degraded when the
//! retransmission budget runs out). [`DestinationSequence`] owns the
//! receiving side: the received-range set, duplicate detection, in-order
//! buffering, and ack-due bookkeeping.
//!
//! Neither type locks anything. The [`SequenceManager`](crate::rm::manager::SequenceManager)
//! wraps each instance in its own mutex; every method here assumes the
//! caller holds that lock.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use causeway_core::sequence::{AckRanges, SequenceAcknowledgement, SequenceId};
use causeway_core::MessageSnapshot;

// ---------------------------------------------------------------------------
// Source side
// ---------------------------------------------------------------------------

/// Lifecycle of a source sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Accepting new message numbers.
    Open,
    /// Last number assigned (close requested or max length reached); no new
    /// numbers, pending messages still retransmit.
    Closing,
    /// Torn down; no further activity.
    Terminated,
    /// Retransmission budget exhausted with numbers still unacknowledged.
    /// Retains state for operator action; refuses new numbers.
    Degraded,
}

/// Why a sequence refused to assign a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberRefusal {
    /// The sequence is closing or terminated.
    Closed,
    /// The sequence's lifetime elapsed.
    Expired,
    /// The sequence is degraded.
    Degraded,
}

/// Send metadata for one pending (unacknowledged) number.
#[derive(Debug, Clone)]
pub struct SendRecord {
    /// When the message was last handed to the transport.
    pub last_send: Instant,
    /// Transmissions so far; 1 after the initial send.
    pub attempts: u32,
}

/// Sending side of one sequence.
#[derive(Debug)]
pub struct SourceSequence {
    id: SequenceId,
    target: String,
    /// Last assigned number; 0 before the first assignment.
    current_number: u64,
    pending: BTreeMap<u64, SendRecord>,
    acked: AckRanges,
    state: SequenceState,
    expires_at: Option<Instant>,
    max_length: u64,
}

impl SourceSequence {
    /// Creates an open sequence toward `target`.
    #[must_use]
    pub fn new(
        id: SequenceId,
        target: impl Into<String>,
        expiry: Option<Duration>,
        max_length: u64,
        now: Instant,
    ) -> Self {
        Self {
            id,
            target: target.into(),
            current_number: 0,
            pending: BTreeMap::new(),
            acked: AckRanges::new(),
            state: SequenceState::Open,
            expires_at: expiry.map(|ttl| now + ttl),
            max_length,
        }
    }

    /// Rebuilds a sequence from persisted records after a restart.
    ///
    /// Pending messages get fresh send metadata: the sweep treats them as
    /// just sent and retries on the normal backoff schedule.
    #[must_use]
    pub fn restore(
        id: SequenceId,
        target: impl Into<String>,
        unacked_numbers: &[u64],
        acked: AckRanges,
        now: Instant,
    ) -> Self {
        let highest_pending = unacked_numbers.iter().copied().max().unwrap_or(0);
        let current_number = highest_pending.max(acked.highest().unwrap_or(0));
        let pending = unacked_numbers
            .iter()
            .map(|&n| {
                (
                    n,
                    SendRecord {
                        last_send: now,
                        attempts: 1,
                    },
                )
            })
            .collect();

        Self {
            id,
            target: target.into(),
            current_number,
            pending,
            acked,
            state: SequenceState::Open,
            expires_at: None,
            max_length: 0,
        }
    }

    /// The sequence id.
    #[must_use]
    pub fn id(&self) -> &SequenceId {
        &self.id
    }

    /// The endpoint this sequence sends toward.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Highest assigned number; 0 before the first assignment.
    #[must_use]
    pub fn current_number(&self) -> u64 {
        self.current_number
    }

    /// Numbers assigned but not yet acknowledged, ascending.
    #[must_use]
    pub fn pending_numbers(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    /// Send metadata for the pending set.
    #[must_use]
    pub fn pending(&self) -> &BTreeMap<u64, SendRecord> {
        &self.pending
    }

    /// Ranges the destination has acknowledged so far.
    #[must_use]
    pub fn acked(&self) -> &AckRanges {
        &self.acked
    }

    /// Whether the sequence's lifetime has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// The number the next send would get, without assigning it.
    ///
    /// Assignment is two-step so persistence can happen in between: the
    /// caller stores the record under the candidate number and only then
    /// calls [`commit_send`](Self::commit_send). A failed store leaves the
    /// counter untouched and the number is handed out again later.
    ///
    /// # Errors
    ///
    /// Refuses when the sequence no longer accepts numbers.
    pub fn candidate_number(&self, now: Instant) -> Result<u64, NumberRefusal> {
        match self.state {
            SequenceState::Open => {}
            SequenceState::Closing | SequenceState::Terminated => {
                return Err(NumberRefusal::Closed)
            }
            SequenceState::Degraded => return Err(NumberRefusal::Degraded),
        }
        if self.is_expired(now) {
            return Err(NumberRefusal::Expired);
        }
        Ok(self.current_number + 1)
    }

    /// Whether assigning `number` would exhaust the configured maximum
    /// length, making it the sequence's last message.
    #[must_use]
    pub fn closes_at(&self, number: u64) -> bool {
        self.max_length > 0 && number >= self.max_length
    }

    /// Commits a previously issued candidate number as sent.
    ///
    /// A sequence that reaches its configured maximum length closes itself;
    /// the caller observes that through [`state`](Self::state).
    pub fn commit_send(&mut self, number: u64, now: Instant) {
        debug_assert_eq!(
            number,
            self.current_number + 1,
            "commit out of order on {}",
            self.id
        );
        self.current_number = number;
        self.pending.insert(
            number,
            SendRecord {
                last_send: now,
                attempts: 1,
            },
        );
        if self.max_length > 0 && self.current_number >= self.max_length {
            self.state = SequenceState::Closing;
        }
    }

    /// Applies an acknowledgement, returning the numbers newly confirmed
    /// (their persisted records can be deleted). Idempotent: a re-applied
    /// acknowledgement returns nothing.
    pub fn record_ack(&mut self, ranges: &AckRanges) -> Vec<u64> {
        self.acked.merge(ranges);
        let confirmed: Vec<u64> = self
            .pending
            .keys()
            .copied()
            .filter(|&n| self.acked.contains(n))
            .collect();
        for number in &confirmed {
            self.pending.remove(number);
        }
        confirmed
    }

    /// Whether a number has been acknowledged.
    #[must_use]
    pub fn is_acked(&self, number: u64) -> bool {
        self.acked.contains(number)
    }

    /// Whether every assigned number is acknowledged.
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records one retransmission of `number`.
    pub fn record_retransmission(&mut self, number: u64, now: Instant) {
        if let Some(record) = self.pending.get_mut(&number) {
            record.attempts += 1;
            record.last_send = now;
        }
    }

    /// Requests close: the current number becomes the last. Pending
    /// messages still retransmit until acknowledged.
    pub fn close(&mut self) {
        if self.state == SequenceState::Open {
            self.state = SequenceState::Closing;
        }
    }

    /// Marks the sequence degraded after the retransmission budget ran out.
    pub fn mark_degraded(&mut self) {
        if self.state != SequenceState::Terminated {
            self.state = SequenceState::Degraded;
        }
    }

    /// Terminates the sequence, returning any numbers still
    /// unacknowledged. A non-empty return is reportable message loss.
    pub fn terminate(&mut self) -> Vec<u64> {
        self.state = SequenceState::Terminated;
        let lost: Vec<u64> = self.pending.keys().copied().collect();
        self.pending.clear();
        lost
    }
}

// ---------------------------------------------------------------------------
// Destination side
// ---------------------------------------------------------------------------

/// Outcome of recording one received number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First time this number was seen.
    Fresh,
    /// Already recorded; the message must not be dispatched again.
    Duplicate,
}

/// Receiving side of one sequence.
#[derive(Debug)]
pub struct DestinationSequence {
    id: SequenceId,
    received: AckRanges,
    /// In-order mode: every number up to and including this one has been
    /// dispatched.
    delivered_up_to: u64,
    /// In-order mode: out-of-order arrivals held until the gap fills.
    buffered: BTreeMap<u64, MessageSnapshot>,
    /// Number of the final message, once the source closed the sequence.
    last_number: Option<u64>,
    duplicates: u64,
    ack_due_since: Option<Instant>,
    /// Skip the piggyback window on the next flush (last message seen or
    /// close requested).
    ack_urgent: bool,
    receipts_since_ack: u32,
    expires_at: Option<Instant>,
}

impl DestinationSequence {
    /// Creates destination state for a sequence first seen now.
    #[must_use]
    pub fn new(id: SequenceId, expiry: Option<Duration>, now: Instant) -> Self {
        Self {
            id,
            received: AckRanges::new(),
            delivered_up_to: 0,
            buffered: BTreeMap::new(),
            last_number: None,
            duplicates: 0,
            ack_due_since: None,
            ack_urgent: false,
            receipts_since_ack: 0,
            expires_at: expiry.map(|ttl| now + ttl),
        }
    }

    /// Rebuilds destination state from a persisted ack snapshot.
    ///
    /// The delivered watermark resumes at the end of the contiguous prefix,
    /// so in-order mode never re-delivers; retransmissions fill any gaps.
    #[must_use]
    pub fn restore(id: SequenceId, received: AckRanges, now: Instant) -> Self {
        let delivered_up_to = match received.ranges().first() {
            Some(first) if first.lower == 1 => first.upper,
            _ => 0,
        };
        let mut sequence = Self::new(id, None, now);
        sequence.received = received;
        sequence.delivered_up_to = delivered_up_to;
        sequence
    }

    /// The sequence id.
    #[must_use]
    pub fn id(&self) -> &SequenceId {
        &self.id
    }

    /// Ranges received so far.
    #[must_use]
    pub fn received(&self) -> &AckRanges {
        &self.received
    }

    /// Count of duplicate receptions.
    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Whether the sequence's lifetime has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Records number receipt into the range set.
    pub fn record_receipt(&mut self, number: u64) -> Receipt {
        if self.received.insert(number) {
            Receipt::Fresh
        } else {
            self.duplicates += 1;
            Receipt::Duplicate
        }
    }

    /// Counts a reception toward the ack batch threshold; marks the ack due
    /// once the threshold is met. Duplicates count too, so a lost ack gets
    /// re-sent when the duplicate arrives.
    pub fn bump_ack_pressure(&mut self, threshold: u32, now: Instant) {
        self.receipts_since_ack += 1;
        if self.receipts_since_ack >= threshold {
            self.mark_ack_due(now);
        }
    }

    /// Marks the acknowledgement due immediately.
    pub fn mark_ack_due(&mut self, now: Instant) {
        if self.ack_due_since.is_none() {
            self.ack_due_since = Some(now);
        }
    }

    /// Marks the acknowledgement due and exempt from the piggyback window,
    /// so the next flush sends it standalone without waiting.
    pub fn mark_ack_urgent(&mut self, now: Instant) {
        self.mark_ack_due(now);
        self.ack_urgent = true;
    }

    /// When the current acknowledgement became due, if one is pending.
    #[must_use]
    pub fn ack_due_since(&self) -> Option<Instant> {
        self.ack_due_since
    }

    /// Whether the pending acknowledgement must go out on the next flush.
    #[must_use]
    pub fn ack_is_urgent(&self) -> bool {
        self.ack_urgent
    }

    /// Builds the acknowledgement covering everything received and clears
    /// the due state.
    pub fn emit_ack(&mut self) -> SequenceAcknowledgement {
        self.ack_due_since = None;
        self.ack_urgent = false;
        self.receipts_since_ack = 0;
        SequenceAcknowledgement::new(self.id.clone(), self.received.clone())
    }

    /// Accepts a fresh number under in-order delivery.
    ///
    /// Returns the messages now deliverable: the new arrival if it fills
    /// the next slot, followed by any buffered successors it unblocks.
    /// Out-of-order arrivals are buffered and return nothing. Numbers
    /// acknowledged before a restart have no buffered copy; the watermark
    /// moves past them.
    pub fn accept_in_order(
        &mut self,
        number: u64,
        snapshot: MessageSnapshot,
    ) -> Vec<(u64, MessageSnapshot)> {
        if number != self.delivered_up_to + 1 {
            self.buffered.insert(number, snapshot);
            return Vec::new();
        }

        let mut deliverable = vec![(number, snapshot)];
        self.delivered_up_to = number;
        loop {
            if let Some(next) = self.buffered.remove(&(self.delivered_up_to + 1)) {
                self.delivered_up_to += 1;
                deliverable.push((self.delivered_up_to, next));
            } else if self.received.contains(self.delivered_up_to + 1) {
                // Received and acknowledged before a restart; the buffered
                // copy is gone. Counted as delivered.
                self.delivered_up_to += 1;
            } else {
                break;
            }
        }
        deliverable
    }

    /// Count of buffered out-of-order messages.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Records the number of the sequence's final message.
    pub fn set_last_number(&mut self, number: u64) {
        self.last_number = Some(number);
    }

    /// Whether the source closed the sequence and every number up to the
    /// last has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.last_number
            .is_some_and(|last| self.received.is_complete_run(1, last))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
