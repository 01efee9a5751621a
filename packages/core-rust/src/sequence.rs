//! Sequence identity and acknowledgement range primitives.
//!
//! A reliable-messaging sequence is a numbered stream of messages between two
//! endpoints. The destination records which numbers it has accepted as a set
//! of inclusive [`AckRange`]s; [`AckRanges`] keeps that set sorted,
//! non-overlapping, and coalesced so adjacent numbers collapse into one range.
//!
//! These types are pure data: all sequence *state machines* (pending sets,
//! expiry, retransmission bookkeeping) live in the runtime crate.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SequenceId
// ---------------------------------------------------------------------------

/// Unique identifier of a reliable-messaging sequence.
///
/// Opaque to the core; the runtime generates UUID-backed ids, but any
/// non-empty string is a valid identifier (e.g. application-assigned ids).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(String);

impl SequenceId {
    /// Creates a sequence id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// AckRange
// ---------------------------------------------------------------------------

/// An inclusive range of acknowledged message numbers (`lower..=upper`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRange {
    /// Lowest acknowledged number in the range.
    pub lower: u64,
    /// Highest acknowledged number in the range (inclusive).
    pub upper: u64,
}

impl AckRange {
    /// Creates a range covering `lower..=upper`.
    ///
    /// Callers must supply `lower <= upper`; the invariant is checked in
    /// debug builds.
    #[must_use]
    pub fn new(lower: u64, upper: u64) -> Self {
        debug_assert!(lower <= upper, "AckRange lower {lower} > upper {upper}");
        Self { lower, upper }
    }

    /// Creates a range covering a single number.
    #[must_use]
    pub fn single(number: u64) -> Self {
        Self {
            lower: number,
            upper: number,
        }
    }

    /// Whether `number` falls inside this range.
    #[must_use]
    pub fn contains(&self, number: u64) -> bool {
        self.lower <= number && number <= self.upper
    }

    /// Number of message numbers covered by this range.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.upper - self.lower + 1
    }
}

impl fmt::Display for AckRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lower == self.upper {
            write!(f, "{}", self.lower)
        } else {
            write!(f, "{}..={}", self.lower, self.upper)
        }
    }
}

// ---------------------------------------------------------------------------
// AckRanges
// ---------------------------------------------------------------------------

/// Sorted, non-overlapping set of acknowledged message numbers.
///
/// Inserts coalesce adjacent and overlapping numbers into compact ranges, so
/// the common in-order case degenerates to a single growing range. All
/// mutation is idempotent: re-inserting a covered number or re-merging an
/// already-applied acknowledgement leaves the set unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRanges {
    ranges: Vec<AckRange>,
}

impl AckRanges {
    /// Creates an empty range set.
    #[must_use]
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Creates a range set from pre-built ranges (e.g. decoded from a
    /// message context). Input ranges are coalesced and need not be sorted.
    #[must_use]
    pub fn from_ranges(ranges: impl IntoIterator<Item = AckRange>) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert_range(range);
        }
        set
    }

    /// Records `number` as acknowledged.
    ///
    /// Returns `false` if the number was already covered (a duplicate),
    /// `true` if the set changed.
    pub fn insert(&mut self, number: u64) -> bool {
        if self.contains(number) {
            return false;
        }
        self.insert_range(AckRange::single(number));
        true
    }

    /// Merges an entire range into the set, coalescing overlaps and
    /// adjacency. Idempotent.
    pub fn insert_range(&mut self, new: AckRange) {
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        let mut pending = new;
        let mut placed = false;

        for &range in &self.ranges {
            if range.upper.saturating_add(1) < pending.lower {
                // Entirely before the pending range, not even adjacent.
                result.push(range);
            } else if pending.upper.saturating_add(1) < range.lower {
                // Entirely after: emit the pending range once, keep the rest.
                if !placed {
                    result.push(pending);
                    placed = true;
                }
                result.push(range);
            } else {
                // Overlap or adjacency: coalesce into the pending range.
                pending = AckRange::new(
                    pending.lower.min(range.lower),
                    pending.upper.max(range.upper),
                );
            }
        }

        if !placed {
            result.push(pending);
        }
        self.ranges = result;
    }

    /// Merges every range of `other` into this set. Idempotent: applying
    /// the same acknowledgement twice leaves the set unchanged.
    pub fn merge(&mut self, other: &AckRanges) {
        for &range in &other.ranges {
            self.insert_range(range);
        }
    }

    /// Whether `number` is covered by the set.
    #[must_use]
    pub fn contains(&self, number: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.lower <= number);
        idx > 0 && self.ranges[idx - 1].contains(number)
    }

    /// The ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> &[AckRange] {
        &self.ranges
    }

    /// Whether no numbers have been acknowledged yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total count of acknowledged numbers.
    #[must_use]
    pub fn covered_count(&self) -> u64 {
        self.ranges.iter().map(AckRange::count).sum()
    }

    /// Highest acknowledged number, if any.
    #[must_use]
    pub fn highest(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.upper)
    }

    /// Whether the set is one gap-free run starting at `first` and covering
    /// everything up to `last` (used to detect a fully-acknowledged
    /// sequence: `is_complete_run(1, current_number)`).
    #[must_use]
    pub fn is_complete_run(&self, first: u64, last: u64) -> bool {
        match self.ranges.as_slice() {
            [only] => only.lower == first && only.upper >= last,
            _ => false,
        }
    }
}

impl fmt::Display for AckRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{range}")?;
        }
        write!(f, "]")
    }
}

// ---------------------------------------------------------------------------
// SequenceAcknowledgement
// ---------------------------------------------------------------------------

/// The set of message numbers a destination has durably accepted for one
/// sequence.
///
/// Constructed by the destination, transmitted back to the source
/// (piggy-backed on an outbound message or standalone), and immutable once
/// emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceAcknowledgement {
    /// The sequence the acknowledged numbers belong to.
    pub id: SequenceId,
    /// The acknowledged numbers as coalesced ranges.
    pub ranges: AckRanges,
}

impl SequenceAcknowledgement {
    /// Creates an acknowledgement for the given sequence.
    #[must_use]
    pub fn new(id: SequenceId, ranges: AckRanges) -> Self {
        Self { id, ranges }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
