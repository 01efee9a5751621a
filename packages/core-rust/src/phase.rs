//! Phase buckets for interceptor ordering.

use std::cmp::Ordering;
use std::fmt;

/// A coarse ordering bucket an interceptor declares membership in.
///
/// Lower priority runs earlier. Within a phase, explicit before/after
/// constraints refine the order; unconstrained interceptors keep their
/// insertion order. The standard phases below are spaced 1000 apart so
/// deployments can slot custom phases between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Phase {
    name: &'static str,
    priority: u32,
}

impl Phase {
    /// Transport hand-off into the chain (inbound entry).
    pub const RECEIVE: Phase = Phase::new("receive", 1000);
    /// Decoding and envelope handling before protocol logic.
    pub const PRE_PROTOCOL: Phase = Phase::new("pre-protocol", 2000);
    /// Protocol-level processing (reliable messaging lives here).
    pub const PROTOCOL: Phase = Phase::new("protocol", 3000);
    /// Application-facing processing after protocol logic.
    pub const POST_PROTOCOL: Phase = Phase::new("post-protocol", 4000);
    /// Transport hand-off out of the chain (outbound exit).
    pub const SEND: Phase = Phase::new("send", 5000);

    /// Declares a phase. Names are expected to be unique per chain;
    /// two phases with equal priority are ordered by insertion.
    #[must_use]
    pub const fn new(name: &'static str, priority: u32) -> Self {
        Self { name, priority }
    }

    /// The phase name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The bucket priority; lower runs earlier.
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }
}

impl PartialOrd for Phase {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Phase {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.name.cmp(other.name))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_phases_are_strictly_ordered() {
        let phases = [
            Phase::RECEIVE,
            Phase::PRE_PROTOCOL,
            Phase::PROTOCOL,
            Phase::POST_PROTOCOL,
            Phase::SEND,
        ];
        for pair in phases.windows(2) {
            assert!(
                pair[0] < pair[1],
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn custom_phase_slots_between_standard_ones() {
        let decode = Phase::new("decode", 2500);
        assert!(Phase::PRE_PROTOCOL < decode);
        assert!(decode < Phase::PROTOCOL);
    }

    #[test]
    fn equal_priority_orders_by_name() {
        let a = Phase::new("audit", 3000);
        assert!(a < Phase::PROTOCOL, "audit sorts before protocol by name");
    }
}
