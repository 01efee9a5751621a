//! Error taxonomy shared by the chain and the reliable-messaging runtime.
//!
//! Two distinct failure families exist and never mix:
//!
//! - [`OrderingError`] is fatal at *chain construction* time. An interceptor
//!   set whose constraints cannot be satisfied is rejected before any message
//!   is processed.
//! - [`ProcessingFault`] is raised per message at *traversal* time. It
//!   triggers the reverse-order fault unwind and is recorded on the message,
//!   but leaves the chain itself intact and reusable.

use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// OrderingError
// ---------------------------------------------------------------------------

/// The interceptor set's ordering constraints cannot be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderingError {
    /// Two interceptors declared the same id.
    #[error("interceptor `{id}` is already registered")]
    DuplicateId {
        /// The id that collided.
        id: String,
    },

    /// Before/after constraints form a cycle among the listed interceptors.
    #[error("ordering constraints form a cycle among: {}", ids.join(", "))]
    Cycle {
        /// Ids of the interceptors that could not be ordered.
        ids: Vec<String>,
    },

    /// A before/after constraint points against the phase order, e.g. an
    /// interceptor in a later phase declaring itself `before` one in an
    /// earlier phase.
    #[error("constraint `{from}` -> `{to}` contradicts phase order ({from_phase} runs after {to_phase})")]
    PhaseConflict {
        /// Id of the interceptor the edge starts at.
        from: String,
        /// Id of the interceptor the edge points to.
        to: String,
        /// Phase of `from`.
        from_phase: &'static str,
        /// Phase of `to`.
        to_phase: &'static str,
    },
}

// ---------------------------------------------------------------------------
// ProcessingFault
// ---------------------------------------------------------------------------

/// Coarse classification of a processing fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// Interceptor-specific application failure.
    Application,
    /// A message referenced a sequence id this endpoint does not know.
    UnknownSequence,
    /// A send was attempted on a sequence that is closing or closed.
    SequenceClosed,
    /// The sequence's lifetime elapsed before the message arrived.
    SequenceExpired,
    /// The persistence collaborator failed; sequence state was left
    /// unchanged.
    Persistence,
    /// The transport failed to hand off the message.
    Transport,
    /// A message exhausted its retransmission budget without being
    /// acknowledged.
    AckTimeout,
}

impl FaultCode {
    /// Stable lower-case label, used in logs and fault messages.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::Application => "application",
            FaultCode::UnknownSequence => "unknown-sequence",
            FaultCode::SequenceClosed => "sequence-closed",
            FaultCode::SequenceExpired => "sequence-expired",
            FaultCode::Persistence => "persistence",
            FaultCode::Transport => "transport",
            FaultCode::AckTimeout => "ack-timeout",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure signalled by an interceptor while processing one message.
///
/// Recorded on the message by the chain, then propagated to every
/// previously-run interceptor via `handle_fault` in reverse order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} fault: {reason}")]
pub struct ProcessingFault {
    /// Classification used by callers to branch on fault kind.
    pub code: FaultCode,
    /// Human-readable detail for logs and diagnostics.
    pub reason: String,
}

impl ProcessingFault {
    /// Creates a fault with an explicit code.
    #[must_use]
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Shorthand for an application-level fault.
    #[must_use]
    pub fn application(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::Application, reason)
    }

    /// Fault for an unrecognized sequence id.
    #[must_use]
    pub fn unknown_sequence(id: impl fmt::Display) -> Self {
        Self::new(
            FaultCode::UnknownSequence,
            format!("no sequence with id {id}"),
        )
    }

    /// Fault for a failed persistence operation.
    #[must_use]
    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::Persistence, reason)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_error_messages_name_the_offenders() {
        let err = OrderingError::Cycle {
            ids: vec!["b".into(), "c".into()],
        };
        assert_eq!(
            err.to_string(),
            "ordering constraints form a cycle among: b, c"
        );

        let err = OrderingError::PhaseConflict {
            from: "sender".into(),
            to: "receiver".into(),
            from_phase: "send",
            to_phase: "receive",
        };
        assert!(
            err.to_string().contains("contradicts phase order"),
            "unexpected message: {err}"
        );
    }

    #[test]
    fn fault_display_includes_code_and_reason() {
        let fault = ProcessingFault::new(FaultCode::UnknownSequence, "no sequence with id s-1");
        assert_eq!(
            fault.to_string(),
            "unknown-sequence fault: no sequence with id s-1"
        );
    }

    #[test]
    fn fault_constructors_set_codes() {
        assert_eq!(
            ProcessingFault::application("boom").code,
            FaultCode::Application
        );
        assert_eq!(
            ProcessingFault::unknown_sequence("s-9").code,
            FaultCode::UnknownSequence
        );
        assert_eq!(
            ProcessingFault::persistence("disk full").code,
            FaultCode::Persistence
        );
    }
}
