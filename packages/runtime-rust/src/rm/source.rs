//! Outbound protocol interceptor: sequence numbering and ack piggybacking.

use std::sync::Arc;
use std::time::Instant;

use causeway_core::message::keys;
use causeway_core::{Continuation, Interceptor, Message, Phase, ProcessingFault};
use tracing::debug;

use crate::rm::manager::SequenceManager;

/// Protocol-phase interceptor for the outbound chain.
///
/// Application messages are resolved to a source sequence and numbered
/// through the store-then-commit protocol; control messages pass through
/// unnumbered. Either way, a due acknowledgement toward the peer rides
/// along if the message does not already carry one.
pub struct RmSourceInterceptor {
    manager: Arc<SequenceManager>,
}

impl RmSourceInterceptor {
    /// Chain id, for before/after constraints of other interceptors.
    pub const ID: &'static str = "rm-source";

    /// Creates the interceptor over a shared manager.
    #[must_use]
    pub fn new(manager: Arc<SequenceManager>) -> Self {
        Self { manager }
    }

    fn attach_due_ack(&self, message: &mut Message) {
        if message.contains(keys::ACK_SEQUENCE_ID) {
            return;
        }
        if let Some(ack) = self.manager.due_piggyback_ack(Instant::now()) {
            debug!(sequence_id = %ack.id, "piggybacking acknowledgement");
            message.set_acknowledgement(&ack);
        }
    }
}

impl Interceptor for RmSourceInterceptor {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn phase(&self) -> Phase {
        Phase::PROTOCOL
    }

    fn handle_message(&self, message: &mut Message) -> Result<Continuation, ProcessingFault> {
        if message.control().is_some() {
            self.attach_due_ack(message);
            return Ok(Continuation::Continue);
        }

        let id = self.manager.resolve_source(message)?;
        self.manager.assign_number(&id, message)?;
        self.attach_due_ack(message);
        Ok(Continuation::Continue)
    }

    fn handle_fault(&self, message: &mut Message) -> Result<(), ProcessingFault> {
        // Nothing to roll back: the number stays assigned and its record
        // persisted, so the sweep re-sends what this traversal failed to.
        if let (Some(id), Some(number)) = (message.sequence_id(), message.message_number()) {
            debug!(
                sequence_id = %id,
                number,
                "send faulted after numbering; retransmission covers it"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
