//! Inbound protocol interceptor: acks, controls, bookkeeping, delivery.

use std::sync::Arc;

use causeway_core::message::keys;
use causeway_core::{
    Continuation, ControlAction, Interceptor, Message, Phase, ProcessingFault,
};
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::rm::manager::{InboundDisposition, SequenceManager};

/// Protocol-phase interceptor for the inbound chain.
///
/// Per message, in order: acknowledgements riding on it are applied to
/// their source sequence, control actions are executed, then sequenced
/// application messages go through receipt bookkeeping and the delivery
/// policy. Everything deliverable crosses the [`Dispatcher`] here, so
/// duplicates and out-of-order holds never reach the application.
/// Messages without sequence keys pass through untouched.
pub struct RmDestinationInterceptor {
    manager: Arc<SequenceManager>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl RmDestinationInterceptor {
    /// Chain id, for before/after constraints of other interceptors.
    pub const ID: &'static str = "rm-destination";

    /// Creates the interceptor over a shared manager and delivery seam.
    #[must_use]
    pub fn new(manager: Arc<SequenceManager>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            manager,
            dispatcher,
        }
    }

    fn apply_carried_ack(&self, message: &mut Message) -> Result<(), ProcessingFault> {
        let Some(ack) = message.take_acknowledgement() else {
            return Ok(());
        };
        let confirmed = self.manager.record_ack(&ack)?;
        debug!(
            sequence_id = %ack.id,
            confirmed = confirmed.len(),
            "applied carried acknowledgement"
        );
        self.manager.retire_if_complete(&ack.id);
        Ok(())
    }

    fn handle_control(
        &self,
        action: ControlAction,
        message: &mut Message,
    ) -> Result<Continuation, ProcessingFault> {
        match action {
            // The carried ranges were already applied above.
            ControlAction::Ack => {}
            ControlAction::CloseSequence => {
                if let Some(id) = message.sequence_id() {
                    let last = message.get(keys::LAST_NUMBER).and_then(|v| v.as_u64());
                    self.manager.close_destination(&id, last)?;
                }
            }
            ControlAction::TerminateSequence => {
                if let Some(id) = message.sequence_id() {
                    // Idempotent: a re-delivered terminate finds nothing.
                    if self.manager.terminate(&id).is_err() {
                        debug!(sequence_id = %id, "terminate for unknown sequence ignored");
                    }
                }
            }
        }
        Ok(Continuation::Continue)
    }
}

impl Interceptor for RmDestinationInterceptor {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn phase(&self) -> Phase {
        Phase::PROTOCOL
    }

    fn handle_message(&self, message: &mut Message) -> Result<Continuation, ProcessingFault> {
        self.apply_carried_ack(message)?;

        if let Some(action) = message.control() {
            return self.handle_control(action, message);
        }
        if message.sequence_id().is_none() {
            // Unsequenced messages are outside reliable messaging.
            return Ok(Continuation::Continue);
        }

        match self.manager.accept_inbound(message)? {
            InboundDisposition::DeliverNow => {
                self.dispatcher.deliver(message.clone());
            }
            InboundDisposition::DeliverRun(run) => {
                // The arriving message reaches the application through its
                // copy in the run; this instance is done.
                message.mark_discarded();
                for released in run {
                    self.dispatcher.deliver(released);
                }
            }
            InboundDisposition::Held | InboundDisposition::Duplicate => {
                message.mark_discarded();
            }
        }
        Ok(Continuation::Continue)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
