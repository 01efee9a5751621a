//! Background maintenance for reliable delivery.
//!
//! Two [`BackgroundRunnable`]s keep the protocol moving without blocking
//! the chains: [`RetransmissionSweep`] re-sends unacknowledged messages on
//! an exponential backoff, and [`AckFlush`] turns overdue acknowledgements
//! into standalone control messages. Both are driven by
//! [`BackgroundWorker`](crate::worker::BackgroundWorker) ticks and accept
//! on-demand tasks for immediate action.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use causeway_core::{ControlAction, Direction, Message, SequenceId};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetransmissionConfig;
use crate::rm::manager::SequenceManager;
use crate::transport::TransportHandle;
use crate::worker::BackgroundRunnable;

/// Backoff before the next transmission attempt.
///
/// Doubles per attempt from `base_interval`, capped at `max_interval`,
/// stretched by up to `jitter_ratio` so a burst of sends does not
/// retransmit in lockstep.
pub(crate) fn backoff_interval(policy: &RetransmissionConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let interval = policy
        .base_interval
        .saturating_mul(1u32 << exponent)
        .min(policy.max_interval);
    if policy.jitter_ratio > 0.0 {
        let stretch = rand::rng().random_range(0.0..policy.jitter_ratio);
        interval.saturating_add(interval.mul_f64(stretch))
    } else {
        interval
    }
}

// ---------------------------------------------------------------------------
// RetransmissionSweep
// ---------------------------------------------------------------------------

/// On-demand task for the sweep worker.
#[derive(Debug, Clone, Copy)]
pub enum SweepCommand {
    /// Sweep immediately instead of waiting for the next tick.
    Now,
}

/// Replays persisted records whose acknowledgement is overdue.
///
/// Each tick asks the [`SequenceManager`] which records are due, then
/// hands their rebuilt messages straight to the transport. Transmit
/// failures are logged and left to the next tick; the record stays
/// persisted until acknowledged.
pub struct RetransmissionSweep {
    manager: Arc<SequenceManager>,
    transport: Arc<dyn TransportHandle>,
}

impl RetransmissionSweep {
    /// Creates a sweep over the given manager and transport.
    #[must_use]
    pub fn new(manager: Arc<SequenceManager>, transport: Arc<dyn TransportHandle>) -> Self {
        Self { manager, transport }
    }

    fn sweep(&self) {
        let records = self.manager.collect_retransmissions(Instant::now());
        for record in records {
            debug!(
                sequence_id = %record.sequence_id,
                number = record.number,
                "retransmitting"
            );
            if let Err(err) = self.transport.transmit(record.to_message()) {
                warn!(
                    sequence_id = %record.sequence_id,
                    number = record.number,
                    %err,
                    "retransmission failed; retrying after backoff"
                );
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for RetransmissionSweep {
    type Task = SweepCommand;

    async fn run(&mut self, task: SweepCommand) {
        match task {
            SweepCommand::Now => self.sweep(),
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

// ---------------------------------------------------------------------------
// AckFlush
// ---------------------------------------------------------------------------

/// Sends standalone acknowledgements once piggybacking has waited too
/// long.
///
/// Each tick drains the acknowledgements that outlived the piggyback
/// window (or were marked urgent) and transmits each as a control message
/// with no payload. Submitting a sequence id flushes that sequence's
/// acknowledgement immediately.
pub struct AckFlush {
    manager: Arc<SequenceManager>,
    transport: Arc<dyn TransportHandle>,
}

impl AckFlush {
    /// Creates a flush over the given manager and transport.
    #[must_use]
    pub fn new(manager: Arc<SequenceManager>, transport: Arc<dyn TransportHandle>) -> Self {
        Self { manager, transport }
    }

    fn flush(&self) {
        for ack in self.manager.overdue_standalone_acks(Instant::now()) {
            let mut message = Message::new(Direction::Outbound);
            message.set_control(ControlAction::Ack);
            message.set_acknowledgement(&ack);
            debug!(sequence_id = %ack.id, "sending standalone acknowledgement");
            if let Err(err) = self.transport.transmit(message) {
                // A lost ack is repaired later: the peer retransmits, the
                // duplicate re-arms the due state.
                warn!(sequence_id = %ack.id, %err, "standalone acknowledgement failed");
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for AckFlush {
    type Task = SequenceId;

    async fn run(&mut self, id: SequenceId) {
        if self.manager.request_ack(&id).is_err() {
            debug!(sequence_id = %id, "no destination sequence to acknowledge");
            return;
        }
        self.flush();
    }

    async fn on_tick(&mut self) {
        self.flush();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
