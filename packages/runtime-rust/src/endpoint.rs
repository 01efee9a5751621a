//! Reliable-messaging endpoint facade.
//!
//! Follows the deferred startup pattern: `new()` wires the chains, the
//! sequence manager, and the shutdown controller, `start()` spawns the
//! background workers, and `shutdown()` stops them, drains in-flight
//! traversals, and reports what is still unacknowledged.

use std::sync::Arc;
use std::time::Duration;

use causeway_core::message::keys;
use causeway_core::{
    ControlAction, Direction, Interceptor, InterceptorChain, Message, OrderingError, Outcome,
    SequenceId, Value,
};
use tracing::{info, warn};

use crate::config::RmConfig;
use crate::dispatch::Dispatcher;
use crate::rm::destination::RmDestinationInterceptor;
use crate::rm::manager::{RecoveryReport, SequenceManager, TerminationReport};
use crate::rm::retransmit::{AckFlush, RetransmissionSweep};
use crate::rm::source::RmSourceInterceptor;
use crate::rm::store::RmStore;
use crate::shutdown::ShutdownController;
use crate::transport::{TransportHandle, TransportSendInterceptor};
use crate::worker::BackgroundWorker;

// ---------------------------------------------------------------------------
// ShutdownReport
// ---------------------------------------------------------------------------

/// What [`RmEndpoint::shutdown`] left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every in-flight traversal finished before the timeout.
    pub drained: bool,
    /// Unacknowledged numbers per source sequence at the moment the
    /// endpoint stopped.
    pub unacked: Vec<(SequenceId, Vec<u64>)>,
}

impl ShutdownReport {
    /// True when the endpoint drained fully and no message is still
    /// waiting for an acknowledgement.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.drained && self.unacked.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RmEndpoint
// ---------------------------------------------------------------------------

/// Both background workers, held together so they start and stop as one.
struct Workers {
    sweep: BackgroundWorker<RetransmissionSweep>,
    flush: BackgroundWorker<AckFlush>,
}

/// One reliable-messaging endpoint: chains, sequence state, persistence,
/// and background maintenance behind a single handle.
///
/// Lifecycle:
/// 1. `new()` -- wires the outbound and inbound chains over a shared
///    [`SequenceManager`]
/// 2. `start()` -- spawns the retransmission sweep and the ack flush,
///    then reports the endpoint ready
/// 3. `shutdown()` -- stops the workers, drains in-flight traversals,
///    and reports unacknowledged messages
///
/// `send` and `receive` each clone a template chain, so any number of
/// tasks may drive the endpoint concurrently; sequence state is
/// serialized inside the manager.
pub struct RmEndpoint {
    manager: Arc<SequenceManager>,
    transport: Arc<dyn TransportHandle>,
    shutdown: Arc<ShutdownController>,
    outbound: InterceptorChain,
    inbound: InterceptorChain,
    workers: Option<Workers>,
}

impl RmEndpoint {
    /// Wires an endpoint over its collaborators without starting the
    /// background workers.
    ///
    /// The outbound chain runs the source interceptor and the
    /// transport-send interceptor; the inbound chain runs the destination
    /// interceptor in front of `dispatcher`.
    ///
    /// # Errors
    ///
    /// Returns an [`OrderingError`] if the built-in interceptors cannot be
    /// ordered, which indicates an id collision with nothing else
    /// registered and should not happen.
    pub fn new(
        config: RmConfig,
        store: Arc<dyn RmStore>,
        transport: Arc<dyn TransportHandle>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, OrderingError> {
        let manager = Arc::new(SequenceManager::new(config, store));

        let mut outbound = InterceptorChain::new();
        outbound.add(Arc::new(RmSourceInterceptor::new(Arc::clone(&manager))))?;
        outbound.add(Arc::new(TransportSendInterceptor::new(Arc::clone(
            &transport,
        ))))?;

        let mut inbound = InterceptorChain::new();
        inbound.add(Arc::new(RmDestinationInterceptor::new(
            Arc::clone(&manager),
            dispatcher,
        )))?;

        Ok(Self {
            manager,
            transport,
            shutdown: Arc::new(ShutdownController::new()),
            outbound,
            inbound,
            workers: None,
        })
    }

    /// Returns a shared reference to the sequence manager.
    ///
    /// Applications use this to establish sequences explicitly or inspect
    /// sequence state.
    #[must_use]
    pub fn manager(&self) -> Arc<SequenceManager> {
        Arc::clone(&self.manager)
    }

    /// Returns a shared reference to the shutdown controller.
    ///
    /// Other components use this to check health state or trigger
    /// shutdown from outside.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Registers an extra interceptor on the outbound chain.
    ///
    /// # Errors
    ///
    /// Returns an [`OrderingError`] for duplicate ids or unsatisfiable
    /// ordering constraints; the chain keeps its previous order.
    pub fn add_outbound_interceptor(
        &mut self,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<(), OrderingError> {
        self.outbound.add(interceptor)
    }

    /// Registers an extra interceptor on the inbound chain.
    ///
    /// # Errors
    ///
    /// Returns an [`OrderingError`] for duplicate ids or unsatisfiable
    /// ordering constraints; the chain keeps its previous order.
    pub fn add_inbound_interceptor(
        &mut self,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<(), OrderingError> {
        self.inbound.add(interceptor)
    }

    /// Spawns the retransmission sweep and the ack flush, then reports
    /// the endpoint ready. A second call is a no-op.
    ///
    /// Must run inside a tokio runtime; the workers are tokio tasks.
    pub fn start(&mut self) {
        if self.workers.is_some() {
            return;
        }

        let retransmission = self.manager.config().retransmission.clone();
        let acks = self.manager.config().acks.clone();

        let sweep = RetransmissionSweep::new(Arc::clone(&self.manager), Arc::clone(&self.transport));
        let flush = AckFlush::new(Arc::clone(&self.manager), Arc::clone(&self.transport));
        self.workers = Some(Workers {
            sweep: BackgroundWorker::start(sweep, retransmission.sweep_interval),
            flush: BackgroundWorker::start(flush, acks.flush_interval),
        });

        self.shutdown.set_ready();
        info!(
            sweep_interval = ?retransmission.sweep_interval,
            flush_interval = ?acks.flush_interval,
            "endpoint ready"
        );
    }

    /// Rebuilds sequence state from the store after a restart.
    ///
    /// Call before [`start`](Self::start): recovered pending messages go
    /// back under retransmission as soon as the sweep runs.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    pub fn recover(&self) -> anyhow::Result<RecoveryReport> {
        Ok(self.manager.recover()?)
    }

    /// Drives an outbound message through the chain: numbering,
    /// persistence, ack piggybacking, transmission.
    ///
    /// The assigned number and sequence id land in the message context.
    /// Protocol failures surface in the returned [`Outcome`], with the
    /// fault recorded on the message.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint is not accepting messages
    /// (not started, or shutting down). The message is untouched.
    pub fn send(&self, message: &mut Message) -> anyhow::Result<Outcome> {
        self.drive(&self.outbound, message)
    }

    /// Like [`send`](Self::send), but on an explicitly named sequence
    /// instead of the target route.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint is not accepting messages. An
    /// unknown `id` surfaces as an `UnknownSequence` fault in the
    /// outcome.
    pub fn send_on(&self, id: &SequenceId, message: &mut Message) -> anyhow::Result<Outcome> {
        message.set_sequence_id(id);
        self.drive(&self.outbound, message)
    }

    /// Drives an arriving message through the inbound chain: carried
    /// acks, controls, receipt bookkeeping, dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint is not accepting messages.
    pub fn receive(&self, message: &mut Message) -> anyhow::Result<Outcome> {
        self.drive(&self.inbound, message)
    }

    /// Closes source sequence `id` and tells the peer its final number.
    ///
    /// Pending messages keep retransmitting until acknowledged; once the
    /// last acknowledgement arrives the sequence retires on its own. A
    /// sequence with nothing pending retires here.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown sequence or when the close control
    /// cannot be delivered; the sequence is closed locally either way.
    pub fn close_sequence(&self, id: &SequenceId) -> anyhow::Result<()> {
        let last = self.manager.close_sequence(id)?;

        let mut control = Message::new(Direction::Outbound);
        control.set_sequence_id(id);
        control.set_control(ControlAction::CloseSequence);
        control.set(keys::LAST_NUMBER, Value::Uint(last));
        let sent = self.send_control(control);

        self.manager.retire_if_complete(id);
        sent
    }

    /// Terminates sequence `id` in either role and tells the peer to drop
    /// its state too.
    ///
    /// Local state is torn down even when the notice cannot be delivered;
    /// the peer's copy then ages out on its own expiry.
    ///
    /// # Errors
    ///
    /// Returns an error when the id matches no sequence.
    pub fn terminate_sequence(&self, id: &SequenceId) -> anyhow::Result<TerminationReport> {
        // Only the source side announces termination. Dropping destination
        // state is local; the peer's source must keep its own records.
        if self.manager.source_state(id).is_some() {
            let mut control = Message::new(Direction::Outbound);
            control.set_sequence_id(id);
            control.set_control(ControlAction::TerminateSequence);
            if let Err(err) = self.send_control(control) {
                warn!(sequence_id = %id, %err, "terminate notice not delivered");
            }
        }

        Ok(self.manager.terminate(id)?)
    }

    /// Asks the flush worker to emit a standalone acknowledgement for
    /// destination sequence `id` now, skipping the piggyback window.
    ///
    /// # Errors
    ///
    /// Returns an error when the workers are not running.
    pub async fn request_acknowledgement(&self, id: &SequenceId) -> anyhow::Result<()> {
        match &self.workers {
            Some(workers) => workers.flush.submit(id.clone()).await,
            None => anyhow::bail!("endpoint not started"),
        }
    }

    /// Stops the workers, drains in-flight traversals for up to
    /// `drain_timeout`, and reports what is still unacknowledged.
    pub async fn shutdown(&mut self, drain_timeout: Duration) -> ShutdownReport {
        self.shutdown.trigger_shutdown();

        if let Some(mut workers) = self.workers.take() {
            workers.sweep.stop().await;
            workers.flush.stop().await;
        }

        let drained = self.shutdown.wait_for_drain(drain_timeout).await;
        if !drained {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with traversals in flight"
            );
        }

        let unacked = self.manager.unacked_summary();
        if unacked.is_empty() {
            info!("endpoint stopped with nothing pending");
        } else {
            warn!(
                sequences = unacked.len(),
                "endpoint stopped with unacknowledged messages"
            );
        }

        ShutdownReport { drained, unacked }
    }

    fn drive(&self, chain: &InterceptorChain, message: &mut Message) -> anyhow::Result<Outcome> {
        if !self.shutdown.is_accepting() {
            anyhow::bail!(
                "endpoint is {:?}, not accepting messages",
                self.shutdown.health_state()
            );
        }
        let _guard = self.shutdown.in_flight_guard();
        Ok(chain.clone().do_intercept(message))
    }

    /// Sends a control message outside the accepting gate, so close and
    /// terminate still reach the peer while the endpoint drains.
    fn send_control(&self, mut control: Message) -> anyhow::Result<()> {
        let _guard = self.shutdown.in_flight_guard();
        match self.outbound.clone().do_intercept(&mut control) {
            Outcome::Completed => Ok(()),
            Outcome::Faulted { fault, .. } => Err(fault.into()),
            Outcome::Suspended => anyhow::bail!("control message suspended in the outbound chain"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
