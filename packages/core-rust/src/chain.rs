//! Phase-ordered interceptor chain with reverse-order fault unwind.
//!
//! Interceptors are registered in any order; the chain resolves a total
//! order from phase priorities, explicit before/after constraints, and
//! insertion order as the tie-break. Resolution happens eagerly on every
//! `add`, so an unsatisfiable constraint set is rejected before any message
//! is processed and the chain keeps its last valid order.
//!
//! Traversal walks the resolved order forward. A fault stops forward
//! progress and notifies the failing interceptor plus every previously-run
//! one via `handle_fault`, in exact reverse order. A suspension freezes the
//! cursor; `resume` continues with the next interceptor, and a fault after
//! resumption still unwinds through the interceptors run before the
//! suspension.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tracing::{debug, debug_span, trace, warn};

use crate::error::{OrderingError, ProcessingFault};
use crate::interceptor::{Continuation, Interceptor};
use crate::message::Message;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal status of one chain traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every interceptor ran to completion.
    Completed,
    /// An interceptor faulted. The primary fault is also recorded on the
    /// message; `suppressed` collects any secondary failures raised by
    /// `handle_fault` hooks during the unwind.
    Faulted {
        /// The fault that stopped forward traversal.
        fault: ProcessingFault,
        /// Failures raised during the unwind, in notification order.
        suppressed: Vec<ProcessingFault>,
    },
    /// An interceptor suspended the traversal; call
    /// [`InterceptorChain::resume`] to continue it.
    Suspended,
}

impl Outcome {
    /// Whether the traversal ran to completion.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }

    /// Whether the traversal stopped on a fault.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        matches!(self, Outcome::Faulted { .. })
    }

    /// Whether the traversal is suspended awaiting `resume`.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Outcome::Suspended)
    }
}

// ---------------------------------------------------------------------------
// InterceptorChain
// ---------------------------------------------------------------------------

/// A suspended traversal: the interceptor set it started with and the
/// position to continue from.
#[derive(Clone)]
struct Traversal {
    active: Vec<Arc<dyn Interceptor>>,
    cursor: usize,
}

/// Phase-bucketed interceptor chain.
///
/// The chain itself carries no per-message state except a possible suspended
/// traversal; it can be reused across messages. Each traversal snapshots the
/// resolved order, so adding interceptors while one message is suspended
/// never disturbs the in-flight traversal.
///
/// A chain drives one message at a time. For concurrent traffic, clone the
/// chain per message: clones share the interceptor instances (via `Arc`) but
/// traverse independently.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    /// All registered interceptors in insertion order.
    interceptors: Vec<Arc<dyn Interceptor>>,
    /// Indices into `interceptors`, in resolved execution order. Kept valid
    /// by re-resolving on every successful `add`.
    resolved: Vec<usize>,
    /// A suspended traversal waiting for `resume`.
    pending: Option<Traversal>,
}

impl InterceptorChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether no interceptors are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Whether a suspended traversal is waiting for [`resume`](Self::resume).
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.pending.is_some()
    }

    /// Registers an interceptor and re-resolves the execution order.
    ///
    /// # Errors
    ///
    /// Rejects duplicate ids and constraint sets that cannot be satisfied
    /// (cycles, constraints against the phase order). On error the chain is
    /// left exactly as it was, with its previous valid order.
    pub fn add(&mut self, interceptor: Arc<dyn Interceptor>) -> Result<(), OrderingError> {
        let id = interceptor.id();
        if self.interceptors.iter().any(|existing| existing.id() == id) {
            return Err(OrderingError::DuplicateId { id: id.to_owned() });
        }

        self.interceptors.push(interceptor);
        match Self::compute_order(&self.interceptors) {
            Ok(order) => {
                self.resolved = order;
                Ok(())
            }
            Err(err) => {
                // Reject the newcomer, keep the chain usable.
                self.interceptors.pop();
                Err(err)
            }
        }
    }

    /// Ids in resolved execution order.
    #[must_use]
    pub fn resolved_order(&self) -> Vec<&'static str> {
        self.resolved
            .iter()
            .map(|&i| self.interceptors[i].id())
            .collect()
    }

    /// Drives `message` through the full chain.
    ///
    /// A message that already carries a fault is not processed: the traversal
    /// reports `Faulted` with the recorded fault and no interceptor runs.
    /// Starting a new traversal abandons any suspended one.
    pub fn do_intercept(&mut self, message: &mut Message) -> Outcome {
        if let Some(fault) = message.fault() {
            warn!(%fault, "refusing to traverse an already-faulted message");
            return Outcome::Faulted {
                fault: fault.clone(),
                suppressed: Vec::new(),
            };
        }

        self.pending = None;
        let active: Vec<Arc<dyn Interceptor>> = self
            .resolved
            .iter()
            .map(|&i| Arc::clone(&self.interceptors[i]))
            .collect();
        self.run(active, 0, message)
    }

    /// Continues a suspended traversal with the interceptor after the one
    /// that suspended. A resume with no suspended traversal is a no-op that
    /// reports `Completed`.
    pub fn resume(&mut self, message: &mut Message) -> Outcome {
        match self.pending.take() {
            Some(traversal) => self.run(traversal.active, traversal.cursor, message),
            None => {
                debug!("resume called with no suspended traversal");
                Outcome::Completed
            }
        }
    }

    fn run(
        &mut self,
        active: Vec<Arc<dyn Interceptor>>,
        start: usize,
        message: &mut Message,
    ) -> Outcome {
        let span = debug_span!(
            "traversal",
            direction = ?message.direction(),
            from = start,
            interceptors = active.len(),
        );
        let _guard = span.enter();

        let mut cursor = start;
        while cursor < active.len() {
            let interceptor = &active[cursor];
            trace!(id = interceptor.id(), phase = %interceptor.phase(), "invoking interceptor");

            match interceptor.handle_message(message) {
                Ok(Continuation::Continue) => cursor += 1,
                Ok(Continuation::Suspend) => {
                    debug!(id = interceptor.id(), "traversal suspended");
                    self.pending = Some(Traversal {
                        active,
                        cursor: cursor + 1,
                    });
                    return Outcome::Suspended;
                }
                Err(fault) => {
                    warn!(id = interceptor.id(), %fault, "interceptor faulted, unwinding");
                    message.record_fault(fault.clone());
                    let suppressed = Self::unwind(&active[..=cursor], message);
                    return Outcome::Faulted { fault, suppressed };
                }
            }
        }
        Outcome::Completed
    }

    /// Notifies `handle_fault` on every visited interceptor in reverse
    /// order. Secondary failures never stop the unwind; they are logged and
    /// returned for diagnostics.
    fn unwind(visited: &[Arc<dyn Interceptor>], message: &mut Message) -> Vec<ProcessingFault> {
        let mut suppressed = Vec::new();
        for interceptor in visited.iter().rev() {
            trace!(id = interceptor.id(), "notifying handle_fault");
            if let Err(secondary) = interceptor.handle_fault(message) {
                warn!(
                    id = interceptor.id(),
                    fault = %secondary,
                    "handle_fault failed during unwind, continuing"
                );
                suppressed.push(secondary);
            }
        }
        suppressed
    }

    // -- order resolution --

    /// Stable topological sort: ready interceptors are picked by
    /// `(phase priority, insertion index)`, so phases group correctly and
    /// unconstrained interceptors keep insertion order.
    fn compute_order(interceptors: &[Arc<dyn Interceptor>]) -> Result<Vec<usize>, OrderingError> {
        let n = interceptors.len();
        let mut index_of: HashMap<&'static str, usize> = HashMap::with_capacity(n);
        for (i, interceptor) in interceptors.iter().enumerate() {
            index_of.insert(interceptor.id(), i);
        }

        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];

        for (i, interceptor) in interceptors.iter().enumerate() {
            // Constraints naming ids not present in the chain are ignored;
            // they may refer to optional interceptors.
            for &target in interceptor.before() {
                if let Some(&j) = index_of.get(target) {
                    Self::add_edge(interceptors, &mut successors, &mut indegree, i, j)?;
                }
            }
            for &target in interceptor.after() {
                if let Some(&j) = index_of.get(target) {
                    Self::add_edge(interceptors, &mut successors, &mut indegree, j, i)?;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(u32, usize)>> = BinaryHeap::new();
        for i in 0..n {
            if indegree[i] == 0 {
                ready.push(Reverse((interceptors[i].phase().priority(), i)));
            }
        }

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((_, i))) = ready.pop() {
            order.push(i);
            for &j in &successors[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push(Reverse((interceptors[j].phase().priority(), j)));
                }
            }
        }

        if order.len() != n {
            let ids = (0..n)
                .filter(|i| !order.contains(i))
                .map(|i| interceptors[i].id().to_owned())
                .collect();
            return Err(OrderingError::Cycle { ids });
        }
        Ok(order)
    }

    /// Adds the edge `from -> to` (from runs earlier), validating it against
    /// the phase order.
    fn add_edge(
        interceptors: &[Arc<dyn Interceptor>],
        successors: &mut [Vec<usize>],
        indegree: &mut [usize],
        from: usize,
        to: usize,
    ) -> Result<(), OrderingError> {
        if from == to {
            return Err(OrderingError::Cycle {
                ids: vec![interceptors[from].id().to_owned()],
            });
        }

        let from_phase = interceptors[from].phase();
        let to_phase = interceptors[to].phase();
        if from_phase.priority() > to_phase.priority() {
            return Err(OrderingError::PhaseConflict {
                from: interceptors[from].id().to_owned(),
                to: interceptors[to].id().to_owned(),
                from_phase: from_phase.name(),
                to_phase: to_phase.name(),
            });
        }

        if !successors[from].contains(&to) {
            successors[from].push(to);
            indegree[to] += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::FaultCode;
    use crate::message::Direction;
    use crate::phase::Phase;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum Mode {
        Continue,
        Suspend,
        Fail,
    }

    /// Scripted interceptor that records every call into a shared log.
    struct Step {
        id: &'static str,
        phase: Phase,
        before: Vec<&'static str>,
        after: Vec<&'static str>,
        mode: Mode,
        fail_fault_hook: bool,
        log: Log,
    }

    impl Step {
        fn new(id: &'static str, phase: Phase, log: &Log) -> Self {
            Self {
                id,
                phase,
                before: Vec::new(),
                after: Vec::new(),
                mode: Mode::Continue,
                fail_fault_hook: false,
                log: Arc::clone(log),
            }
        }

        fn runs_before(mut self, ids: &[&'static str]) -> Self {
            self.before = ids.to_vec();
            self
        }

        fn runs_after(mut self, ids: &[&'static str]) -> Self {
            self.after = ids.to_vec();
            self
        }

        fn suspending(mut self) -> Self {
            self.mode = Mode::Suspend;
            self
        }

        fn failing(mut self) -> Self {
            self.mode = Mode::Fail;
            self
        }

        fn failing_fault_hook(mut self) -> Self {
            self.fail_fault_hook = true;
            self
        }

        fn arc(self) -> Arc<dyn Interceptor> {
            Arc::new(self)
        }
    }

    impl Interceptor for Step {
        fn id(&self) -> &'static str {
            self.id
        }

        fn phase(&self) -> Phase {
            self.phase
        }

        fn before(&self) -> &[&'static str] {
            &self.before
        }

        fn after(&self) -> &[&'static str] {
            &self.after
        }

        fn handle_message(&self, _message: &mut Message) -> Result<Continuation, ProcessingFault> {
            self.log.lock().unwrap().push(format!("handle:{}", self.id));
            match self.mode {
                Mode::Continue => Ok(Continuation::Continue),
                Mode::Suspend => Ok(Continuation::Suspend),
                Mode::Fail => Err(ProcessingFault::application(format!("{} failed", self.id))),
            }
        }

        fn handle_fault(&self, _message: &mut Message) -> Result<(), ProcessingFault> {
            self.log.lock().unwrap().push(format!("fault:{}", self.id));
            if self.fail_fault_hook {
                Err(ProcessingFault::application(format!(
                    "{} fault hook failed",
                    self.id
                )))
            } else {
                Ok(())
            }
        }
    }

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn inbound() -> Message {
        Message::new(Direction::Inbound)
    }

    // -- ordering --

    #[test]
    fn empty_chain_completes() {
        let mut chain = InterceptorChain::new();
        let outcome = chain.do_intercept(&mut inbound());
        assert_eq!(outcome, Outcome::Completed);
    }

    #[test]
    fn phases_group_regardless_of_insertion_order() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("sender", Phase::SEND, &log).arc()).unwrap();
        chain
            .add(Step::new("receiver", Phase::RECEIVE, &log).arc())
            .unwrap();
        chain
            .add(Step::new("proto", Phase::PROTOCOL, &log).arc())
            .unwrap();

        assert_eq!(chain.resolved_order(), vec!["receiver", "proto", "sender"]);
    }

    #[test]
    fn insertion_order_breaks_ties_within_a_phase() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain
            .add(Step::new("early", Phase::RECEIVE, &log).arc())
            .unwrap();
        chain.add(Step::new("b", Phase::PROTOCOL, &log).arc()).unwrap();

        assert_eq!(chain.resolved_order(), vec!["early", "a", "b"]);
    }

    #[test]
    fn before_constraint_reorders_within_a_phase() {
        // a, b, c registered in that order; c declares it must run before b.
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain.add(Step::new("b", Phase::PROTOCOL, &log).arc()).unwrap();
        chain
            .add(Step::new("c", Phase::PROTOCOL, &log).runs_before(&["b"]).arc())
            .unwrap();

        assert_eq!(chain.resolved_order(), vec!["a", "c", "b"]);

        let outcome = chain.do_intercept(&mut inbound());
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(entries(&log), vec!["handle:a", "handle:c", "handle:b"]);
    }

    #[test]
    fn after_constraint_pulls_interceptor_later() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain
            .add(Step::new("a", Phase::PROTOCOL, &log).runs_after(&["b"]).arc())
            .unwrap();
        chain.add(Step::new("b", Phase::PROTOCOL, &log).arc()).unwrap();

        assert_eq!(chain.resolved_order(), vec!["b", "a"]);
    }

    #[test]
    fn resolution_is_stable_across_identical_builds() {
        let build = || {
            let log = new_log();
            let mut chain = InterceptorChain::new();
            chain
                .add(Step::new("x", Phase::PROTOCOL, &log).runs_before(&["y"]).arc())
                .unwrap();
            chain.add(Step::new("y", Phase::PROTOCOL, &log).arc()).unwrap();
            chain.add(Step::new("z", Phase::RECEIVE, &log).arc()).unwrap();
            chain.resolved_order()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();

        let err = chain
            .add(Step::new("a", Phase::RECEIVE, &log).arc())
            .unwrap_err();
        assert_eq!(err, OrderingError::DuplicateId { id: "a".into() });
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn unsatisfiable_constraints_are_rejected_before_any_message() {
        // c demands both sides of b at once; no order can satisfy that.
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain.add(Step::new("b", Phase::PROTOCOL, &log).arc()).unwrap();

        let err = chain
            .add(
                Step::new("c", Phase::PROTOCOL, &log)
                    .runs_before(&["b"])
                    .runs_after(&["b"])
                    .arc(),
            )
            .unwrap_err();
        assert!(
            matches!(err, OrderingError::Cycle { .. }),
            "expected cycle, got {err}"
        );

        // The chain keeps its previous valid order and stays usable.
        assert_eq!(chain.resolved_order(), vec!["a", "b"]);
        let outcome = chain.do_intercept(&mut inbound());
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(entries(&log), vec!["handle:a", "handle:b"]);
    }

    #[test]
    fn self_referential_constraint_is_a_cycle() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        let err = chain
            .add(Step::new("a", Phase::PROTOCOL, &log).runs_before(&["a"]).arc())
            .unwrap_err();
        assert_eq!(err, OrderingError::Cycle { ids: vec!["a".into()] });
    }

    #[test]
    fn constraint_against_phase_order_is_rejected() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain
            .add(Step::new("early", Phase::RECEIVE, &log).arc())
            .unwrap();

        let err = chain
            .add(
                Step::new("late", Phase::SEND, &log)
                    .runs_before(&["early"])
                    .arc(),
            )
            .unwrap_err();
        match err {
            OrderingError::PhaseConflict { from, to, .. } => {
                assert_eq!(from, "late");
                assert_eq!(to, "early");
            }
            other => panic!("expected phase conflict, got {other}"),
        }
    }

    #[test]
    fn constraints_naming_absent_ids_are_ignored() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain
            .add(
                Step::new("a", Phase::PROTOCOL, &log)
                    .runs_before(&["not-installed"])
                    .arc(),
            )
            .unwrap();
        assert_eq!(chain.resolved_order(), vec!["a"]);
    }

    // -- fault unwind --

    #[test]
    fn fault_unwinds_visited_interceptors_in_reverse() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain.add(Step::new("b", Phase::PROTOCOL, &log).arc()).unwrap();
        chain
            .add(Step::new("c", Phase::PROTOCOL, &log).failing().arc())
            .unwrap();
        chain.add(Step::new("d", Phase::PROTOCOL, &log).arc()).unwrap();

        let mut message = inbound();
        let outcome = chain.do_intercept(&mut message);

        let Outcome::Faulted { fault, suppressed } = outcome else {
            panic!("expected fault, got {outcome:?}");
        };
        assert_eq!(fault.reason, "c failed");
        assert!(suppressed.is_empty());
        assert_eq!(message.fault().map(|f| f.code), Some(FaultCode::Application));

        // Forward up to c, then reverse unwind including c; d never runs.
        assert_eq!(
            entries(&log),
            vec![
                "handle:a", "handle:b", "handle:c", "fault:c", "fault:b", "fault:a"
            ]
        );
    }

    #[test]
    fn fault_in_first_interceptor_unwinds_only_itself() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain
            .add(Step::new("a", Phase::PROTOCOL, &log).failing().arc())
            .unwrap();
        chain.add(Step::new("b", Phase::PROTOCOL, &log).arc()).unwrap();

        let outcome = chain.do_intercept(&mut inbound());
        assert!(outcome.is_faulted());
        assert_eq!(entries(&log), vec!["handle:a", "fault:a"]);
    }

    #[test]
    fn secondary_faults_are_suppressed_and_collected() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain
            .add(
                Step::new("b", Phase::PROTOCOL, &log)
                    .failing_fault_hook()
                    .arc(),
            )
            .unwrap();
        chain
            .add(
                Step::new("c", Phase::PROTOCOL, &log)
                    .failing()
                    .failing_fault_hook()
                    .arc(),
            )
            .unwrap();

        let outcome = chain.do_intercept(&mut inbound());
        let Outcome::Faulted { fault, suppressed } = outcome else {
            panic!("expected fault, got {outcome:?}");
        };
        assert_eq!(fault.reason, "c failed");

        // Both failing hooks are reported, in unwind order, and neither
        // stops the unwind from reaching a.
        let reasons: Vec<&str> = suppressed.iter().map(|f| f.reason.as_str()).collect();
        assert_eq!(reasons, vec!["c fault hook failed", "b fault hook failed"]);
        assert_eq!(
            entries(&log),
            vec![
                "handle:a", "handle:b", "handle:c", "fault:c", "fault:b", "fault:a"
            ]
        );
    }

    #[test]
    fn already_faulted_message_is_not_processed() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();

        let mut message = inbound();
        message.record_fault(ProcessingFault::application("pre-existing"));

        let outcome = chain.do_intercept(&mut message);
        let Outcome::Faulted { fault, suppressed } = outcome else {
            panic!("expected fault, got {outcome:?}");
        };
        assert_eq!(fault.reason, "pre-existing");
        assert!(suppressed.is_empty());
        assert!(entries(&log).is_empty(), "no interceptor may run");
    }

    // -- suspend / resume --

    #[test]
    fn suspend_freezes_the_cursor_and_resume_continues() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain
            .add(Step::new("s", Phase::PROTOCOL, &log).suspending().arc())
            .unwrap();
        chain.add(Step::new("b", Phase::PROTOCOL, &log).arc()).unwrap();

        let mut message = inbound();
        assert_eq!(chain.do_intercept(&mut message), Outcome::Suspended);
        assert!(chain.is_suspended());
        assert_eq!(entries(&log), vec!["handle:a", "handle:s"]);

        assert_eq!(chain.resume(&mut message), Outcome::Completed);
        assert!(!chain.is_suspended());
        assert_eq!(entries(&log), vec!["handle:a", "handle:s", "handle:b"]);
    }

    #[test]
    fn fault_after_resume_unwinds_through_pre_suspension_interceptors() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain
            .add(Step::new("s", Phase::PROTOCOL, &log).suspending().arc())
            .unwrap();
        chain
            .add(Step::new("b", Phase::PROTOCOL, &log).failing().arc())
            .unwrap();

        let mut message = inbound();
        assert_eq!(chain.do_intercept(&mut message), Outcome::Suspended);

        let outcome = chain.resume(&mut message);
        assert!(outcome.is_faulted());
        assert_eq!(
            entries(&log),
            vec![
                "handle:a", "handle:s", "handle:b", "fault:b", "fault:s", "fault:a"
            ]
        );
    }

    #[test]
    fn resume_without_suspension_is_a_noop() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();

        assert_eq!(chain.resume(&mut inbound()), Outcome::Completed);
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn adding_while_suspended_leaves_the_inflight_traversal_alone() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain
            .add(Step::new("s", Phase::PROTOCOL, &log).suspending().arc())
            .unwrap();

        let mut message = inbound();
        assert_eq!(chain.do_intercept(&mut message), Outcome::Suspended);

        // Registered mid-suspension, in an earlier phase.
        chain
            .add(Step::new("early", Phase::RECEIVE, &log).arc())
            .unwrap();

        // The in-flight traversal still sees the old snapshot.
        assert_eq!(chain.resume(&mut message), Outcome::Completed);
        assert_eq!(entries(&log), vec!["handle:a", "handle:s"]);

        // The next traversal picks up the new order.
        log.lock().unwrap().clear();
        assert_eq!(chain.do_intercept(&mut inbound()), Outcome::Suspended);
        assert_eq!(entries(&log), vec!["handle:early", "handle:a", "handle:s"]);
    }

    #[test]
    fn clones_traverse_independently() {
        let log = new_log();
        let mut chain = InterceptorChain::new();
        chain.add(Step::new("a", Phase::PROTOCOL, &log).arc()).unwrap();
        chain
            .add(Step::new("s", Phase::SEND, &log).suspending().arc())
            .unwrap();

        let mut clone = chain.clone();
        let mut message = inbound();
        assert_eq!(clone.do_intercept(&mut message), Outcome::Suspended);

        // The suspension lives in the clone; the original is untouched.
        assert!(!chain.is_suspended());
        assert_eq!(chain.do_intercept(&mut inbound()), Outcome::Suspended);

        assert_eq!(clone.resume(&mut message), Outcome::Completed);
        assert_eq!(
            entries(&log),
            vec!["handle:a", "handle:s", "handle:a", "handle:s"]
        );
    }

    // -- property tests --

    mod properties {
        use proptest::prelude::*;

        use super::*;

        const IDS: [&str; 12] = [
            "i0", "i1", "i2", "i3", "i4", "i5", "i6", "i7", "i8", "i9", "i10", "i11",
        ];

        proptest! {
            /// With no explicit constraints, resolution is exactly the
            /// stable sort of interceptors by (phase priority, insertion).
            #[test]
            fn unconstrained_resolution_is_a_stable_phase_sort(
                picks in proptest::collection::vec(0usize..5, 1..12)
            ) {
                let phases = [
                    Phase::RECEIVE,
                    Phase::PRE_PROTOCOL,
                    Phase::PROTOCOL,
                    Phase::POST_PROTOCOL,
                    Phase::SEND,
                ];
                let log = new_log();

                let mut chain = InterceptorChain::new();
                for (k, &p) in picks.iter().enumerate() {
                    chain.add(Step::new(IDS[k], phases[p], &log).arc()).unwrap();
                }

                let mut expected: Vec<usize> = (0..picks.len()).collect();
                expected.sort_by_key(|&k| (phases[picks[k]].priority(), k));
                let expected_ids: Vec<&str> = expected.iter().map(|&k| IDS[k]).collect();

                prop_assert_eq!(chain.resolved_order(), expected_ids);
            }
        }
    }
}
