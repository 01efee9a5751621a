//! The interceptor abstraction: one unit of processing in a chain.

use crate::error::ProcessingFault;
use crate::message::Message;
use crate::phase::Phase;

/// What a successful `handle_message` call tells the chain to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Proceed to the next interceptor in resolved order.
    Continue,
    /// Halt forward traversal without fault. The chain records its position;
    /// [`InterceptorChain::resume`](crate::chain::InterceptorChain::resume)
    /// continues with the next interceptor.
    Suspend,
}

/// One unit of message processing, slotted into a chain by phase and
/// refined by explicit before/after constraints.
///
/// Implementations are shared across traversals as `Arc<dyn Interceptor>`,
/// so any internal state needs interior mutability.
pub trait Interceptor: Send + Sync {
    /// Stable identifier, referenced by other interceptors' constraints.
    /// Must be unique within a chain.
    fn id(&self) -> &'static str;

    /// The phase bucket this interceptor runs in.
    fn phase(&self) -> Phase;

    /// Ids this interceptor must run before. Ids not present in the chain
    /// are ignored, so constraints may name optional interceptors.
    fn before(&self) -> &[&'static str] {
        &[]
    }

    /// Ids this interceptor must run after. Unknown ids are ignored.
    fn after(&self) -> &[&'static str] {
        &[]
    }

    /// Processes the message.
    ///
    /// # Errors
    ///
    /// Returning a [`ProcessingFault`] stops forward traversal and triggers
    /// `handle_fault` on this interceptor and every previously-run one, in
    /// reverse order.
    fn handle_message(&self, message: &mut Message) -> Result<Continuation, ProcessingFault>;

    /// Cleanup notification during a fault unwind.
    ///
    /// Default is a no-op. Failures here are logged and collected but never
    /// interrupt the unwind.
    ///
    /// # Errors
    ///
    /// Secondary faults are suppressed by the chain; returning one only
    /// surfaces it in the traversal outcome for diagnostics.
    fn handle_fault(&self, message: &mut Message) -> Result<(), ProcessingFault> {
        let _ = message;
        Ok(())
    }
}
