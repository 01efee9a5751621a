//! Transport boundary of the runtime.
//!
//! The chains end at a [`TransportHandle`]: the outbound chain's send phase
//! transmits through it, and the retransmission sweep replays persisted
//! messages into it. No wire format is defined here; a production transport
//! serializes the message however it likes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use causeway_core::{
    Continuation, FaultCode, Interceptor, Message, Phase, ProcessingFault,
};
use parking_lot::Mutex;
use thiserror::Error;

/// Transport failed to take the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport has been closed; no further messages can be sent.
    #[error("transport closed")]
    Closed,
    /// The transport rejected this message.
    #[error("transport rejected message: {reason}")]
    Rejected {
        /// Transport-specific detail.
        reason: String,
    },
}

/// Hand-off point for fully processed outbound messages.
///
/// Called synchronously from the send phase and from the retransmission
/// sweep; implementations queue internally if actual I/O is async. Used as
/// `Arc<dyn TransportHandle>`.
pub trait TransportHandle: Send + Sync {
    /// Transmits one message toward the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the message could not be handed off.
    /// At-least-once delivery does not depend on this succeeding; the
    /// retransmission sweep re-sends anything unacknowledged.
    fn transmit(&self, message: Message) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// TransportSendInterceptor
// ---------------------------------------------------------------------------

/// Send-phase interceptor that ends the outbound chain at the transport.
pub struct TransportSendInterceptor {
    transport: Arc<dyn TransportHandle>,
}

impl TransportSendInterceptor {
    /// Chain id, for before/after constraints of other interceptors.
    pub const ID: &'static str = "transport-send";

    /// Creates the interceptor over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn TransportHandle>) -> Self {
        Self { transport }
    }
}

impl Interceptor for TransportSendInterceptor {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn phase(&self) -> Phase {
        Phase::SEND
    }

    fn handle_message(&self, message: &mut Message) -> Result<Continuation, ProcessingFault> {
        self.transport
            .transmit(message.clone())
            .map_err(|err| ProcessingFault::new(FaultCode::Transport, err.to_string()))?;
        Ok(Continuation::Continue)
    }
}

// ---------------------------------------------------------------------------
// LoopbackTransport
// ---------------------------------------------------------------------------

struct LoopbackInner {
    queue: Mutex<VecDeque<Message>>,
    drop_next: AtomicU32,
    closed: AtomicBool,
    transmitted: AtomicU64,
}

/// In-process transport for tests and local wiring.
///
/// Transmitted messages land in an internal queue the test (or the peer
/// endpoint's pump) drains. Message loss is simulated with
/// [`drop_next`](Self::drop_next): dropped messages still count as
/// transmitted but never reach the queue, exactly like a datagram lost in
/// flight.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

impl LoopbackTransport {
    /// Creates an open loopback transport with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                queue: Mutex::new(VecDeque::new()),
                drop_next: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                transmitted: AtomicU64::new(0),
            }),
        }
    }

    /// Silently drops the next `count` transmissions.
    pub fn drop_next(&self, count: u32) {
        self.inner.drop_next.store(count, Ordering::SeqCst);
    }

    /// Closes the transport; subsequent transmits fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Removes and returns the oldest delivered message.
    #[must_use]
    pub fn pop(&self) -> Option<Message> {
        self.inner.queue.lock().pop_front()
    }

    /// Removes and returns every delivered message, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<Message> {
        self.inner.queue.lock().drain(..).collect()
    }

    /// Number of messages waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Total transmit calls that succeeded, including dropped ones.
    #[must_use]
    pub fn transmitted(&self) -> u64 {
        self.inner.transmitted.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportHandle for LoopbackTransport {
    fn transmit(&self, message: Message) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.inner.transmitted.fetch_add(1, Ordering::SeqCst);

        // Simulated loss: the sender sees success, the peer sees nothing.
        let pending_drops = self.inner.drop_next.load(Ordering::SeqCst);
        if pending_drops > 0 {
            self.inner.drop_next.store(pending_drops - 1, Ordering::SeqCst);
            return Ok(());
        }

        self.inner.queue.lock().push_back(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use causeway_core::Direction;

    use super::*;

    fn outbound(tag: u64) -> Message {
        let mut message = Message::new(Direction::Outbound);
        message.set_message_number(tag);
        message
    }

    #[test]
    fn transmits_arrive_in_order() {
        let transport = LoopbackTransport::new();
        transport.transmit(outbound(1)).unwrap();
        transport.transmit(outbound(2)).unwrap();

        let delivered = transport.drain();
        let numbers: Vec<_> = delivered.iter().map(|m| m.message_number()).collect();
        assert_eq!(numbers, vec![Some(1), Some(2)]);
        assert_eq!(transport.queued(), 0);
    }

    #[test]
    fn drop_next_loses_messages_without_error() {
        let transport = LoopbackTransport::new();
        transport.drop_next(1);

        transport.transmit(outbound(1)).unwrap();
        transport.transmit(outbound(2)).unwrap();

        let delivered = transport.drain();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message_number(), Some(2));
        // Both count as transmitted from the sender's perspective.
        assert_eq!(transport.transmitted(), 2);
    }

    #[test]
    fn closed_transport_rejects() {
        let transport = LoopbackTransport::new();
        transport.close();
        assert_eq!(
            transport.transmit(outbound(1)),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn send_interceptor_transmits_and_surfaces_failures() {
        let transport = LoopbackTransport::new();
        let interceptor = TransportSendInterceptor::new(Arc::new(transport.clone()));

        let mut message = outbound(7);
        assert_eq!(
            interceptor.handle_message(&mut message).unwrap(),
            Continuation::Continue
        );
        assert_eq!(transport.pop().unwrap().message_number(), Some(7));

        transport.close();
        let fault = interceptor.handle_message(&mut message).unwrap_err();
        assert_eq!(fault.code, FaultCode::Transport);
    }
}
