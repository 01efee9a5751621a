//! Reliable-messaging subsystem.
//!
//! Sequences give messages durable numbers on the way out and receipt
//! tracking on the way in; acknowledgements confirm delivery and release
//! persisted records. The pieces:
//!
//! - [`sequence`] -- per-sequence state machines, no I/O
//! - [`manager`] -- concurrent registry tying sequences to the store
//! - [`store`] / [`stores`] -- persistence trait and its backends
//! - [`source`] / [`destination`] -- the protocol interceptors
//! - [`retransmit`] -- background sweep and standalone ack flush

pub mod destination;
pub mod manager;
pub mod retransmit;
pub mod sequence;
pub mod source;
pub mod store;
pub mod stores;

// ---------------------------------------------------------------------------
// Re-exports -- flat public API
// ---------------------------------------------------------------------------

// sequence state
pub use sequence::{
    DestinationSequence, NumberRefusal, Receipt, SendRecord, SequenceState, SourceSequence,
};

// manager
pub use manager::{
    InboundDisposition, RecoveryReport, SequenceManager, TerminationReport, DEFAULT_TARGET,
};

// interceptors
pub use destination::RmDestinationInterceptor;
pub use source::RmSourceInterceptor;

// persistence
pub use store::{RmMessage, RmStore, SequenceRole, StoreError};
pub use stores::MemoryStore;
#[cfg(feature = "redb")]
pub use stores::RedbStore;

// background maintenance
pub use retransmit::{AckFlush, RetransmissionSweep, SweepCommand};

// ---------------------------------------------------------------------------
// Scenario tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use causeway_core::{Direction, Message, SequenceId};

    use super::MemoryStore;
    use crate::config::RmConfig;
    use crate::dispatch::{Dispatcher, RecordingDispatcher};
    use crate::endpoint::RmEndpoint;
    use crate::transport::LoopbackTransport;

    /// Aggressive timings so loss and repair fit in a short test.
    fn fast_config() -> RmConfig {
        let mut config = RmConfig::default();
        config.retransmission.base_interval = Duration::from_millis(30);
        config.retransmission.max_interval = Duration::from_millis(30);
        config.retransmission.sweep_interval = Duration::from_millis(10);
        config.retransmission.jitter_ratio = 0.0;
        config.retransmission.max_retransmissions = 0;
        config.acks.piggyback_window = Duration::ZERO;
        config.acks.flush_interval = Duration::from_millis(10);
        config
    }

    fn endpoint_with(
        config: RmConfig,
    ) -> (RmEndpoint, LoopbackTransport, Arc<RecordingDispatcher>) {
        let transport = LoopbackTransport::new();
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let endpoint = RmEndpoint::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(transport.clone()),
            Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
        )
        .unwrap();
        (endpoint, transport, dispatcher)
    }

    fn outbound(payload: &[u8]) -> Message {
        Message::with_payload(Direction::Outbound, payload.to_vec())
    }

    fn inbound(id: &SequenceId, number: u64) -> Message {
        let mut message = Message::with_payload(Direction::Inbound, b"in".to_vec());
        message.set_sequence_id(id);
        message.set_message_number(number);
        message
    }

    /// Re-delivers a transmitted message the way a transport would.
    fn arrives(wire: &Message) -> Message {
        wire.snapshot().into_message(Direction::Inbound)
    }

    /// Trace output for the timing tests, filtered by `RUST_LOG`.
    fn trace() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[tokio::test]
    async fn lost_acknowledgements_are_repaired_by_retransmission() {
        trace();
        let (mut alice, alice_wire, _alice_app) = endpoint_with(fast_config());
        let (mut bob, bob_wire, bob_app) = endpoint_with(fast_config());
        alice.start();
        bob.start();

        let mut message = outbound(b"payload");
        alice.send(&mut message).unwrap();
        let id = message.sequence_id().unwrap();

        // The first transmission arrives, but its acknowledgement is lost.
        let first = alice_wire.pop().unwrap();
        bob.receive(&mut arrives(&first)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let lost = bob_wire.drain();
        assert!(!lost.is_empty(), "a standalone ack should have gone out");

        // The sweep replays the same number; the duplicate is discarded
        // but re-arms the acknowledgement.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let replay = alice_wire.pop().expect("retransmission should be due");
        assert_eq!(replay.message_number(), Some(1));
        assert_eq!(replay.payload(), b"payload");
        bob.receive(&mut arrives(&replay)).unwrap();
        assert_eq!(
            bob_app.delivered_count(),
            1,
            "the duplicate must not reach the application again"
        );

        // This time the acknowledgement gets through.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let acks = bob_wire.drain();
        assert!(!acks.is_empty());
        for wire in &acks {
            alice.receive(&mut arrives(wire)).unwrap();
        }
        assert!(alice.manager().is_acked(&id, 1).unwrap());

        let report = alice.shutdown(Duration::from_millis(200)).await;
        assert!(report.is_clean());
        bob.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn replies_piggyback_acknowledgements() {
        let (mut alice, alice_wire, alice_app) = endpoint_with(RmConfig::default());
        let (mut bob, bob_wire, bob_app) = endpoint_with(RmConfig::default());
        alice.start();
        bob.start();

        let mut request = outbound(b"request");
        alice.send(&mut request).unwrap();
        let alice_seq = request.sequence_id().unwrap();
        bob.receive(&mut arrives(&alice_wire.pop().unwrap())).unwrap();
        assert_eq!(bob_app.delivered_count(), 1);

        // Bob's reply carries his pending acknowledgement, no flush needed.
        let mut reply = outbound(b"reply");
        bob.send(&mut reply).unwrap();
        let wire_reply = bob_wire.pop().unwrap();
        assert_eq!(wire_reply.acknowledgement().unwrap().id, alice_seq);

        alice.receive(&mut arrives(&wire_reply)).unwrap();
        assert_eq!(alice_app.delivered_count(), 1);
        assert!(alice.manager().is_acked(&alice_seq, 1).unwrap());

        alice.shutdown(Duration::from_millis(200)).await;
        bob.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn out_of_order_arrivals_release_in_number_order() {
        let mut config = RmConfig::default();
        config.delivery.in_order = true;
        let (mut receiver, _wire, app) = endpoint_with(config);
        receiver.start();

        let id = SequenceId::new("ordered");
        receiver.receive(&mut inbound(&id, 2)).unwrap();
        assert_eq!(app.delivered_count(), 0, "the gap holds delivery back");

        receiver.receive(&mut inbound(&id, 1)).unwrap();
        assert_eq!(app.delivered_numbers(), vec![1, 2]);

        let ranges = receiver.manager().received_ranges(&id).unwrap();
        assert!(ranges.contains(1) && ranges.contains(2));

        receiver.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn close_handshake_retires_the_sequence_once_all_is_acked() {
        trace();
        let (mut alice, alice_wire, _alice_app) = endpoint_with(fast_config());
        let (mut bob, bob_wire, _bob_app) = endpoint_with(fast_config());
        alice.start();
        bob.start();

        let mut message = outbound(b"finale");
        alice.send(&mut message).unwrap();
        let id = message.sequence_id().unwrap();
        alice.close_sequence(&id).unwrap();

        // Bob sees the message and the close announcement.
        for wire in alice_wire.drain() {
            bob.receive(&mut arrives(&wire)).unwrap();
        }

        // The close made Bob's acknowledgement urgent; his flush sends it.
        tokio::time::sleep(Duration::from_millis(60)).await;
        for wire in bob_wire.drain() {
            alice.receive(&mut arrives(&wire)).unwrap();
        }

        // The final acknowledgement retired Alice's closing sequence.
        assert!(alice.manager().source_state(&id).is_none());

        alice.shutdown(Duration::from_millis(200)).await;
        bob.shutdown(Duration::from_millis(200)).await;
    }
}
