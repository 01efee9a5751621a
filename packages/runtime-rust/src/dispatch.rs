//! Application-side delivery seam.
//!
//! The destination interceptor hands every deliverable message to a
//! [`Dispatcher`]. Duplicates never cross this boundary, and in in-order
//! mode messages cross it in exact number order.

use causeway_core::Message;
use parking_lot::Mutex;

/// Receives messages that passed reliable-messaging checks.
///
/// Implementations are invoked from inside the inbound chain traversal and
/// must not block for long. Used as `Arc<dyn Dispatcher>`.
pub trait Dispatcher: Send + Sync {
    /// Delivers one message to the application.
    fn deliver(&self, message: Message);
}

/// Dispatcher that drops everything. For send-only endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn deliver(&self, _message: Message) {}
}

/// Dispatcher that records deliveries for inspection. Test helper, also
/// usable as a staging buffer for a polling consumer.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    delivered: Mutex<Vec<Message>>,
}

impl RecordingDispatcher {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything delivered so far, oldest first.
    #[must_use]
    pub fn take_delivered(&self) -> Vec<Message> {
        std::mem::take(&mut *self.delivered.lock())
    }

    /// Message numbers delivered so far, in delivery order.
    #[must_use]
    pub fn delivered_numbers(&self) -> Vec<u64> {
        self.delivered
            .lock()
            .iter()
            .filter_map(Message::message_number)
            .collect()
    }

    /// Count of deliveries so far.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn deliver(&self, message: Message) {
        self.delivered.lock().push(message);
    }
}

#[cfg(test)]
mod tests {
    use causeway_core::Direction;

    use super::*;

    #[test]
    fn recording_dispatcher_keeps_delivery_order() {
        let dispatcher = RecordingDispatcher::new();
        for n in [3u64, 1, 2] {
            let mut message = Message::new(Direction::Inbound);
            message.set_message_number(n);
            dispatcher.deliver(message);
        }

        assert_eq!(dispatcher.delivered_numbers(), vec![3, 1, 2]);
        assert_eq!(dispatcher.delivered_count(), 3);

        let drained = dispatcher.take_delivered();
        assert_eq!(drained.len(), 3);
        assert_eq!(dispatcher.delivered_count(), 0);
    }
}
