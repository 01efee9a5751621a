//! Configuration types for the reliable-messaging runtime.

use std::time::Duration;

/// Top-level configuration for an RM endpoint.
#[derive(Debug, Clone, Default)]
pub struct RmConfig {
    /// Retransmission timing and limits.
    pub retransmission: RetransmissionConfig,
    /// Acknowledgement emission policy.
    pub acks: AckConfig,
    /// Inbound delivery policy.
    pub delivery: DeliveryConfig,
    /// Sequence lifetime limits.
    pub sequence: SequenceConfig,
}

/// Controls when and how often unacknowledged messages are re-sent.
#[derive(Debug, Clone)]
pub struct RetransmissionConfig {
    /// Base interval before the first retransmission of a message.
    /// Subsequent attempts back off exponentially (doubling per attempt).
    pub base_interval: Duration,
    /// Upper bound on the backoff interval.
    pub max_interval: Duration,
    /// Attempts after which a still-unacknowledged sequence is marked
    /// degraded and stops retransmitting. 0 means retry forever.
    pub max_retransmissions: u32,
    /// How often the sweep worker scans for due retransmissions.
    pub sweep_interval: Duration,
    /// Random jitter stretching each backoff interval, as a fraction of
    /// the interval (0.1 = up to 10% longer).
    pub jitter_ratio: f64,
}

impl Default for RetransmissionConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(60),
            max_retransmissions: 8,
            sweep_interval: Duration::from_millis(500),
            jitter_ratio: 0.1,
        }
    }
}

/// Controls when the destination emits acknowledgements.
#[derive(Debug, Clone)]
pub struct AckConfig {
    /// How long a due acknowledgement may wait for an outbound message to
    /// piggy-back on before a standalone ack is emitted.
    pub piggyback_window: Duration,
    /// How often the flush worker checks for overdue acknowledgements.
    pub flush_interval: Duration,
    /// Number of unacknowledged receptions that makes an ack due. 1 means
    /// every reception schedules an acknowledgement.
    pub batch_threshold: u32,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            piggyback_window: Duration::from_millis(200),
            flush_interval: Duration::from_secs(1),
            batch_threshold: 1,
        }
    }
}

/// Controls how inbound messages reach the application.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Buffer out-of-order arrivals and release them in number order.
    /// Off by default: the protocol guarantees delivery, not ordering.
    pub in_order: bool,
    /// Accept messages for sequence ids this endpoint has never seen,
    /// creating destination state on first contact. When off, unknown ids
    /// fault the message instead.
    pub accept_unknown_sequences: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            in_order: false,
            accept_unknown_sequences: true,
        }
    }
}

/// Limits on a single sequence's lifetime and size.
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// Sequences older than this refuse new numbers and new receptions.
    /// `None` means sequences never expire.
    pub expiry: Option<Duration>,
    /// A sequence closes automatically once this many numbers have been
    /// assigned. 0 means unlimited.
    pub max_length: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            expiry: None,
            max_length: 0,
        }
    }
}
