//! The mutable carrier of one in-flight exchange.
//!
//! A [`Message`] is a direction flag, an opaque payload, and a string-keyed
//! context bag of typed [`Value`]s. Interceptors communicate exclusively
//! through the bag; the reliable-messaging properties live under the
//! well-known [`keys`] and are exposed through typed accessors so call sites
//! never handle raw keys.
//!
//! [`MessageSnapshot`] is the persistence image of a message: context plus
//! payload, MessagePack-encoded. Retransmission rebuilds the original
//! outbound message from its snapshot byte for byte.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ProcessingFault;
use crate::sequence::{AckRange, AckRanges, SequenceAcknowledgement, SequenceId};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Direction of a message relative to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Arriving from a remote endpoint, flowing toward the application.
    Inbound,
    /// Leaving the application, flowing toward the transport.
    Outbound,
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Typed value stored in a message context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Unsigned integer (message numbers, counts).
    Uint(u64),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string (ids, endpoint names, control actions).
    String(String),
    /// Raw bytes.
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Acknowledgement ranges riding on a message.
    Ranges(Vec<AckRange>),
}

impl Value {
    /// The boolean, if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The unsigned integer, if this is a `Uint`.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(n) => Some(*n),
            _ => None,
        }
    }

    /// The string slice, if this is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The byte slice, if this is `Bytes`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The ranges, if this is `Ranges`.
    #[must_use]
    pub fn as_ranges(&self) -> Option<&[AckRange]> {
        match self {
            Value::Ranges(r) => Some(r),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Well-known context keys
// ---------------------------------------------------------------------------

/// Context keys used by the reliable-messaging interceptors.
///
/// Prefer the typed accessors on [`Message`] over raw `get`/`set` with these
/// keys.
pub mod keys {
    /// Sequence id the message belongs to (`Value::String`).
    pub const SEQUENCE_ID: &str = "rm.sequence-id";
    /// Message number within the sequence (`Value::Uint`).
    pub const MESSAGE_NUMBER: &str = "rm.message-number";
    /// Marks the final message of a sequence (`Value::Bool`).
    pub const LAST_MESSAGE: &str = "rm.last-message";
    /// Sender requests an immediate acknowledgement (`Value::Bool`).
    pub const ACK_REQUESTED: &str = "rm.ack-requested";
    /// Sequence id an attached acknowledgement refers to (`Value::String`).
    pub const ACK_SEQUENCE_ID: &str = "rm.ack.sequence-id";
    /// Acknowledged ranges riding on this message (`Value::Ranges`).
    pub const ACK_RANGES: &str = "rm.ack.ranges";
    /// Control action for protocol messages (`Value::String`).
    pub const CONTROL: &str = "rm.control";
    /// Highest number assigned to a sequence, carried by close controls
    /// (`Value::Uint`).
    pub const LAST_NUMBER: &str = "rm.close.last-number";
    /// Target endpoint of an outbound message; selects which sequence the
    /// source interceptor assigns it to (`Value::String`).
    pub const TO: &str = "rm.to";
    /// Set when protocol processing decided the message must not reach the
    /// application (duplicate or held for in-order delivery)
    /// (`Value::Bool`).
    pub const DISCARDED: &str = "rm.discarded";
}

// ---------------------------------------------------------------------------
// ControlAction
// ---------------------------------------------------------------------------

/// Protocol-level action carried by a control message instead of an
/// application payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Standalone acknowledgement.
    Ack,
    /// Source closes the sequence; no further numbers will be assigned.
    CloseSequence,
    /// Sequence state is torn down on both sides.
    TerminateSequence,
}

impl ControlAction {
    /// Stable label stored in the message context.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Ack => "ack",
            ControlAction::CloseSequence => "close-sequence",
            ControlAction::TerminateSequence => "terminate-sequence",
        }
    }

    /// Parses a label back into an action.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "ack" => Some(ControlAction::Ack),
            "close-sequence" => Some(ControlAction::CloseSequence),
            "terminate-sequence" => Some(ControlAction::TerminateSequence),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The mutable carrier of one in-flight exchange.
#[derive(Debug, Clone)]
pub struct Message {
    direction: Direction,
    context: HashMap<String, Value>,
    payload: Vec<u8>,
    fault: Option<ProcessingFault>,
}

impl Message {
    /// Creates an empty message flowing in `direction`.
    #[must_use]
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            context: HashMap::new(),
            payload: Vec::new(),
            fault: None,
        }
    }

    /// Creates a message with an application payload.
    #[must_use]
    pub fn with_payload(direction: Direction, payload: impl Into<Vec<u8>>) -> Self {
        let mut message = Self::new(direction);
        message.payload = payload.into();
        message
    }

    /// Direction of the message relative to this endpoint.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The application payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replaces the application payload.
    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.payload = payload.into();
    }

    // -- raw context access --

    /// Stores `value` under `key`, returning the previous value if any.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.context.insert(key.into(), value)
    }

    /// Reads the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Removes and returns the value stored under `key`.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.context.remove(key)
    }

    /// Whether the context holds `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.context.contains_key(key)
    }

    // -- fault state --

    /// The fault recorded on this message, if any.
    #[must_use]
    pub fn fault(&self) -> Option<&ProcessingFault> {
        self.fault.as_ref()
    }

    /// Whether a fault has been recorded.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// Records a fault. The first fault wins; later calls are ignored so the
    /// original cause survives the unwind.
    pub fn record_fault(&mut self, fault: ProcessingFault) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }

    // -- typed reliable-messaging accessors --

    /// Sequence id the message belongs to.
    #[must_use]
    pub fn sequence_id(&self) -> Option<SequenceId> {
        self.get(keys::SEQUENCE_ID)
            .and_then(Value::as_str)
            .map(SequenceId::new)
    }

    /// Assigns the message to a sequence.
    pub fn set_sequence_id(&mut self, id: &SequenceId) {
        self.set(keys::SEQUENCE_ID, Value::String(id.as_str().to_owned()));
    }

    /// Message number within its sequence.
    #[must_use]
    pub fn message_number(&self) -> Option<u64> {
        self.get(keys::MESSAGE_NUMBER).and_then(Value::as_u64)
    }

    /// Sets the message number.
    pub fn set_message_number(&mut self, number: u64) {
        self.set(keys::MESSAGE_NUMBER, Value::Uint(number));
    }

    /// Whether this is the final message of its sequence.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.get(keys::LAST_MESSAGE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Marks this as the final message of its sequence.
    pub fn mark_last(&mut self) {
        self.set(keys::LAST_MESSAGE, Value::Bool(true));
    }

    /// Whether the sender asked for an immediate acknowledgement.
    #[must_use]
    pub fn ack_requested(&self) -> bool {
        self.get(keys::ACK_REQUESTED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Requests an immediate acknowledgement from the peer.
    pub fn set_ack_requested(&mut self) {
        self.set(keys::ACK_REQUESTED, Value::Bool(true));
    }

    /// The acknowledgement riding on this message, if any.
    #[must_use]
    pub fn acknowledgement(&self) -> Option<SequenceAcknowledgement> {
        let id = self.get(keys::ACK_SEQUENCE_ID).and_then(Value::as_str)?;
        let ranges = self.get(keys::ACK_RANGES).and_then(Value::as_ranges)?;
        Some(SequenceAcknowledgement::new(
            SequenceId::new(id),
            AckRanges::from_ranges(ranges.iter().copied()),
        ))
    }

    /// Removes and returns the acknowledgement riding on this message, so it
    /// is applied exactly once.
    pub fn take_acknowledgement(&mut self) -> Option<SequenceAcknowledgement> {
        let ack = self.acknowledgement()?;
        self.remove(keys::ACK_SEQUENCE_ID);
        self.remove(keys::ACK_RANGES);
        Some(ack)
    }

    /// Attaches an acknowledgement to this message.
    pub fn set_acknowledgement(&mut self, ack: &SequenceAcknowledgement) {
        self.set(
            keys::ACK_SEQUENCE_ID,
            Value::String(ack.id.as_str().to_owned()),
        );
        self.set(keys::ACK_RANGES, Value::Ranges(ack.ranges.ranges().to_vec()));
    }

    /// Control action carried by this message, if it is a protocol message.
    #[must_use]
    pub fn control(&self) -> Option<ControlAction> {
        self.get(keys::CONTROL)
            .and_then(Value::as_str)
            .and_then(ControlAction::parse)
    }

    /// Turns this message into a protocol control message.
    pub fn set_control(&mut self, action: ControlAction) {
        self.set(keys::CONTROL, Value::String(action.as_str().to_owned()));
    }

    /// Target endpoint of an outbound message.
    #[must_use]
    pub fn to(&self) -> Option<&str> {
        self.get(keys::TO).and_then(Value::as_str)
    }

    /// Sets the target endpoint of an outbound message.
    pub fn set_to(&mut self, endpoint: impl Into<String>) {
        self.set(keys::TO, Value::String(endpoint.into()));
    }

    /// Whether protocol processing decided this message must not reach the
    /// application.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.get(keys::DISCARDED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Flags the message so delivery stages skip it.
    pub fn mark_discarded(&mut self) {
        self.set(keys::DISCARDED, Value::Bool(true));
    }

    /// Captures the context and payload for persistence.
    #[must_use]
    pub fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            context: self.context.clone(),
            payload: self.payload.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageSnapshot
// ---------------------------------------------------------------------------

/// Encoding or decoding a [`MessageSnapshot`] failed.
#[derive(Debug, Error)]
pub enum SnapshotCodecError {
    /// MessagePack serialization failed.
    #[error("snapshot encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// MessagePack deserialization failed.
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Point-in-time image of a message's context and payload.
///
/// This is what the persistence layer stores for unacknowledged messages and
/// what retransmission replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    /// The full context bag at capture time.
    pub context: HashMap<String, Value>,
    /// The application payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl MessageSnapshot {
    /// Encodes the snapshot as MessagePack.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotCodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes a snapshot from MessagePack bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotCodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Rebuilds a message from this snapshot, flowing in `direction`.
    #[must_use]
    pub fn into_message(self, direction: Direction) -> Message {
        Message {
            direction,
            context: self.context,
            payload: self.payload,
            fault: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
