//! # Message Envelope
//!
//! Platform-wide message specification for everything that crosses the bus.
//!
//! ## Envelope Fields
//!
//! - `id`: Unique message identifier
//! - `event_type`: One of the stable event identifiers in [`EventType`]
//! - `data`: Event-specific payload as a JSON object
//! - `priority`: Delivery priority bucket (integer ranked)
//! - `correlation_id`: Links every message in one invoice's lifetime
//! - `timestamp`: When the message was created
//! - `retry_count` / `max_retries`: Redelivery bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable event identifiers carried on the bus.
///
/// The wire form is the dotted name (e.g. `invoice.uploaded`); the enum keeps
/// subscriptions and stream keys typo-proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "invoice.uploaded")]
    InvoiceUploaded,
    #[serde(rename = "invoice.processed")]
    InvoiceProcessed,
    #[serde(rename = "invoice.approved")]
    InvoiceApproved,
    #[serde(rename = "invoice.rejected")]
    InvoiceRejected,
    #[serde(rename = "invoice.paid")]
    InvoicePaid,

    #[serde(rename = "payment.initiated")]
    PaymentInitiated,
    #[serde(rename = "payment.completed")]
    PaymentCompleted,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,

    #[serde(rename = "erp.sync_started")]
    ErpSyncStarted,
    #[serde(rename = "erp.sync_completed")]
    ErpSyncCompleted,
    #[serde(rename = "erp.sync_failed")]
    ErpSyncFailed,

    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    #[serde(rename = "approval.assigned")]
    ApprovalAssigned,
    #[serde(rename = "approval.completed")]
    ApprovalCompleted,

    #[serde(rename = "system.error")]
    SystemError,
    #[serde(rename = "system.warning")]
    SystemWarning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceUploaded => "invoice.uploaded",
            Self::InvoiceProcessed => "invoice.processed",
            Self::InvoiceApproved => "invoice.approved",
            Self::InvoiceRejected => "invoice.rejected",
            Self::InvoicePaid => "invoice.paid",
            Self::PaymentInitiated => "payment.initiated",
            Self::PaymentCompleted => "payment.completed",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentRefunded => "payment.refunded",
            Self::ErpSyncStarted => "erp.sync_started",
            Self::ErpSyncCompleted => "erp.sync_completed",
            Self::ErpSyncFailed => "erp.sync_failed",
            Self::ApprovalRequested => "approval.requested",
            Self::ApprovalAssigned => "approval.assigned",
            Self::ApprovalCompleted => "approval.completed",
            Self::SystemError => "system.error",
            Self::SystemWarning => "system.warning",
        }
    }

    /// True for the `system.*` events the bus itself emits. Used to avoid
    /// error-reporting loops when a system event is itself dead-lettered.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::SystemError | Self::SystemWarning)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoice.uploaded" => Ok(Self::InvoiceUploaded),
            "invoice.processed" => Ok(Self::InvoiceProcessed),
            "invoice.approved" => Ok(Self::InvoiceApproved),
            "invoice.rejected" => Ok(Self::InvoiceRejected),
            "invoice.paid" => Ok(Self::InvoicePaid),
            "payment.initiated" => Ok(Self::PaymentInitiated),
            "payment.completed" => Ok(Self::PaymentCompleted),
            "payment.failed" => Ok(Self::PaymentFailed),
            "payment.refunded" => Ok(Self::PaymentRefunded),
            "erp.sync_started" => Ok(Self::ErpSyncStarted),
            "erp.sync_completed" => Ok(Self::ErpSyncCompleted),
            "erp.sync_failed" => Ok(Self::ErpSyncFailed),
            "approval.requested" => Ok(Self::ApprovalRequested),
            "approval.assigned" => Ok(Self::ApprovalAssigned),
            "approval.completed" => Ok(Self::ApprovalCompleted),
            "system.error" => Ok(Self::SystemError),
            "system.warning" => Ok(Self::SystemWarning),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// Message priority levels, integer ranked.
///
/// Serialized as the integer rank so envelopes stay stable across producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl From<MessagePriority> for u8 {
    fn from(p: MessagePriority) -> u8 {
        p.rank()
    }
}

impl TryFrom<u8> for MessagePriority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            other => Err(format!("invalid priority rank: {other}")),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// A durable bus message.
///
/// Messages remain in their event-type stream until retention evicts them and
/// are redelivered to a failing handler until `retry_count` reaches
/// `max_retries`, after which they land in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub event_type: EventType,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub priority: MessagePriority,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Message {
    /// Create a new message with a generated id.
    ///
    /// The correlation id defaults to the message's own id; producers that
    /// continue an existing business transaction should override it with
    /// [`Message::with_correlation_id`].
    pub fn new(event_type: EventType, data: serde_json::Map<String, serde_json::Value>) -> Self {
        let id = format!("msg-{}", Uuid::new_v4());
        Self {
            correlation_id: id.clone(),
            id,
            event_type,
            data,
            priority: MessagePriority::Normal,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A message as persisted in an event-type stream, with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub seq: u64,
    pub message: Message,
}

/// A message that exhausted its retry budget (or failed terminally).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original: Message,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_data() -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("invoice_id".into(), json!("inv-1"));
        data.insert("size".into(), json!(2048));
        data
    }

    #[test]
    fn event_type_round_trips_through_wire_name() {
        for et in [
            EventType::InvoiceUploaded,
            EventType::ApprovalCompleted,
            EventType::ErpSyncFailed,
            EventType::SystemError,
        ] {
            assert_eq!(et.as_str().parse::<EventType>(), Ok(et));
        }
        assert!("invoice.shredded".parse::<EventType>().is_err());
    }

    #[test]
    fn priority_serializes_as_integer_rank() {
        let json = serde_json::to_string(&MessagePriority::Critical).unwrap();
        assert_eq!(json, "4");
        let back: MessagePriority = serde_json::from_str("2").unwrap();
        assert_eq!(back, MessagePriority::Normal);
        assert!(serde_json::from_str::<MessagePriority>("9").is_err());
    }

    #[test]
    fn priority_ordering_matches_ranks() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
    }

    #[test]
    fn message_serde_round_trip_is_lossless() {
        let msg = Message::new(EventType::InvoiceUploaded, sample_data())
            .with_priority(MessagePriority::High)
            .with_correlation_id("doc-42");

        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.correlation_id, "doc-42");
        assert_eq!(back.event_type, EventType::InvoiceUploaded);
    }

    #[test]
    fn correlation_id_defaults_to_message_id() {
        let msg = Message::new(EventType::SystemWarning, serde_json::Map::new());
        assert_eq!(msg.correlation_id, msg.id);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.max_retries, 3);
    }
}
