//! # EventBus Abstraction
//!
//! A platform-level abstraction for event-driven messaging between the
//! invoice pipeline's stage workers.
//!
//! ## Why This Lives in Tier 1
//!
//! The EventBus is a **shared runtime capability** that every module depends
//! on. Placing it in `platform/` allows:
//! - Modules to depend on platform crates without circular dependencies
//! - Config-driven swap between a broker-backed bus and the in-process bus
//!
//! ## Delivery Contract
//!
//! At-least-once. Handlers must be idempotent. A handler that fails with
//! [`HandlerError::Transient`] is retried with exponential backoff until the
//! message's `retry_count` reaches `max_retries`, after which the message is
//! dead-lettered and a `system.error` event is published. A handler that
//! fails with [`HandlerError::Fatal`] dead-letters the message immediately.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, EventType, InMemoryBus, Message, MessageHandler, HandlerError};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Printer {
//!     fn name(&self) -> &str { "printer" }
//!     async fn handle(&self, message: Message) -> Result<(), HandlerError> {
//!         println!("got {} on {}", message.id, message.event_type);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> event_bus::BusResult<()> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! bus.subscribe(EventType::InvoiceUploaded, Arc::new(Printer)).await?;
//! bus.start_consumers().await?;
//! bus.publish(Message::new(EventType::InvoiceUploaded, serde_json::Map::new())).await?;
//! # Ok(())
//! # }
//! ```

pub mod retry;

mod inmemory_bus;
mod message;

pub use inmemory_bus::{BusConfig, InMemoryBus};
pub use message::{DeadLetter, EventType, Message, MessagePriority, StreamEntry};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors that can occur when using the event bus (the transport layer).
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to event type: {0}")]
    SubscribeError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("bus is shut down")]
    ShutDown,

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// How a handler invocation failed, from the dispatcher's point of view.
///
/// The dispatcher branches on this instead of inspecting error payloads:
/// transient failures are retried with backoff, fatal ones go straight to
/// the dead-letter queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

/// A subscriber that consumes messages of one event type.
///
/// Handlers are identified by [`MessageHandler::name`]; subscribing the same
/// name to the same event type twice is a no-op.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable identity used for idempotent registration and logging.
    fn name(&self) -> &str;

    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

/// Core event bus abstraction for publish-subscribe messaging.
///
/// Implementations must persist published messages to a per-event-type
/// stream (bounded by retention), enqueue them into a priority queue, and
/// fan them out to subscribed handlers in publish order within an event type.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message.
    ///
    /// Succeeds only if the stream append, the subscriber fan-out, and the
    /// priority enqueue all committed.
    async fn publish(&self, message: Message) -> BusResult<()>;

    /// Register a handler for an event type. Idempotent by handler name.
    async fn subscribe(&self, event_type: EventType, handler: Arc<dyn MessageHandler>)
        -> BusResult<()>;

    /// Begin delivery to registered handlers.
    ///
    /// Delivery to a single handler is ordered by publish time within an
    /// event type; no ordering is guaranteed across event types.
    async fn start_consumers(&self) -> BusResult<()>;

    /// Replay persisted messages of one event type in publish order.
    ///
    /// Returns a finite stream of entries with `seq > since_seq`, at most
    /// `count` of them. Restart the replay by calling again with the last
    /// observed sequence number.
    async fn get_stream(
        &self,
        event_type: EventType,
        since_seq: u64,
        count: usize,
    ) -> BusResult<BoxStream<'static, StreamEntry>>;

    /// Append a message to the dead-letter queue with the failure reason.
    async fn dead_letter(&self, message: Message, error: &str) -> BusResult<()>;

    /// Snapshot of the dead-letter queue, oldest first.
    async fn dead_letters(&self) -> Vec<DeadLetter>;

    /// Stop accepting messages, wait (bounded) for in-flight handler
    /// invocations, then drop the dispatch loops.
    async fn shutdown(&self, grace: Duration);
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
