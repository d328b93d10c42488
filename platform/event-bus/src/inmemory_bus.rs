//! In-process implementation of the EventBus trait.
//!
//! Three cooperating structures back the bus, written together by a single
//! `publish`:
//!
//! 1. A durable per-event-type stream: a retention-capped ring with monotone
//!    sequence numbers, replayable via `get_stream`.
//! 2. A priority-bucketed pending queue keyed by message priority.
//! 3. A fan-out channel per event type feeding one dispatch loop, which
//!    delivers to handlers in publish order and applies the retry/DLQ policy.
//!
//! This bus runs entirely in-process: messages do not survive a restart.
//! Construction logs that degradation loudly so it is never silent in
//! production deployments that forgot to configure a broker.

use crate::message::{DeadLetter, EventType, Message, MessagePriority, StreamEntry};
use crate::{BusError, BusResult, EventBus, HandlerError, MessageHandler};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tuning knobs for the in-process bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Newest messages kept per event-type stream.
    pub stream_retention: usize,
    /// Concurrent handler invocations per event type. With the default of 1,
    /// delivery within an event type is strictly ordered.
    pub pool_size: usize,
    /// First redelivery delay after a transient handler failure.
    pub retry_base: Duration,
    /// Cap on the doubling redelivery delay.
    pub retry_cap: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stream_retention: 10_000,
            pool_size: 1,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct StreamLog {
    next_seq: u64,
    entries: VecDeque<StreamEntry>,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<EventType, Vec<Arc<dyn MessageHandler>>>,
    senders: HashMap<EventType, mpsc::UnboundedSender<Message>>,
    // Receivers staged between subscribe() and start_consumers()
    staged: Vec<(EventType, mpsc::UnboundedReceiver<Message>)>,
    started: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct Core {
    config: BusConfig,
    streams: Mutex<HashMap<EventType, StreamLog>>,
    queue: Mutex<BTreeMap<u8, VecDeque<Message>>>,
    registry: Mutex<Registry>,
    dlq: Mutex<Vec<DeadLetter>>,
    shutdown: watch::Sender<bool>,
}

/// EventBus implementation using in-memory structures and Tokio channels.
///
/// Suitable for single-process deployments, local development, and tests.
/// A broker-backed implementation plugs in behind the same [`EventBus`]
/// trait without touching consumers.
#[derive(Clone)]
pub struct InMemoryBus {
    core: Arc<Core>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        warn!(
            retention = config.stream_retention,
            pool_size = config.pool_size,
            "Using in-process event bus; messages are not persisted across restarts"
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                config,
                streams: Mutex::new(HashMap::new()),
                queue: Mutex::new(BTreeMap::new()),
                registry: Mutex::new(Registry::default()),
                dlq: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// Pop the next pending message: highest priority bucket first, FIFO
    /// within a bucket. Used by worker pools that drain the task queue
    /// instead of subscribing to a single event type.
    pub async fn pop_pending(&self) -> Option<Message> {
        let mut queue = self.core.queue.lock().await;
        let rank = *queue.keys().next_back()?;
        let bucket = queue.get_mut(&rank)?;
        let message = bucket.pop_front();
        if bucket.is_empty() {
            queue.remove(&rank);
        }
        message
    }

    pub async fn pending_len(&self) -> usize {
        let queue = self.core.queue.lock().await;
        queue.values().map(|b| b.len()).sum()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn publish_inner(core: &Arc<Core>, message: Message) -> BusResult<()> {
    if *core.shutdown.borrow() {
        return Err(BusError::ShutDown);
    }

    // 1. Durable stream append with retention eviction
    {
        let mut streams = core.streams.lock().await;
        let log = streams.entry(message.event_type).or_default();
        log.next_seq += 1;
        log.entries.push_back(StreamEntry {
            seq: log.next_seq,
            message: message.clone(),
        });
        while log.entries.len() > core.config.stream_retention {
            log.entries.pop_front();
        }
    }

    // 2. Priority queue
    {
        let mut queue = core.queue.lock().await;
        queue
            .entry(message.priority.rank())
            .or_default()
            .push_back(message.clone());
    }

    // 3. Fan-out to the event type's dispatch loop, if anyone subscribed
    {
        let registry = core.registry.lock().await;
        if let Some(sender) = registry.senders.get(&message.event_type) {
            sender.send(message.clone()).map_err(|_| {
                BusError::PublishError(format!(
                    "dispatch loop for {} is gone",
                    message.event_type
                ))
            })?;
        }
    }

    debug!(
        event_type = %message.event_type,
        message_id = %message.id,
        priority = message.priority.rank(),
        correlation_id = %message.correlation_id,
        "Message published"
    );

    Ok(())
}

async fn push_dead_letter(core: &Arc<Core>, message: Message, reason: &str) {
    warn!(
        message_id = %message.id,
        event_type = %message.event_type,
        retry_count = message.retry_count,
        error = %reason,
        "Message sent to DLQ"
    );
    core.dlq.lock().await.push(DeadLetter {
        original: message,
        error: reason.to_string(),
        failed_at: Utc::now(),
    });
}

/// Dead-letter `message` and announce the failure on `system.error`.
///
/// System events are dead-lettered without a follow-up announcement so a
/// broken system.error handler cannot feed itself forever.
async fn dead_letter_and_report(core: &Arc<Core>, message: Message, reason: &str) {
    let event_type = message.event_type;
    let correlation_id = message.correlation_id.clone();
    push_dead_letter(core, message, reason).await;

    if event_type.is_system() {
        return;
    }

    let mut data = serde_json::Map::new();
    data.insert("component".into(), json!("event-bus"));
    data.insert(
        "error".into(),
        json!(format!("handler failed for {event_type}: {reason}")),
    );
    data.insert("severity".into(), json!("error"));

    let report = Message::new(EventType::SystemError, data)
        .with_priority(MessagePriority::High)
        .with_correlation_id(correlation_id);

    if let Err(e) = publish_inner(core, report).await {
        error!(error = %e, "Failed to publish system.error after dead-letter");
    }
}

fn backoff_for(config: &BusConfig, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    std::cmp::min(config.retry_base * 2u32.pow(doublings), config.retry_cap)
}

async fn deliver_with_retry(core: Arc<Core>, handler: Arc<dyn MessageHandler>, mut message: Message) {
    loop {
        match handler.handle(message.clone()).await {
            Ok(()) => {
                debug!(
                    handler = handler.name(),
                    message_id = %message.id,
                    "Message handled"
                );
                return;
            }
            Err(HandlerError::Fatal(reason)) => {
                warn!(
                    handler = handler.name(),
                    message_id = %message.id,
                    error = %reason,
                    "Handler failed terminally, dead-lettering"
                );
                dead_letter_and_report(&core, message, &reason).await;
                return;
            }
            Err(HandlerError::Transient(reason)) => {
                if message.retry_count >= message.max_retries {
                    error!(
                        handler = handler.name(),
                        message_id = %message.id,
                        retry_count = message.retry_count,
                        error = %reason,
                        "Retries exhausted, dead-lettering"
                    );
                    dead_letter_and_report(&core, message, &reason).await;
                    return;
                }

                message.retry_count += 1;
                let delay = backoff_for(&core.config, message.retry_count);
                warn!(
                    handler = handler.name(),
                    message_id = %message.id,
                    attempt = message.retry_count,
                    backoff_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Handler failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn spawn_dispatch_loop(
    core: Arc<Core>,
    event_type: EventType,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(event_type = %event_type, "Consumer started");

        let limiter = Arc::new(Semaphore::new(core.config.pool_size.max(1)));
        let mut shutdown = core.shutdown.subscribe();
        let mut inflight: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(message) = maybe else { break };

                    let handlers: Vec<Arc<dyn MessageHandler>> = {
                        let registry = core.registry.lock().await;
                        registry.handlers.get(&event_type).cloned().unwrap_or_default()
                    };

                    for handler in handlers {
                        let Ok(permit) = limiter.clone().acquire_owned().await else {
                            break;
                        };
                        let core = core.clone();
                        let message = message.clone();
                        inflight.push(tokio::spawn(async move {
                            let _permit = permit;
                            deliver_with_retry(core, handler, message).await;
                        }));
                    }

                    inflight.retain(|task| !task.is_finished());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for task in inflight {
            let _ = task.await;
        }
        warn!(event_type = %event_type, "Consumer stopped");
    })
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, message: Message) -> BusResult<()> {
        publish_inner(&self.core, message).await
    }

    async fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn MessageHandler>,
    ) -> BusResult<()> {
        let mut registry = self.core.registry.lock().await;

        let handlers = registry.handlers.entry(event_type).or_default();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            debug!(
                event_type = %event_type,
                handler = handler.name(),
                "Handler already subscribed, ignoring"
            );
            return Ok(());
        }
        debug!(event_type = %event_type, handler = handler.name(), "Handler subscribed");
        handlers.push(handler);

        if !registry.senders.contains_key(&event_type) {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.senders.insert(event_type, tx);
            if registry.started {
                let task = spawn_dispatch_loop(self.core.clone(), event_type, rx);
                registry.tasks.push(task);
            } else {
                registry.staged.push((event_type, rx));
            }
        }

        Ok(())
    }

    async fn start_consumers(&self) -> BusResult<()> {
        let mut registry = self.core.registry.lock().await;
        if registry.started {
            return Ok(());
        }
        registry.started = true;

        let staged = std::mem::take(&mut registry.staged);
        let count = staged.len();
        for (event_type, rx) in staged {
            let task = spawn_dispatch_loop(self.core.clone(), event_type, rx);
            registry.tasks.push(task);
        }

        info!(count, "Consumers started");
        Ok(())
    }

    async fn get_stream(
        &self,
        event_type: EventType,
        since_seq: u64,
        count: usize,
    ) -> BusResult<BoxStream<'static, StreamEntry>> {
        let core = self.core.clone();
        let stream = async_stream::stream! {
            let mut cursor = since_seq;
            let mut remaining = count;
            while remaining > 0 {
                let batch: Vec<StreamEntry> = {
                    let streams = core.streams.lock().await;
                    match streams.get(&event_type) {
                        Some(log) => log
                            .entries
                            .iter()
                            .filter(|e| e.seq > cursor)
                            .take(remaining.min(64))
                            .cloned()
                            .collect(),
                        None => Vec::new(),
                    }
                };
                if batch.is_empty() {
                    break;
                }
                for entry in batch {
                    cursor = entry.seq;
                    remaining -= 1;
                    yield entry;
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn dead_letter(&self, message: Message, error: &str) -> BusResult<()> {
        push_dead_letter(&self.core, message, error).await;
        Ok(())
    }

    async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.core.dlq.lock().await.clone()
    }

    async fn shutdown(&self, grace: Duration) {
        info!("Event bus shutting down");
        let _ = self.core.shutdown.send(true);

        let tasks = {
            let mut registry = self.core.registry.lock().await;
            registry.senders.clear();
            std::mem::take(&mut registry.tasks)
        };

        let deadline = tokio::time::Instant::now() + grace;
        for task in tasks {
            let abort = task.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!("Consumer task did not finish within grace period, aborting");
                abort.abort();
            }
        }
        info!("Event bus shut down");
    }
}
