//! Partitioned, retrying, backpressure-aware event bus.
//!
//! Retry/backoff/DLQ algorithm and the per-partition-key ordering
//! guarantee follow a dispatch/invoke/send-to-dlq split; the tokio
//! task-per-partition shape (one long-lived consumer loop per logical
//! unit, polled with a bounded timeout so it can observe a shutdown
//! signal) mirrors a coordinator/heartbeat-ticker actor style.
//! `dashmap` replaces a dict-of-locks for concurrently accessed
//! subscription/partition/queue-depth maps.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::{EventBusConfig, OverflowPolicy};
use crate::error::{EngineError, EngineResult};

use super::event::{ancestors, BusEvent, EventKind};

/// Stable handle returned by `subscribe`, used for dedup and `unsubscribe`
/// instead of relying on callable identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A subscriber invoked when a matching event is dispatched.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: Arc<dyn BusEvent>) -> EngineResult<()>;
}

#[derive(Clone)]
struct Subscription {
    id: HandlerId,
    priority: i32,
    seq: u64,
    handler: Arc<dyn EventHandler>,
}

/// An event whose dispatch to `handler_name` exhausted its retry budget.
#[derive(Clone, Debug)]
pub struct FailedEvent {
    pub event: Arc<dyn BusEvent>,
    pub handler_name: String,
    pub error_message: String,
    pub failed_at: i64,
    pub attempt_count: u32,
    pub partition_key: String,
}

struct PartitionHandle {
    sender: mpsc::Sender<Arc<dyn BusEvent>>,
    depth: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

struct BusInner {
    config: EventBusConfig,
    clock: Arc<dyn Clock>,
    subscriptions: DashMap<EventKind, Vec<Subscription>>,
    partitions: DashMap<String, PartitionHandle>,
    queue_depths: DashMap<String, Arc<AtomicUsize>>,
    dlq: Mutex<Vec<FailedEvent>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    running: AtomicBool,
    next_handler_id: AtomicU64,
    next_registration_seq: AtomicU64,
}

impl BusInner {
    fn get_or_create_partition(
        inner: &Arc<BusInner>,
        key: &str,
    ) -> (mpsc::Sender<Arc<dyn BusEvent>>, Arc<AtomicUsize>) {
        match inner.partitions.entry(key.to_string()) {
            Entry::Occupied(e) => {
                let handle = e.get();
                (handle.sender.clone(), handle.depth.clone())
            }
            Entry::Vacant(e) => {
                let capacity = inner.config.max_queue_size.max(1);
                let (tx, rx) = mpsc::channel(capacity);
                let depth = Arc::new(AtomicUsize::new(0));
                inner.queue_depths.insert(key.to_string(), depth.clone());

                let inner_clone = Arc::clone(inner);
                let key_owned = key.to_string();
                let task = tokio::spawn(async move {
                    BusInner::run_partition_consumer(inner_clone, key_owned, rx).await;
                });

                let handle = PartitionHandle {
                    sender: tx.clone(),
                    depth: depth.clone(),
                    task,
                };
                e.insert(handle);
                (tx, depth)
            }
        }
    }

    /// Pulls events with a ~1s poll so the consumer can observe a stop
    /// request, then dispatches them in publish order.
    async fn run_partition_consumer(
        inner: Arc<BusInner>,
        partition_key: String,
        mut receiver: mpsc::Receiver<Arc<dyn BusEvent>>,
    ) {
        let mut stop_rx = inner.stop_rx.clone();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await {
                Ok(Some(event)) => {
                    if let Some(depth) = inner.queue_depths.get(&partition_key) {
                        depth.fetch_sub(1, Ordering::SeqCst);
                    }
                    BusInner::dispatch_event(&inner, event, &partition_key).await;
                }
                Ok(None) => break,
                Err(_elapsed) => continue,
            }
        }

        // stop() drains what's already buffered to completion rather than
        // discarding it.
        while let Ok(event) = receiver.try_recv() {
            if let Some(depth) = inner.queue_depths.get(&partition_key) {
                depth.fetch_sub(1, Ordering::SeqCst);
            }
            BusInner::dispatch_event(&inner, event, &partition_key).await;
        }
    }

    /// Assembles the ordered, deduplicated handler list for `event`'s kind
    /// (including supertype matches) and invokes each under its own retry
    /// loop.
    async fn dispatch_event(inner: &Arc<BusInner>, event: Arc<dyn BusEvent>, partition_key: &str) {
        let kind = event.kind();
        let mut kinds_to_check = vec![kind];
        kinds_to_check.extend_from_slice(ancestors(kind));

        let mut matched: Vec<Subscription> = Vec::new();
        let mut seen_ids: HashSet<HandlerId> = HashSet::new();
        for k in kinds_to_check {
            if let Some(subs) = inner.subscriptions.get(&k) {
                for s in subs.iter() {
                    if seen_ids.insert(s.id) {
                        matched.push(s.clone());
                    }
                }
            }
        }

        matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        for sub in &matched {
            BusInner::invoke_handler_with_retry(inner, sub, event.clone(), partition_key).await;
        }
    }

    async fn invoke_handler_with_retry(
        inner: &Arc<BusInner>,
        sub: &Subscription,
        event: Arc<dyn BusEvent>,
        partition_key: &str,
    ) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let deadline = Duration::from_millis(inner.config.handler_timeout_ms);
            let outcome = tokio::time::timeout(deadline, sub.handler.handle(event.clone())).await;

            let failure_message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_elapsed) => Some(format!(
                    "handler '{}' timed out after {}ms",
                    sub.handler.name(),
                    inner.config.handler_timeout_ms
                )),
            };

            let message = failure_message.expect("non-success path always sets a message");

            if attempt >= inner.config.max_retry_attempts {
                BusInner::send_to_dlq(
                    inner,
                    event,
                    sub.handler.name().to_string(),
                    message,
                    attempt,
                    partition_key.to_string(),
                )
                .await;
                return;
            }

            if *inner.stop_rx.borrow() {
                // Cooperative cancellation: stop() observed between attempts,
                // don't retry further.
                return;
            }

            let delay_ms = inner.config.retry_base_delay_ms * 2u64.pow(attempt);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn send_to_dlq(
        inner: &Arc<BusInner>,
        event: Arc<dyn BusEvent>,
        handler_name: String,
        error_message: String,
        attempt_count: u32,
        partition_key: String,
    ) {
        tracing::error!(
            handler = %handler_name,
            partition = %partition_key,
            attempts = attempt_count,
            error = %error_message,
            "handler exhausted retries, event sent to DLQ"
        );
        let failed = FailedEvent {
            event,
            handler_name,
            error_message,
            failed_at: inner.clock.now_ms(),
            attempt_count,
            partition_key,
        };
        inner.dlq.lock().unwrap().push(failed);
    }
}

/// Per-key ordered delivery with bounded memory, explicit overflow
/// policies, bounded-attempt retry, and quarantine of persistently failing
/// events.
pub struct PartitionedEventBus {
    inner: Arc<BusInner>,
}

impl PartitionedEventBus {
    pub fn new(config: EventBusConfig, clock: Arc<dyn Clock>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::new(BusInner {
            config,
            clock,
            subscriptions: DashMap::new(),
            partitions: DashMap::new(),
            queue_depths: DashMap::new(),
            dlq: Mutex::new(Vec::new()),
            stop_tx,
            stop_rx,
            running: AtomicBool::new(false),
            next_handler_id: AtomicU64::new(1),
            next_registration_seq: AtomicU64::new(1),
        });
        Self { inner }
    }

    /// Idempotent: calling start() on an already-started bus is a no-op.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    /// Idempotent: signals every consumer to stop, then joins them after
    /// they drain their buffered events.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.stop_tx.send(true);

        let keys: Vec<String> = self.inner.partitions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.inner.partitions.remove(&key) {
                let _ = handle.task.await;
            }
        }
    }

    /// Accepted events are guaranteed to be dispatched to every matching
    /// handler at least once (modulo DLQ exhaustion). A rejected publish
    /// returns `false` without enqueueing, except under `halt`, which
    /// returns a fatal backpressure error.
    pub async fn publish(&self, event: Arc<dyn BusEvent>) -> EngineResult<bool> {
        let partition_key = event.partition_key().to_string();
        let (sender, depth) = BusInner::get_or_create_partition(&self.inner, &partition_key);

        match self.inner.config.overflow_policy {
            OverflowPolicy::Block => {
                if sender.send(event).await.is_err() {
                    return Err(EngineError::Backpressure(partition_key));
                }
                depth.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            OverflowPolicy::Halt => match sender.try_send(event) {
                Ok(()) => {
                    depth.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
                Err(_) => Err(EngineError::Backpressure(partition_key)),
            },
            // The coalesce hook exists for kinds (e.g. order-book snapshots)
            // whose latest value subsumes prior ones; no merge is wired up
            // yet so it falls through to drop semantics.
            OverflowPolicy::Drop | OverflowPolicy::Coalesce => match sender.try_send(event) {
                Ok(()) => {
                    depth.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
                Err(_) => {
                    tracing::warn!(partition = %partition_key, "dropping event under backpressure");
                    Ok(false)
                }
            },
        }
    }

    /// Subscribes `handler` to `kind` at `priority` (descending order,
    /// registration order breaks ties). Also invoked for every kind whose
    /// ancestry includes `kind`.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>, priority: i32) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst));
        let seq = self.inner.next_registration_seq.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscriptions
            .entry(kind)
            .or_insert_with(Vec::new)
            .push(Subscription {
                id,
                priority,
                seq,
                handler,
            });
        id
    }

    pub fn unsubscribe(&self, kind: EventKind, id: HandlerId) {
        if let Some(mut subs) = self.inner.subscriptions.get_mut(&kind) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Drains and returns every event currently quarantined in the DLQ.
    pub fn get_dlq_events(&self) -> Vec<FailedEvent> {
        std::mem::take(&mut self.inner.dlq.lock().unwrap())
    }

    /// Re-publishes the inner event of a previously failed delivery.
    pub async fn replay_dlq_event(&self, failed: FailedEvent) -> EngineResult<bool> {
        self.publish(failed.event).await
    }

    pub fn queue_depths(&self) -> std::collections::HashMap<String, usize> {
        self.inner
            .queue_depths
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::SeqCst)))
            .collect()
    }

    pub fn dlq_size(&self) -> usize {
        self.inner.dlq.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::Mutex as StdMutex;

    struct RecordingHandler {
        name: String,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, event: Arc<dyn BusEvent>) -> EngineResult<()> {
            self.log.lock().unwrap().push(event.event_id().to_string());
            Ok(())
        }
    }

    struct AlwaysFailHandler {
        name: String,
    }

    #[async_trait]
    impl EventHandler for AlwaysFailHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _event: Arc<dyn BusEvent>) -> EngineResult<()> {
            Err(EngineError::HandlerException {
                handler: self.name.clone(),
                message: "boom".to_string(),
            })
        }
    }

    fn fast_config() -> EventBusConfig {
        EventBusConfig {
            max_queue_size: 100,
            overflow_policy: OverflowPolicy::Drop,
            handler_timeout_ms: 200,
            max_retry_attempts: 3,
            retry_base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn per_partition_fifo_preserves_publish_order() {
        let bus = PartitionedEventBus::new(fast_config(), Arc::new(MockClock::new()));
        bus.start();

        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(
            EventKind::ClockTick,
            Arc::new(RecordingHandler {
                name: "recorder".to_string(),
                log: log.clone(),
            }),
            0,
        );

        let mut expected = Vec::new();
        for i in 0..50 {
            let event = Arc::new(crate::bus::event::ClockTick::new(i));
            expected.push(event.event_id.clone());
            bus.publish(event).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.stop().await;

        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn subscriber_to_supertype_observes_refinement() {
        let bus = PartitionedEventBus::new(fast_config(), Arc::new(MockClock::new()));
        bus.start();

        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(
            EventKind::MarketData,
            Arc::new(RecordingHandler {
                name: "market-data-watcher".to_string(),
                log: log.clone(),
            }),
            0,
        );

        let book = crate::domain::types::OrderBook::new("tok");
        let event = Arc::new(crate::bus::event::OrderBookUpdate {
            event_id: "ev-1".to_string(),
            market_id: "market-1".to_string(),
            timestamp_ms: 1000,
            book,
        });
        bus.publish(event).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.stop().await;

        assert_eq!(*log.lock().unwrap(), vec!["ev-1".to_string()]);
    }

    #[tokio::test]
    async fn handler_exhaustion_lands_in_dlq_with_attempt_count() {
        let config = EventBusConfig {
            max_retry_attempts: 2,
            retry_base_delay_ms: 1,
            handler_timeout_ms: 50,
            ..fast_config()
        };
        let bus = PartitionedEventBus::new(config, Arc::new(MockClock::new()));
        bus.start();

        bus.subscribe(
            EventKind::ClockTick,
            Arc::new(AlwaysFailHandler {
                name: "flaky".to_string(),
            }),
            0,
        );

        bus.publish(Arc::new(crate::bus::event::ClockTick::new(1000)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.stop().await;

        let dlq = bus.get_dlq_events();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].attempt_count, 2);
        assert_eq!(dlq[0].partition_key, crate::bus::event::GLOBAL_PARTITION);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_dispatch() {
        let bus = PartitionedEventBus::new(fast_config(), Arc::new(MockClock::new()));
        bus.start();

        let log = Arc::new(StdMutex::new(Vec::new()));
        let id = bus.subscribe(
            EventKind::ClockTick,
            Arc::new(RecordingHandler {
                name: "recorder".to_string(),
                log: log.clone(),
            }),
            0,
        );
        bus.unsubscribe(EventKind::ClockTick, id);

        bus.publish(Arc::new(crate::bus::event::ClockTick::new(1000)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop().await;

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn halt_policy_surfaces_backpressure_error_when_full() {
        let config = EventBusConfig {
            max_queue_size: 1,
            overflow_policy: OverflowPolicy::Halt,
            ..fast_config()
        };
        let bus = PartitionedEventBus::new(config, Arc::new(MockClock::new()));
        // No subscribers and no start(): the partition task still drains the
        // channel, so fill it synchronously by publishing faster than a
        // single slot drains - use a handler that blocks briefly instead.
        bus.subscribe(
            EventKind::ClockTick,
            Arc::new(AlwaysFailHandler {
                name: "slow".to_string(),
            }),
            0,
        );

        let first = bus.publish(Arc::new(crate::bus::event::ClockTick::new(1))).await;
        assert!(first.is_ok());
        // A burst of publishes should eventually hit the single-slot cap
        // before the consumer drains it.
        let mut saw_backpressure = false;
        for i in 2..200 {
            if bus
                .publish(Arc::new(crate::bus::event::ClockTick::new(i)))
                .await
                .is_err()
            {
                saw_backpressure = true;
                break;
            }
        }
        bus.stop().await;
        assert!(saw_backpressure);
    }
}
