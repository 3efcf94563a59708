use crate::event::{Event, Topic};
use chrono::{DateTime, Utc};
use corral_core::{CorralError, CorralResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1024;

/// Per-topic emission counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TopicStats {
    pub count: u64,
    pub last_emitted: Option<DateTime<Utc>>,
}

/// In-process typed pub/sub. Cloning is cheap; all clones share the same
/// channel and statistics.
///
/// Delivery is fan-out over a broadcast channel: every subscriber runs on
/// its own task, so a handler that panics or lags only affects itself.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    stats: Arc<RwLock<HashMap<Topic, TopicStats>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish an event to all current subscribers. Never blocks; with no
    /// subscribers the event is dropped after the stats update.
    pub fn publish(&self, event: Event) {
        if let Ok(mut stats) = self.stats.write() {
            let entry = stats.entry(event.topic()).or_default();
            entry.count += 1;
            entry.last_emitted = Some(Utc::now());
        }
        let _ = self.sender.send(event);
    }

    /// Register a handler for one topic. The handler runs on a dedicated
    /// task; drop or cancel the returned [`Subscription`] to deregister.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.subscribe_inner(topic, handler, false)
    }

    /// Like [`subscribe`](Self::subscribe) but fires at most once.
    pub fn subscribe_once<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.subscribe_inner(topic, handler, true)
    }

    fn subscribe_inner<F>(&self, topic: Topic, handler: F, once: bool) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.topic() == topic => {
                        handler(event);
                        if once {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %topic, skipped = n, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }

    /// Raw receiver over every topic, for components that drive their own
    /// event loop (the workflow engine, the lifecycle manager).
    pub fn receiver(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Wait for the first event on `topic` matching `predicate`, up to
    /// `timeout`. Subscribes at the call; to observe events racing an
    /// action, take a [`receiver`](Self::receiver) first and use
    /// [`wait_on`](Self::wait_on).
    pub async fn await_event<P>(
        &self,
        topic: Topic,
        predicate: P,
        timeout: Duration,
    ) -> CorralResult<Event>
    where
        P: Fn(&Event) -> bool,
    {
        let receiver = self.sender.subscribe();
        Self::wait_on(receiver, topic, predicate, timeout).await
    }

    /// Like [`await_event`](Self::await_event) over an already-open
    /// receiver, so nothing published since the receiver was taken is
    /// missed.
    pub async fn wait_on<P>(
        mut receiver: broadcast::Receiver<Event>,
        topic: Topic,
        predicate: P,
        timeout: Duration,
    ) -> CorralResult<Event>
    where
        P: Fn(&Event) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CorralError::Timeout(format!("awaiting {topic}")));
            }
            match tokio::time::timeout(remaining, receiver.recv()).await {
                Ok(Ok(event)) => {
                    if event.topic() == topic && predicate(&event) {
                        return Ok(event);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!(topic = %topic, skipped = n, "await_event receiver lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(CorralError::Cancelled(format!("bus closed awaiting {topic}")));
                }
                Err(_) => return Err(CorralError::Timeout(format!("awaiting {topic}"))),
            }
        }
    }

    pub fn stats(&self, topic: Topic) -> TopicStats {
        self.stats
            .read()
            .ok()
            .and_then(|s| s.get(&topic).copied())
            .unwrap_or_default()
    }

    /// Snapshot of every topic that has seen at least one emission.
    pub fn stats_snapshot(&self) -> HashMap<Topic, TopicStats> {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Handle for a registered handler. Cancelling (or dropping) stops the
/// handler task.
pub struct Subscription {
    handle: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::AgentId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started(id: AgentId) -> Event {
        Event::AgentStarted { agent_id: id }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = bus.subscribe(Topic::AgentStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        // Subscription task registers its receiver synchronously, before
        // spawn returns, so this publish is observed.
        bus.publish(started(AgentId::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscriber_filters_topics() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = bus.subscribe(Topic::AgentStopped, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(started(AgentId::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribe_once_fires_once() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = bus.subscribe_once(Topic::AgentStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(started(AgentId::new()));
        bus.publish(started(AgentId::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_await_event_matches_predicate() {
        let bus = EventBus::default();
        let wanted = AgentId::new();
        let other = AgentId::new();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(started(other));
            publisher.publish(started(wanted));
        });

        let event = bus
            .await_event(
                Topic::AgentStarted,
                |e| e.agent_id() == Some(wanted),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(event.agent_id(), Some(wanted));
    }

    #[tokio::test]
    async fn test_await_event_times_out() {
        let bus = EventBus::default();
        let result = bus
            .await_event(Topic::AgentReady, |_| true, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(CorralError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stats_count_and_timestamp() {
        let bus = EventBus::default();
        assert_eq!(bus.stats(Topic::AgentStarted).count, 0);
        bus.publish(started(AgentId::new()));
        bus.publish(started(AgentId::new()));
        let stats = bus.stats(Topic::AgentStarted);
        assert_eq!(stats.count, 2);
        assert!(stats.last_emitted.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_receiving() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = bus.subscribe(Topic::AgentStarted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish(started(AgentId::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
