// SPDX-License-Identifier: MIT OR Apache-2.0
//! agentspy-hub
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! In-process typed publish-subscribe for Agent Spy's live event stream
//! A subscriber registers interest in a set of [`EventType`]s; the
//! hub holds one bounded mailbox per subscriber and fans events out to
//! whichever subscribers asked for that type. Delivery is best-effort,
//! at-most-once, per subscriber: a subscriber that falls behind has its
//! oldest queued event dropped, never blocking the publisher and never
//! affecting any other subscriber.

use agentspy_telemetry::DroppedEventCounter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

/// Default per-subscriber mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// The closed set of event types the hub knows how to fan out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// First upsert of a given run id.
    #[serde(rename = "trace.created")]
    TraceCreated,
    /// A subsequent, non-terminal upsert of an existing run id.
    #[serde(rename = "trace.updated")]
    TraceUpdated,
    /// The run's derived status transitioned to `completed` in this call.
    #[serde(rename = "trace.completed")]
    TraceCompleted,
    /// The run's derived status transitioned to `failed` in this call.
    #[serde(rename = "trace.failed")]
    TraceFailed,
    /// The dashboard aggregate stats changed.
    #[serde(rename = "stats.updated")]
    StatsUpdated,
}

impl EventType {
    /// Stable wire name, matching the `#[serde(rename)]` above.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TraceCreated => "trace.created",
            Self::TraceUpdated => "trace.updated",
            Self::TraceCompleted => "trace.completed",
            Self::TraceFailed => "trace.failed",
            Self::StatsUpdated => "stats.updated",
        }
    }
}

/// Source protocol that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// LangSmith-compatible REST receiver.
    Langsmith,
    /// OTLP/HTTP receiver.
    OtlpHttp,
    /// OTLP/gRPC receiver.
    OtlpGrpc,
}

/// The `data` payload of an [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// Root-run grouping, when known.
    pub trace_id: Option<Uuid>,
    /// Parent run id, when this run is not a root.
    pub parent_run_id: Option<Uuid>,
    /// Human label.
    pub name: String,
    /// What kind of step this run represents, as its wire string.
    pub run_type: String,
    /// Current derived status, as its wire string.
    pub status: String,
    /// Logical project grouping, when set.
    pub project_name: Option<String>,
    /// Which receiver produced this event.
    pub source: EventSource,
    /// Server-computed duration, when the run has ended.
    pub duration_ms: Option<i64>,
    /// Failure description, when present.
    pub error: Option<String>,
}

/// A single hub event, as delivered to subscribers and serialized over the
/// WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The event's type, determining which subscribers receive it.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Server timestamp at emission.
    pub timestamp: DateTime<Utc>,
    /// The event body.
    pub data: EventData,
}

impl Event {
    /// Construct an event of the given type with the given payload.
    pub fn new(event_type: EventType, timestamp: DateTime<Utc>, data: EventData) -> Self {
        Self {
            event_type,
            timestamp,
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber identity
// ---------------------------------------------------------------------------

/// Opaque handle identifying one subscriber (bound to one WebSocket
/// connection for its lifetime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// A bounded, drop-oldest-on-overflow queue for one subscriber. Plain data
/// structure behind a synchronous [`Mutex`] plus a [`Notify`] — no lock is
/// ever held across an `.await`, so a slow subscriber never stalls a
/// publisher.
struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Pushes `event`, dropping the oldest queued event if full. Returns
    /// `true` if an event was dropped to make room.
    async fn push(&self, event: Event) -> bool {
        let mut dropped = false;
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.capacity {
                queue.pop_front();
                dropped = true;
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
        dropped
    }

    /// Waits for and returns the next queued event, or `None` once the
    /// mailbox has been closed (subscriber removed) and drained.
    async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// EventHub
// ---------------------------------------------------------------------------

struct Subscription {
    /// Event types this subscriber currently wants. Mutated by
    /// subscribe/unsubscribe frames over the connection's lifetime.
    types: RwLock<HashSet<EventType>>,
    mailbox: Mailbox,
}

/// The process-wide event hub. Cheap to clone (internally `Arc`-shared);
/// lifetime is the process.
#[derive(Clone)]
pub struct EventHub {
    subscribers: Arc<RwLock<HashMap<SubscriberId, Arc<Subscription>>>>,
    dropped: DroppedEventCounter,
    mailbox_capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl EventHub {
    /// Construct a new, empty hub with the given per-subscriber mailbox
    /// capacity.
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            dropped: DroppedEventCounter::new(),
            mailbox_capacity,
        }
    }

    /// Total events dropped across all subscribers since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.get()
    }

    /// Register a new subscriber with an initial filter set (possibly
    /// empty; empty means "subscribed to nothing yet").
    pub async fn subscribe(&self, initial_types: impl IntoIterator<Item = EventType>) -> SubscriberId {
        let id = SubscriberId::new();
        let subscription = Arc::new(Subscription {
            types: RwLock::new(initial_types.into_iter().collect()),
            mailbox: Mailbox::new(self.mailbox_capacity),
        });
        self.subscribers.write().await.insert(id, subscription);
        id
    }

    /// Add event types to a subscriber's filter (the WS `subscribe` op).
    /// A no-op if the subscriber has already been removed.
    pub async fn add_interest(&self, id: SubscriberId, types: impl IntoIterator<Item = EventType>) {
        if let Some(sub) = self.subscribers.read().await.get(&id) {
            sub.types.write().await.extend(types);
        }
    }

    /// Remove event types from a subscriber's filter (the WS `unsubscribe`
    /// op). A no-op if the subscriber has already been removed.
    pub async fn remove_interest(&self, id: SubscriberId, types: impl IntoIterator<Item = EventType>) {
        if let Some(sub) = self.subscribers.read().await.get(&id) {
            let mut guard = sub.types.write().await;
            for t in types {
                guard.remove(&t);
            }
        }
    }

    /// Removes a subscriber. Guarantees no further callbacks (its `recv`
    /// loop observes the close and returns `None`) once this returns.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        if let Some(sub) = self.subscribers.write().await.remove(&id) {
            sub.mailbox.close();
        }
    }

    /// Waits for the next event addressed to `id`'s current filter.
    /// Returns `None` once the subscriber has been unsubscribed and its
    /// mailbox drained — the caller should then end its connection loop.
    pub async fn recv(&self, id: SubscriberId) -> Option<Event> {
        let sub = self.subscribers.read().await.get(&id).cloned();
        match sub {
            Some(sub) => sub.mailbox.recv().await,
            None => None,
        }
    }

    /// Publishes `event` to every subscriber whose filter includes its
    /// type. Never blocks on a slow subscriber: a full mailbox drops its
    /// oldest entry and the hub's dropped-event counter is incremented.
    /// Events for a given run id are expected to be published in their
    /// canonical emission order by the caller (the repository); the hub
    /// preserves that order per subscriber because each mailbox push is a
    /// simple ordered append.
    pub async fn publish(&self, event: Event) {
        let recipients: Vec<Arc<Subscription>> = {
            let subscribers = self.subscribers.read().await;
            let mut out = Vec::with_capacity(subscribers.len());
            for sub in subscribers.values() {
                if sub.types.read().await.contains(&event.event_type) {
                    out.push(sub.clone());
                }
            }
            out
        };
        for sub in recipients {
            if sub.mailbox.push(event.clone()).await {
                self.dropped.increment();
            }
        }
    }

    /// Number of currently-registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(event_type: EventType) -> Event {
        Event::new(
            event_type,
            Utc::now(),
            EventData {
                trace_id: None,
                parent_run_id: None,
                name: "root".into(),
                run_type: "chain".into(),
                status: "running".into(),
                project_name: None,
                source: EventSource::Langsmith,
                duration_ms: None,
                error: None,
            },
        )
    }

    #[tokio::test]
    async fn subscriber_only_receives_matching_types() {
        let hub = EventHub::default();
        let a = hub.subscribe([EventType::TraceCompleted]).await;
        let b = hub
            .subscribe([EventType::TraceCreated, EventType::TraceCompleted])
            .await;

        hub.publish(sample_event(EventType::TraceCreated)).await;
        hub.publish(sample_event(EventType::TraceCompleted)).await;

        let a_event = hub.recv(a).await.unwrap();
        assert_eq!(a_event.event_type, EventType::TraceCompleted);

        let first_b = hub.recv(b).await.unwrap();
        assert_eq!(first_b.event_type, EventType::TraceCreated);
        let second_b = hub.recv(b).await.unwrap();
        assert_eq!(second_b.event_type, EventType::TraceCompleted);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_closes_recv() {
        let hub = EventHub::default();
        let id = hub.subscribe([EventType::TraceCreated]).await;
        hub.unsubscribe(id).await;
        hub.publish(sample_event(EventType::TraceCreated)).await;
        assert_eq!(hub.recv(id).await, None);
    }

    #[tokio::test]
    async fn full_mailbox_drops_oldest_and_counts_it() {
        let hub = EventHub::new(2);
        let id = hub.subscribe([EventType::TraceUpdated]).await;

        for _ in 0..3 {
            hub.publish(sample_event(EventType::TraceUpdated)).await;
        }
        assert_eq!(hub.dropped_events(), 1);

        // Two events remain queued, in arrival order (the oldest of the
        // three was dropped).
        assert!(hub.recv(id).await.is_some());
        assert!(hub.recv(id).await.is_some());
    }

    #[tokio::test]
    async fn events_for_one_subscriber_preserve_publish_order() {
        let hub = EventHub::default();
        let id = hub
            .subscribe([
                EventType::TraceCreated,
                EventType::TraceUpdated,
                EventType::TraceCompleted,
            ])
            .await;

        hub.publish(sample_event(EventType::TraceCreated)).await;
        hub.publish(sample_event(EventType::TraceUpdated)).await;
        hub.publish(sample_event(EventType::TraceCompleted)).await;

        assert_eq!(hub.recv(id).await.unwrap().event_type, EventType::TraceCreated);
        assert_eq!(hub.recv(id).await.unwrap().event_type, EventType::TraceUpdated);
        assert_eq!(hub.recv(id).await.unwrap().event_type, EventType::TraceCompleted);
    }

    #[tokio::test]
    async fn add_and_remove_interest_changes_filter_live() {
        let hub = EventHub::default();
        let id = hub.subscribe([EventType::TraceCreated]).await;

        hub.add_interest(id, [EventType::TraceCompleted]).await;
        hub.publish(sample_event(EventType::TraceCompleted)).await;
        assert!(hub.recv(id).await.is_some());

        hub.remove_interest(id, [EventType::TraceCompleted]).await;
        hub.publish(sample_event(EventType::TraceCompleted)).await;
        hub.publish(sample_event(EventType::TraceCreated)).await;
        let received = hub.recv(id).await.unwrap();
        assert_eq!(received.event_type, EventType::TraceCreated);
    }
}
