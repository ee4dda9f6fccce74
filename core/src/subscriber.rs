use argus_proto::{ChangeKind, Entity, Priority, WatchBehavior};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(Ulid);

impl SubscriberId {
    pub fn new() -> Self { Self(Ulid::new()) }
}

impl Default for SubscriberId {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "S-{}", self.0) }
}

/// Delivery knobs for one subscriber, already normalized: the keepalive
/// clamp to >= 1s happens on conversion from the wire behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriberOptions {
    pub max_rate_hz: f64,
    pub min_priority: Priority,
    pub keepalive: Option<Duration>,
}

impl Default for SubscriberOptions {
    fn default() -> Self { Self { max_rate_hz: 0.0, min_priority: Priority::Unspecified, keepalive: None } }
}

impl SubscriberOptions {
    /// Ticker period for the rate limiter, when one is configured.
    pub fn rate_interval(&self) -> Option<Duration> {
        if self.max_rate_hz > 0.0 {
            Some(Duration::from_secs_f64(1.0 / self.max_rate_hz))
        } else {
            None
        }
    }
}

impl From<WatchBehavior> for SubscriberOptions {
    fn from(behavior: WatchBehavior) -> Self {
        let keepalive = match behavior.keepalive_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms.max(1000))),
        };
        Self { max_rate_hz: behavior.max_rate_hz, min_priority: behavior.min_priority, keepalive }
    }
}

/// One pending unit of work for a sender loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PopItem {
    pub id: String,
    pub kind: ChangeKind,
    pub priority: Priority,
    /// Last-known entity, captured when Expired was queued for an id that
    /// is no longer in head.
    pub snapshot: Option<Entity>,
}

/// A subscriber is its own queue: four priority buckets of coalesced
/// pending ids plus a single-slot wake signal. Producers write through
/// `mark_dirty` under the subscriber's lock in O(1); only the owning
/// sender loop pops.
pub struct Subscriber(Arc<SubscriberInner>);

impl Clone for Subscriber {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

struct SubscriberInner {
    id: SubscriberId,
    options: SubscriberOptions,
    buckets: Mutex<Buckets>,
    signal: Notify,
}

#[derive(Default)]
struct Buckets {
    by_priority: [HashMap<String, ChangeKind>; 4],
    expired: HashMap<String, Entity>,
}

impl Subscriber {
    pub fn new(options: SubscriberOptions) -> Self {
        Self(Arc::new(SubscriberInner { id: SubscriberId::new(), options, buckets: Mutex::new(Buckets::default()), signal: Notify::new() }))
    }

    pub fn id(&self) -> SubscriberId { self.0.id }

    pub fn options(&self) -> &SubscriberOptions { &self.0.options }

    /// Queue a change for `id`. Below-floor priorities are discarded.
    /// Repeated calls for one id coalesce to a single entry carrying the
    /// latest change kind and the highest priority observed so far.
    pub fn mark_dirty(&self, id: &str, priority: Priority, kind: ChangeKind, snapshot: Option<Entity>) {
        if priority < self.0.options.min_priority {
            return;
        }
        {
            let mut buckets = self.0.buckets.lock().unwrap();
            let mut seat = priority;
            for index in 0..buckets.by_priority.len() {
                if buckets.by_priority[index].remove(id).is_some() {
                    if let Some(previous) = Priority::from_index(index) {
                        seat = seat.max(previous);
                    }
                }
            }
            buckets.by_priority[seat.index()].insert(id.to_string(), kind);
            match (kind, snapshot) {
                (ChangeKind::Expired, Some(entity)) => {
                    buckets.expired.insert(id.to_string(), entity);
                }
                _ => {
                    buckets.expired.remove(id);
                }
            }
        }
        // single-slot: any number of notifications collapse into one permit
        self.0.signal.notify_one();
    }

    /// Drain strictly Flash -> Immediate -> Routine -> Unspecified,
    /// respecting the floor. Relative order of distinct ids within one
    /// bucket is unspecified.
    pub fn pop_next(&self) -> Option<PopItem> {
        let mut buckets = self.0.buckets.lock().unwrap();
        for priority in Priority::DESCENDING {
            if priority < self.0.options.min_priority {
                continue;
            }
            let bucket = &mut buckets.by_priority[priority.index()];
            if let Some(id) = bucket.keys().next().cloned() {
                let kind = bucket.remove(&id).unwrap();
                let snapshot = buckets.expired.remove(&id);
                return Some(PopItem { id, kind, priority, snapshot });
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        let buckets = self.0.buckets.lock().unwrap();
        buckets.by_priority.iter().all(|bucket| bucket.is_empty())
    }

    /// Wait for the next wake signal.
    pub async fn notified(&self) { self.0.signal.notified().await }
}
