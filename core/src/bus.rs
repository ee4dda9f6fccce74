use crate::subscriber::{Subscriber, SubscriberId};
use argus_proto::{ChangeKind, Entity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of subscribers and the fan-out point for dirty notifications.
///
/// There is no message queue between publisher and subscriber: the
/// subscriber *is* the queue. Fan-out touches each subscriber's own lock
/// for O(1) work, so a publisher is never blocked by consumer throughput.
pub struct Bus(Arc<BusInner>);

impl Clone for Bus {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

struct BusInner {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
}

impl Default for Bus {
    fn default() -> Self { Self::new() }
}

impl Bus {
    pub fn new() -> Self { Self(Arc::new(BusInner { subscribers: Mutex::new(HashMap::new()) })) }

    pub fn register(&self, subscriber: Subscriber) {
        self.0.subscribers.lock().unwrap().insert(subscriber.id(), subscriber);
    }

    /// A subscriber removed mid-fanout simply no longer receives; its
    /// internals are untouched.
    pub fn unregister(&self, id: SubscriberId) {
        self.0.subscribers.lock().unwrap().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize { self.0.subscribers.lock().unwrap().len() }

    /// Route one change to every subscriber. The registry lock is released
    /// before touching subscriber locks so register/unregister never
    /// contend with a slow fan-out.
    pub fn dirty(&self, entity: &Entity, kind: ChangeKind) {
        let subscribers: Vec<Subscriber> = self.0.subscribers.lock().unwrap().values().cloned().collect();
        let priority = entity.effective_priority();
        for subscriber in subscribers {
            let snapshot = (kind == ChangeKind::Expired).then(|| entity.clone());
            subscriber.mark_dirty(&entity.id, priority, kind, snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::SubscriberOptions;
    use argus_proto::Priority;

    #[test]
    fn fans_out_to_all_subscribers() {
        let bus = Bus::new();
        let a = Subscriber::new(SubscriberOptions::default());
        let b = Subscriber::new(SubscriberOptions::default());
        bus.register(a.clone());
        bus.register(b.clone());

        let mut e = Entity::new("e1");
        e.priority = Some(Priority::Immediate);
        bus.dirty(&e, ChangeKind::Updated);

        assert_eq!(a.pop_next().unwrap().priority, Priority::Immediate);
        assert_eq!(b.pop_next().unwrap().id, "e1");
    }

    #[test]
    fn unregistered_subscriber_stops_receiving() {
        let bus = Bus::new();
        let sub = Subscriber::new(SubscriberOptions::default());
        bus.register(sub.clone());
        bus.unregister(sub.id());

        bus.dirty(&Entity::new("e1"), ChangeKind::Updated);
        assert!(sub.pop_next().is_none());
    }

    #[test]
    fn expired_carries_snapshot() {
        let bus = Bus::new();
        let sub = Subscriber::new(SubscriberOptions::default());
        bus.register(sub.clone());

        let mut e = Entity::new("e1");
        e.label = Some("gone".into());
        bus.dirty(&e, ChangeKind::Expired);

        let item = sub.pop_next().unwrap();
        assert_eq!(item.snapshot.unwrap().label.as_deref(), Some("gone"));
    }
}
