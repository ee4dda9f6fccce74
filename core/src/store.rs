use argus_proto::Entity;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Append-only log of every entity version ever pushed. The store never
/// forgets: GC and timeline freezes only touch head. Insertion order is
/// preserved and is the tie-break among versions of the same id.
pub struct EventStore {
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    log: Vec<Entity>,
    min: Option<DateTime<Utc>>,
    max: Option<DateTime<Utc>>,
}

impl Default for EventStore {
    fn default() -> Self { Self::new() }
}

impl EventStore {
    pub fn new() -> Self { Self { inner: RwLock::new(StoreInner::default()) } }

    /// Append a version, widening the observed `[min, max]` time bounds
    /// from the entity's lifetime when present.
    pub fn append(&self, entity: Entity) {
        let mut inner = self.inner.write().unwrap();
        if let Some(lifetime) = &entity.lifetime {
            for t in [lifetime.from, lifetime.until].into_iter().flatten() {
                inner.min = Some(inner.min.map_or(t, |min| min.min(t)));
                inner.max = Some(inner.max.map_or(t, |max| max.max(t)));
            }
        }
        inner.log.push(entity);
    }

    /// Observed time bounds; epoch zero when nothing has been observed.
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let inner = self.inner.read().unwrap();
        (inner.min.unwrap_or(DateTime::UNIX_EPOCH), inner.max.unwrap_or(DateTime::UNIX_EPOCH))
    }

    pub fn len(&self) -> usize { self.inner.read().unwrap().log.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Rebuild the world as of instant `t`: for every id ever stored, the
    /// latest version with `from <= t` and (`until` absent or `until >= t`).
    /// Ids with no qualifying version are omitted.
    pub fn reconstruct_at(&self, t: DateTime<Utc>) -> HashMap<String, Entity> {
        let inner = self.inner.read().unwrap();
        let mut head = HashMap::new();
        for version in &inner.log {
            let Some(lifetime) = &version.lifetime else {
                head.insert(version.id.clone(), version.clone());
                continue;
            };
            if lifetime.from.is_some_and(|from| from > t) {
                continue;
            }
            if lifetime.until.is_some_and(|until| until < t) {
                continue;
            }
            head.insert(version.id.clone(), version.clone());
        }
        head
    }
}
