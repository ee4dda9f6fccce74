use crate::{
    bus::Bus,
    error::WorldError,
    filter,
    policy::{PermissiveAgent, PolicyAgent},
    store::EventStore,
    subscriber::Subscriber,
};
use argus_proto::{ChangeKind, Device, DeviceState, Entity, Filter, Lifetime, NodeDescriptor, TimelineState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

/// The authoritative world: latest-version head of state, the append-only
/// store behind it, and the bus that fans changes out to subscribers.
///
/// One world instance is the natural scope of the whole engine; tests
/// construct fresh instances. Cloning shares the instance.
pub struct World(Arc<WorldInner>);

impl Clone for World {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

struct WorldInner {
    head: RwLock<HashMap<String, Entity>>,
    store: EventStore,
    bus: Bus,
    timeline: Mutex<Timeline>,
    node_id: OnceLock<String>,
    policy: Arc<dyn PolicyAgent>,
}

#[derive(Debug, Clone, Copy)]
struct Timeline {
    frozen: bool,
    at: DateTime<Utc>,
}

impl Default for World {
    fn default() -> Self { Self::new() }
}

impl World {
    pub fn new() -> Self { Self::with_policy(Arc::new(PermissiveAgent::new())) }

    pub fn with_policy(policy: Arc<dyn PolicyAgent>) -> Self {
        Self(Arc::new(WorldInner {
            head: RwLock::new(HashMap::new()),
            store: EventStore::new(),
            bus: Bus::new(),
            timeline: Mutex::new(Timeline { frozen: false, at: DateTime::UNIX_EPOCH }),
            node_id: OnceLock::new(),
            policy,
        }))
    }

    pub fn bus(&self) -> &Bus { &self.0.bus }

    pub fn store(&self) -> &EventStore { &self.0.store }

    pub fn policy(&self) -> &Arc<dyn PolicyAgent> { &self.0.policy }

    /// The effective current instant: the frozen instant while frozen,
    /// wall-clock otherwise.
    pub fn now(&self) -> DateTime<Utc> {
        let timeline = self.0.timeline.lock().unwrap();
        if timeline.frozen {
            timeline.at
        } else {
            Utc::now()
        }
    }

    pub fn is_frozen(&self) -> bool { self.0.timeline.lock().unwrap().frozen }

    /// The id of the entity representing this node, once initialized.
    pub fn local_node_id(&self) -> Option<&str> { self.0.node_id.get().map(String::as_str) }

    /// Merge a batch of changes into head, in argument order. Every merged
    /// version is appended to the store. While frozen the store still
    /// appends but head stays untouched and no subscriber is notified.
    pub fn push(&self, changes: Vec<Entity>) -> Result<(), WorldError> {
        for change in changes {
            if change.id.is_empty() {
                return Err(WorldError::InvalidArgument("entity id must not be empty".into()));
            }
            let frozen = self.is_frozen();
            let now = self.now();
            let merged = {
                let mut head = self.0.head.write().unwrap();
                let mut merged = match head.get(&change.id) {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        merged.merge_from(change);
                        merged
                    }
                    None => change,
                };
                self.stamp(&mut merged, now);
                if !frozen {
                    head.insert(merged.id.clone(), merged.clone());
                }
                merged
            };
            self.0.store.append(merged.clone());
            if !frozen {
                self.0.bus.dirty(&merged, ChangeKind::Updated);
            }
        }
        Ok(())
    }

    /// Stamp `lifetime.from` and the owning node, preserving anything
    /// already set.
    fn stamp(&self, entity: &mut Entity, now: DateTime<Utc>) {
        let lifetime = entity.lifetime.get_or_insert_with(Lifetime::default);
        if lifetime.from.is_none() {
            lifetime.from = Some(now);
        }
        if let Some(node_id) = self.local_node_id() {
            let controller = entity.controller.get_or_insert_with(Default::default);
            if controller.node.is_none() {
                controller.node = Some(node_id.to_string());
            }
        }
    }

    pub fn get_head(&self, id: &str) -> Option<Entity> { self.0.head.read().unwrap().get(id).cloned() }

    pub fn get(&self, id: &str) -> Result<Entity, WorldError> {
        self.get_head(id).ok_or_else(|| WorldError::NotFound(id.to_string()))
    }

    /// Snapshot of head matching the filter, sorted by id.
    pub fn list(&self, filter: Option<&Filter>) -> Vec<Entity> {
        let head = self.0.head.read().unwrap();
        let mut entities: Vec<Entity> = head.values().filter(|e| filter::matches(filter, e)).cloned().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    pub fn head_len(&self) -> usize { self.0.head.read().unwrap().len() }

    /// Set `lifetime.until` to the effective now, in place. The entity
    /// stays in head until the next GC pass collects it.
    pub fn expire(&self, id: &str) -> Result<(), WorldError> {
        let now = self.now();
        let expired = {
            let mut head = self.0.head.write().unwrap();
            let entity = head.get_mut(id).ok_or_else(|| WorldError::NotFound(id.to_string()))?;
            entity.lifetime.get_or_insert_with(Lifetime::default).until = Some(now);
            entity.clone()
        };
        self.0.bus.dirty(&expired, ChangeKind::Updated);
        Ok(())
    }

    /// Delete every head entry whose `until` lies before the effective
    /// now, dirtying each as Expired with the removed snapshot. While
    /// frozen this evaluates against the frozen instant, so entities alive
    /// at that instant survive regardless of wall-clock.
    pub fn gc(&self) {
        let now = self.now();
        let removed: Vec<Entity> = {
            let mut head = self.0.head.write().unwrap();
            let expired_ids: Vec<String> = head
                .values()
                .filter(|e| e.lifetime.as_ref().and_then(|l| l.until).is_some_and(|until| now > until))
                .map(|e| e.id.clone())
                .collect();
            expired_ids.into_iter().filter_map(|id| head.remove(&id)).collect()
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "gc expired entities");
        }
        for entity in removed {
            self.0.bus.dirty(&entity, ChangeKind::Expired);
        }
    }

    /// Re-dirty every head entity into one subscriber as Updated at its
    /// natural priority. Drives the keepalive heartbeat.
    pub fn requeue_all(&self, subscriber: &Subscriber) {
        let head = self.0.head.read().unwrap();
        for entity in head.values() {
            subscriber.mark_dirty(&entity.id, entity.effective_priority(), ChangeKind::Updated, None);
        }
    }

    /// Adopt an existing entity carrying a node device descriptor, or mint
    /// a fresh identity and place it in head. Must run after the world
    /// file has been loaded so a persisted identity wins.
    pub fn init_node_identity(&self) -> Result<Entity, WorldError> {
        let existing = {
            let head = self.0.head.read().unwrap();
            head.values().find(|e| e.device.as_ref().is_some_and(|d| d.node.is_some())).cloned()
        };
        if let Some(entity) = existing {
            let _ = self.0.node_id.set(entity.id.clone());
            info!(node = %entity.id, "adopted node identity");
            return Ok(entity);
        }

        let id = format!("node/{}", Ulid::new());
        let _ = self.0.node_id.set(id.clone());
        let hostname = hostname();
        let mut entity = Entity::new(&id);
        entity.label = Some(hostname.clone());
        entity.device = Some(Device {
            state: DeviceState::Online,
            node: Some(NodeDescriptor { hostname, os: std::env::consts::OS.into(), arch: std::env::consts::ARCH.into() }),
            ..Default::default()
        });
        self.push(vec![entity])?;
        info!(node = %id, "created node identity");
        self.get(&id)
    }

    pub fn local_node(&self) -> Result<Entity, WorldError> {
        let id = self.local_node_id().ok_or_else(|| WorldError::NotFound("local node".into()))?.to_string();
        self.get(&id)
    }

    /// Freeze or thaw the clock at `at`: GC evaluates against the new
    /// instant, head is rebuilt from the store's reconstruction, and every
    /// resulting entity is dirtied as Updated.
    pub fn move_timeline(&self, freeze: bool, at: DateTime<Utc>) {
        {
            let mut timeline = self.0.timeline.lock().unwrap();
            timeline.frozen = freeze;
            timeline.at = at;
        }
        info!(frozen = freeze, %at, "timeline moved");
        self.gc();

        let rebuilt = self.0.store.reconstruct_at(at);
        let entities: Vec<Entity> = {
            let mut head = self.0.head.write().unwrap();
            *head = rebuilt;
            head.values().cloned().collect()
        };
        for entity in entities {
            self.0.bus.dirty(&entity, ChangeKind::Updated);
        }
    }

    pub fn timeline_state(&self) -> TimelineState {
        let (min, max) = self.0.store.bounds();
        let timeline = self.0.timeline.lock().unwrap();
        TimelineState { min, max, frozen: timeline.frozen, at: timeline.at }
    }

    /// Run GC on a fixed cadence until cancelled.
    pub fn spawn_gc(&self, period: Duration, cancel: CancellationToken) {
        let world = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => world.gc(),
                }
            }
        });
    }
}

fn hostname() -> String { std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()) }
