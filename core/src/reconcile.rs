//! Pair configuration directives with the local devices that accept them,
//! and keep a per-controller stream of New / Changed / Removed pairings
//! flowing as either side changes.

use crate::{
    error::SendError,
    filter,
    subscriber::{Subscriber, SubscriberOptions},
    world::World,
};
use argus_proto::{Config, Entity, ReconcileAction, ReconcileEvent};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

/// Where a reconcile stream writes.
#[async_trait]
pub trait ReconcileSink: Send {
    async fn send(&mut self, event: ReconcileEvent) -> Result<(), SendError>;
}

#[async_trait]
impl ReconcileSink for tokio::sync::mpsc::Sender<ReconcileEvent> {
    async fn send(&mut self, event: ReconcileEvent) -> Result<(), SendError> {
        tokio::sync::mpsc::Sender::send(self, event).await.map_err(|_| SendError::Closed)
    }
}

/// Open a reconcile stream for one controller: emit New for the full
/// initial match set, then follow head changes until cancelled.
pub async fn run_reconcile<S: ReconcileSink>(
    world: World,
    controller: String,
    mut sink: S,
    cancel: CancellationToken,
) -> Result<(), SendError> {
    let subscriber = Subscriber::new(SubscriberOptions::default());
    world.bus().register(subscriber.clone());
    let result = drive(&world, controller, &mut sink, &subscriber, &cancel).await;
    world.bus().unregister(subscriber.id());
    result
}

async fn drive<S: ReconcileSink>(
    world: &World,
    controller: String,
    sink: &mut S,
    subscriber: &Subscriber,
    cancel: &CancellationToken,
) -> Result<(), SendError> {
    let mut matcher = Matcher::new(world.clone(), controller);
    for event in matcher.initial() {
        sink.send(event).await?;
    }
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match subscriber.pop_next() {
            Some(item) => {
                for event in matcher.apply(&item.id) {
                    sink.send(event).await?;
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = subscriber.notified() => {}
                }
            }
        }
    }
}

/// Incremental match-set maintenance. The three indices move together so
/// removal events can be synthesised even when an entity is already gone
/// from head.
struct Matcher {
    world: World,
    controller: String,
    /// config id -> last-known config entity
    configs: HashMap<String, Entity>,
    /// device id -> last-known device entity
    devices: HashMap<String, Entity>,
    /// config id -> ids of currently matched devices
    matches: HashMap<String, HashSet<String>>,
    /// device id -> ids of configs it currently matches
    device_index: HashMap<String, HashSet<String>>,
}

impl Matcher {
    fn new(world: World, controller: String) -> Self {
        Self {
            world,
            controller,
            configs: HashMap::new(),
            devices: HashMap::new(),
            matches: HashMap::new(),
            device_index: HashMap::new(),
        }
    }

    /// A config is in scope when it belongs to the stream's controller.
    fn in_scope(&self, entity: &Entity) -> bool {
        entity.config.as_ref().is_some_and(|c| c.controller == self.controller)
    }

    /// The §match rule: controller name, announced key, optional selector,
    /// and locality all hold.
    fn pair_matches(&self, config: &Config, device: &Entity) -> bool {
        if device.controller_id() != Some(config.controller.as_str()) {
            return false;
        }
        let Some(component) = &device.device else {
            return false;
        };
        if !component.configurable.iter().any(|c| c.key == config.key) {
            return false;
        }
        if let Some(selector) = &config.selector {
            if !filter::matches(Some(selector), device) {
                return false;
            }
        }
        let local = self.world.local_node_id();
        local.is_some() && device.owner_node() == local
    }

    /// Build the full initial match set and emit New for each pair.
    fn initial(&mut self) -> Vec<ReconcileEvent> {
        for entity in self.world.list(None) {
            if self.in_scope(&entity) {
                self.configs.insert(entity.id.clone(), entity.clone());
            }
            if entity.device.is_some() {
                self.devices.insert(entity.id.clone(), entity);
            }
        }

        let mut events = Vec::new();
        let mut config_ids: Vec<String> = self.configs.keys().cloned().collect();
        config_ids.sort();
        for config_id in config_ids {
            events.extend(self.recompute_config(&config_id));
        }
        events
    }

    /// Process one dirtied id: re-read head and reconcile both of the
    /// roles the entity may play.
    fn apply(&mut self, id: &str) -> Vec<ReconcileEvent> {
        let current = self.world.get_head(id);
        let mut events = Vec::new();

        let is_config = current.as_ref().is_some_and(|e| self.in_scope(e));
        let was_config = self.configs.contains_key(id);
        if is_config {
            self.configs.insert(id.to_string(), current.clone().unwrap_or_default());
            events.extend(self.recompute_config(id));
        } else if was_config {
            events.extend(self.remove_config(id));
        }

        let is_device = current.as_ref().is_some_and(|e| e.device.is_some());
        let was_device = self.devices.contains_key(id);
        if is_device {
            self.devices.insert(id.to_string(), current.unwrap_or_default());
            events.extend(self.recompute_device(id));
        } else if was_device {
            events.extend(self.remove_device(id));
        }

        events
    }

    /// Config added or updated: diff its device set against the previous
    /// one. Retained pairs re-emit as Changed so consumers can pick up
    /// selector or value edits.
    fn recompute_config(&mut self, config_id: &str) -> Vec<ReconcileEvent> {
        let Some(config_entity) = self.configs.get(config_id).cloned() else {
            return Vec::new();
        };
        let Some(config) = config_entity.config.clone() else {
            return Vec::new();
        };

        let old: HashSet<String> = self.matches.get(config_id).cloned().unwrap_or_default();
        let mut device_ids: Vec<String> = self.devices.keys().cloned().collect();
        device_ids.sort();

        let mut new = HashSet::new();
        let mut events = Vec::new();
        for device_id in device_ids {
            let device = self.devices[&device_id].clone();
            if !self.pair_matches(&config, &device) {
                continue;
            }
            new.insert(device_id.clone());
            let action = if old.contains(&device_id) { ReconcileAction::Changed } else { ReconcileAction::New };
            if action == ReconcileAction::New {
                self.device_index.entry(device_id).or_default().insert(config_id.to_string());
            }
            events.push(ReconcileEvent { action, config: config_entity.clone(), device });
        }

        let mut departed: Vec<&String> = old.difference(&new).collect();
        departed.sort();
        for device_id in departed {
            if let Some(configs) = self.device_index.get_mut(device_id) {
                configs.remove(config_id);
            }
            if let Some(device) = self.devices.get(device_id) {
                events.push(ReconcileEvent { action: ReconcileAction::Removed, config: config_entity.clone(), device: device.clone() });
            }
        }

        self.matches.insert(config_id.to_string(), new);
        events
    }

    /// Config removed (or its entity lost): every surviving pair emits
    /// Removed, using the last-known config entity.
    fn remove_config(&mut self, config_id: &str) -> Vec<ReconcileEvent> {
        let Some(config_entity) = self.configs.remove(config_id) else {
            return Vec::new();
        };
        let old = self.matches.remove(config_id).unwrap_or_default();
        let mut device_ids: Vec<String> = old.into_iter().collect();
        device_ids.sort();

        let mut events = Vec::new();
        for device_id in device_ids {
            if let Some(configs) = self.device_index.get_mut(&device_id) {
                configs.remove(config_id);
            }
            if let Some(device) = self.devices.get(&device_id) {
                events.push(ReconcileEvent { action: ReconcileAction::Removed, config: config_entity.clone(), device: device.clone() });
            }
        }
        events
    }

    /// Device added or updated: check it against every known config.
    fn recompute_device(&mut self, device_id: &str) -> Vec<ReconcileEvent> {
        let Some(device) = self.devices.get(device_id).cloned() else {
            return Vec::new();
        };
        let mut config_ids: Vec<String> = self.configs.keys().cloned().collect();
        config_ids.sort();

        let mut events = Vec::new();
        for config_id in config_ids {
            let config_entity = self.configs[&config_id].clone();
            let Some(config) = config_entity.config.clone() else {
                continue;
            };
            let matched_before = self.matches.get(&config_id).is_some_and(|set| set.contains(device_id));
            let matches_now = self.pair_matches(&config, &device);
            let action = match (matched_before, matches_now) {
                (false, true) => ReconcileAction::New,
                (true, false) => ReconcileAction::Removed,
                (true, true) => ReconcileAction::Changed,
                (false, false) => continue,
            };
            match action {
                ReconcileAction::New => {
                    self.matches.entry(config_id.clone()).or_default().insert(device_id.to_string());
                    self.device_index.entry(device_id.to_string()).or_default().insert(config_id.clone());
                }
                ReconcileAction::Removed => {
                    if let Some(set) = self.matches.get_mut(&config_id) {
                        set.remove(device_id);
                    }
                    if let Some(set) = self.device_index.get_mut(device_id) {
                        set.remove(&config_id);
                    }
                }
                ReconcileAction::Changed => {}
            }
            events.push(ReconcileEvent { action, config: config_entity, device: device.clone() });
        }
        events
    }

    /// Device removed: Removed for each config that previously matched it,
    /// using the last-known device entity.
    fn remove_device(&mut self, device_id: &str) -> Vec<ReconcileEvent> {
        let Some(device) = self.devices.remove(device_id) else {
            return Vec::new();
        };
        let config_ids = self.device_index.remove(device_id).unwrap_or_default();
        let mut config_ids: Vec<String> = config_ids.into_iter().collect();
        config_ids.sort();

        let mut events = Vec::new();
        for config_id in config_ids {
            if let Some(set) = self.matches.get_mut(&config_id) {
                set.remove(device_id);
            }
            if let Some(config_entity) = self.configs.get(&config_id) {
                events.push(ReconcileEvent { action: ReconcileAction::Removed, config: config_entity.clone(), device: device.clone() });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_proto::{Configurable, Controller, Device, Filter, ReconcileAction};
    use std::time::Duration;

    fn config_entity(id: &str, controller: &str, key: &str) -> Entity {
        let mut e = Entity::new(id);
        e.config = Some(Config { key: key.into(), controller: controller.into(), selector: None, value: None });
        e
    }

    fn device_entity(id: &str, controller: &str, key: &str, node: &str) -> Entity {
        let mut e = Entity::new(id);
        e.controller = Some(Controller { id: Some(controller.into()), node: Some(node.into()) });
        e.device = Some(Device { configurable: vec![Configurable { key: key.into(), schema: None }], ..Default::default() });
        e
    }

    fn local_world() -> (World, String) {
        let world = World::new();
        let node = world.init_node_identity().unwrap();
        (world, node.id)
    }

    #[tokio::test]
    async fn initial_match_set_emits_new_pairs() {
        let (world, node) = local_world();
        world.push(vec![config_entity("cfg1", "meshtastic", "meshtastic.usb.v0")]).unwrap();
        world.push(vec![device_entity("dev1", "meshtastic", "meshtastic.usb.v0", &node)]).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_reconcile(world.clone(), "meshtastic".into(), tx, cancel.clone()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, ReconcileAction::New);
        assert_eq!(event.config.id, "cfg1");
        assert_eq!(event.device.id, "dev1");
        cancel.cancel();
    }

    #[tokio::test]
    async fn device_expiry_synthesizes_removed() {
        let (world, node) = local_world();
        world.push(vec![config_entity("cfg1", "meshtastic", "meshtastic.usb.v0")]).unwrap();
        world.push(vec![device_entity("dev1", "meshtastic", "meshtastic.usb.v0", &node)]).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_reconcile(world.clone(), "meshtastic".into(), tx, cancel.clone()));
        assert_eq!(rx.recv().await.unwrap().action, ReconcileAction::New);

        world.expire("dev1").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        world.gc();

        // the expire itself surfaces as Changed (device still in head),
        // the gc pass then drops it from head and synthesizes Removed
        loop {
            let event = rx.recv().await.unwrap();
            if event.action == ReconcileAction::Removed {
                assert_eq!(event.config.id, "cfg1");
                assert_eq!(event.device.id, "dev1");
                break;
            }
            assert_eq!(event.action, ReconcileAction::Changed);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn config_update_diffs_old_and_new_matches() {
        let (world, node) = local_world();
        world.push(vec![device_entity("dev1", "meshtastic", "key.a", &node)]).unwrap();
        world.push(vec![device_entity("dev2", "meshtastic", "key.b", &node)]).unwrap();
        world.push(vec![config_entity("cfg1", "meshtastic", "key.a")]).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_reconcile(world.clone(), "meshtastic".into(), tx, cancel.clone()));

        let event = rx.recv().await.unwrap();
        assert_eq!((event.action, event.device.id.as_str()), (ReconcileAction::New, "dev1"));

        // the config moves to key.b: dev1 departs, dev2 arrives
        world.push(vec![config_entity("cfg1", "meshtastic", "key.b")]).unwrap();
        let mut actions = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        actions.sort_by_key(|e| e.device.id.clone());
        assert_eq!((actions[0].action, actions[0].device.id.as_str()), (ReconcileAction::Removed, "dev1"));
        assert_eq!((actions[1].action, actions[1].device.id.as_str()), (ReconcileAction::New, "dev2"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn selector_narrows_matches() {
        let (world, node) = local_world();
        let mut cfg = config_entity("cfg1", "meshtastic", "key.a");
        cfg.config.as_mut().unwrap().selector = Some(Filter { label: Some("usb".into()), ..Default::default() });
        world.push(vec![cfg]).unwrap();

        let plain = device_entity("dev1", "meshtastic", "key.a", &node);
        let mut labelled = device_entity("dev2", "meshtastic", "key.a", &node);
        labelled.label = Some("usb".into());
        world.push(vec![plain, labelled]).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_reconcile(world.clone(), "meshtastic".into(), tx, cancel.clone()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.device.id, "dev2");
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn remote_devices_never_match() {
        let (world, _node) = local_world();
        world.push(vec![config_entity("cfg1", "meshtastic", "key.a")]).unwrap();
        world.push(vec![device_entity("dev1", "meshtastic", "key.a", "node/remote")]).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_reconcile(world.clone(), "meshtastic".into(), tx, cancel.clone()));

        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn other_controllers_are_out_of_scope() {
        let (world, node) = local_world();
        world.push(vec![config_entity("cfg1", "other", "key.a")]).unwrap();
        world.push(vec![device_entity("dev1", "other", "key.a", &node)]).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_reconcile(world.clone(), "meshtastic".into(), tx, cancel.clone()));

        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        cancel.cancel();
    }
}
