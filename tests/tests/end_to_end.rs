//! The full stack: world engine behind the WebSocket server, driven by the
//! native client.

use argus_core::World;
use argus_proto::{
    ChangeKind, Config, Configurable, Controller, Device, Entity, Filter, Position, ReconcileAction, StreamPayload, TaskStatus,
};
use argus_server::{ServerOptions, WebsocketServer};
use argus_websocket_client::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn start_server() -> (World, Client, CancellationToken) {
    let world = World::new();
    world.init_node_identity().unwrap();
    let cancel = CancellationToken::new();
    world.spawn_gc(Duration::from_millis(100), cancel.clone());

    let server = WebsocketServer::new(world.clone(), ServerOptions::default());
    let addr = server.spawn("127.0.0.1:0").await.unwrap();
    let client = Client::connect(&addr.to_string()).await.unwrap();
    (world, client, cancel)
}

#[tokio::test(flavor = "multi_thread")]
async fn unary_surface_round_trip() {
    let (_world, client, cancel) = start_server().await;

    let mut e1 = Entity::new("e1");
    e1.label = Some("tank".into());
    e1.geo = Some(Position::new(2.0, 1.0));
    let response = client.push(vec![e1]).await.unwrap();
    assert!(response.accepted);

    let mut update = Entity::new("e1");
    update.label = Some("updated".into());
    client.push(vec![update]).await.unwrap();

    let head = client.get("e1").await.unwrap();
    assert_eq!(head.label.as_deref(), Some("updated"));
    assert_eq!(head.geo, Some(Position::new(2.0, 1.0)));

    // list is id-sorted and includes the node identity
    client.push(vec![Entity::new("a1")]).await.unwrap();
    let listed = client.list(None).await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|e| e.id.as_str()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    client.expire("e1").await.unwrap();
    // the periodic gc collects it
    tokio::time::sleep(Duration::from_millis(300)).await;
    let err = client.get("e1").await.unwrap_err();
    assert!(err.to_string().contains("not_found") || err.to_string().contains("NotFound"), "{err}");
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn get_unknown_entity_is_not_found() {
    let (_world, client, cancel) = start_server().await;
    assert!(client.get("missing").await.is_err());
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_stream_seeds_then_follows() {
    let (_world, client, cancel) = start_server().await;
    client.push(vec![Entity::new("seed")]).await.unwrap();

    let mut stream = client.watch(None, None).await.unwrap();

    // invalid-change sentinel first
    let Some(Ok(StreamPayload::Change(first))) = stream.next().await else { panic!("no sentinel") };
    assert_eq!(first.kind, ChangeKind::Unobserved);

    // id-sorted snapshot: node identity + seed, in some id order
    let mut snapshot = Vec::new();
    for _ in 0..2 {
        let Some(Ok(StreamPayload::Change(change))) = stream.next().await else { panic!("snapshot truncated") };
        snapshot.push(change.entity.id);
    }
    assert!(snapshot.contains(&"seed".to_string()));

    // live delta
    client.push(vec![Entity::new("live")]).await.unwrap();
    let Some(Ok(StreamPayload::Change(delta))) = stream.next().await else { panic!("no delta") };
    assert_eq!(delta.entity.id, "live");
    assert_eq!(delta.kind, ChangeKind::Updated);

    stream.cancel().await.unwrap();
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_filter_narrows_stream() {
    let (_world, client, cancel) = start_server().await;
    let filter = Filter { label: Some("wanted".into()), ..Default::default() };
    let mut stream = client.watch(Some(filter), None).await.unwrap();

    // sentinel only; nothing matches yet
    let Some(Ok(StreamPayload::Change(first))) = stream.next().await else { panic!("no sentinel") };
    assert_eq!(first.kind, ChangeKind::Unobserved);

    client.push(vec![Entity::new("noise")]).await.unwrap();
    let mut wanted = Entity::new("signal");
    wanted.label = Some("wanted".into());
    client.push(vec![wanted]).await.unwrap();

    let Some(Ok(StreamPayload::Change(change))) = stream.next().await else { panic!("no item") };
    assert_eq!(change.entity.id, "signal");
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn reconcile_pairs_config_and_device() {
    let (world, client, cancel) = start_server().await;
    let node = world.local_node_id().unwrap().to_string();

    let mut cfg = Entity::new("cfg1");
    cfg.config = Some(Config { key: "meshtastic.usb.v0".into(), controller: "meshtastic".into(), selector: None, value: None });
    client.push(vec![cfg]).await.unwrap();

    let mut dev = Entity::new("dev1");
    dev.controller = Some(Controller { id: Some("meshtastic".into()), node: Some(node) });
    dev.device = Some(Device { configurable: vec![Configurable { key: "meshtastic.usb.v0".into(), schema: None }], ..Default::default() });
    client.push(vec![dev]).await.unwrap();

    let mut stream = client.reconcile("meshtastic").await.unwrap();
    let Some(Ok(StreamPayload::Reconcile(event))) = stream.next().await else { panic!("no initial pair") };
    assert_eq!(event.action, ReconcileAction::New);
    assert_eq!((event.config.id.as_str(), event.device.id.as_str()), ("cfg1", "dev1"));

    client.expire("dev1").await.unwrap();
    loop {
        let Some(Ok(StreamPayload::Reconcile(event))) = stream.next().await else { panic!("stream ended early") };
        if event.action == ReconcileAction::Removed {
            assert_eq!((event.config.id.as_str(), event.device.id.as_str()), ("cfg1", "dev1"));
            break;
        }
    }
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn timeline_stream_and_move() {
    let (_world, client, cancel) = start_server().await;
    client.push(vec![Entity::new("e1")]).await.unwrap();

    let mut stream = client.timeline().await.unwrap();
    let Some(Ok(StreamPayload::Timeline(state))) = stream.next().await else { panic!("no timeline state") };
    assert!(!state.frozen);

    let freeze_at = chrono::Utc::now();
    client.move_timeline(true, freeze_at).await.unwrap();
    // the stream reports the change within its one second cadence
    let Some(Ok(StreamPayload::Timeline(state))) = stream.next().await else { panic!("no update") };
    assert!(state.frozen);
    assert_eq!(state.at, freeze_at);

    client.move_timeline(false, chrono::Utc::now()).await.unwrap();
    stream.cancel().await.unwrap();
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn node_info_and_task_stub() {
    let (world, client, cancel) = start_server().await;

    let node = client.local_node().await.unwrap();
    assert_eq!(Some(node.id.as_str()), world.local_node_id());
    assert!(node.device.unwrap().node.is_some());

    let task = client.run_task("t1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Invalid);
    assert!(task.execution_id.is_empty());
    cancel.cancel();
}
