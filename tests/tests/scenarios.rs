//! End-to-end scenarios for the world engine, driven through the core API.

use argus_core::{persistence, PolicyContext, Subscriber, SubscriberOptions, World};
use argus_core::{run_watch, WorldError};
use argus_proto::{ChangeKind, Entity, EntityChange, Filter, GeoFilter, Geometry, Lifetime, Position};
use chrono::{TimeDelta, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn spawn_watch(
    world: &World,
    options: SubscriberOptions,
    filter: Option<Filter>,
) -> (tokio::sync::mpsc::Receiver<EntityChange>, CancellationToken) {
    let subscriber = Subscriber::new(options);
    world.bus().register(subscriber.clone());
    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let cancel = CancellationToken::new();
    tokio::spawn(run_watch(world.clone(), subscriber, filter, PolicyContext::default(), tx, cancel.clone()));
    (rx, cancel)
}

// S1: push, merge, expire, collect
#[test]
fn merge_and_expire() {
    let world = World::new();

    let mut e1 = Entity::new("e1");
    e1.label = Some("tank".into());
    e1.geo = Some(Position::new(2.0, 1.0));
    world.push(vec![e1]).unwrap();

    let mut update = Entity::new("e1");
    update.label = Some("updated".into());
    world.push(vec![update]).unwrap();

    let head = world.get("e1").unwrap();
    assert_eq!(head.label.as_deref(), Some("updated"));
    assert_eq!(head.geo, Some(Position::new(2.0, 1.0)));

    world.expire("e1").unwrap();
    std::thread::sleep(Duration::from_millis(5));
    world.gc();
    assert!(matches!(world.get("e1"), Err(WorldError::NotFound(_))));
}

// S3: a silent world still heartbeats current state to keepalive subscribers
#[tokio::test]
async fn keepalive_heartbeat() {
    let world = World::new();
    world.push(vec![Entity::new("e1"), Entity::new("e2")]).unwrap();

    let options = SubscriberOptions { keepalive: Some(Duration::from_secs(1)), ..Default::default() };
    let (mut rx, cancel) = spawn_watch(&world, options, None);

    // sentinel + snapshot of two
    for _ in 0..3 {
        rx.recv().await.unwrap();
    }

    // no producer activity at all from here on
    let mut seen = std::collections::HashSet::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
    while seen.len() < 2 {
        let change = tokio::time::timeout_at(deadline, rx.recv()).await.expect("keepalive did not fire").unwrap();
        if change.kind == ChangeKind::Updated {
            seen.insert(change.entity.id);
        }
    }
    cancel.cancel();
}

// S4: freeze rewinds head to the reconstruction, thaw replays forward
#[test]
fn freeze_and_replay() {
    let world = World::new();
    let t1 = Utc::now();
    let t2 = t1 + TimeDelta::seconds(10);

    let mut v1 = Entity::new("e1");
    v1.label = Some("v1".into());
    v1.lifetime = Some(Lifetime { from: Some(t1), until: None });
    world.push(vec![v1]).unwrap();

    let mut v2 = Entity::new("e1");
    v2.label = Some("v2".into());
    v2.lifetime = Some(Lifetime { from: Some(t2), until: None });
    world.push(vec![v2]).unwrap();

    world.move_timeline(true, t1 + TimeDelta::milliseconds(1));
    let listed = world.list(None);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].label.as_deref(), Some("v1"));
    let state = world.timeline_state();
    assert!(state.frozen);

    world.move_timeline(false, t2 + TimeDelta::seconds(1));
    assert_eq!(world.get("e1").unwrap().label.as_deref(), Some("v2"));
    assert!(!world.timeline_state().frozen);
}

// S6: polygon watch passes entities inside the box and drops the rest
#[tokio::test]
async fn geo_polygon_watch() {
    let world = World::new();

    let enclosing = Filter {
        geo: Some(GeoFilter {
            geometry: Some(Geometry::Polygon {
                exterior: vec![Position::new(10.0, 47.0), Position::new(12.0, 47.0), Position::new(12.0, 49.0), Position::new(10.0, 49.0)],
                holes: vec![],
            }),
            entity_id: None,
        }),
        ..Default::default()
    };
    let (mut rx, cancel) = spawn_watch(&world, SubscriberOptions::default(), Some(enclosing));
    assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Unobserved);

    let mut x = Entity::new("x");
    x.geo = Some(Position::new(11.0, 48.0));
    world.push(vec![x]).unwrap();
    assert_eq!(rx.recv().await.unwrap().entity.id, "x");
    cancel.cancel();

    let origin = Filter {
        geo: Some(GeoFilter {
            geometry: Some(Geometry::Polygon {
                exterior: vec![Position::new(-1.0, -1.0), Position::new(1.0, -1.0), Position::new(1.0, 1.0), Position::new(-1.0, 1.0)],
                holes: vec![],
            }),
            entity_id: None,
        }),
        ..Default::default()
    };
    let (mut rx, cancel) = spawn_watch(&world, SubscriberOptions::default(), Some(origin));
    assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Unobserved);

    let mut y = Entity::new("y");
    y.geo = Some(Position::new(11.0, 48.0));
    world.push(vec![y]).unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    cancel.cancel();
}

// property 8: the world file round-trips the persistable multiset
#[test]
fn world_file_round_trip() {
    let mut a = Entity::new("alpha");
    a.label = Some("hq".into());
    a.symbol = Some("SFGPUCI----".into());
    a.geo = Some(Position::new(11.57, 48.13));
    a.lifetime = Some(Lifetime { from: Some(Utc::now()), until: None });

    let mut b = Entity::new("bravo");
    b.label = Some("relay".into());
    b.lifetime = Some(Lifetime { from: Some(Utc::now()), until: None });

    let entities = vec![a, b];
    let parsed = persistence::parse_world(&persistence::serialize_world(&entities).unwrap()).unwrap();
    assert_eq!(parsed, entities);
}

// property 4: a slow consumer never stalls the publisher
#[tokio::test]
async fn publisher_is_not_blocked_by_slow_consumers() {
    let world = World::new();
    // a rate-limited subscriber that nobody ever pops
    let slow = Subscriber::new(SubscriberOptions { max_rate_hz: 0.001, ..Default::default() });
    world.bus().register(slow);

    let start = std::time::Instant::now();
    for i in 0..1000 {
        world.push(vec![Entity::new(format!("e{i}"))]).unwrap();
    }
    // coalescing + O(1) mark_dirty: three orders of magnitude under the
    // subscriber's pace
    assert!(start.elapsed() < Duration::from_secs(2), "push stalled: {:?}", start.elapsed());
}
