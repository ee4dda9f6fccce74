use crate::{
    error::SendError,
    filter,
    policy::PolicyContext,
    subscriber::Subscriber,
    world::World,
};
use argus_proto::{ChangeKind, Entity, EntityChange, Filter, Priority};
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where a watch stream writes. A write error terminates that one stream.
#[async_trait]
pub trait WatchSink: Send {
    async fn send(&mut self, change: EntityChange) -> Result<(), SendError>;
}

/// Blanket impl so tests and in-process consumers can watch into a channel.
#[async_trait]
impl WatchSink for tokio::sync::mpsc::Sender<EntityChange> {
    async fn send(&mut self, change: EntityChange) -> Result<(), SendError> {
        tokio::sync::mpsc::Sender::send(self, change).await.map_err(|_| SendError::Closed)
    }
}

/// Drive one subscriber: emit the sentinel and the current filtered head,
/// then pop work, re-read head, apply policy and filter, pace non-Flash
/// items on the rate ticker, and write to the sink until cancelled or the
/// sink fails.
///
/// The subscriber must already be registered on the world's bus; the
/// caller unregisters it when this returns.
pub async fn run_watch<S: WatchSink>(
    world: World,
    subscriber: Subscriber,
    watch_filter: Option<Filter>,
    context: PolicyContext,
    mut sink: S,
    cancel: CancellationToken,
) -> Result<(), SendError> {
    // invalid-change sentinel first: flushes downstream buffers
    sink.send(EntityChange::sentinel()).await?;
    for entity in world.list(watch_filter.as_ref()) {
        if !world.policy().can_read_entity(&context, &entity).is_allowed() {
            continue;
        }
        sink.send(EntityChange { entity, kind: ChangeKind::Updated }).await?;
    }

    let mut rate = subscriber.options().rate_interval().map(|period| {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick
    });
    let mut keepalive = subscriber.options().keepalive.map(|period| {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick
    });

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let Some(item) = subscriber.pop_next() else {
            // queue is empty: block on the signal, the keepalive tick
            // (which reseeds the queue from head), or cancellation
            match keepalive {
                Some(ref mut tick) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = subscriber.notified() => {}
                        _ = tick.tick() => world.requeue_all(&subscriber),
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = subscriber.notified() => {}
                    }
                }
            }
            continue;
        };

        // re-read head: the queue only carries ids
        let entity = match world.get_head(&item.id) {
            Some(entity) => entity,
            None if item.kind == ChangeKind::Expired => item.snapshot.unwrap_or_else(|| Entity::new(item.id.clone())),
            None => {
                // revived-and-deleted in between; nothing to report
                continue;
            }
        };

        if !world.policy().can_read_entity(&context, &entity).is_allowed() {
            continue;
        }

        // Flash is urgent: it bypasses both the filter and the limiter
        if item.priority != Priority::Flash {
            if !filter::matches(watch_filter.as_ref(), &entity) {
                continue;
            }
            if let Some(ref mut tick) = rate {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tick.tick() => {}
                }
            }
        }

        debug!(id = %item.id, kind = ?item.kind, priority = ?item.priority, "watch emit");
        sink.send(EntityChange { entity, kind: item.kind }).await?;
    }
}
