//! The world file: a human-readable multi-document YAML rendering of the
//! persistable slice of head. Documents are separated by a line containing
//! exactly `---`; empty documents are skipped on load.

use crate::{error::PersistenceError, world::World};
use argus_proto::Entity;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Only entities that are not controller-produced and not already expiring
/// are written out.
pub fn is_persistable(entity: &Entity) -> bool {
    entity.controller_id().is_none() && entity.lifetime.as_ref().and_then(|l| l.until).is_none()
}

/// Parse a multi-document world file into entities, in document order.
pub fn parse_world(input: &str) -> Result<Vec<Entity>, PersistenceError> {
    let mut entities = Vec::new();
    for (index, document) in split_documents(input).into_iter().enumerate() {
        if document.trim().is_empty() {
            continue;
        }
        let entity: Entity = serde_yaml::from_str(&document).map_err(|source| PersistenceError::Parse { index, source })?;
        entities.push(entity);
    }
    Ok(entities)
}

/// Split on separator lines by hand. This keeps the format independent of
/// the YAML library's multi-document quirks: a document boundary is a line
/// containing exactly `---`, nothing else.
fn split_documents(input: &str) -> Vec<String> {
    let mut documents = vec![String::new()];
    for line in input.lines() {
        if line == "---" {
            documents.push(String::new());
        } else {
            let document = documents.last_mut().unwrap();
            document.push_str(line);
            document.push('\n');
        }
    }
    documents
}

/// One entity in canonical field order, with absent components elided.
/// Shared by the world file writer and human-facing tooling.
pub fn entity_to_yaml(entity: &Entity) -> Result<String, PersistenceError> {
    let value = serde_yaml::to_value(entity).map_err(PersistenceError::Serialize)?;
    let compact = strip_absent(value).unwrap_or(serde_yaml::Value::Mapping(Default::default()));
    serde_yaml::to_string(&compact).map_err(PersistenceError::Serialize)
}

/// Serialize the persistable subset, id-sorted, in canonical field order.
pub fn serialize_world(entities: &[Entity]) -> Result<String, PersistenceError> {
    let mut persistable: Vec<&Entity> = entities.iter().filter(|e| is_persistable(e)).collect();
    persistable.sort_by(|a, b| a.id.cmp(&b.id));

    let mut out = String::new();
    for entity in persistable {
        out.push_str("---\n");
        out.push_str(&entity_to_yaml(entity)?);
    }
    Ok(out)
}

/// Drop null values and component mappings that emptied out, recursively.
/// Sequence elements are cleaned but never removed, so list lengths are
/// stable across a round trip.
fn strip_absent(value: serde_yaml::Value) -> Option<serde_yaml::Value> {
    match value {
        serde_yaml::Value::Null => None,
        serde_yaml::Value::Mapping(mapping) => {
            let cleaned: serde_yaml::Mapping =
                mapping.into_iter().filter_map(|(key, value)| strip_absent(value).map(|v| (key, v))).collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(serde_yaml::Value::Mapping(cleaned))
            }
        }
        serde_yaml::Value::Sequence(sequence) => Some(serde_yaml::Value::Sequence(
            sequence.into_iter().map(|v| strip_absent(v).unwrap_or(serde_yaml::Value::Mapping(Default::default()))).collect(),
        )),
        other => Some(other),
    }
}

/// Load the world file into head. A missing file is not an error; an empty
/// file is a no-op.
pub fn load_world(world: &World, path: &Path) -> Result<usize, PersistenceError> {
    let input = match std::fs::read_to_string(path) {
        Ok(input) => input,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let entities = parse_world(&input)?;
    let count = entities.len();
    world.push(entities)?;
    info!(count, path = %path.display(), "loaded world file");
    Ok(count)
}

/// Write the persistable slice of head atomically: temp file in the same
/// directory, then rename over the target.
pub fn flush_world(world: &World, path: &Path) -> Result<(), PersistenceError> {
    let serialized = serialize_world(&world.list(None))?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(serialized.as_bytes())?;
    tmp.persist(path).map_err(|e| PersistenceError::Io(e.error))?;
    Ok(())
}

/// Flush on a fixed cadence until cancelled. Failures are logged; the next
/// tick retries.
pub fn spawn_flusher(world: World, path: std::path::PathBuf, period: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = flush_world(&world, &path) {
                        warn!(%err, path = %path.display(), "world flush failed");
                    }
                }
            }
        }
    });
}
