use crate::entity::Entity;
use serde::{Deserialize, Serialize};

/// What happened to an entity, as seen by a subscriber.
///
/// `Unobserved` is the invalid sentinel: it is queued for ids whose state
/// is not yet known and emitted once at the head of every watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    #[default]
    Unobserved = 0,
    Updated = 1,
    Expired = 2,
}

/// One item of a watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity: Entity,
    pub kind: ChangeKind,
}

impl EntityChange {
    /// The stream-head sentinel: an empty entity with the invalid kind.
    pub fn sentinel() -> Self { Self { entity: Entity::default(), kind: ChangeKind::Unobserved } }
}
