use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current timeline position plus the observed bounds of the event store.
/// `min`/`max` are the store's observed time bounds (epoch zero when the
/// store is empty). While `frozen`, the effective current instant is `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineState {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    pub frozen: bool,
    pub at: DateTime<Utc>,
}
