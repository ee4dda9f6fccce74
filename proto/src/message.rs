use crate::{
    change::EntityChange,
    entity::{Entity, Priority},
    filter::Filter,
    timeline::TimelineState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Correlates requests with responses and stream items on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct RequestId(Ulid);

impl RequestId {
    pub fn new() -> Self { Self(Ulid::new()) }

    /// To be used only for testing
    pub fn test(id: u64) -> Self { Self(Ulid::from_parts(id, 0)) }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "R-{}", self.0) }
}

/// Per-subscription delivery behavior for WatchEntities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatchBehavior {
    /// Maximum non-Flash emit rate in Hz. 0 means unlimited.
    pub max_rate_hz: f64,
    /// Changes below this priority are discarded at enqueue time.
    pub min_priority: Priority,
    /// Keepalive interval. 0 means off; values below 1000 clamp to 1000.
    pub keepalive_interval_ms: u64,
}

impl Default for WatchBehavior {
    fn default() -> Self { Self { max_rate_hz: 0.0, min_priority: Priority::Unspecified, keepalive_interval_ms: 0 } }
}

/// Error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    PermissionDenied,
    Canceled,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self { Self { kind, message: message.into() } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Invalid,
    Pending,
    Running,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTaskResponse {
    pub execution_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: bool,
    pub debug: Option<String>,
}

/// Reconciliation stream event types (§ config/device pairing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    New,
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileEvent {
    pub action: ReconcileAction,
    pub config: Entity,
    pub device: Entity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Request(Request),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestPayload {
    ListEntities { filter: Option<Filter> },
    GetEntity { id: String },
    Push { changes: Vec<Entity> },
    ExpireEntity { id: String },
    WatchEntities { filter: Option<Filter>, behavior: Option<WatchBehavior> },
    GetLocalNode,
    GetTimeline,
    MoveTimeline { freeze: bool, at: DateTime<Utc> },
    Reconcile { controller: String },
    RunTask { task_id: String },
    /// Stop a previously started stream identified by its request id.
    CancelStream { of: RequestId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Response(Response),
    /// One item of a watch / timeline / reconcile stream.
    StreamItem { request_id: RequestId, item: StreamPayload },
    /// Stream terminated; error is absent on clean cancellation.
    StreamEnd { request_id: RequestId, error: Option<WireError> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Entities(Vec<Entity>),
    Entity(Entity),
    Push(PushResponse),
    Expired,
    TimelineMoved,
    Task(RunTaskResponse),
    /// Acknowledges that a stream request is live; items follow separately.
    StreamStarted,
    Canceled,
    Error(WireError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamPayload {
    Change(EntityChange),
    Timeline(TimelineState),
    Reconcile(ReconcileEvent),
}
