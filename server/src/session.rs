use crate::sender::ClientSender;
use argus_core::{run_reconcile, run_watch, PolicyContext, Subscriber, SubscriberOptions, World, WorldError};
use argus_proto as proto;
use argus_proto::{ErrorKind, RequestPayload, ResponsePayload, RunTaskResponse, TaskStatus, WireError};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One connected client: dispatches unary requests inline and tracks the
/// cancellation token of every live stream it spawned.
pub struct Session {
    world: World,
    sender: ClientSender,
    context: PolicyContext,
    streams: HashMap<proto::RequestId, CancellationToken>,
}

impl Session {
    pub fn new(world: World, sender: ClientSender, context: PolicyContext) -> Self {
        Self { world, sender, context, streams: HashMap::new() }
    }

    /// Ends every stream this session started. Called on disconnect.
    pub fn shutdown(&mut self) {
        for (_, cancel) in self.streams.drain() {
            cancel.cancel();
        }
    }

    pub async fn handle(&mut self, request: proto::Request) {
        debug!(id = %request.id, "request");
        let payload = match request.payload {
            RequestPayload::ListEntities { filter } => self.list(filter),
            RequestPayload::GetEntity { id } => self.get(&id),
            RequestPayload::Push { changes } => self.push(changes),
            RequestPayload::ExpireEntity { id } => self.expire(&id),
            RequestPayload::GetLocalNode => self.local_node(),
            RequestPayload::MoveTimeline { freeze, at } => self.move_timeline(freeze, at),
            RequestPayload::RunTask { task_id } => Self::run_task(&task_id),
            RequestPayload::WatchEntities { filter, behavior } => self.start_watch(request.id, filter, behavior),
            RequestPayload::GetTimeline => self.start_timeline(request.id),
            RequestPayload::Reconcile { controller } => self.start_reconcile(request.id, controller),
            RequestPayload::CancelStream { of } => self.cancel_stream(of),
        };
        let _ = self.sender.send(proto::ServerMessage::Response(proto::Response { request_id: request.id, payload })).await;
    }

    fn list(&self, filter: Option<proto::Filter>) -> ResponsePayload {
        let entities = self
            .world
            .list(filter.as_ref())
            .into_iter()
            .filter(|e| self.world.policy().can_read_entity(&self.context, e).is_allowed())
            .collect();
        ResponsePayload::Entities(entities)
    }

    fn get(&self, id: &str) -> ResponsePayload {
        match self.world.get(id) {
            Ok(entity) => {
                if self.world.policy().can_read_entity(&self.context, &entity).is_allowed() {
                    ResponsePayload::Entity(entity)
                } else {
                    error(&WorldError::PermissionDenied)
                }
            }
            Err(err) => error(&err),
        }
    }

    fn push(&self, changes: Vec<proto::Entity>) -> ResponsePayload {
        for change in &changes {
            if !self.world.policy().can_push_entity(&self.context, change).is_allowed() {
                return error(&WorldError::PermissionDenied);
            }
        }
        match self.world.push(changes) {
            Ok(()) => ResponsePayload::Push(proto::PushResponse { accepted: true, debug: None }),
            Err(err) => error(&err),
        }
    }

    fn expire(&self, id: &str) -> ResponsePayload {
        if !self.world.policy().can_expire_entity(&self.context, id).is_allowed() {
            return error(&WorldError::PermissionDenied);
        }
        match self.world.expire(id) {
            Ok(()) => ResponsePayload::Expired,
            Err(err) => error(&err),
        }
    }

    fn local_node(&self) -> ResponsePayload {
        match self.world.local_node() {
            Ok(entity) => ResponsePayload::Entity(entity),
            Err(err) => error(&err),
        }
    }

    fn move_timeline(&self, freeze: bool, at: chrono::DateTime<chrono::Utc>) -> ResponsePayload {
        if !self.world.policy().can_move_timeline(&self.context).is_allowed() {
            return error(&WorldError::PermissionDenied);
        }
        self.world.move_timeline(freeze, at);
        ResponsePayload::TimelineMoved
    }

    fn run_task(task_id: &str) -> ResponsePayload {
        // task execution is not wired up yet; the call shape is stable
        debug!(task_id, "run_task stub");
        ResponsePayload::Task(RunTaskResponse { execution_id: String::new(), status: TaskStatus::Invalid })
    }

    fn start_watch(
        &mut self,
        request_id: proto::RequestId,
        filter: Option<proto::Filter>,
        behavior: Option<proto::WatchBehavior>,
    ) -> ResponsePayload {
        if !self.world.policy().can_watch(&self.context, filter.as_ref()).is_allowed() {
            return error(&WorldError::PermissionDenied);
        }
        let subscriber = Subscriber::new(SubscriberOptions::from(behavior.unwrap_or_default()));
        self.world.bus().register(subscriber.clone());

        let cancel = CancellationToken::new();
        self.streams.insert(request_id, cancel.clone());
        let sink = self.sender.stream(request_id);
        let world = self.world.clone();
        let context = self.context.clone();
        tokio::spawn(async move {
            let result = run_watch(world.clone(), subscriber.clone(), filter, context, sink.clone(), cancel).await;
            world.bus().unregister(subscriber.id());
            sink.end(result.err().map(|e| WireError::new(ErrorKind::Internal, e.to_string()))).await;
        });
        ResponsePayload::StreamStarted
    }

    fn start_timeline(&mut self, request_id: proto::RequestId) -> ResponsePayload {
        let cancel = CancellationToken::new();
        self.streams.insert(request_id, cancel.clone());
        let sink = self.sender.stream(request_id);
        let world = self.world.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        sink.end(None).await;
                        return;
                    }
                    _ = tick.tick() => {
                        let state = world.timeline_state();
                        if last != Some(state) {
                            if sink.timeline(state).await.is_err() {
                                return;
                            }
                            last = Some(state);
                        }
                    }
                }
            }
        });
        ResponsePayload::StreamStarted
    }

    fn start_reconcile(&mut self, request_id: proto::RequestId, controller: String) -> ResponsePayload {
        let cancel = CancellationToken::new();
        self.streams.insert(request_id, cancel.clone());
        let sink = self.sender.stream(request_id);
        let world = self.world.clone();
        tokio::spawn(async move {
            let result = run_reconcile(world, controller, sink.clone(), cancel).await;
            sink.end(result.err().map(|e| WireError::new(ErrorKind::Internal, e.to_string()))).await;
        });
        ResponsePayload::StreamStarted
    }

    fn cancel_stream(&mut self, of: proto::RequestId) -> ResponsePayload {
        match self.streams.remove(&of) {
            Some(cancel) => {
                cancel.cancel();
                ResponsePayload::Canceled
            }
            None => error(&WorldError::NotFound(format!("stream {of}"))),
        }
    }
}

fn error(err: &WorldError) -> ResponsePayload { ResponsePayload::Error(err.into()) }
