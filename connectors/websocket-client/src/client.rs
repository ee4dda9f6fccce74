use argus_proto::{
    ClientMessage, Entity, Filter, PushResponse, Request, RequestId, RequestPayload, ResponsePayload, RunTaskResponse,
    ServerMessage, StreamPayload, WatchBehavior, WireError,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection lost")]
    Disconnected,
    #[error("{0}")]
    Server(WireError),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

struct ClientInner {
    tx: mpsc::Sender<Message>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ResponsePayload>>>,
    streams: Mutex<HashMap<RequestId, mpsc::Sender<Result<StreamPayload, WireError>>>>,
}

/// Handle to one server connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    /// Connect to a server address such as `localhost:50051`,
    /// `ws://host:port` or `http://host:port`.
    pub async fn connect(server: &str) -> Result<Self, ClientError> {
        let url = normalize_url(server);
        debug!(%url, "connecting");
        let (socket, _) = connect_async(url.as_str()).await.map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut sink, mut source) = socket.split();

        let (tx, mut rx) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let inner = Arc::new(ClientInner { tx, pending: Mutex::new(HashMap::new()), streams: Mutex::new(HashMap::new()) });
        let reader = inner.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = source.next().await {
                let Message::Binary(data) = message else { continue };
                match bincode::deserialize::<ServerMessage>(&data) {
                    Ok(message) => dispatch(&reader, message).await,
                    Err(err) => warn!(%err, "undecodable server message"),
                }
            }
            // connection gone: fail every waiter
            reader.pending.lock().unwrap().clear();
            reader.streams.lock().unwrap().clear();
        });

        Ok(Self(inner))
    }

    async fn send(&self, request: Request) -> Result<(), ClientError> {
        let data = bincode::serialize(&ClientMessage::Request(request)).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.0.tx.send(Message::Binary(data.into())).await.map_err(|_| ClientError::Disconnected)
    }

    async fn request(&self, payload: RequestPayload) -> Result<ResponsePayload, ClientError> {
        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.0.pending.lock().unwrap().insert(id, tx);
        self.send(Request { id, payload }).await?;
        match rx.await.map_err(|_| ClientError::Disconnected)? {
            ResponsePayload::Error(err) => Err(ClientError::Server(err)),
            payload => Ok(payload),
        }
    }

    async fn stream(&self, payload: RequestPayload) -> Result<Subscription, ClientError> {
        let id = RequestId::new();
        let (item_tx, item_rx) = mpsc::channel(64);
        self.0.streams.lock().unwrap().insert(id, item_tx);
        let (tx, rx) = oneshot::channel();
        self.0.pending.lock().unwrap().insert(id, tx);
        self.send(Request { id, payload }).await?;
        match rx.await.map_err(|_| ClientError::Disconnected)? {
            ResponsePayload::StreamStarted => Ok(Subscription { id, rx: item_rx, client: self.clone() }),
            ResponsePayload::Error(err) => {
                self.0.streams.lock().unwrap().remove(&id);
                Err(ClientError::Server(err))
            }
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn list(&self, filter: Option<Filter>) -> Result<Vec<Entity>, ClientError> {
        match self.request(RequestPayload::ListEntities { filter }).await? {
            ResponsePayload::Entities(entities) => Ok(entities),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Entity, ClientError> {
        match self.request(RequestPayload::GetEntity { id: id.into() }).await? {
            ResponsePayload::Entity(entity) => Ok(entity),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn push(&self, changes: Vec<Entity>) -> Result<PushResponse, ClientError> {
        match self.request(RequestPayload::Push { changes }).await? {
            ResponsePayload::Push(response) => Ok(response),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn expire(&self, id: &str) -> Result<(), ClientError> {
        match self.request(RequestPayload::ExpireEntity { id: id.into() }).await? {
            ResponsePayload::Expired => Ok(()),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn local_node(&self) -> Result<Entity, ClientError> {
        match self.request(RequestPayload::GetLocalNode).await? {
            ResponsePayload::Entity(entity) => Ok(entity),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn move_timeline(&self, freeze: bool, at: DateTime<Utc>) -> Result<(), ClientError> {
        match self.request(RequestPayload::MoveTimeline { freeze, at }).await? {
            ResponsePayload::TimelineMoved => Ok(()),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn run_task(&self, task_id: &str) -> Result<RunTaskResponse, ClientError> {
        match self.request(RequestPayload::RunTask { task_id: task_id.into() }).await? {
            ResponsePayload::Task(response) => Ok(response),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    pub async fn watch(&self, filter: Option<Filter>, behavior: Option<WatchBehavior>) -> Result<Subscription, ClientError> {
        self.stream(RequestPayload::WatchEntities { filter, behavior }).await
    }

    pub async fn timeline(&self) -> Result<Subscription, ClientError> {
        self.stream(RequestPayload::GetTimeline).await
    }

    pub async fn reconcile(&self, controller: &str) -> Result<Subscription, ClientError> {
        self.stream(RequestPayload::Reconcile { controller: controller.into() }).await
    }
}

async fn dispatch(inner: &Arc<ClientInner>, message: ServerMessage) {
    match message {
        ServerMessage::Response(response) => {
            let waiter = inner.pending.lock().unwrap().remove(&response.request_id);
            if let Some(waiter) = waiter {
                let _ = waiter.send(response.payload);
            } else {
                debug!(id = %response.request_id, "response for unknown request");
            }
        }
        ServerMessage::StreamItem { request_id, item } => {
            let tx = inner.streams.lock().unwrap().get(&request_id).cloned();
            if let Some(tx) = tx {
                if tx.send(Ok(item)).await.is_err() {
                    inner.streams.lock().unwrap().remove(&request_id);
                }
            }
        }
        ServerMessage::StreamEnd { request_id, error } => {
            let tx = inner.streams.lock().unwrap().remove(&request_id);
            if let (Some(tx), Some(error)) = (tx, error) {
                let _ = tx.send(Err(error)).await;
            }
        }
    }
}

/// One live stream. Dropping it without `cancel` leaves the server side
/// running until the connection closes.
pub struct Subscription {
    id: RequestId,
    rx: mpsc::Receiver<Result<StreamPayload, WireError>>,
    client: Client,
}

impl Subscription {
    pub fn id(&self) -> RequestId { self.id }

    /// Next stream item; None when the stream ended cleanly or the
    /// connection dropped.
    pub async fn next(&mut self) -> Option<Result<StreamPayload, WireError>> { self.rx.recv().await }

    /// Ask the server to stop this stream.
    pub async fn cancel(self) -> Result<(), ClientError> {
        self.client.0.streams.lock().unwrap().remove(&self.id);
        match self.client.request(RequestPayload::CancelStream { of: self.id }).await? {
            ResponsePayload::Canceled => Ok(()),
            other => Err(ClientError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }
}

fn normalize_url(server: &str) -> String {
    match server {
        s if s.starts_with("ws://") || s.starts_with("wss://") => format!("{s}/ws"),
        s if s.starts_with("http://") => format!("ws://{}/ws", &s[7..]),
        s if s.starts_with("https://") => format!("wss://{}/ws", &s[8..]),
        s => format!("ws://{s}/ws"),
    }
}
