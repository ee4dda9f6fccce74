use argus_core::SendError;
use argus_proto as proto;
use argus_proto::{EntityChange, ReconcileEvent, RequestId, StreamPayload};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use tokio::sync::mpsc;
use tracing::debug;

// writer side of one websocket connection: everything the session and its
// stream tasks emit funnels through a single mpsc into the socket
#[derive(Clone)]
pub struct ClientSender {
    tx: mpsc::Sender<proto::ServerMessage>,
}

impl ClientSender {
    pub fn new(mut sink: SplitSink<WebSocket, Message>) -> Self {
        let (tx, mut rx) = mpsc::channel::<proto::ServerMessage>(64);
        use futures_util::SinkExt;
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let data = match bincode::serialize(&message) {
                    Ok(data) => data,
                    Err(err) => {
                        debug!(%err, "dropping unserializable server message");
                        continue;
                    }
                };
                if sink.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });
        Self { tx }
    }

    pub async fn send(&self, message: proto::ServerMessage) -> Result<(), SendError> {
        self.tx.send(message).await.map_err(|_| SendError::Closed)
    }

    /// A sink that tags every item with its stream's request id.
    pub fn stream(&self, request_id: RequestId) -> StreamSender {
        StreamSender { sender: self.clone(), request_id }
    }
}

#[derive(Clone)]
pub struct StreamSender {
    sender: ClientSender,
    request_id: RequestId,
}

impl StreamSender {
    async fn item(&self, item: StreamPayload) -> Result<(), SendError> {
        self.sender.send(proto::ServerMessage::StreamItem { request_id: self.request_id, item }).await
    }

    pub async fn end(&self, error: Option<proto::WireError>) {
        let _ = self.sender.send(proto::ServerMessage::StreamEnd { request_id: self.request_id, error }).await;
    }

    pub async fn timeline(&self, state: proto::TimelineState) -> Result<(), SendError> {
        self.item(StreamPayload::Timeline(state)).await
    }
}

#[async_trait]
impl argus_core::WatchSink for StreamSender {
    async fn send(&mut self, change: EntityChange) -> Result<(), SendError> {
        self.item(StreamPayload::Change(change)).await
    }
}

#[async_trait]
impl argus_core::ReconcileSink for StreamSender {
    async fn send(&mut self, event: ReconcileEvent) -> Result<(), SendError> {
        self.item(StreamPayload::Reconcile(event)).await
    }
}
