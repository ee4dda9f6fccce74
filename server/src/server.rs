use crate::{sender::ClientSender, session::Session};
use argus_core::{PolicyContext, World};
use argus_proto as proto;
use anyhow::Result;
use axum::extract::{connect_info::ConnectInfo, State};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use axum_extra::{headers, TypedHeader};
use bincode::deserialize;
use futures_util::StreamExt;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{debug, info, warn, Level};

/// Deployment toggles that are accepted on the daemon command line and
/// surfaced to protocol adapters. The engine itself does not consume them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    pub allow_local_serial: bool,
    pub skip_defaults: bool,
}

pub struct WebsocketServer {
    world: World,
    options: ServerOptions,
}

impl WebsocketServer {
    pub fn new(world: World, options: ServerOptions) -> Self { Self { world, options } }

    pub async fn run(&self, bind_address: &str) -> Result<()> {
        info!(options = ?self.options, "server options");
        let app = Router::new().route("/ws", get(ws_handler)).with_state(self.world.clone()).layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .into_inner(),
        );

        let listener = tokio::net::TcpListener::bind(bind_address).await?;
        info!("listening on {}", listener.local_addr()?);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

        Ok(())
    }

    /// Bind on an ephemeral port and serve in the background. Returns the
    /// bound address; used by tests and embedding callers.
    pub async fn spawn(&self, bind_address: &str) -> Result<SocketAddr> {
        let app = Router::new().route("/ws", get(ws_handler)).with_state(self.world.clone());
        let listener = tokio::net::TcpListener::bind(bind_address).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
                warn!(%err, "server exited");
            }
        });
        Ok(addr)
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(world): State<World>,
) -> impl IntoResponse {
    let user_agent = if let Some(TypedHeader(user_agent)) = user_agent { user_agent.to_string() } else { String::from("unknown") };
    debug!(%addr, %user_agent, "upgrading connection");
    ws.on_upgrade(move |socket| handle_socket(socket, addr, world))
}

async fn handle_socket(socket: WebSocket, who: SocketAddr, world: World) {
    info!(%who, "client connected");

    let (sink, mut receiver) = socket.split();
    let sender = ClientSender::new(sink);
    let mut session = Session::new(world, sender, PolicyContext { peer: Some(who.to_string()) });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => {
                debug!(%who, "client abruptly disconnected");
                break;
            }
        };
        match msg {
            Message::Binary(data) => match deserialize::<proto::ClientMessage>(&data) {
                Ok(proto::ClientMessage::Request(request)) => session.handle(request).await,
                Err(err) => warn!(%who, %err, "undecodable client message"),
            },
            Message::Close(_) => break,
            // pings are answered by axum itself
            _ => {}
        }
    }

    session.shutdown();
    info!(%who, "client disconnected");
}
