use anyhow::Result;
use argus_core::{persistence, World};
use argus_server::{ServerOptions, WebsocketServer};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// The Argus world engine daemon.
#[derive(Parser, Debug)]
#[command(name = "argusd", version, about)]
struct Args {
    /// Port to serve the RPC surface on.
    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// World file to load on start and flush periodically.
    #[arg(long)]
    world_file: Option<PathBuf>,

    /// Policy file (reserved; evaluation is delegated to the policy hook).
    #[arg(long)]
    policy_file: Option<PathBuf>,

    /// Open a browser against the server after startup.
    #[arg(long)]
    open_browser: bool,

    /// Allow protocol adapters to claim local serial devices.
    #[arg(long)]
    allow_local_serial: bool,

    /// Skip seeding adapter default entities.
    #[arg(long)]
    skip_defaults: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();
    let args = Args::parse();

    let world = World::new();
    if let Some(path) = &args.world_file {
        let count = persistence::load_world(&world, path)?;
        info!(count, path = %path.display(), "world file loaded");
    }
    let node = world.init_node_identity()?;
    info!(node = %node.id, "node identity ready");

    if let Some(path) = &args.policy_file {
        warn!(path = %path.display(), "policy file given but policy evaluation is delegated; running permissive");
    }

    let cancel = CancellationToken::new();
    world.spawn_gc(Duration::from_secs(1), cancel.clone());
    if let Some(path) = &args.world_file {
        persistence::spawn_flusher(world.clone(), path.clone(), persistence::FLUSH_INTERVAL, cancel.clone());
    }

    if args.open_browser {
        let url = format!("http://localhost:{}", args.port);
        if let Err(err) = std::process::Command::new("xdg-open").arg(&url).spawn() {
            warn!(%err, %url, "could not open browser");
        }
    }

    let options = ServerOptions { allow_local_serial: args.allow_local_serial, skip_defaults: args.skip_defaults };
    let server = WebsocketServer::new(world.clone(), options);
    let bind = format!("0.0.0.0:{}", args.port);

    tokio::select! {
        result = server.run(&bind) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            cancel.cancel();
            if let Some(path) = &args.world_file {
                if let Err(err) = persistence::flush_world(&world, path) {
                    warn!(%err, "final world flush failed");
                }
            }
        }
    }
    Ok(())
}
