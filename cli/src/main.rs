//! Operator CLI for the Argus world engine. Every command talks to a
//! running `argusd` over its WebSocket RPC surface.

use anyhow::{bail, Context, Result};
use argus_core::persistence;
use argus_proto::{
    Entity, Filter, GeoFilter, Geometry, Position, Priority, ReconcileAction, StreamPayload, WatchBehavior,
};
use argus_websocket_client::Client;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "argus", version, about)]
struct Cli {
    /// Server address, e.g. localhost:50051 or ws://host:port
    #[arg(long, global = true, default_value = "localhost:50051", env = "ARGUS_SERVER")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List entities, optionally narrowed by a filter document
    List {
        /// Filter as YAML/JSON, e.g. '{label: tank}'
        #[arg(long)]
        query: Option<String>,
    },
    /// Print one entity
    Get { id: String },
    /// Push entities from a YAML file (single document or `---` stream);
    /// omit the file or pass `-` for stdin
    Put { file: Option<PathBuf> },
    /// Round-trip one entity through $EDITOR and push the result
    Edit { id: String },
    /// Expire one entity
    Remove { id: String },
    /// Expire every entity except the local node identity
    Clear,
    /// Print the device hierarchy by parent link
    DeviceTree,
    /// Follow config/device pairings for one controller
    Reconcile { controller: String },
    /// Follow entity changes and print each one
    Watch {
        /// Filter as YAML/JSON
        #[arg(long)]
        query: Option<String>,
        /// Maximum emit rate in Hz, 0 = unlimited
        #[arg(long, default_value_t = 0.0)]
        rate: f64,
        /// Drop changes below this priority (unspecified|routine|immediate|flash)
        #[arg(long, default_value = "unspecified")]
        min_priority: String,
        /// Keepalive interval in ms, 0 = off
        #[arg(long, default_value_t = 0)]
        keepalive_ms: u64,
    },
    /// Watch entities inside a polygon given as lon,lat vertices
    Observe { vertices: Vec<String> },
    /// Print the local node identity
    NodeInfo,
    /// Inspect or move the timeline
    Timeline {
        #[command(subcommand)]
        action: TimelineAction,
    },
}

#[derive(Subcommand, Debug)]
enum TimelineAction {
    /// Print the current timeline state
    Show,
    /// Freeze the world at an RFC3339 instant
    Freeze { at: String },
    /// Return to wall-clock
    Thaw,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let cli = Cli::parse();
    let client = Client::connect(&cli.server).await.with_context(|| format!("connecting to {}", cli.server))?;

    match cli.command {
        Command::List { query } => {
            let filter = parse_filter(query.as_deref())?;
            for entity in client.list(filter).await? {
                println!("---");
                print!("{}", persistence::entity_to_yaml(&entity)?);
            }
        }
        Command::Get { id } => {
            let entity = client.get(&id).await?;
            print!("{}", persistence::entity_to_yaml(&entity)?);
        }
        Command::Put { file } => {
            let input = read_input(file.as_deref())?;
            let entities = persistence::parse_world(&input)?;
            if entities.is_empty() {
                bail!("no entities in input");
            }
            let count = entities.len();
            client.push(entities).await?;
            println!("pushed {count} entities");
        }
        Command::Edit { id } => {
            let entity = client.get(&id).await?;
            let edited = edit_in_editor(&persistence::entity_to_yaml(&entity)?)?;
            let entities = persistence::parse_world(&edited)?;
            if entities.is_empty() {
                bail!("edited document is empty");
            }
            client.push(entities).await?;
            println!("updated {id}");
        }
        Command::Remove { id } => {
            client.expire(&id).await?;
            println!("expired {id}");
        }
        Command::Clear => {
            let node_id = client.local_node().await.map(|n| n.id).ok();
            let mut count = 0usize;
            for entity in client.list(None).await? {
                if Some(&entity.id) == node_id.as_ref() {
                    continue;
                }
                client.expire(&entity.id).await?;
                count += 1;
            }
            println!("expired {count} entities");
        }
        Command::DeviceTree => {
            device_tree(&client).await?;
        }
        Command::Reconcile { controller } => {
            let mut stream = client.reconcile(&controller).await?;
            while let Some(event) = stream.next().await {
                let event = event.map_err(anyhow::Error::from)?;
                let StreamPayload::Reconcile(event) = event else { continue };
                let tag = match event.action {
                    ReconcileAction::New => "new",
                    ReconcileAction::Changed => "changed",
                    ReconcileAction::Removed => "removed",
                };
                println!("{tag}\t{}\t{}", event.config.id, event.device.id);
            }
        }
        Command::Watch { query, rate, min_priority, keepalive_ms } => {
            let filter = parse_filter(query.as_deref())?;
            let behavior = WatchBehavior {
                max_rate_hz: rate,
                min_priority: parse_priority(&min_priority)?,
                keepalive_interval_ms: keepalive_ms,
            };
            watch(&client, filter, behavior).await?;
        }
        Command::Observe { vertices } => {
            if vertices.len() < 3 {
                bail!("need at least three lon,lat vertices");
            }
            let exterior = vertices.iter().map(|v| parse_vertex(v)).collect::<Result<Vec<_>>>()?;
            let filter = Filter {
                geo: Some(GeoFilter { geometry: Some(Geometry::Polygon { exterior, holes: vec![] }), entity_id: None }),
                ..Default::default()
            };
            watch(&client, Some(filter), WatchBehavior::default()).await?;
        }
        Command::NodeInfo => {
            let node = client.local_node().await?;
            print!("{}", persistence::entity_to_yaml(&node)?);
        }
        Command::Timeline { action } => match action {
            TimelineAction::Show => {
                let mut stream = client.timeline().await?;
                if let Some(Ok(StreamPayload::Timeline(state))) = stream.next().await {
                    println!("min:    {}", state.min);
                    println!("max:    {}", state.max);
                    println!("frozen: {}", state.frozen);
                    println!("at:     {}", state.at);
                }
                stream.cancel().await?;
            }
            TimelineAction::Freeze { at } => {
                let at: DateTime<Utc> = at.parse().context("expected an RFC3339 instant")?;
                client.move_timeline(true, at).await?;
                println!("frozen at {at}");
            }
            TimelineAction::Thaw => {
                client.move_timeline(false, Utc::now()).await?;
                println!("thawed");
            }
        },
    }
    Ok(())
}

async fn watch(client: &Client, filter: Option<Filter>, behavior: WatchBehavior) -> Result<()> {
    let mut stream = client.watch(filter, Some(behavior)).await?;
    while let Some(item) = stream.next().await {
        let item = item.map_err(anyhow::Error::from)?;
        let StreamPayload::Change(change) = item else { continue };
        println!("--- # {:?}", change.kind);
        print!("{}", persistence::entity_to_yaml(&change.entity)?);
    }
    Ok(())
}

async fn device_tree(client: &Client) -> Result<()> {
    let devices: Vec<Entity> = client
        .list(Some(Filter { components: vec![argus_proto::fieldnum::DEVICE], ..Default::default() }))
        .await?;
    let ids: std::collections::HashSet<&str> = devices.iter().map(|e| e.id.as_str()).collect();

    fn print_subtree(devices: &[Entity], parent: Option<&str>, depth: usize) {
        for entity in devices {
            let entity_parent = entity.device.as_ref().and_then(|d| d.parent.as_deref());
            if entity_parent != parent {
                continue;
            }
            let label = entity.label.as_deref().unwrap_or("-");
            println!("{}{}  ({})", "  ".repeat(depth), entity.id, label);
            print_subtree(devices, Some(&entity.id), depth + 1);
        }
    }

    // roots: no parent, or a parent that is not itself a listed device
    for entity in &devices {
        let parent = entity.device.as_ref().and_then(|d| d.parent.as_deref());
        if parent.is_none() || !ids.contains(parent.unwrap()) {
            let label = entity.label.as_deref().unwrap_or("-");
            println!("{}  ({})", entity.id, label);
            print_subtree(&devices, Some(&entity.id), 1);
        }
    }
    Ok(())
}

fn parse_filter(query: Option<&str>) -> Result<Option<Filter>> {
    match query {
        Some(query) => Ok(Some(serde_yaml::from_str(query).context("invalid filter document")?)),
        None => Ok(None),
    }
}

fn parse_priority(input: &str) -> Result<Priority> {
    Ok(match input.to_ascii_lowercase().as_str() {
        "unspecified" => Priority::Unspecified,
        "routine" => Priority::Routine,
        "immediate" => Priority::Immediate,
        "flash" => Priority::Flash,
        other => bail!("unknown priority: {other}"),
    })
}

fn parse_vertex(input: &str) -> Result<Position> {
    let (lon, lat) = input.split_once(',').with_context(|| format!("expected lon,lat: {input}"))?;
    Ok(Position::new(lon.trim().parse().context("bad longitude")?, lat.trim().parse().context("bad latitude")?))
}

fn read_input(file: Option<&std::path::Path>) -> Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        _ => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input).context("reading stdin")?;
            Ok(input)
        }
    }
}

fn edit_in_editor(original: &str) -> Result<String> {
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    std::fs::write(file.path(), original)?;
    let status = std::process::Command::new(&editor).arg(file.path()).status().with_context(|| format!("launching {editor}"))?;
    if !status.success() {
        bail!("{editor} exited with {status}");
    }
    Ok(std::fs::read_to_string(file.path())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_parsing() {
        assert_eq!(parse_vertex("11.5,48.1").unwrap(), Position::new(11.5, 48.1));
        assert!(parse_vertex("11.5").is_err());
    }

    #[test]
    fn priority_parsing() {
        assert_eq!(parse_priority("flash").unwrap(), Priority::Flash);
        assert!(parse_priority("urgent").is_err());
    }

    #[test]
    fn filter_accepts_yaml_and_json() {
        let f = parse_filter(Some("{label: tank}")).unwrap().unwrap();
        assert_eq!(f.label.as_deref(), Some("tank"));
        let f = parse_filter(Some(r#"{"controller_id": "radar"}"#)).unwrap().unwrap();
        assert_eq!(f.controller_id.as_deref(), Some("radar"));
    }
}
