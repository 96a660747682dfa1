use std::sync::Arc;

use clap::{Parser, Subcommand};
use node_map::{DistributedHashtable, GrpcCoordinator, Options};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nodemap", about = "Read and edit a node-map document", version)]
struct Cli {
    /// Coordination server address.
    #[arg(long, env = "NODEMAP_ADDR", default_value = "127.0.0.1:50051")]
    addr: String,

    /// Node holding the document.
    #[arg(long, env = "NODEMAP_PATH", default_value = "/node-map")]
    path: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the value stored under a key.
    Get { key: String },
    /// Store a string value under a key.
    Set { key: String, value: String },
    /// Remove a key.
    Delete { key: String },
    /// Merge a JSON object into the document.
    Merge { json: String },
    /// Print the whole document.
    Dump,
    /// Print the document every time it changes, until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let zk = GrpcCoordinator::connect(cli.addr.as_str()).await?;
    let map = DistributedHashtable::new(Arc::new(zk), cli.path, Options::default()).await?;

    match cli.command {
        Command::Get { key } => match node_map_cli::get(&map, &key).await? {
            Some(value) => println!("{}", value),
            None => {
                eprintln!("{}: not set", key);
                std::process::exit(1);
            }
        },
        Command::Set { key, value } => {
            node_map_cli::set(&map, &key, &value).await?;
        }
        Command::Delete { key } => {
            if node_map_cli::delete(&map, &key).await?.is_none() {
                eprintln!("{}: not set", key);
            }
        }
        Command::Merge { json } => {
            let merged = node_map_cli::merge(&map, &json).await?;
            println!("{}", serde_json::to_string_pretty(&merged)?);
        }
        Command::Dump => println!("{}", node_map_cli::dump(&map).await?),
        Command::Watch => {
            map.try_read().await?;
            let snapshot = map.clone();
            map.on_change(move || {
                let text = serde_json::to_string_pretty(&snapshot.to_map())?;
                println!("{}", text);
                Ok(())
            });
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}
