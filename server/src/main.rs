use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use coord_server::{db, grpc, storage};

#[derive(Parser)]
#[command(
    name = "coord-server",
    about = "Single-node coordination service for node-map clients",
    version
)]
struct Cli {
    /// Address to serve gRPC on.
    #[arg(long, env = "COORD_LISTEN", default_value = "127.0.0.1:50051")]
    listen: SocketAddr,

    /// SQLite database URL.
    #[arg(long, env = "COORD_DATABASE", default_value = "sqlite::memory:")]
    database: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let pool = db::init_pool(&cli.database).await?;
    let storage = Arc::new(storage::Storage::new(pool));
    let server = grpc::create_server(storage);

    tracing::info!(listen = %cli.listen, database = %cli.database, "coordination server starting");
    Server::builder().add_service(server).serve(cli.listen).await?;

    Ok(())
}
