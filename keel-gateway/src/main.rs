use std::net::SocketAddr;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keel_db::Database;
use keel_gateway::{router, AppState};

#[derive(Debug, Parser)]
#[command(name = "keel", about = "keel document database server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9181")]
    addr: SocketAddr,

    /// Peer id advertised on /peerid (set by the P2P layer when enabled).
    #[arg(long)]
    peer_id: Option<String>,

    /// Development mode: error envelopes include stack details.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let dev = args.dev || std::env::var("KEEL_ENV").as_deref() == Ok("dev");

    let db = Database::new_in_memory()?;
    let state = AppState {
        db: Some(db),
        peer_id: args.peer_id,
        dev,
    };

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!("keel listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
