use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use batchd::config::{FlushPolicy, ServerConfig};
use batchd::server::Server;
use batchd::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "batchd")]
#[command(version)]
#[command(about = "A single-node batch job scheduler")]
struct Args {
    /// Address for client connections
    #[arg(long, default_value = "127.0.0.1:7470")]
    client_addr: SocketAddr,

    /// Address for agent connections
    #[arg(long, default_value = "127.0.0.1:7471")]
    agent_addr: SocketAddr,

    /// Directory for the journal and snapshot files
    #[arg(long, default_value = "/var/lib/batchd")]
    state_dir: PathBuf,

    /// Admission sweep interval in milliseconds
    #[arg(long, default_value = "500")]
    sched_freq_ms: u64,

    /// Flush the journal on a timer instead of after every commit.
    /// The value is the flush interval in milliseconds.
    #[arg(long)]
    flush_defer_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::new(args.client_addr, args.agent_addr, args.state_dir)
        .with_sched_freq(args.sched_freq_ms);
    if let Some(interval_ms) = args.flush_defer_ms {
        config = config.with_flush(FlushPolicy::Deferred { interval_ms });
    }

    let shutdown = install_shutdown_handler();
    let server = Server::start(config, shutdown).await?;
    server.run().await?;
    Ok(())
}
