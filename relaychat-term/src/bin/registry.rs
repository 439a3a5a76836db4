//! relaychat registry binary.
//!
//! # Usage
//!
//! ```bash
//! relaychat-registry --bind 0.0.0.0:9090
//! RUST_LOG=debug relaychat-registry --max-connections 500
//! ```

use clap::Parser;
use log::info;
use relaychat_net::{Registry, RegistryConfig};

/// Rendezvous registry for relaychat peers
#[derive(Parser, Debug)]
#[command(name = "relaychat-registry")]
#[command(about = "Assigns peer identities and fans out chat")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:9090")]
    bind: String,

    /// Maximum concurrent connections (unbounded when omitted)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Lines buffered per connection before chat is dropped for it
    #[arg(long, default_value = "256")]
    outbox_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RegistryConfig {
        bind_addr: args.bind,
        outbox_capacity: args.outbox_capacity,
        max_connections: args.max_connections,
    };

    let registry = Registry::bind(config).await?;

    tokio::select! {
        result = registry.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = registry.stats().await;
            info!(
                "Shutting down: {} connections served, {} chats broadcast, {} lines dropped",
                stats.total_connections, stats.chats_broadcast, stats.lines_dropped
            );
        }
    }

    Ok(())
}
