//! relaychat peer: terminal chat client.
//!
//! # Usage
//!
//! ```bash
//! relaychat-peer --server-ip 10.0.0.1 --server-port 9090 --name alice
//! ```
//!
//! Type a line and press Enter to chat. `/name NAME` renames, `/ip` toggles
//! showing the local IP address instead of the name, `/status` prints the
//! current identity and proxy, `/quit` exits.

mod state;

use clap::Parser;
use log::info;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};

use relaychat_net::{ChatRoute, Peer, PeerConfig, PeerEvent};
use state::{ChatLog, Command};

/// Rendezvous chat peer
#[derive(Parser, Debug)]
#[command(name = "relaychat-peer")]
#[command(about = "Chat peer that can relay through other peers")]
#[command(version)]
struct Args {
    /// Registry IP address
    #[arg(long, default_value = "127.0.0.1")]
    server_ip: String,

    /// Registry port
    #[arg(long, default_value = "9090")]
    server_port: u16,

    /// Relay listener port (random in 10000..=15000 when omitted)
    #[arg(long)]
    peer_port: Option<u16>,

    /// Display name
    #[arg(long, default_value = "Anon")]
    name: String,

    /// Show the local IP address instead of the name
    #[arg(long)]
    use_local_ip: bool,

    /// IP announced to the registry for the relay listener
    #[arg(long)]
    advertise_ip: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let peer_port = args
        .peer_port
        .unwrap_or_else(|| rand::thread_rng().gen_range(10_000..=15_000));

    let config = PeerConfig {
        registry_addr: format!("{}:{}", args.server_ip, args.server_port),
        relay_bind_addr: format!("0.0.0.0:{peer_port}"),
        advertise_ip: args.advertise_ip,
        name: args.name,
        use_local_ip: args.use_local_ip,
        ..PeerConfig::default()
    };

    info!("Starting peer, registry {}", config.registry_addr);
    let (peer, mut events) = Peer::start(config).await?;
    info!("Relay listening on {}", peer.relay_addr());

    let mut chat_log = ChatLog::new();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = input.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Command::Chat(text) => match peer.send_chat(text).await {
                        Ok(ChatRoute::Proxy(id)) => log::debug!("Sent via proxy {id}"),
                        Ok(ChatRoute::Direct) => log::debug!("Sent directly"),
                        Err(e) => println!("(not sent: {e})"),
                    },
                    Command::SetName(name) => {
                        peer.set_name(name).await;
                        println!("(name is now {})", peer.display_name().await);
                    }
                    Command::ToggleLocalIp => {
                        let on = peer.toggle_use_local_ip().await;
                        println!("(use local IP: {on}, showing as {})", peer.display_name().await);
                    }
                    Command::Status => {
                        let id = peer.id().await;
                        let proxy = peer.proxy().await;
                        println!(
                            "(id {id:?}, {:?}, proxy {:?}, proxying for {:?})",
                            peer.connection_state().await,
                            proxy.map(|p| p.id),
                            peer.proxy_targets().await,
                        );
                    }
                    Command::Quit => break,
                    Command::Empty => {}
                }
            }

            Some(event) = events.recv() => {
                if let Some(line) = chat_log.record(&event) {
                    println!("{line}");
                    continue;
                }
                match event {
                    PeerEvent::Registered(id) => println!("(registered as {id})"),
                    PeerEvent::UseProxy { proxy_id, peer } => {
                        println!("(routing chat through {proxy_id} at {peer})");
                    }
                    PeerEvent::ProxyFor(id) => println!("(relaying for {id})"),
                    PeerEvent::Disconnected => println!("(registry connection lost, retrying)"),
                    _ => {}
                }
            }
        }
    }

    info!("Shutting down");
    Ok(())
}
