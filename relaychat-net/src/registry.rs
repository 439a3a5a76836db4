//! Registry service: identity assignment, chat fan-out and proxy wiring.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                      ┌── outbox A ──► Peer A
//!          ├── connection task ───┤
//! Peer B ──┘        │             └── outbox B ──► Peer B
//!                   ▼
//!              ClientTable (records + IdentityPool, one mutex)
//! ```
//!
//! Each accepted connection is served by its own task, which reads the
//! peer's lines and drains the peer's outbox. Replies to the connection's own
//! requests are written directly; anything triggered by another connection
//! (chat fan-out, `PROXY_FOR`) arrives through the outbox.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};

use crate::error::ProtocolError;
use crate::framing::{self, LineReader, LineWriter};
use crate::protocol::{
    unix_timestamp, ClientId, ClientMessage, RelayAddr, ServerMessage, WireMessage,
};
use crate::table::{ClientTable, Followup, Outbox};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Lines buffered per connection before fan-out starts dropping
    pub outbox_capacity: usize,
    /// Upper bound on concurrently served connections (None = unbounded)
    pub max_connections: Option<usize>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9090".to_string(),
            outbox_capacity: 256,
            max_connections: None,
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_connections: u64,
    pub active_clients: usize,
    pub chats_broadcast: u64,
    pub lines_dropped: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    chats_broadcast: AtomicU64,
}

/// The rendezvous registry.
pub struct Registry {
    config: RegistryConfig,
    listener: TcpListener,
    table: Arc<ClientTable>,
    counters: Arc<Counters>,
    limiter: Option<Arc<Semaphore>>,
}

impl Registry {
    /// Bind the listening socket.
    pub async fn bind(config: RegistryConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let limiter = config.max_connections.map(|n| Arc::new(Semaphore::new(n)));
        Ok(Self {
            config,
            listener,
            table: Arc::new(ClientTable::new()),
            counters: Arc::new(Counters::default()),
            limiter,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn table(&self) -> &Arc<ClientTable> {
        &self.table
    }

    pub async fn stats(&self) -> RegistryStats {
        let table = self.table.stats().await;
        RegistryStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_clients: table.registered,
            chats_broadcast: self.counters.chats_broadcast.load(Ordering::Relaxed),
            lines_dropped: table.lines_dropped,
        }
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(&self) -> std::io::Result<()> {
        log::info!("Registry listening on {}", self.local_addr()?);

        loop {
            let permit = match &self.limiter {
                Some(limiter) => match limiter.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Ok(()),
                },
                None => None,
            };

            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            self.counters.total_connections.fetch_add(1, Ordering::Relaxed);

            let table = self.table.clone();
            let counters = self.counters.clone();
            let capacity = self.config.outbox_capacity;

            tokio::spawn(async move {
                let _permit = permit;
                Connection::new(stream, addr, table, counters, capacity).serve().await;
            });
        }
    }
}

/// Per-connection lifecycle. `Closed` is implicit: the task ends.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnState {
    Unregistered,
    Registered { id: ClientId, name: String },
}

struct Connection {
    addr: SocketAddr,
    reader: LineReader,
    writer: LineWriter,
    outbox: Outbox,
    outbox_rx: mpsc::Receiver<Arc<str>>,
    state: ConnState,
    table: Arc<ClientTable>,
    counters: Arc<Counters>,
}

impl Connection {
    fn new(
        stream: TcpStream,
        addr: SocketAddr,
        table: Arc<ClientTable>,
        counters: Arc<Counters>,
        outbox_capacity: usize,
    ) -> Self {
        let (reader, writer) = framing::split(stream);
        let (outbox, outbox_rx) = Outbox::channel(outbox_capacity);
        Self {
            addr,
            reader,
            writer,
            outbox,
            outbox_rx,
            state: ConnState::Unregistered,
            table,
            counters,
        }
    }

    async fn serve(mut self) {
        match self.pump().await {
            Ok(()) => log::info!("Connection closed from {}", self.addr),
            Err(e) => log::warn!("Connection error from {}: {e}", self.addr),
        }

        if let ConnState::Registered { id, .. } = self.state {
            if let Some(record) = self.table.remove(id).await {
                log::info!(
                    "Client {id} ({}) disconnected. Total: {}",
                    record.observed_addr,
                    self.table.len().await
                );
            }
        }
    }

    async fn pump(&mut self) -> Result<(), ProtocolError> {
        loop {
            tokio::select! {
                msg = framing::next_message::<ClientMessage>(&mut self.reader) => {
                    match msg? {
                        Some(msg) => self.handle(msg).await?,
                        None => return Ok(()),
                    }
                }

                Some(line) = self.outbox_rx.recv() => {
                    self.writer.send(&*line).await?;
                }
            }
        }
    }

    async fn reply(&mut self, msg: &ServerMessage) -> Result<(), ProtocolError> {
        framing::send_message(&mut self.writer, msg).await
    }

    async fn handle(&mut self, msg: ClientMessage) -> Result<(), ProtocolError> {
        match msg {
            ClientMessage::Register { peer_ip, peer_port, name } => {
                self.register(peer_ip, peer_port, name).await?;
            }

            ClientMessage::Chat { text, name } => {
                let ConnState::Registered { id, name: registered } = &self.state else {
                    log::debug!("Dropping chat from unregistered connection {}", self.addr);
                    return Ok(());
                };
                let from_name = name.unwrap_or_else(|| registered.clone());
                log::info!("CHAT from {id} ({from_name}): {text}");
                self.broadcast_chat(*id, from_name, text).await?;
            }

            ClientMessage::ForwardedChat { orig_id, name, text } => {
                log::info!("FORWARDED_CHAT on behalf of {orig_id} ({name}): {text}");
                self.broadcast_chat(orig_id, name, text).await?;
            }

            ClientMessage::Choice { chosen_id } => {
                let ConnState::Registered { id, .. } = self.state else {
                    log::debug!("Dropping choice from unregistered connection {}", self.addr);
                    return Ok(());
                };
                self.choose_proxy(id, chosen_id).await?;
            }

            ClientMessage::Ping => {
                self.reply(&ServerMessage::Pong { ts: unix_timestamp() }).await?;
            }

            ClientMessage::MeasureRequest => {
                self.reply(&ServerMessage::MeasureReply { ts: unix_timestamp() }).await?;
            }

            ClientMessage::Unknown => {
                log::debug!("Ignoring unknown message from {}", self.addr);
            }
        }
        Ok(())
    }

    async fn register(
        &mut self,
        peer_ip: Option<String>,
        peer_port: u16,
        name: Option<String>,
    ) -> Result<(), ProtocolError> {
        if let ConnState::Registered { id, .. } = self.state {
            log::warn!("Client {id} sent REGISTER again; ignoring");
            return Ok(());
        }

        let relay = RelayAddr::new(
            peer_ip.unwrap_or_else(|| self.addr.ip().to_string()),
            peer_port,
        );
        let registration = self
            .table
            .register(self.addr, relay.clone(), name, self.outbox.clone())
            .await;
        let id = registration.id;

        self.state = ConnState::Registered { id, name: registration.name.clone() };
        self.reply(&ServerMessage::AssignId { id }).await?;
        log::info!(
            "Registered client {id} {} peer {relay} name {}",
            self.addr,
            registration.name
        );

        match registration.followup {
            Followup::Nothing => {}
            Followup::Bootstrap { proxy_id, proxy_relay, proxy_outbox } => {
                self.reply(&ServerMessage::UseProxy { proxy_id, proxy_peer: proxy_relay })
                    .await?;
                let notice: Arc<str> = ServerMessage::ProxyFor { client_id: id }.encode()?.into();
                if let Err(e) = self.table.deliver(&proxy_outbox, notice) {
                    log::warn!("Could not tell client {proxy_id} it proxies for {id}: {e}");
                }
            }
            Followup::Roster(clients) => {
                log::debug!("Sending {} roster entries to client {id}", clients.len());
                self.reply(&ServerMessage::ClientList { clients }).await?;
            }
        }
        Ok(())
    }

    async fn broadcast_chat(
        &self,
        from_id: ClientId,
        from_name: String,
        text: String,
    ) -> Result<(), ProtocolError> {
        let line: Arc<str> = ServerMessage::Chat { from_id, from_name, text }.encode()?.into();
        let result = self.table.fan_out(line).await;
        self.counters.chats_broadcast.fetch_add(1, Ordering::Relaxed);
        if result.dropped > 0 {
            log::warn!("Chat from {from_id} dropped for {} recipients", result.dropped);
        }
        Ok(())
    }

    async fn choose_proxy(
        &mut self,
        chooser: ClientId,
        chosen_id: ClientId,
    ) -> Result<(), ProtocolError> {
        log::info!("Client {chooser} chose proxy {chosen_id}");

        let Some(contact) = self.table.lookup(chosen_id).await else {
            log::debug!("Choice of unknown client {chosen_id} by {chooser}; ignoring");
            return Ok(());
        };

        let notice: Arc<str> = ServerMessage::ProxyFor { client_id: chooser }.encode()?.into();
        if let Err(e) = self.table.deliver(&contact.outbox, notice) {
            log::warn!("Could not tell client {chosen_id} it proxies for {chooser}: {e}");
        }
        self.reply(&ServerMessage::UseProxy { proxy_id: chosen_id, proxy_peer: contact.relay })
            .await
    }
}
