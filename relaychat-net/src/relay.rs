//! Peer relay listener and the client side used to talk to other peers' relays.
//!
//! ```text
//! Peer B ──FORWARD_TO_SERVER──► A's RelayListener ──FORWARDED_CHAT──► registry
//!        ◄──FORWARD_CHAT_RESULT──                  (via A's RegistryLink)
//! ```
//!
//! A relay serves any number of inbound peers, one task each, and answers
//! requests in the order they arrive on a connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::{PeerError, ProtocolError};
use crate::framing::{self, LineReader, LineWriter};
use crate::peer::{EventSink, PeerEvent};
use crate::protocol::{
    unix_timestamp, ClientMessage, ForwardAction, PeerReply, PeerRequest, RelayAddr, WireMessage,
};
use crate::session::RegistryLink;

/// Error string reported when a server probe is asked of a relay without a registry link.
pub const NO_SERVER_CONN: &str = "no_server_conn";

/// What a relay needs from the peer that owns it.
#[derive(Clone)]
pub struct RelayContext {
    pub link: RegistryLink,
    pub events: EventSink,
    /// Bound on waiting for the registry's PONG during MEASURE_SERVER.
    pub server_ping_timeout: Duration,
}

impl RelayContext {
    async fn forward(&self, action: ForwardAction) -> Option<PeerReply> {
        match action {
            ForwardAction::MeasureServer { req_id } => {
                if !self.link.is_connected().await {
                    return Some(PeerReply::measure_failed(req_id, NO_SERVER_CONN));
                }
                let reply = match self.link.measure_rtt(self.server_ping_timeout).await {
                    Ok(rtt) => PeerReply::measured(req_id, rtt.as_secs_f64() * 1000.0),
                    Err(e) => PeerReply::measure_failed(req_id, e.to_string()),
                };
                Some(reply)
            }

            ForwardAction::ForwardChat { orig_id, name, text } => {
                let msg = ClientMessage::ForwardedChat { orig_id, name, text };
                let reply = match self.link.send(&msg).await {
                    Ok(()) => {
                        log::info!("Forwarded chat for client {orig_id}");
                        PeerReply::forwarded()
                    }
                    Err(e) => PeerReply::forward_failed(e.to_string()),
                };
                Some(reply)
            }

            ForwardAction::Unknown => {
                log::debug!("Ignoring unknown forward action");
                None
            }
        }
    }

    async fn answer(&self, request: PeerRequest, line: &str) -> Option<PeerReply> {
        match request {
            PeerRequest::Ping => Some(PeerReply::Pong { ts: unix_timestamp() }),
            PeerRequest::ForwardToServer(action) => self.forward(action).await,
            PeerRequest::Unknown => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                    self.events.emit(PeerEvent::PeerMessage(value));
                }
                None
            }
        }
    }
}

/// Accepts inbound peer connections.
pub struct RelayListener {
    listener: TcpListener,
}

impl RelayListener {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(addr).await? })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self, ctx: RelayContext) -> std::io::Result<()> {
        log::info!("Relay listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("Peer connection from {addr}");
            let ctx = ctx.clone();
            tokio::spawn(async move {
                serve_peer(stream, addr, ctx).await;
            });
        }
    }
}

async fn serve_peer(stream: TcpStream, addr: SocketAddr, ctx: RelayContext) {
    let (mut reader, mut writer) = framing::split(stream);

    loop {
        let line = match framing::next_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::debug!("Peer {addr} read error: {e}");
                break;
            }
        };

        let request = match PeerRequest::decode(&line) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("Dropping malformed line from peer {addr}: {e}");
                continue;
            }
        };

        if let Some(reply) = ctx.answer(request, &line).await {
            if let Err(e) = framing::send_message(&mut writer, &reply).await {
                log::debug!("Peer {addr} write error: {e}");
                break;
            }
        }
    }

    log::debug!("Peer {addr} disconnected");
}

/// One connection to another peer's relay listener.
pub struct RelayClient {
    reader: LineReader,
    writer: LineWriter,
}

impl RelayClient {
    pub async fn connect(addr: &RelayAddr, connect_timeout: Duration) -> Result<Self, PeerError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr.connect_target()))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let (reader, writer) = framing::split(stream);
        Ok(Self { reader, writer })
    }

    /// Send a request and wait for the first well-formed reply.
    pub async fn request(
        &mut self,
        request: &PeerRequest,
        read_timeout: Duration,
    ) -> Result<PeerReply, PeerError> {
        framing::send_message(&mut self.writer, request).await?;

        match timeout(read_timeout, framing::next_message::<PeerReply>(&mut self.reader)).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(ProtocolError::ConnectionClosed.into()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PeerError::Timeout),
        }
    }
}
