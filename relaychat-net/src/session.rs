//! A peer's persistent link to the registry.
//!
//! Provides:
//! - Connection lifecycle (connect, register, reconnect forever)
//! - A single writer task per socket, fed by a channel
//! - Dispatch of registry messages into peer state and events
//! - Server round-trip probes completed by `PONG` replies

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::election;
use crate::error::{PeerError, ProtocolError};
use crate::framing::{self, LineWriter};
use crate::peer::{PeerEvent, PeerShared, ProxyLink};
use crate::protocol::{ClientMessage, ServerMessage, WireMessage};

/// Lines queued for the registry writer before senders wait.
const OUTGOING_CAPACITY: usize = 256;

/// Registry connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct LinkInner {
    /// Channel to the writer task of the current connection
    outgoing: RwLock<Option<mpsc::Sender<String>>>,
    /// Server RTT probes waiting for a PONG, oldest first
    pending_pings: Mutex<VecDeque<oneshot::Sender<Instant>>>,
    state: RwLock<ConnectionState>,
    /// Bumped on every attach; identifies the current connection
    generation: AtomicU64,
}

/// Shared handle to the registry connection.
///
/// Everything that writes to the registry (the session itself, elections,
/// the relay listener forwarding on behalf of other peers) goes through this
/// handle, so every line reaches the socket through one writer task.
#[derive(Clone)]
pub struct RegistryLink {
    inner: Arc<LinkInner>,
}

impl Default for RegistryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryLink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LinkInner {
                outgoing: RwLock::new(None),
                pending_pings: Mutex::new(VecDeque::new()),
                state: RwLock::new(ConnectionState::Disconnected),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.outgoing.read().await.is_some()
    }

    /// Which registry connection is current. Changes on every reconnect.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub(crate) async fn set_state(&self, state: ConnectionState) {
        *self.inner.state.write().await = state;
    }

    async fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.inner.outgoing.read().await.clone()
    }

    /// Queue a message for the registry.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), PeerError> {
        let line = msg.encode()?;
        let tx = self.sender().await.ok_or(PeerError::NotConnected)?;
        tx.send(line).await.map_err(|_| PeerError::NotConnected)
    }

    /// Ping the registry and wait for the matching `PONG`.
    ///
    /// The registry answers pings in order, so waiters are completed FIFO.
    pub async fn measure_rtt(&self, wait: Duration) -> Result<Duration, PeerError> {
        let line = ClientMessage::Ping.encode()?;
        let (done_tx, done_rx) = oneshot::channel();

        let tx = self.sender().await.ok_or(PeerError::NotConnected)?;
        // capacity first; the waiter queue is never held across an await
        let permit = tx.reserve().await.map_err(|_| PeerError::NotConnected)?;

        let started = {
            let mut pending = self.inner.pending_pings.lock().await;
            pending.push_back(done_tx);
            permit.send(line);
            Instant::now()
        };

        match tokio::time::timeout(wait, done_rx).await {
            Ok(Ok(answered)) => Ok(answered.saturating_duration_since(started)),
            Ok(Err(_)) => Err(PeerError::NotConnected),
            Err(_) => Err(PeerError::Timeout),
        }
    }

    /// Complete the oldest pending probe.
    pub(crate) async fn complete_ping(&self, at: Instant) {
        if let Some(waiter) = self.inner.pending_pings.lock().await.pop_front() {
            let _ = waiter.send(at);
        }
    }

    pub(crate) async fn attach(&self, tx: mpsc::Sender<String>) {
        *self.inner.outgoing.write().await = Some(tx);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.set_state(ConnectionState::Connected).await;
    }

    /// Forget the current connection. Pending probes fail right away.
    pub(crate) async fn detach(&self) {
        *self.inner.outgoing.write().await = None;
        self.inner.pending_pings.lock().await.clear();
        self.set_state(ConnectionState::Disconnected).await;
    }
}

/// Keep a registry connection up for the lifetime of the peer.
pub(crate) async fn run(shared: Arc<PeerShared>) {
    let mut first = true;
    loop {
        let state = if first {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        shared.link.set_state(state).await;
        first = false;

        match TcpStream::connect(&shared.config.registry_addr).await {
            Ok(stream) => {
                log::info!("Connected to registry at {}", shared.config.registry_addr);
                shared.events.emit(PeerEvent::Connected);

                match serve(&shared, stream).await {
                    Ok(()) => log::info!("Registry closed the connection"),
                    Err(e) => log::warn!("Registry connection lost: {e}"),
                }

                shared.link.detach().await;
                shared.events.emit(PeerEvent::Disconnected);
            }
            Err(e) => {
                log::warn!(
                    "Could not reach registry at {}: {e}",
                    shared.config.registry_addr
                );
                shared.link.detach().await;
            }
        }

        tokio::time::sleep(shared.config.reconnect_delay).await;
    }
}

async fn serve(shared: &Arc<PeerShared>, stream: TcpStream) -> Result<(), PeerError> {
    let (mut reader, writer) = framing::split(stream);
    let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
    let writer_task = tokio::spawn(write_loop(writer, rx));

    shared.link.attach(tx).await;

    let result = async {
        shared.link.send(&shared.register_message().await).await?;
        while let Some(msg) = framing::next_message::<ServerMessage>(&mut reader).await? {
            dispatch(shared, msg).await;
        }
        Ok::<(), PeerError>(())
    }
    .await;

    writer_task.abort();
    result
}

async fn write_loop(mut writer: LineWriter, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.send(line).await {
            log::warn!("Registry write failed: {}", ProtocolError::from(e));
            break;
        }
    }
}

async fn dispatch(shared: &Arc<PeerShared>, msg: ServerMessage) {
    match msg {
        ServerMessage::AssignId { id } => {
            {
                let mut state = shared.state.write().await;
                state.id = Some(id);
                state.proxy = None;
                state.proxy_targets.clear();
            }
            log::info!("Registered with id {id}");
            shared.events.emit(PeerEvent::Registered(id));
        }

        ServerMessage::UseProxy { proxy_id, proxy_peer } => {
            shared.state.write().await.proxy = Some(ProxyLink {
                id: proxy_id,
                peer: proxy_peer.clone(),
            });
            log::info!("Using client {proxy_id} at {proxy_peer} as proxy");
            shared.events.emit(PeerEvent::UseProxy { proxy_id, peer: proxy_peer });
        }

        ServerMessage::ProxyFor { client_id } => {
            shared.state.write().await.proxy_targets.insert(client_id);
            log::info!("Now proxying for client {client_id}");
            shared.events.emit(PeerEvent::ProxyFor(client_id));
        }

        ServerMessage::ClientList { clients } => {
            let generation = shared.link.generation();
            tokio::spawn(election::run(shared.clone(), clients, generation));
        }

        ServerMessage::Chat { from_id, from_name, text } => {
            shared.events.emit(PeerEvent::Chat { from_id, from_name, text });
        }

        ServerMessage::Pong { .. } => {
            shared.link.complete_ping(Instant::now()).await;
        }

        ServerMessage::MeasureReply { ts } => {
            log::debug!("MEASURE_REPLY ts={ts}");
        }

        ServerMessage::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unattached_link_is_not_connected() {
        let link = RegistryLink::new();
        assert!(!link.is_connected().await);
        assert_eq!(link.state().await, ConnectionState::Disconnected);
        assert!(matches!(
            link.send(&ClientMessage::Ping).await,
            Err(PeerError::NotConnected)
        ));
        assert!(matches!(
            link.measure_rtt(Duration::from_millis(50)).await,
            Err(PeerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_goes_through_the_writer_channel() {
        let link = RegistryLink::new();
        let (tx, mut rx) = mpsc::channel(4);
        link.attach(tx).await;

        link.send(&ClientMessage::Choice { chosen_id: 3 }).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"CHOICE","chosen_id":3}"#);
        assert_eq!(link.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_pongs_complete_probes_in_order() {
        let link = RegistryLink::new();
        let (tx, mut rx) = mpsc::channel(4);
        link.attach(tx).await;

        let probe = {
            let link = link.clone();
            tokio::spawn(async move { link.measure_rtt(Duration::from_secs(2)).await })
        };

        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"PING"}"#);
        link.complete_ping(Instant::now()).await;

        let rtt = probe.await.unwrap().unwrap();
        assert!(rtt < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_detach_fails_pending_probes() {
        let link = RegistryLink::new();
        let (tx, mut rx) = mpsc::channel(4);
        link.attach(tx).await;

        let probe = {
            let link = link.clone();
            tokio::spawn(async move { link.measure_rtt(Duration::from_secs(5)).await })
        };
        rx.recv().await.unwrap();
        link.detach().await;

        assert!(matches!(probe.await.unwrap(), Err(PeerError::NotConnected)));
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn test_pong_dispatch_not_blocked_by_full_writer() {
        let link = RegistryLink::new();
        let (tx, mut rx) = mpsc::channel(1);
        link.attach(tx).await;
        link.send(&ClientMessage::Choice { chosen_id: 1 }).await.unwrap();

        // the writer channel is full, so this PING waits for capacity
        let rtt = {
            let link = link.clone();
            tokio::spawn(async move { link.measure_rtt(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_millis(200), link.complete_ping(Instant::now()))
            .await
            .expect("PONG dispatch blocked behind a queued PING");

        // drain the backlog; the queued PING goes out and its PONG completes it
        rx.recv().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"PING"}"#);
        link.complete_ping(Instant::now()).await;
        assert!(rtt.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_generation_changes_on_reattach() {
        let link = RegistryLink::new();
        let (tx, _rx) = mpsc::channel(1);
        link.attach(tx).await;
        let first = link.generation();

        link.detach().await;
        assert_eq!(link.generation(), first);

        let (tx, _rx2) = mpsc::channel(1);
        link.attach(tx).await;
        assert_ne!(link.generation(), first);
    }

    #[tokio::test]
    async fn test_unanswered_probe_times_out() {
        let link = RegistryLink::new();
        let (tx, _rx) = mpsc::channel(4);
        link.attach(tx).await;

        let result = link.measure_rtt(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(PeerError::Timeout)));
    }
}
