//! A chat peer: registry session, relay listener and outbound chat path.
//!
//! [`Peer::start`] binds the relay listener, spawns it together with the
//! registry session and hands back an event receiver for the front end.
//! Elections are spawned by the session whenever a roster arrives.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::election::{ElectionTimeouts, Prober, TcpProber};
use crate::error::PeerError;
use crate::protocol::{ClientId, ClientMessage, ForwardAction, PeerReply, PeerRequest, RelayAddr};
use crate::relay::{RelayClient, RelayContext, RelayListener};
use crate::session::{self, ConnectionState, RegistryLink};

/// Peer configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Registry address, `host:port`
    pub registry_addr: String,
    /// Where the relay listener binds; port 0 picks a free port
    pub relay_bind_addr: String,
    /// IP announced in REGISTER. Defaults to the local interface address.
    pub advertise_ip: Option<String>,
    pub name: String,
    /// Show the local IP address instead of the name
    pub use_local_ip: bool,
    pub reconnect_delay: Duration,
    /// Bound on a registry PING issued for another peer's MEASURE_SERVER
    pub server_ping_timeout: Duration,
    pub chat_connect_timeout: Duration,
    pub chat_reply_timeout: Duration,
    pub election: ElectionTimeouts,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            registry_addr: "127.0.0.1:9090".to_string(),
            relay_bind_addr: "0.0.0.0:0".to_string(),
            advertise_ip: None,
            name: "Anon".to_string(),
            use_local_ip: false,
            reconnect_delay: Duration::from_secs(1),
            server_ping_timeout: Duration::from_secs(2),
            chat_connect_timeout: Duration::from_secs(2),
            chat_reply_timeout: Duration::from_secs(2),
            election: ElectionTimeouts::default(),
        }
    }
}

/// This peer's active proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLink {
    pub id: ClientId,
    pub peer: RelayAddr,
}

#[derive(Debug, Clone, Default)]
pub struct PeerState {
    pub id: Option<ClientId>,
    pub name: String,
    pub use_local_ip: bool,
    pub proxy: Option<ProxyLink>,
    /// Peers currently using this peer as their proxy
    pub proxy_targets: BTreeSet<ClientId>,
}

/// Events emitted to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Registry connection established
    Connected,
    /// Registry connection lost
    Disconnected,
    /// Identity assigned by the registry
    Registered(ClientId),
    UseProxy { proxy_id: ClientId, peer: RelayAddr },
    ProxyFor(ClientId),
    Chat {
        from_id: ClientId,
        from_name: String,
        text: String,
    },
    /// A message of unknown type sent straight to the relay listener
    PeerMessage(serde_json::Value),
}

/// Sending half of the event queue. Emitting never blocks.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: PeerEvent) {
        // A front end that stopped listening is not an error.
        let _ = self.tx.send(event);
    }
}

/// Which way an outbound chat line went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRoute {
    Proxy(ClientId),
    Direct,
}

pub(crate) struct PeerShared {
    pub(crate) config: PeerConfig,
    pub(crate) state: RwLock<PeerState>,
    pub(crate) link: RegistryLink,
    pub(crate) events: EventSink,
    pub(crate) relay_addr: SocketAddr,
    pub(crate) prober: Arc<dyn Prober>,
}

impl PeerShared {
    pub(crate) async fn display_name(&self) -> String {
        let state = self.state.read().await;
        if state.use_local_ip {
            local_ip_string()
        } else {
            state.name.clone()
        }
    }

    pub(crate) async fn register_message(&self) -> ClientMessage {
        let peer_ip = self
            .config
            .advertise_ip
            .clone()
            .unwrap_or_else(local_ip_string);
        ClientMessage::Register {
            peer_ip: Some(peer_ip),
            peer_port: self.relay_addr.port(),
            name: Some(self.display_name().await),
        }
    }
}

/// A running peer. Dropping it stops its tasks.
pub struct Peer {
    shared: Arc<PeerShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    /// Start a peer that probes candidates over TCP.
    pub async fn start(
        config: PeerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let prober = Arc::new(TcpProber::new(config.election.clone()));
        Self::start_with_prober(config, prober).await
    }

    /// Start a peer with a custom election prober.
    pub async fn start_with_prober(
        config: PeerConfig,
        prober: Arc<dyn Prober>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let listener = RelayListener::bind(&config.relay_bind_addr).await?;
        let relay_addr = listener.local_addr()?;
        let (events, events_rx) = EventSink::channel();

        let shared = Arc::new(PeerShared {
            state: RwLock::new(PeerState {
                name: config.name.clone(),
                use_local_ip: config.use_local_ip,
                ..PeerState::default()
            }),
            link: RegistryLink::new(),
            events,
            relay_addr,
            prober,
            config,
        });

        let ctx = RelayContext {
            link: shared.link.clone(),
            events: shared.events.clone(),
            server_ping_timeout: shared.config.server_ping_timeout,
        };
        let relay_task = tokio::spawn(async move {
            if let Err(e) = listener.run(ctx).await {
                log::error!("Relay listener stopped: {e}");
            }
        });
        let session_task = tokio::spawn(session::run(shared.clone()));

        Ok((
            Self {
                shared,
                tasks: vec![relay_task, session_task],
            },
            events_rx,
        ))
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.shared.relay_addr
    }

    pub async fn id(&self) -> Option<ClientId> {
        self.shared.state.read().await.id
    }

    pub async fn proxy(&self) -> Option<ProxyLink> {
        self.shared.state.read().await.proxy.clone()
    }

    pub async fn proxy_targets(&self) -> BTreeSet<ClientId> {
        self.shared.state.read().await.proxy_targets.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.link.state().await
    }

    pub async fn display_name(&self) -> String {
        self.shared.display_name().await
    }

    pub async fn set_name(&self, name: impl Into<String>) {
        self.shared.state.write().await.name = name.into();
    }

    /// Flip identity-by-address; returns the new setting.
    pub async fn toggle_use_local_ip(&self) -> bool {
        let mut state = self.shared.state.write().await;
        state.use_local_ip = !state.use_local_ip;
        state.use_local_ip
    }

    /// Send a chat line, through the proxy when one is set.
    ///
    /// A proxy that cannot be reached or refuses the line is bypassed and
    /// the line goes out directly on the registry link.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatRoute, PeerError> {
        let text = text.into();
        let name = self.shared.display_name().await;
        let (id, proxy) = {
            let state = self.shared.state.read().await;
            (state.id, state.proxy.clone())
        };

        if let (Some(id), Some(proxy)) = (id, proxy) {
            match self.forward_via(&proxy, id, &name, &text).await {
                Ok(()) => return Ok(ChatRoute::Proxy(proxy.id)),
                Err(e) => log::warn!("Proxy {} failed ({e}); sending directly", proxy.id),
            }
        }

        self.shared
            .link
            .send(&ClientMessage::Chat { text, name: Some(name) })
            .await?;
        Ok(ChatRoute::Direct)
    }

    async fn forward_via(
        &self,
        proxy: &ProxyLink,
        orig_id: ClientId,
        name: &str,
        text: &str,
    ) -> Result<(), PeerError> {
        let config = &self.shared.config;
        let mut client = RelayClient::connect(&proxy.peer, config.chat_connect_timeout).await?;
        let request = PeerRequest::ForwardToServer(ForwardAction::ForwardChat {
            orig_id,
            name: name.to_string(),
            text: text.to_string(),
        });

        match client.request(&request, config.chat_reply_timeout).await? {
            PeerReply::ForwardChatResult { ok: true, .. } => Ok(()),
            PeerReply::ForwardChatResult { ok: false, error } => Err(PeerError::Rejected(
                error.unwrap_or_else(|| "unspecified".to_string()),
            )),
            other => Err(crate::error::ProtocolError::UnexpectedReply(format!("{other:?}")).into()),
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// This host's primary interface address, or loopback if none is found.
pub fn local_ip_string() -> String {
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            log::debug!("Local IP lookup failed ({e}); using loopback");
            "127.0.0.1".to_string()
        }
    }
}
