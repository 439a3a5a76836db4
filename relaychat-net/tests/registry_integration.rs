//! Integration tests for the registry.
//!
//! These tests start a real registry and drive it with raw line-framed
//! connections, checking exactly what each connection receives.

use std::sync::Arc;

use relaychat_net::framing::{self, LineReader, LineWriter};
use relaychat_net::protocol::{unix_timestamp, ClientMessage, RelayAddr, ServerMessage};
use relaychat_net::registry::{Registry, RegistryConfig};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(2);

/// Start a registry on a free port.
async fn start_registry() -> (Arc<Registry>, String) {
    let config = RegistryConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..RegistryConfig::default()
    };
    let registry = Arc::new(Registry::bind(config).await.unwrap());
    let addr = registry.local_addr().unwrap().to_string();

    let server = registry.clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (registry, addr)
}

struct RawClient {
    reader: LineReader,
    writer: LineWriter,
}

impl RawClient {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = framing::split(stream);
        Self { reader, writer }
    }

    async fn send(&mut self, msg: &ClientMessage) {
        framing::send_message(&mut self.writer, msg).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        timeout(WAIT, framing::next_message::<ServerMessage>(&mut self.reader))
            .await
            .expect("timed out waiting for the registry")
            .unwrap()
            .expect("registry closed the connection")
    }

    /// Register and return the assigned id.
    async fn register(&mut self, relay_port: u16, name: &str) -> u32 {
        self.send(&ClientMessage::Register {
            peer_ip: Some("127.0.0.1".to_string()),
            peer_port: relay_port,
            name: Some(name.to_string()),
        })
        .await;
        match self.recv().await {
            ServerMessage::AssignId { id } => id,
            other => panic!("expected ASSIGN_ID, got {other:?}"),
        }
    }

    /// Assert nothing else is queued: a PING must be answered next.
    async fn expect_quiet(&mut self) {
        self.send(&ClientMessage::Ping).await;
        match self.recv().await {
            ServerMessage::Pong { .. } => {}
            other => panic!("expected nothing before PONG, got {other:?}"),
        }
    }
}

async fn wait_until_removed(registry: &Registry, id: u32) {
    timeout(WAIT, async {
        while registry.table().contains(id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry never dropped the client");
}

#[tokio::test]
async fn test_sequential_registrations_get_sequential_ids() {
    let (_registry, addr) = start_registry().await;

    let mut clients = Vec::new();
    for n in 1..=5u32 {
        let mut client = RawClient::connect(&addr).await;
        assert_eq!(client.register(10_000 + n as u16, &format!("c{n}")).await, n);
        clients.push(client);
    }
}

#[tokio::test]
async fn test_two_peers_bootstrap_proxy() {
    let (_registry, addr) = start_registry().await;

    let mut first = RawClient::connect(&addr).await;
    assert_eq!(first.register(10_001, "alice").await, 1);

    let mut second = RawClient::connect(&addr).await;
    assert_eq!(second.register(10_002, "bob").await, 2);

    assert_eq!(
        second.recv().await,
        ServerMessage::UseProxy {
            proxy_id: 1,
            proxy_peer: RelayAddr::new("127.0.0.1", 10_001),
        }
    );
    assert_eq!(first.recv().await, ServerMessage::ProxyFor { client_id: 2 });

    first.expect_quiet().await;
    second.expect_quiet().await;
}

#[tokio::test]
async fn test_third_peer_receives_roster() {
    let (_registry, addr) = start_registry().await;

    let mut a = RawClient::connect(&addr).await;
    a.register(10_001, "alice").await;
    let mut b = RawClient::connect(&addr).await;
    b.register(10_002, "bob").await;
    let mut c = RawClient::connect(&addr).await;
    assert_eq!(c.register(10_003, "carol").await, 3);

    match c.recv().await {
        ServerMessage::ClientList { clients } => {
            let ids: Vec<_> = clients.iter().map(|e| e.id).collect();
            assert_eq!(ids, vec![1, 2]);
            assert_eq!(clients[0].peer, RelayAddr::new("127.0.0.1", 10_001));
            assert_eq!(clients[1].name, "bob");
        }
        other => panic!("expected CLIENT_LIST, got {other:?}"),
    }
}

#[tokio::test]
async fn test_released_id_is_reused() {
    let (registry, addr) = start_registry().await;

    let mut a = RawClient::connect(&addr).await;
    a.register(10_001, "a").await;
    let mut b = RawClient::connect(&addr).await;
    b.register(10_002, "b").await;
    let mut c = RawClient::connect(&addr).await;
    c.register(10_003, "c").await;

    drop(b);
    wait_until_removed(&registry, 2).await;

    let mut d = RawClient::connect(&addr).await;
    assert_eq!(d.register(10_004, "d").await, 2);
    // three peers registered: no bootstrap, and id 2 never gets a roster
    d.expect_quiet().await;

    let mut e = RawClient::connect(&addr).await;
    assert_eq!(e.register(10_005, "e").await, 4);
}

#[tokio::test]
async fn test_chat_reaches_everyone_including_sender() {
    let (_registry, addr) = start_registry().await;

    let mut a = RawClient::connect(&addr).await;
    a.register(10_001, "alice").await;
    let mut b = RawClient::connect(&addr).await;
    b.register(10_002, "bob").await;
    // drain bootstrap notices
    b.recv().await;
    a.recv().await;

    b.send(&ClientMessage::Chat { text: "hi".into(), name: Some("A".into()) }).await;

    let expected = ServerMessage::Chat { from_id: 2, from_name: "A".into(), text: "hi".into() };
    assert_eq!(a.recv().await, expected);
    assert_eq!(b.recv().await, expected);
}

#[tokio::test]
async fn test_chat_without_name_uses_registered_name() {
    let (_registry, addr) = start_registry().await;

    let mut a = RawClient::connect(&addr).await;
    a.register(10_001, "alice").await;
    a.send(&ClientMessage::Chat { text: "yo".into(), name: None }).await;

    assert_eq!(
        a.recv().await,
        ServerMessage::Chat { from_id: 1, from_name: "alice".into(), text: "yo".into() }
    );
}

#[tokio::test]
async fn test_forwarded_chat_is_attributed_to_origin() {
    let (_registry, addr) = start_registry().await;

    let mut proxy = RawClient::connect(&addr).await;
    proxy.register(10_001, "proxy").await;

    proxy
        .send(&ClientMessage::ForwardedChat { orig_id: 7, name: "far".into(), text: "via".into() })
        .await;
    assert_eq!(
        proxy.recv().await,
        ServerMessage::Chat { from_id: 7, from_name: "far".into(), text: "via".into() }
    );
}

#[tokio::test]
async fn test_choice_wires_both_sides() {
    let (_registry, addr) = start_registry().await;

    let mut a = RawClient::connect(&addr).await;
    a.register(10_001, "a").await;
    let mut b = RawClient::connect(&addr).await;
    b.register(10_002, "b").await;
    let mut c = RawClient::connect(&addr).await;
    c.register(10_003, "c").await;
    c.recv().await; // roster

    assert_eq!(a.recv().await, ServerMessage::ProxyFor { client_id: 2 });

    c.send(&ClientMessage::Choice { chosen_id: 1 }).await;
    assert_eq!(
        c.recv().await,
        ServerMessage::UseProxy { proxy_id: 1, proxy_peer: RelayAddr::new("127.0.0.1", 10_001) }
    );
    assert_eq!(a.recv().await, ServerMessage::ProxyFor { client_id: 3 });
}

#[tokio::test]
async fn test_choice_of_absent_id_is_dropped() {
    let (_registry, addr) = start_registry().await;

    let mut a = RawClient::connect(&addr).await;
    a.register(10_001, "a").await;

    a.send(&ClientMessage::Choice { chosen_id: 42 }).await;
    a.expect_quiet().await;
}

#[tokio::test]
async fn test_two_pings_two_pongs() {
    let (_registry, addr) = start_registry().await;
    let mut client = RawClient::connect(&addr).await;

    for _ in 0..2 {
        let sent_at = unix_timestamp();
        client.send(&ClientMessage::Ping).await;
        match client.recv().await {
            ServerMessage::Pong { ts } => assert!(ts >= sent_at),
            other => panic!("expected PONG, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_malformed_lines_keep_connection_open() {
    use futures_util::SinkExt;

    let (_registry, addr) = start_registry().await;
    let mut client = RawClient::connect(&addr).await;

    client.writer.send("this is not json").await.unwrap();
    client.writer.send(r#"{"type":"FROM_THE_FUTURE"}"#).await.unwrap();
    client.send(&ClientMessage::MeasureRequest).await;

    assert!(matches!(client.recv().await, ServerMessage::MeasureReply { .. }));
}

#[tokio::test]
async fn test_stats_track_connections_and_chats() {
    let (registry, addr) = start_registry().await;

    let mut a = RawClient::connect(&addr).await;
    a.register(10_001, "a").await;
    a.send(&ClientMessage::Chat { text: "one".into(), name: None }).await;
    a.recv().await;

    let stats = registry.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_clients, 1);
    assert_eq!(stats.chats_broadcast, 1);
    assert_eq!(stats.lines_dropped, 0);
}
