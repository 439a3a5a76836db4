//! Line-delimited JSON protocol spoken between registry, peers and relays.
//!
//! Wire format: one JSON object per line, discriminated by `type`:
//! ```text
//! peer → registry   {"type":"REGISTER","peer_ip":"10.0.0.5","peer_port":10001,"name":"alice"}
//! registry → peer   {"type":"ASSIGN_ID","id":3}
//! registry → peer   {"type":"CLIENT_LIST","clients":[{"id":1,"peer":["10.0.0.4",10000],"name":"bob"}]}
//! peer → relay      {"type":"FORWARD_TO_SERVER","action":"MEASURE_SERVER","req_id":"m5f0c..."}
//! relay → peer      {"type":"FORWARD_REPLY","req_id":"m5f0c...","server_rtt_ms":0.84}
//! ```
//!
//! Every connection direction has its own closed message enum. Tags that a
//! direction does not know decode to `Unknown`, which handlers ignore.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Registry-assigned peer identity. Always positive.
pub type ClientId = u32;

/// Advertised relay address of a peer, `[ip, port]` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayAddr(pub String, pub u16);

impl RelayAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self(ip.into(), port)
    }

    pub fn ip(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> u16 {
        self.1
    }

    /// Target usable with `TcpStream::connect` (host names resolve too).
    pub fn connect_target(&self) -> (&str, u16) {
        (self.0.as_str(), self.1)
    }
}

impl fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.contains(':') {
            write!(f, "[{}]:{}", self.0, self.1)
        } else {
            write!(f, "{}:{}", self.0, self.1)
        }
    }
}

/// One peer in a roster handed to a newly joined peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: ClientId,
    pub peer: RelayAddr,
    pub name: String,
}

/// Messages a peer sends to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Join the registry, advertising the relay listener address.
    Register {
        /// Falls back to the address the registry observes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_ip: Option<String>,
        peer_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Chat line from the sender itself.
    Chat {
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Result of this peer's proxy election.
    Choice { chosen_id: ClientId },
    /// Chat injected by a proxy on behalf of the peer it relays for.
    ForwardedChat {
        orig_id: ClientId,
        #[serde(default)]
        name: String,
        #[serde(default)]
        text: String,
    },
    Ping,
    /// Legacy timestamp probe, answered with `MeasureReply`.
    MeasureRequest,
    #[serde(other)]
    Unknown,
}

/// Messages the registry sends to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    AssignId { id: ClientId },
    UseProxy { proxy_id: ClientId, proxy_peer: RelayAddr },
    ProxyFor { client_id: ClientId },
    /// All registered peers with a smaller identity; triggers an election.
    ClientList { clients: Vec<RosterEntry> },
    Chat {
        from_id: ClientId,
        from_name: String,
        text: String,
    },
    Pong { ts: f64 },
    MeasureReply { ts: f64 },
    #[serde(other)]
    Unknown,
}

/// Work a peer asks another peer's relay listener to do on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardAction {
    /// Ping the relay's own registry link and report the round trip.
    MeasureServer { req_id: String },
    /// Inject a chat line into the registry broadcast.
    ForwardChat {
        orig_id: ClientId,
        #[serde(default)]
        name: String,
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Unknown,
}

/// Messages accepted by a peer's relay listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerRequest {
    Ping,
    ForwardToServer(ForwardAction),
    #[serde(other)]
    Unknown,
}

/// Replies written by a peer's relay listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerReply {
    Pong { ts: f64 },
    /// Exactly one of `server_rtt_ms` / `error` is set.
    ForwardReply {
        req_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_rtt_ms: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ForwardChatResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl PeerReply {
    pub fn measured(req_id: String, rtt_ms: f64) -> Self {
        Self::ForwardReply { req_id, server_rtt_ms: Some(rtt_ms), error: None }
    }

    pub fn measure_failed(req_id: String, error: impl Into<String>) -> Self {
        Self::ForwardReply { req_id, server_rtt_ms: None, error: Some(error.into()) }
    }

    pub fn forwarded() -> Self {
        Self::ForwardChatResult { ok: true, error: None }
    }

    pub fn forward_failed(error: impl Into<String>) -> Self {
        Self::ForwardChatResult { ok: false, error: Some(error.into()) }
    }
}

/// A message that travels as one JSON line.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Serialize to a single line (no trailing newline).
    fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a single line.
    fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl WireMessage for ClientMessage {}
impl WireMessage for ServerMessage {}
impl WireMessage for PeerRequest {}
impl WireMessage for PeerReply {}

/// Seconds since the Unix epoch, as carried in `ts` fields.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
