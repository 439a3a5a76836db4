//! # relaychat-net: Rendezvous chat with peer relays
//!
//! A central registry hands out identities and fans chat out to every
//! registered peer. Peers may route their chat through another peer (a
//! proxy), picked by a cascading latency election.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON lines / TCP   ┌─────────────┐
//! │    Peer     │ ◄──────────────────► │  Registry   │
//! │  (session)  │                      │  (central)  │
//! └──────┬──────┘                      └──────┬──────┘
//!        │ FORWARD_TO_SERVER                  │
//!        ▼                                    ▼
//! ┌─────────────┐                      ┌─────────────┐
//! │ Proxy peer  │                      │ ClientTable │
//! │ (relay)     │                      │ + identities│
//! └─────────────┘                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire messages, one closed enum per direction
//! - [`framing`]: Line framing over TCP
//! - [`identity`]: Smallest-first identity reuse
//! - [`table`]: Registry client table and fan-out
//! - [`registry`]: Registry server
//! - [`session`]: A peer's auto-reconnecting registry link
//! - [`relay`]: Relay listener and relay client
//! - [`election`]: Cascading proxy election
//! - [`peer`]: Peer facade used by front ends

pub mod error;
pub mod protocol;
pub mod framing;
pub mod identity;
pub mod table;
pub mod registry;
pub mod session;
pub mod relay;
pub mod election;
pub mod peer;

// Re-exports for convenience
pub use error::{PeerError, ProtocolError};
pub use protocol::{
    ClientId, ClientMessage, ForwardAction, PeerReply, PeerRequest, RelayAddr, RosterEntry,
    ServerMessage, WireMessage,
};
pub use identity::IdentityPool;
pub use table::{ClientTable, DeliveryError, FanOut, Followup, Outbox, Registration, TableStats};
pub use registry::{Registry, RegistryConfig, RegistryStats};
pub use session::{ConnectionState, RegistryLink};
pub use relay::{RelayClient, RelayContext, RelayListener};
pub use election::{elect, tie_set, Election, ElectionTimeouts, Prober, TcpProber, Tier};
pub use peer::{ChatRoute, EventSink, Peer, PeerConfig, PeerEvent, PeerState, ProxyLink};
