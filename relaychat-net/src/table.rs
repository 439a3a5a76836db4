//! Registry client table: registered peers plus the identity pool.
//!
//! The table is only reachable through synchronized operations. A single
//! mutex guards both the records and the pool and is held for the mutation
//! alone; delivery to outboxes always happens after it is released.
//!
//! Fan-out pushes pre-encoded lines (`Arc<str>`) so a broadcast is
//! serialized once no matter how many peers receive it.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::identity::IdentityPool;
use crate::protocol::{ClientId, RelayAddr, RosterEntry};

/// Why a line could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbox full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Outgoing queue of one registry connection, drained by that connection's task.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Arc<str>>,
}

impl Outbox {
    /// Create an outbox and the receiver its connection task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a line without waiting. A full outbox drops the line.
    pub fn push(&self, line: Arc<str>) -> Result<(), DeliveryError> {
        self.tx.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// A registered peer, owned by the table.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub outbox: Outbox,
    /// Address the registry sees the connection coming from.
    pub observed_addr: SocketAddr,
    /// Address the peer's relay listener accepts peers on.
    pub relay: RelayAddr,
    pub name: String,
}

/// What a fresh registration must be told beyond its identity.
#[derive(Debug, Clone)]
pub enum Followup {
    Nothing,
    /// Second peer of a two-peer registry: use peer 1 as proxy.
    Bootstrap {
        proxy_id: ClientId,
        proxy_relay: RelayAddr,
        proxy_outbox: Outbox,
    },
    /// Peers with smaller identities, ascending, to elect a proxy from.
    Roster(Vec<RosterEntry>),
}

/// Result of [`ClientTable::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: ClientId,
    pub name: String,
    pub followup: Followup,
}

/// How to reach a registered peer.
#[derive(Debug, Clone)]
pub struct Contact {
    pub outbox: Outbox,
    pub relay: RelayAddr,
}

/// Delivery result of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub registered: usize,
    pub lines_sent: u64,
    pub lines_dropped: u64,
}

struct AtomicTableStats {
    lines_sent: AtomicU64,
    lines_dropped: AtomicU64,
}

struct TableInner {
    clients: BTreeMap<ClientId, ClientRecord>,
    pool: IdentityPool,
}

/// The registry's client table and identity allocator.
pub struct ClientTable {
    inner: Mutex<TableInner>,
    stats: AtomicTableStats,
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                clients: BTreeMap::new(),
                pool: IdentityPool::new(),
            }),
            stats: AtomicTableStats {
                lines_sent: AtomicU64::new(0),
                lines_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Allocate an identity and insert the record.
    ///
    /// The bootstrap/roster decision is taken in the same critical section,
    /// so it sees exactly the table the new identity was inserted into.
    pub async fn register(
        &self,
        observed_addr: SocketAddr,
        relay: RelayAddr,
        name: Option<String>,
        outbox: Outbox,
    ) -> Registration {
        let mut inner = self.inner.lock().await;
        let id = inner.pool.allocate();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Client{id}"));

        inner.clients.insert(
            id,
            ClientRecord {
                id,
                outbox,
                observed_addr,
                relay,
                name: name.clone(),
            },
        );

        let followup = if id == 2 && inner.clients.len() <= 2 {
            match inner.clients.get(&1) {
                Some(first) => Followup::Bootstrap {
                    proxy_id: first.id,
                    proxy_relay: first.relay.clone(),
                    proxy_outbox: first.outbox.clone(),
                },
                None => Followup::Nothing,
            }
        } else if id >= 3 {
            Followup::Roster(
                inner
                    .clients
                    .range(..id)
                    .map(|(_, c)| RosterEntry {
                        id: c.id,
                        peer: c.relay.clone(),
                        name: c.name.clone(),
                    })
                    .collect(),
            )
        } else {
            Followup::Nothing
        };

        Registration { id, name, followup }
    }

    /// Remove a record and return its identity to the pool.
    pub async fn remove(&self, id: ClientId) -> Option<ClientRecord> {
        let mut inner = self.inner.lock().await;
        let record = inner.clients.remove(&id)?;
        inner.pool.release(id);
        Some(record)
    }

    pub async fn lookup(&self, id: ClientId) -> Option<Contact> {
        let inner = self.inner.lock().await;
        inner.clients.get(&id).map(|c| Contact {
            outbox: c.outbox.clone(),
            relay: c.relay.clone(),
        })
    }

    pub async fn contains(&self, id: ClientId) -> bool {
        self.inner.lock().await.clients.contains_key(&id)
    }

    /// Outboxes of every registered connection.
    pub async fn broadcast_targets(&self) -> Vec<Outbox> {
        let inner = self.inner.lock().await;
        inner.clients.values().map(|c| c.outbox.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Queue a pre-encoded line on one outbox, counting the outcome.
    pub fn deliver(&self, outbox: &Outbox, line: Arc<str>) -> Result<(), DeliveryError> {
        let result = outbox.push(line);
        match result {
            Ok(()) => self.stats.lines_sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.lines_dropped.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Queue a pre-encoded line on every registered connection.
    ///
    /// Best-effort: a full or closed outbox drops the line for that peer only.
    pub async fn fan_out(&self, line: Arc<str>) -> FanOut {
        let targets = self.broadcast_targets().await;
        let mut result = FanOut::default();
        for outbox in &targets {
            match self.deliver(outbox, line.clone()) {
                Ok(()) => result.delivered += 1,
                Err(_) => result.dropped += 1,
            }
        }
        result
    }

    pub async fn stats(&self) -> TableStats {
        TableStats {
            registered: self.len().await,
            lines_sent: self.stats.lines_sent.load(Ordering::Relaxed),
            lines_dropped: self.stats.lines_dropped.load(Ordering::Relaxed),
        }
    }
}
