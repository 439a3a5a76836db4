//! Cascading proxy election.
//!
//! A newly joined peer receives a roster of every peer with a smaller
//! identity and narrows it tier by tier:
//!
//! | Tier | Score | Timeouts (connect / read) |
//! |------|-------|---------------------------|
//! | 1 | Direct RTT to the candidate's relay (`PING`) | 1 s / 1 s |
//! | 2 | Candidate's own RTT to the registry (`MEASURE_SERVER`) | 2 s / 3 s |
//! | 3 | Full chain RTT through the candidate to the registry | 3 s / 3 s |
//!
//! Only the candidates tied on the best score of a tier move on to the next.
//! A tie that survives all three tiers is broken uniformly at random.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::peer::{PeerShared, ProxyLink};
use crate::protocol::{ClientMessage, ForwardAction, PeerReply, PeerRequest, RelayAddr, RosterEntry};
use crate::relay::RelayClient;

/// Scores closer than this (in milliseconds) count as equal.
pub const TIE_EPSILON_MS: f64 = 1e-6;

/// Election stage that settled the choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    DirectRtt,
    ServerRtt,
    ChainRtt,
    Random,
}

/// Outcome of an election.
#[derive(Debug, Clone, PartialEq)]
pub struct Election {
    pub chosen: RosterEntry,
    pub decided_by: Tier,
}

/// Latency probes used by the election. Scores are in milliseconds and
/// `f64::INFINITY` means unreachable.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn direct_rtt(&self, relay: &RelayAddr) -> f64;
    async fn server_rtt(&self, relay: &RelayAddr) -> f64;
    async fn chain_rtt(&self, relay: &RelayAddr) -> f64;
}

/// Per-tier timeouts of the TCP prober.
#[derive(Debug, Clone)]
pub struct ElectionTimeouts {
    pub direct: Duration,
    pub server_connect: Duration,
    pub server_read: Duration,
    pub chain_connect: Duration,
    pub chain_read: Duration,
}

impl Default for ElectionTimeouts {
    fn default() -> Self {
        Self {
            direct: Duration::from_secs(1),
            server_connect: Duration::from_secs(2),
            server_read: Duration::from_secs(3),
            chain_connect: Duration::from_secs(3),
            chain_read: Duration::from_secs(3),
        }
    }
}

/// Probes candidates over their relay listeners.
#[derive(Debug, Clone, Default)]
pub struct TcpProber {
    pub timeouts: ElectionTimeouts,
}

impl TcpProber {
    pub fn new(timeouts: ElectionTimeouts) -> Self {
        Self { timeouts }
    }

    fn measure_request() -> PeerRequest {
        PeerRequest::ForwardToServer(ForwardAction::MeasureServer {
            req_id: format!("m{}", Uuid::new_v4().simple()),
        })
    }

    /// Run one MEASURE_SERVER exchange; returns the reply and its elapsed time.
    async fn measure(
        &self,
        relay: &RelayAddr,
        connect: Duration,
        read: Duration,
    ) -> Option<(Option<f64>, Duration)> {
        let mut client = match RelayClient::connect(relay, connect).await {
            Ok(client) => client,
            Err(e) => {
                log::debug!("Relay {relay} unreachable: {e}");
                return None;
            }
        };

        let started = Instant::now();
        match client.request(&Self::measure_request(), read).await {
            Ok(PeerReply::ForwardReply { server_rtt_ms, error, .. }) => {
                if let Some(error) = error {
                    log::debug!("Relay {relay} could not measure the registry: {error}");
                }
                Some((server_rtt_ms, started.elapsed()))
            }
            Ok(other) => {
                log::debug!("Relay {relay} answered MEASURE_SERVER with {other:?}");
                None
            }
            Err(e) => {
                log::debug!("MEASURE_SERVER via {relay} failed: {e}");
                None
            }
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[async_trait]
impl Prober for TcpProber {
    async fn direct_rtt(&self, relay: &RelayAddr) -> f64 {
        let wait = self.timeouts.direct;
        let mut client = match RelayClient::connect(relay, wait).await {
            Ok(client) => client,
            Err(e) => {
                log::debug!("Relay {relay} unreachable: {e}");
                return f64::INFINITY;
            }
        };

        let started = Instant::now();
        match client.request(&PeerRequest::Ping, wait).await {
            Ok(_) => millis(started.elapsed()),
            Err(e) => {
                log::debug!("PING to {relay} failed: {e}");
                f64::INFINITY
            }
        }
    }

    async fn server_rtt(&self, relay: &RelayAddr) -> f64 {
        let t = &self.timeouts;
        match self.measure(relay, t.server_connect, t.server_read).await {
            Some((Some(rtt), _)) => rtt,
            _ => f64::INFINITY,
        }
    }

    /// Time of a full MEASURE_SERVER exchange. A reply carrying an error scores +∞.
    async fn chain_rtt(&self, relay: &RelayAddr) -> f64 {
        let t = &self.timeouts;
        match self.measure(relay, t.chain_connect, t.chain_read).await {
            Some((Some(_), elapsed)) => millis(elapsed),
            _ => f64::INFINITY,
        }
    }
}

/// Indices of the scores tied for best, in input order.
///
/// NaN counts as unreachable. When nothing is reachable every index is tied.
pub fn tie_set(scores: &[f64]) -> Vec<usize> {
    let norm = |s: f64| if s.is_nan() { f64::INFINITY } else { s };
    let best = scores.iter().copied().map(norm).fold(f64::INFINITY, f64::min);

    if best.is_infinite() {
        return (0..scores.len()).collect();
    }

    scores
        .iter()
        .enumerate()
        .filter(|(_, s)| (norm(**s) - best).abs() < TIE_EPSILON_MS)
        .map(|(i, _)| i)
        .collect()
}

async fn score<P: Prober + ?Sized>(prober: &P, tier: Tier, relay: &RelayAddr) -> f64 {
    match tier {
        Tier::DirectRtt => prober.direct_rtt(relay).await,
        Tier::ServerRtt => prober.server_rtt(relay).await,
        Tier::ChainRtt => prober.chain_rtt(relay).await,
        Tier::Random => f64::INFINITY,
    }
}

/// Pick a proxy from `roster`.
///
/// Returns `None` for an empty roster or when no candidate answers the
/// direct probe.
pub async fn elect<P, R>(prober: &P, roster: &[RosterEntry], rng: &mut R) -> Option<Election>
where
    P: Prober + ?Sized,
    R: Rng + Send + ?Sized,
{
    if roster.is_empty() {
        return None;
    }

    let mut candidates: Vec<&RosterEntry> = roster.iter().collect();

    for tier in [Tier::DirectRtt, Tier::ServerRtt, Tier::ChainRtt] {
        let scores = join_all(candidates.iter().map(|c| score(prober, tier, &c.peer))).await;

        if tier == Tier::DirectRtt && scores.iter().all(|s| !s.is_finite()) {
            log::warn!("No roster candidate answered a direct probe; keeping current route");
            return None;
        }

        let tied = tie_set(&scores);
        log::debug!(
            "{tier:?}: scores {scores:?}, tied {:?}",
            tied.iter().map(|&i| candidates[i].id).collect::<Vec<_>>()
        );

        if let [only] = tied[..] {
            return Some(Election {
                chosen: candidates[only].clone(),
                decided_by: tier,
            });
        }
        candidates = tied.into_iter().map(|i| candidates[i]).collect();
    }

    let chosen = candidates.choose(rng)?;
    Some(Election {
        chosen: (*chosen).clone(),
        decided_by: Tier::Random,
    })
}

/// Elect a proxy from `roster`, adopt it and report it to the registry.
///
/// `generation` is the registry connection the roster arrived on. A result
/// that outlives that connection is discarded.
pub(crate) async fn run(shared: Arc<PeerShared>, roster: Vec<RosterEntry>, generation: u64) {
    log::info!("Electing a proxy among {} peers", roster.len());

    let mut rng = StdRng::from_entropy();
    let Some(Election { chosen, decided_by }) =
        elect(shared.prober.as_ref(), &roster, &mut rng).await
    else {
        return;
    };

    {
        // ASSIGN_ID for a new connection takes this lock too
        let mut state = shared.state.write().await;
        if shared.link.generation() != generation {
            log::info!("Registry connection changed during election; discarding result");
            return;
        }
        state.proxy = Some(ProxyLink {
            id: chosen.id,
            peer: chosen.peer.clone(),
        });
    }

    log::info!(
        "Elected client {} ({}) at {} as proxy by {decided_by:?}",
        chosen.id,
        chosen.name,
        chosen.peer
    );

    if let Err(e) = shared
        .link
        .send(&ClientMessage::Choice { chosen_id: chosen.id })
        .await
    {
        log::warn!("Could not report proxy choice {}: {e}", chosen.id);
    }
}
