//! Load-balancing outbound group with latency tiers.
//!
//! A [`LoadBalance`] group probes its members against a canary URL on a
//! background ticker, keeps the top-N lowest-latency members of each tier
//! as candidates, and dispatches each connection to one of them, either
//! uniformly at random or by consistent hash over a key extracted from the
//! connection's metadata. Tier selection runs through a hysteresis FSM so
//! a flapping primary tier does not bounce traffic.
//!
//! Candidate sets are published as immutable snapshots behind a lock that
//! only the prober writes; a dispatch call clones the current `Arc` once
//! and never observes a half-updated state.

mod candidate;
pub mod hysteresis;

pub use hysteresis::{Tier, TierState};

use crate::adapter::{BoxPacketConn, IoStream, Outbound, OutboundGroup, OutboundRegistry};
use crate::context::InboundContext;
use crate::error::DispatchError;
use crate::hashkey::{self, KeyPart};
use crate::history::{HistoryStore, UrlTestHistory};
use crate::interrupt::InterruptGroup;
use crate::pause::PauseManager;
use crate::ring::{self, HashRing};
use crate::types::{Endpoint, Network};
use crate::urltest;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use sy_config::{
    ConfigError, EmptyPoolAction, HysteresisConfig, LoadBalanceConfig, OnEmptyKey, Strategy,
};
use tokio_util::sync::CancellationToken;

const URLTEST_BATCH_SIZE: usize = 10;

/// Immutable view of the candidate pools, published whole after every
/// probe round.
pub struct CandidateSnapshot {
    pub primary: Vec<Arc<dyn Outbound>>,
    pub backup: Vec<Arc<dyn Outbound>>,
    pub active_tier: Tier,
    /// Present only for the consistent-hash strategy; its members are the
    /// active tier's candidate tags.
    pub ring: Option<Arc<HashRing>>,
}

impl CandidateSnapshot {
    /// Candidates of the active tier, falling through to backup when the
    /// primary list is empty.
    fn active_candidates(&self) -> &[Arc<dyn Outbound>] {
        if self.active_tier == Tier::Primary && !self.primary.is_empty() {
            &self.primary
        } else {
            &self.backup
        }
    }
}

/// URL-test driven load balancing over primary and backup member tiers.
pub struct LoadBalance {
    tag: String,
    registry: Arc<OutboundRegistry>,
    history: Arc<HistoryStore>,
    pause: Option<Arc<dyn PauseManager>>,

    primary_tags: Vec<String>,
    backup_tags: Vec<String>,
    url: String,
    interval: Duration,
    timeout: Duration,
    idle_timeout: Duration,
    top_n_primary: usize,
    top_n_backup: usize,
    strategy: Strategy,
    empty_pool_action: EmptyPoolAction,
    hash_key_parts: Vec<KeyPart>,
    hash_virtual_nodes: usize,
    hash_on_empty_key: OnEmptyKey,
    hash_key_salt: String,
    hysteresis: HysteresisConfig,
    interrupt_group: Option<InterruptGroup>,

    snapshot: RwLock<Option<Arc<CandidateSnapshot>>>,
    tier: Mutex<TierState>,
    checking: AtomicBool,
    last_dispatch: Mutex<Instant>,
    ticker_running: AtomicBool,
    shutdown: CancellationToken,
    weak: Weak<LoadBalance>,
}

impl LoadBalance {
    /// Construct a group with a private history store and no pause
    /// manager.
    pub fn new(
        tag: impl Into<String>,
        config: LoadBalanceConfig,
        registry: Arc<OutboundRegistry>,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_services(tag, config, registry, Arc::new(HistoryStore::new()), None)
    }

    /// Construct a group wired to a shared history store and pause
    /// manager.
    pub fn with_services(
        tag: impl Into<String>,
        config: LoadBalanceConfig,
        registry: Arc<OutboundRegistry>,
        history: Arc<HistoryStore>,
        pause: Option<Arc<dyn PauseManager>>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let top_n_backup = config.effective_top_n_backup();
        let hash = config.hash.clone().unwrap_or_default();
        let interrupt_group = config
            .interrupt_exist_connections
            .then(InterruptGroup::new);

        Ok(Arc::new_cyclic(|weak| Self {
            tag: tag.into(),
            registry,
            history,
            pause,
            primary_tags: config.primary_outbounds,
            backup_tags: config.backup_outbounds,
            url: config.url,
            interval: config.interval,
            timeout: config.timeout,
            idle_timeout: config.idle_timeout,
            top_n_primary: config.top_n.primary,
            top_n_backup,
            strategy: config.strategy,
            empty_pool_action: config.empty_pool_action,
            hash_key_parts: KeyPart::parse_all(&hash.key_parts),
            hash_virtual_nodes: hash.virtual_nodes,
            hash_on_empty_key: hash.on_empty_key,
            hash_key_salt: hash.key_salt,
            hysteresis: config.hysteresis,
            interrupt_group,
            snapshot: RwLock::new(None),
            tier: Mutex::new(TierState::new()),
            checking: AtomicBool::new(false),
            last_dispatch: Mutex::new(Instant::now()),
            ticker_running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            weak: weak.clone(),
        }))
    }

    /// Resolve-time sanity pass over the configured membership.
    pub fn start(&self) {
        for tag in self.primary_tags.iter().chain(self.backup_tags.iter()) {
            if self.registry.lookup(tag).is_none() {
                tracing::warn!(group = %self.tag, outbound = %tag, "configured outbound not found");
            }
        }
    }

    /// Run one synchronous probe round so the first dispatch finds a
    /// snapshot.
    pub async fn post_start(&self) {
        self.check_outbounds().await;
    }

    /// Signal the probe loop to shut down. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// The current candidate snapshot, if a probe round has completed.
    pub fn snapshot(&self) -> Option<Arc<CandidateSnapshot>> {
        self.snapshot.read().clone()
    }

    /// The probe history store backing this group.
    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Probe every configured member once and republish the candidate
    /// snapshot. Reentrant calls while a round is running are skipped.
    pub async fn check_outbounds(&self) {
        if self.checking.swap(true, Ordering::SeqCst) {
            return;
        }
        self.run_probe_round().await;
        self.checking.store(false, Ordering::SeqCst);
    }

    async fn run_probe_round(&self) {
        if let Some(pause) = &self.pause {
            if pause.is_paused() {
                tracing::debug!(group = %self.tag, "paused, skipping health check");
                return;
            }
        }

        let mut outbounds: Vec<Arc<dyn Outbound>> = Vec::new();
        for tag in self.primary_tags.iter().chain(self.backup_tags.iter()) {
            match self.registry.lookup(tag) {
                Some(outbound) => outbounds.push(outbound),
                None => {
                    tracing::error!(group = %self.tag, outbound = %tag, "outbound not found")
                }
            }
        }
        if outbounds.is_empty() {
            return;
        }

        for batch in outbounds.chunks(URLTEST_BATCH_SIZE) {
            futures::future::join_all(batch.iter().map(|outbound| async move {
                match urltest::url_test(outbound.as_ref(), &self.url, self.timeout).await {
                    Ok(delay) => {
                        self.history.store(
                            outbound.tag(),
                            UrlTestHistory {
                                time: Instant::now(),
                                delay,
                            },
                        );
                        tracing::debug!(
                            group = %self.tag,
                            proxy = %outbound.tag(),
                            delay_ms = delay,
                            "health check ok"
                        );
                    }
                    Err(error) => {
                        tracing::debug!(
                            group = %self.tag,
                            proxy = %outbound.tag(),
                            error = %error,
                            "health check failed"
                        );
                    }
                }
            }))
            .await;
        }

        self.update_candidates();
    }

    /// Rebuild candidate pools from current histories and publish a new
    /// snapshot. Runs only on the prober path.
    fn update_candidates(&self) {
        let stale_after = self.interval * 2;
        let primary_stats = candidate::collect_tier_stats(
            &self.primary_tags,
            &self.history,
            &self.registry,
            stale_after,
        );
        let backup_stats = candidate::collect_tier_stats(
            &self.backup_tags,
            &self.history,
            &self.registry,
            stale_after,
        );
        let primary = candidate::select_top_n(&primary_stats, self.top_n_primary, &self.registry);
        let backup = candidate::select_top_n(&backup_stats, self.top_n_backup, &self.registry);

        let tier_state = {
            let mut tier = self.tier.lock();
            let next = hysteresis::step(
                &tier,
                !primary.is_empty(),
                !backup.is_empty(),
                Instant::now(),
                &self.hysteresis,
            );
            *tier = next.clone();
            next
        };

        let previous = self.snapshot.read().clone();

        let ring = if self.strategy == Strategy::ConsistentHash {
            let members: Vec<String> = {
                let active: &[Arc<dyn Outbound>] =
                    if tier_state.active_tier == Tier::Primary && !primary.is_empty() {
                        &primary
                    } else {
                        &backup
                    };
                active.iter().map(|o| o.tag().to_string()).collect()
            };
            if members.is_empty() {
                None
            } else {
                match previous.as_ref().and_then(|s| s.ring.clone()) {
                    Some(old) if old.same_membership(&members) => Some(old),
                    _ => Some(Arc::new(HashRing::new(&members, self.hash_virtual_nodes))),
                }
            }
        } else {
            None
        };

        let snapshot = Arc::new(CandidateSnapshot {
            primary,
            backup,
            active_tier: tier_state.active_tier,
            ring,
        });
        *self.snapshot.write() = Some(snapshot.clone());

        if let Some(previous) = &previous {
            if previous.active_tier != snapshot.active_tier {
                tracing::info!(
                    group = %self.tag,
                    from = %previous.active_tier,
                    to = %snapshot.active_tier,
                    primary_candidates = snapshot.primary.len(),
                    backup_candidates = snapshot.backup.len(),
                    "tier switch"
                );
                if let Some(group) = &self.interrupt_group {
                    group.interrupt();
                }
            }
        }

        self.log_candidates("primary", &snapshot.primary, &primary_stats);
        self.log_candidates("backup", &snapshot.backup, &backup_stats);
    }

    fn log_candidates(
        &self,
        tier_name: &str,
        candidates: &[Arc<dyn Outbound>],
        stats: &[candidate::NodeStat],
    ) {
        if candidates.is_empty() {
            tracing::debug!(group = %self.tag, tier = tier_name, "0 candidates");
            return;
        }
        let summary = candidates
            .iter()
            .map(|c| {
                let delay = stats
                    .iter()
                    .find(|s| s.tag == c.tag() && !s.failed)
                    .map(|s| s.delay)
                    .unwrap_or(0);
                format!("{}({}ms)", c.tag(), delay)
            })
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(
            group = %self.tag,
            tier = tier_name,
            count = candidates.len(),
            candidates = %summary,
            "tier candidates"
        );
    }

    /// Record dispatch activity and make sure the probe ticker is running
    /// (it suspends itself after `idle_timeout` without dispatches).
    fn touch(&self) {
        *self.last_dispatch.lock() = Instant::now();
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.ticker_running.swap(true, Ordering::SeqCst) {
            match self.weak.upgrade() {
                Some(this) => {
                    tokio::spawn(async move { this.probe_loop().await });
                }
                None => self.ticker_running.store(false, Ordering::SeqCst),
            }
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        tracing::debug!(group = %self.tag, "health check ticker started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if !self.idle_timeout.is_zero()
                        && self.last_dispatch.lock().elapsed() >= self.idle_timeout
                    {
                        tracing::debug!(group = %self.tag, "no recent dispatches, suspending health checks");
                        break;
                    }
                    let this = self.clone();
                    tokio::spawn(async move { this.check_outbounds().await });
                }
            }
        }
        self.ticker_running.store(false, Ordering::SeqCst);
    }

    /// Pick the upstream for one connection.
    fn select_outbound(
        &self,
        network: Network,
        metadata: &InboundContext,
    ) -> Result<Arc<dyn Outbound>, DispatchError> {
        self.touch();

        let snapshot = self
            .snapshot
            .read()
            .clone()
            .ok_or(DispatchError::NotInitialized)?;

        let mut candidates: Vec<Arc<dyn Outbound>> = snapshot.active_candidates().to_vec();
        if candidates.is_empty() {
            match self.empty_pool_action {
                EmptyPoolAction::Error => return Err(DispatchError::NoHealthyCandidates),
                EmptyPoolAction::FallbackAll => {
                    tracing::warn!(
                        group = %self.tag,
                        "both tiers empty, falling back to all configured outbounds"
                    );
                    candidates = self
                        .primary_tags
                        .iter()
                        .chain(self.backup_tags.iter())
                        .filter_map(|tag| self.registry.lookup(tag))
                        .collect();
                }
            }
        }

        let network_candidates: Vec<Arc<dyn Outbound>> = candidates
            .into_iter()
            .filter(|c| c.network().contains(&network))
            .collect();
        if network_candidates.is_empty() {
            return Err(DispatchError::NoCandidatesForNetwork(network));
        }

        let selected = match self.strategy {
            Strategy::Random => {
                let selected = pick_random(&network_candidates);
                tracing::debug!(
                    group = %self.tag,
                    tier = %snapshot.active_tier,
                    selected = %selected.tag(),
                    pool_size = network_candidates.len(),
                    "random selection"
                );
                selected
            }
            Strategy::ConsistentHash => {
                self.pick_consistent_hash(&snapshot, &network_candidates, metadata)
            }
        };
        Ok(selected)
    }

    fn pick_consistent_hash(
        &self,
        snapshot: &CandidateSnapshot,
        network_candidates: &[Arc<dyn Outbound>],
        metadata: &InboundContext,
    ) -> Arc<dyn Outbound> {
        let ring = match &snapshot.ring {
            Some(ring) if !ring.is_empty() => ring,
            _ => {
                tracing::warn!(group = %self.tag, "hash ring not available, using random selection");
                return pick_random(network_candidates);
            }
        };

        let key = hashkey::build_hash_key(metadata, &self.hash_key_parts, &self.hash_key_salt);
        let key_hash = if key.is_empty() {
            match self.hash_on_empty_key {
                OnEmptyKey::Random => {
                    tracing::debug!(group = %self.tag, "empty hash key, using random selection");
                    return pick_random(network_candidates);
                }
                OnEmptyKey::HashEmpty => ring::hash_key(""),
            }
        } else {
            ring::hash_key(&key)
        };

        let target = ring
            .lookup(key_hash)
            .and_then(|tag| network_candidates.iter().find(|c| c.tag() == tag).cloned());
        match target {
            Some(selected) => {
                tracing::debug!(
                    group = %self.tag,
                    tier = %snapshot.active_tier,
                    key = %key,
                    key_hash,
                    selected = %selected.tag(),
                    "consistent hash selection"
                );
                selected
            }
            None => {
                // Ring member not capable of this network.
                tracing::debug!(
                    group = %self.tag,
                    "hash target not in network candidates, using random selection"
                );
                pick_random(network_candidates)
            }
        }
    }

    /// Dispatch one stream connection through the selected upstream.
    pub async fn dial(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Endpoint,
    ) -> Result<IoStream, DispatchError> {
        let selected = self.select_outbound(network, ctx)?;
        let conn = selected
            .dial(ctx, network, destination)
            .await
            .map_err(DispatchError::UpstreamDialFailed)?;
        Ok(match &self.interrupt_group {
            Some(group) => group.wrap_stream(conn),
            None => conn,
        })
    }

    /// Dispatch one packet session through the selected upstream.
    pub async fn listen_packet(
        &self,
        ctx: &InboundContext,
        destination: &Endpoint,
    ) -> Result<BoxPacketConn, DispatchError> {
        let selected = self.select_outbound(Network::Udp, ctx)?;
        let conn = selected
            .listen_packet(ctx, destination)
            .await
            .map_err(DispatchError::UpstreamDialFailed)?;
        Ok(match &self.interrupt_group {
            Some(group) => group.wrap_packet(conn),
            None => conn,
        })
    }
}

fn pick_random(candidates: &[Arc<dyn Outbound>]) -> Arc<dyn Outbound> {
    candidates[fastrand::usize(0..candidates.len())].clone()
}

#[async_trait]
impl Outbound for LoadBalance {
    fn tag(&self) -> &str {
        &self.tag
    }

    /// Intersection of the active candidates' networks; both networks
    /// before the first snapshot.
    fn network(&self) -> Vec<Network> {
        let Some(snapshot) = self.snapshot.read().clone() else {
            return vec![Network::Tcp, Network::Udp];
        };
        let candidates = snapshot.active_candidates();
        if candidates.is_empty() {
            return vec![Network::Tcp, Network::Udp];
        }
        [Network::Tcp, Network::Udp]
            .into_iter()
            .filter(|network| candidates.iter().all(|c| c.network().contains(network)))
            .collect()
    }

    async fn dial(
        &self,
        ctx: &InboundContext,
        network: Network,
        destination: &Endpoint,
    ) -> io::Result<IoStream> {
        LoadBalance::dial(self, ctx, network, destination)
            .await
            .map_err(Into::into)
    }

    async fn listen_packet(
        &self,
        ctx: &InboundContext,
        destination: &Endpoint,
    ) -> io::Result<BoxPacketConn> {
        LoadBalance::listen_packet(self, ctx, destination)
            .await
            .map_err(Into::into)
    }
}

impl OutboundGroup for LoadBalance {
    fn now_tag(&self) -> String {
        match self.snapshot.read().as_ref() {
            Some(snapshot) => snapshot
                .active_candidates()
                .first()
                .map(|c| c.tag().to_string())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    fn all_tags(&self) -> Vec<String> {
        self.primary_tags
            .iter()
            .chain(self.backup_tags.iter())
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for LoadBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalance")
            .field("tag", &self.tag)
            .field("primary", &self.primary_tags)
            .field("backup", &self.backup_tags)
            .field("strategy", &self.strategy)
            .finish()
    }
}
