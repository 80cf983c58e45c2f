//! # Discovery Plugin and XOR-Metric Routing
//!
//! Kademlia-style peer discovery hardened with S/Kademlia admission:
//!
//! - **Routing table**: 256 k-buckets indexed by the prefix length of the
//!   XOR distance between the local id and the peer id. Each bucket is an
//!   LRU list of up to `bucket_size` identities.
//! - **Discovery plugin**: handles PING / PONG / LOOKUP_NODE_REQUEST /
//!   LOOKUP_NODE_RESPONSE, keeps the table fresh from message traffic, and
//!   rejects senders failing the cryptopuzzle admission check when
//!   enforcement is on.
//! - **Iterative FIND_NODE**: α-bounded fan-out toward a target id,
//!   tolerant of slow and absent peers.
//!
//! ## Bucket Organization
//!
//! ```text
//! Bucket 0:   distance has 0 leading zeros (furthest, 50% of keyspace)
//! Bucket 1:   distance has 1 leading zero  (25% of keyspace)
//! ...
//! Bucket 255: distance has 255 leading zeros (closest)
//! ```
//!
//! ## Full-Bucket Policy
//!
//! A full bucket does not admit a new peer outright. `update` hands back a
//! [`PendingEviction`]; the plugin pings the least-recently-seen occupant
//! with the lookup timeout and applies the result: a live tail is refreshed
//! and the candidate discarded, a dead tail is evicted and the candidate
//! admitted.
//!
//! ## Concurrency
//!
//! Each bucket sits behind its own mutex, so updates to a single bucket are
//! linearizable while `find_closest_peers` observes a consistent snapshot
//! per bucket (not across buckets). The plugin itself is a cheaply clonable
//! handle; a `watch` channel carries the cancellation signal into in-flight
//! lookups and any task holding a [`Discovery::cancellation`] receiver.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

use crate::hashing;
use crate::identity::{is_peer_valid, is_valid_dynamic, NodeId, DEFAULT_C1, DEFAULT_C2};
use crate::messages::DiscoveryMessage;
use crate::protocols::DiscoveryRpc;

/// Max entries per k-bucket and the default lookup width (K).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Default lookup fan-out (α).
pub const DEFAULT_ALPHA: usize = 8;

/// Number of distance buckets, one per possible prefix length of a 256-bit
/// identifier.
const BUCKET_COUNT: usize = 256;

/// Default per-request timeout during lookups and eviction probes.
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// K-Buckets and Routing Table
// ============================================================================

#[derive(Debug, Default)]
struct Bucket {
    /// Front = most-recently-seen, back = least-recently-seen.
    peers: VecDeque<NodeId>,
}

#[derive(Debug)]
enum BucketUpdate {
    Inserted,
    Refreshed,
    Full { candidate: NodeId, oldest: NodeId },
}

impl Bucket {
    fn update(&mut self, peer: NodeId, capacity: usize) -> BucketUpdate {
        if let Some(pos) = self.peers.iter().position(|p| p.id == peer.id) {
            self.peers.remove(pos);
            self.peers.push_front(peer);
            return BucketUpdate::Refreshed;
        }

        if self.peers.len() < capacity {
            self.peers.push_front(peer);
            return BucketUpdate::Inserted;
        }

        match self.peers.back() {
            Some(oldest) => BucketUpdate::Full {
                candidate: peer,
                oldest: oldest.clone(),
            },
            // A full bucket is never empty at positive capacity.
            None => BucketUpdate::Inserted,
        }
    }

    fn refresh(&mut self, id: &[u8]) {
        if let Some(pos) = self.peers.iter().position(|p| p.id == id) {
            if let Some(peer) = self.peers.remove(pos) {
                self.peers.push_front(peer);
            }
        }
    }

    fn remove(&mut self, id: &[u8]) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p.id == id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }

    fn contains(&self, id: &[u8]) -> bool {
        self.peers.iter().any(|p| p.id == id)
    }
}

/// A full bucket waiting on a liveness probe of its least-recently-seen
/// occupant before deciding the fate of a new candidate.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    bucket: usize,
    oldest: NodeId,
    candidate: NodeId,
}

impl PendingEviction {
    /// The least-recently-seen occupant to probe.
    pub fn oldest(&self) -> &NodeId {
        &self.oldest
    }

    /// The peer waiting for a slot.
    pub fn candidate(&self) -> &NodeId {
        &self.candidate
    }
}

/// Result of folding a peer into the routing table.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The peer was the local node or had an unusable id; nothing changed.
    Ignored,
    Inserted,
    /// Already present; moved to the bucket front.
    Refreshed,
    /// The target bucket is full; resolve via a liveness probe and
    /// [`RoutingTable::apply_eviction_probe`].
    Full(PendingEviction),
}

/// 256 k-buckets of peer identities around one local node.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, bucket_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(Mutex::new(Bucket::default()));
        }
        Self {
            self_id,
            bucket_size,
            buckets,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    fn lock_bucket(&self, index: usize) -> MutexGuard<'_, Bucket> {
        self.buckets[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bucket index for a peer: prefix length of `self.id ⊕ peer.id`.
    /// `None` when the peer's id width does not match the local id.
    fn bucket_index(&self, id: &[u8]) -> Option<usize> {
        let distance = hashing::xor(&self.self_id.id, id).ok()?;
        Some(hashing::leading_zero_bits(&distance).min(BUCKET_COUNT - 1))
    }

    /// Fold a peer into its bucket. The local node is never inserted.
    pub fn update(&self, peer: NodeId) -> UpdateOutcome {
        if peer.id == self.self_id.id || self.bucket_size == 0 {
            return UpdateOutcome::Ignored;
        }
        let Some(index) = self.bucket_index(&peer.id) else {
            debug!(peer = ?peer, "ignoring peer with unusable id width");
            return UpdateOutcome::Ignored;
        };
        match self.lock_bucket(index).update(peer, self.bucket_size) {
            BucketUpdate::Inserted => UpdateOutcome::Inserted,
            BucketUpdate::Refreshed => UpdateOutcome::Refreshed,
            BucketUpdate::Full { candidate, oldest } => UpdateOutcome::Full(PendingEviction {
                bucket: index,
                oldest,
                candidate,
            }),
        }
    }

    /// Resolve a full-bucket probe. A live tail is refreshed and the
    /// candidate discarded; a dead tail is evicted and the candidate
    /// admitted if a slot is still free.
    pub fn apply_eviction_probe(&self, pending: PendingEviction, oldest_alive: bool) {
        let mut bucket = self.lock_bucket(pending.bucket);
        if oldest_alive {
            bucket.refresh(&pending.oldest.id);
            return;
        }

        bucket.remove(&pending.oldest.id);
        if !bucket.contains(&pending.candidate.id) && bucket.peers.len() < self.bucket_size {
            bucket.peers.push_front(pending.candidate);
        }
    }

    pub fn peer_exists(&self, peer: &NodeId) -> bool {
        self.bucket_index(&peer.id)
            .map(|index| self.lock_bucket(index).contains(&peer.id))
            .unwrap_or(false)
    }

    pub fn remove_peer(&self, peer: &NodeId) -> bool {
        self.bucket_index(&peer.id)
            .map(|index| self.lock_bucket(index).remove(&peer.id))
            .unwrap_or(false)
    }

    /// Addresses of every peer currently in the table, in no particular
    /// order.
    pub fn get_peer_addresses(&self) -> Vec<String> {
        let mut addresses = Vec::new();
        for index in 0..BUCKET_COUNT {
            let bucket = self.lock_bucket(index);
            addresses.extend(bucket.peers.iter().map(|p| p.address.clone()));
        }
        addresses
    }

    /// Up to `n` peers minimizing the XOR distance to `target`, ascending.
    ///
    /// Collection starts at the target's bucket and expands outward until
    /// `n` candidates are gathered or every bucket has been visited; the
    /// final order is a stable sort of the collected candidates by distance
    /// with ties broken on id. The local node is never included.
    pub fn find_closest_peers(&self, target: &NodeId, n: usize) -> Vec<NodeId> {
        if n == 0 {
            return Vec::new();
        }

        let center = match hashing::xor(&self.self_id.id, &target.id) {
            Ok(distance) => hashing::leading_zero_bits(&distance).min(BUCKET_COUNT - 1),
            Err(_) => 0,
        };

        let mut collected = Vec::new();
        self.collect_bucket(center, &mut collected);

        let (mut low, mut high) = (center, center);
        while collected.len() < n && (low > 0 || high + 1 < BUCKET_COUNT) {
            if low > 0 {
                low -= 1;
                self.collect_bucket(low, &mut collected);
            }
            if collected.len() < n && high + 1 < BUCKET_COUNT {
                high += 1;
                self.collect_bucket(high, &mut collected);
            }
        }

        let mut keyed: Vec<(Vec<u8>, NodeId)> = collected
            .into_iter()
            .filter_map(|peer| {
                hashing::xor(&target.id, &peer.id)
                    .ok()
                    .map(|distance| (distance, peer))
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        keyed.truncate(n);
        keyed.into_iter().map(|(_, peer)| peer).collect()
    }

    fn collect_bucket(&self, index: usize, out: &mut Vec<NodeId>) {
        let bucket = self.lock_bucket(index);
        out.extend(bucket.peers.iter().cloned());
    }
}

// ============================================================================
// Discovery Plugin
// ============================================================================

/// Tunables for one discovery plugin instance.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Max entries per k-bucket and the default lookup width (K).
    pub bucket_size: usize,
    /// Concurrent outstanding requests per lookup round (α).
    pub alpha: usize,
    /// Static puzzle difficulty: leading zero bits of `H(pk)`.
    pub c1: usize,
    /// Dynamic puzzle difficulty for the handshake check.
    pub c2: usize,
    pub disable_ping: bool,
    pub disable_pong: bool,
    pub disable_lookup: bool,
    /// Reject incoming messages from senders failing the S/Kademlia
    /// admission check.
    pub enforce_skademlia_ids: bool,
    /// Per-request timeout during iterative lookups and eviction probes.
    pub lookup_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            c1: DEFAULT_C1,
            c2: DEFAULT_C2,
            disable_ping: false,
            disable_pong: false,
            disable_lookup: false,
            enforce_skademlia_ids: false,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

/// The sender of an incoming message failed admission.
#[derive(Clone, Debug)]
pub enum DiscoveryError {
    InvalidPeer { peer: NodeId },
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::InvalidPeer { peer } => {
                write!(f, "sender {peer} is not a valid node id")
            }
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// The discovery protocol state machine around one routing table.
///
/// Cheap to clone; all clones share the table and the cancellation signal.
pub struct Discovery<N: DiscoveryRpc> {
    config: DiscoveryConfig,
    routes: Arc<RoutingTable>,
    network: Arc<N>,
    cancel: watch::Sender<bool>,
}

impl<N: DiscoveryRpc> Clone for Discovery<N> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            routes: self.routes.clone(),
            network: self.network.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<N: DiscoveryRpc> Discovery<N> {
    /// Build the plugin around a fresh routing table for `self_id`.
    pub fn new(self_id: NodeId, network: N, config: DiscoveryConfig) -> Self {
        let routes = Arc::new(RoutingTable::new(self_id, config.bucket_size));
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            routes,
            network: Arc::new(network),
            cancel,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    /// Cancellation receiver for tasks that outlive this handle, such as
    /// accept loops.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Raise the cancellation signal. In-flight lookups abandon their
    /// outstanding requests and return their best current answer.
    pub fn shutdown(&self) {
        self.cancel.send_replace(true);
    }

    /// Dynamic-puzzle check for the higher-level handshake, at this
    /// plugin's configured difficulty.
    pub fn verify_dynamic_puzzle(&self, peer: &NodeId, nonce: &[u8]) -> bool {
        is_valid_dynamic(&peer.public_key, nonce, self.config.c2)
    }

    /// Fold a peer into the routing table, resolving a full bucket with a
    /// background liveness probe of the bucket's least-recently-seen
    /// occupant.
    pub fn update_routes(&self, peer: NodeId) {
        if let UpdateOutcome::Full(pending) = self.routes.update(peer) {
            let routes = self.routes.clone();
            let network = self.network.clone();
            let probe_timeout = self.config.lookup_timeout;
            tokio::spawn(async move {
                let alive =
                    tokio::time::timeout(probe_timeout, network.ping(pending.oldest()))
                        .await
                        .map(|r| r.is_ok())
                        .unwrap_or(false);
                routes.apply_eviction_probe(pending, alive);
            });
        }
    }

    /// Handle one decoded incoming message.
    ///
    /// Every accepted message refreshes the sender's routing table entry
    /// first; the returned reply, if any, is sent by the transport layer on
    /// the inbound connection. Senders failing admission are rejected
    /// before the table is touched.
    pub async fn on_receive(
        &self,
        sender: &NodeId,
        message: DiscoveryMessage,
    ) -> Result<Option<DiscoveryMessage>, DiscoveryError> {
        if self.config.enforce_skademlia_ids && !is_peer_valid(sender, self.config.c1) {
            return Err(DiscoveryError::InvalidPeer {
                peer: sender.clone(),
            });
        }
        self.update_routes(sender.clone());

        match message {
            DiscoveryMessage::Ping => {
                if self.config.disable_ping {
                    return Ok(None);
                }
                Ok(Some(DiscoveryMessage::Pong))
            }
            DiscoveryMessage::Pong => {
                if self.config.disable_pong {
                    return Ok(None);
                }
                let peers = self
                    .find_node(sender, self.config.bucket_size, self.config.alpha)
                    .await;
                for peer in peers {
                    self.update_routes(peer);
                }
                debug!(peers = ?self.routes.get_peer_addresses(), "bootstrapped w/ peer(s)");
                Ok(None)
            }
            DiscoveryMessage::LookupNodeRequest { target } => {
                if self.config.disable_lookup {
                    return Ok(None);
                }
                let peers = self
                    .routes
                    .find_closest_peers(&target, self.config.bucket_size);
                debug!(peers = ?self.routes.get_peer_addresses(), "answered node lookup");
                Ok(Some(DiscoveryMessage::LookupNodeResponse { peers }))
            }
            // Responses are consumed by the transport's request/response
            // correlation; one arriving here has no outstanding request.
            DiscoveryMessage::LookupNodeResponse { .. } => Ok(None),
        }
    }

    /// Drop a disconnected peer from the routing table.
    pub fn on_peer_disconnect(&self, peer: &NodeId) {
        if self.routes.peer_exists(peer) {
            self.routes.remove_peer(peer);
            debug!(
                address = %self.routes.self_id().address,
                peer_address = %peer.address,
                "peer has disconnected"
            );
        }
    }

    /// Join the network through known seed peers: ping each seed and pull
    /// its neighborhood into the routing table.
    pub async fn bootstrap(&self, seeds: &[NodeId]) {
        for seed in seeds {
            if seed.id == self.routes.self_id().id {
                continue;
            }
            self.update_routes(seed.clone());
            match self.network.ping(seed).await {
                Ok(()) => {
                    let peers = self
                        .find_node(seed, self.config.bucket_size, self.config.alpha)
                        .await;
                    for peer in peers {
                        self.update_routes(peer);
                    }
                }
                Err(error) => {
                    debug!(peer = %seed.address, %error, "bootstrap ping failed");
                }
            }
        }
        debug!(peers = ?self.routes.get_peer_addresses(), "bootstrapped w/ peer(s)");
    }

    /// Iterative FIND_NODE: converge on the `k` peers closest to `target`.
    ///
    /// Seeds a shortlist with the `alpha` table-closest peers, then runs
    /// rounds of at most `alpha` concurrent lookup requests against the
    /// closest unqueried candidates. Peers that error or exceed the lookup
    /// timeout are marked failed for this invocation only — they are
    /// excluded from the result but stay in the routing table. The loop
    /// ends when a round fails to improve the best known distance, every
    /// candidate has been queried, or the plugin is cancelled.
    pub async fn find_node(&self, target: &NodeId, k: usize, alpha: usize) -> Vec<NodeId> {
        let fan_out = alpha.max(1);
        let self_id = self.routes.self_id().id.clone();
        let mut cancelled = self.cancel.subscribe();

        let mut candidates = self.routes.find_closest_peers(target, fan_out);
        let mut seen: HashSet<Vec<u8>> = candidates.iter().map(|p| p.id.clone()).collect();
        seen.insert(self_id.clone());
        let mut queried: HashSet<Vec<u8>> = HashSet::new();
        let mut failed: HashSet<Vec<u8>> = HashSet::new();

        let mut best = best_distance(&candidates, target, &failed);

        'rounds: loop {
            if *cancelled.borrow() {
                break;
            }

            let mut unqueried: Vec<(Vec<u8>, NodeId)> = candidates
                .iter()
                .filter(|p| !queried.contains(&p.id))
                .filter_map(|p| {
                    hashing::xor(&target.id, &p.id)
                        .ok()
                        .map(|distance| (distance, p.clone()))
                })
                .collect();
            unqueried.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

            let round: Vec<NodeId> = unqueried
                .into_iter()
                .take(fan_out)
                .map(|(_, peer)| peer)
                .collect();
            if round.is_empty() {
                break;
            }

            let mut join_set = JoinSet::new();
            for peer in round {
                queried.insert(peer.id.clone());
                let network = self.network.clone();
                let target = target.clone();
                let request_timeout = self.config.lookup_timeout;
                join_set.spawn(async move {
                    let result = tokio::time::timeout(
                        request_timeout,
                        network.lookup_node(&peer, &target),
                    )
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("lookup request timed out")));
                    (peer, result)
                });
            }

            loop {
                tokio::select! {
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            join_set.abort_all();
                            break 'rounds;
                        }
                    }
                    joined = join_set.join_next() => {
                        let Some(joined) = joined else { break };
                        let Ok((peer, result)) = joined else { continue };
                        match result {
                            Ok(found) => {
                                for node in found {
                                    if node.id == self_id {
                                        continue;
                                    }
                                    if seen.insert(node.id.clone()) {
                                        candidates.push(node);
                                    }
                                }
                            }
                            Err(error) => {
                                debug!(peer = %peer.address, %error, "lookup request failed");
                                failed.insert(peer.id.clone());
                            }
                        }
                    }
                }
            }

            let round_best = best_distance(&candidates, target, &failed);
            let improved = match (&best, &round_best) {
                (Some(previous), Some(current)) => current < previous,
                (None, Some(_)) => true,
                _ => false,
            };
            if improved {
                best = round_best;
            } else {
                break;
            }
        }

        let mut keyed: Vec<(Vec<u8>, NodeId)> = candidates
            .into_iter()
            .filter(|p| !failed.contains(&p.id))
            .filter_map(|p| {
                hashing::xor(&target.id, &p.id)
                    .ok()
                    .map(|distance| (distance, p))
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        keyed.truncate(k);
        let closest: Vec<NodeId> = keyed.into_iter().map(|(_, peer)| peer).collect();

        debug!(
            found = closest.len(),
            queried = queried.len(),
            failed = failed.len(),
            "iterative lookup completed"
        );
        closest
    }
}

/// Smallest XOR distance from `target` among non-failed candidates.
fn best_distance(
    candidates: &[NodeId],
    target: &NodeId,
    failed: &HashSet<Vec<u8>>,
) -> Option<Vec<u8>> {
    candidates
        .iter()
        .filter(|p| !failed.contains(&p.id))
        .filter_map(|p| hashing::xor(&target.id, &p.id).ok())
        .min()
}
