use dashmap::DashSet;
use rand::seq::SliceRandom;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;

use super::client::StorageClient;
use super::part_store::PartStore;
use crate::client::CoordinatorClient;
use crate::config::{ReplicaPolicyKind, ReplicationConfig, TimeoutConfig};
use crate::discovery::types::StorageNodeAddress;

/// Picks the peer that receives this node's copy of a part.
pub trait ReplicaPolicy: Send + Sync {
    fn choose(&self, part_name: &str) -> Option<StorageNodeAddress>;
}

/// Always the first peer.
pub struct FixedPeer {
    peer: Option<StorageNodeAddress>,
}

impl FixedPeer {
    pub fn new(peers: Vec<StorageNodeAddress>) -> Self {
        Self {
            peer: peers.into_iter().next(),
        }
    }
}

impl ReplicaPolicy for FixedPeer {
    fn choose(&self, _part_name: &str) -> Option<StorageNodeAddress> {
        self.peer.clone()
    }
}

pub struct RoundRobinPeers {
    peers: Vec<StorageNodeAddress>,
    next: AtomicUsize,
}

impl RoundRobinPeers {
    pub fn new(peers: Vec<StorageNodeAddress>) -> Self {
        Self {
            peers,
            next: AtomicUsize::new(0),
        }
    }
}

impl ReplicaPolicy for RoundRobinPeers {
    fn choose(&self, _part_name: &str) -> Option<StorageNodeAddress> {
        if self.peers.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.peers.len();
        Some(self.peers[idx].clone())
    }
}

/// Highest-random-weight choice: a part always maps to the same peer while the
/// peer set is unchanged.
pub struct RendezvousPeers {
    peers: Vec<StorageNodeAddress>,
}

impl RendezvousPeers {
    pub fn new(peers: Vec<StorageNodeAddress>) -> Self {
        Self { peers }
    }

    fn weight(part_name: &str, peer: &StorageNodeAddress) -> u64 {
        let mut hasher = DefaultHasher::new();
        part_name.hash(&mut hasher);
        peer.hash(&mut hasher);
        hasher.finish()
    }
}

impl ReplicaPolicy for RendezvousPeers {
    fn choose(&self, part_name: &str) -> Option<StorageNodeAddress> {
        self.peers
            .iter()
            .max_by_key(|peer| Self::weight(part_name, peer))
            .cloned()
    }
}

pub struct RandomPeer {
    peers: Vec<StorageNodeAddress>,
}

impl RandomPeer {
    pub fn new(peers: Vec<StorageNodeAddress>) -> Self {
        Self { peers }
    }
}

impl ReplicaPolicy for RandomPeer {
    fn choose(&self, _part_name: &str) -> Option<StorageNodeAddress> {
        self.peers.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Builds the configured policy over every peer except `own`.
pub fn build_policy(config: &ReplicationConfig, own: &StorageNodeAddress) -> Arc<dyn ReplicaPolicy> {
    let mut peers: Vec<StorageNodeAddress> = Vec::with_capacity(config.peers.len());
    for peer in config.peers.iter() {
        if peer == own {
            tracing::warn!("Ignoring replication peer {}: it is this node", peer);
        } else if !peers.contains(peer) {
            peers.push(peer.clone());
        }
    }

    match config.policy {
        ReplicaPolicyKind::Fixed => Arc::new(FixedPeer::new(peers)),
        ReplicaPolicyKind::RoundRobin => Arc::new(RoundRobinPeers::new(peers)),
        ReplicaPolicyKind::Rendezvous => Arc::new(RendezvousPeers::new(peers)),
        ReplicaPolicyKind::Random => Arc::new(RandomPeer::new(peers)),
    }
}

/// What happened to one replication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// The peer holds a copy and the coordinator knows about it.
    Replicated { peer: StorageNodeAddress },
    /// The peer holds a copy but the coordinator could not be told.
    Unreported { peer: StorageNodeAddress },
    PeerUnreachable { peer: StorageNodeAddress },
    NoPeer,
}

impl fmt::Display for ReplicationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replicated { peer } => write!(f, "replicated to {}", peer),
            Self::Unreported { peer } => write!(f, "copied to {} but not reported", peer),
            Self::PeerUnreachable { peer } => write!(f, "peer {} unreachable", peer),
            Self::NoPeer => write!(f, "no replication peer"),
        }
    }
}

/// Pushes each newly stored part to one peer, once, then tells the coordinator.
///
/// Best-effort: failures are logged and never retried.
pub struct Replicator {
    store: Arc<PartStore>,
    policy: Arc<dyn ReplicaPolicy>,
    client: StorageClient,
    coordinator: StorageNodeAddress,
    timeouts: TimeoutConfig,
    replicated: DashSet<String>,
}

impl Replicator {
    pub fn new(
        store: Arc<PartStore>,
        policy: Arc<dyn ReplicaPolicy>,
        coordinator: StorageNodeAddress,
        timeouts: TimeoutConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            policy,
            client: StorageClient::new(timeouts.clone()),
            coordinator,
            timeouts,
            replicated: DashSet::new(),
        })
    }

    /// Starts replicating `part_name` in the background.
    ///
    /// Returns `None` when this part name was already handed to the replicator.
    pub fn schedule(self: &Arc<Self>, part_name: &str) -> Option<JoinHandle<ReplicationOutcome>> {
        if !self.replicated.insert(part_name.to_string()) {
            tracing::debug!("Part {} already replicated, skipping", part_name);
            return None;
        }

        let replicator = self.clone();
        let part_name = part_name.to_string();
        Some(tokio::spawn(async move {
            let outcome = replicator.replicate(&part_name).await;
            match &outcome {
                ReplicationOutcome::Replicated { .. } => {
                    tracing::info!("Part {}: {}", part_name, outcome)
                }
                _ => tracing::warn!("Part {}: {}", part_name, outcome),
            }
            outcome
        }))
    }

    /// Clears the record of a part, so storing it again replicates again.
    pub fn forget(&self, part_name: &str) -> bool {
        self.replicated.remove(part_name).is_some()
    }

    pub fn is_replicated(&self, part_name: &str) -> bool {
        self.replicated.contains(part_name)
    }

    async fn replicate(&self, part_name: &str) -> ReplicationOutcome {
        let Some(peer) = self.policy.choose(part_name) else {
            return ReplicationOutcome::NoPeer;
        };

        let sent = match self.store.part_path(part_name) {
            Ok(path) => self.client.store_file(&peer, part_name, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::warn!("Replication of {} to {} failed: {}", part_name, peer, e);
            return ReplicationOutcome::PeerUnreachable { peer };
        }

        let reported = async {
            let mut coordinator =
                CoordinatorClient::connect(&self.coordinator, self.timeouts.clone()).await?;
            coordinator.report_replication(part_name, &peer).await
        }
        .await;

        match reported {
            Ok(()) => ReplicationOutcome::Replicated { peer },
            Err(e) => {
                tracing::warn!(
                    "Could not report replica of {} to coordinator {}: {}",
                    part_name,
                    self.coordinator,
                    e
                );
                ReplicationOutcome::Unreported { peer }
            }
        }
    }
}
