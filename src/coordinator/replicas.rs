use dashmap::DashMap;

use crate::discovery::types::StorageNodeAddress;

/// Where copies of each part live besides its primary node.
///
/// Fed only by `REPLICATION_INFO` reports from storage nodes. Kept in memory; a
/// coordinator restart forgets every replica.
#[derive(Default)]
pub struct ReplicationRegistry {
    replicas: DashMap<String, Vec<StorageNodeAddress>>,
}

impl ReplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a replica. Returns `false` if it was already known.
    pub fn record(&self, part_name: &str, node: StorageNodeAddress) -> bool {
        let mut nodes = self.replicas.entry(part_name.to_string()).or_default();
        if nodes.contains(&node) {
            return false;
        }
        nodes.push(node);
        true
    }

    /// Replicas of a part, in the order they were reported.
    pub fn replicas_of(&self, part_name: &str) -> Vec<StorageNodeAddress> {
        self.replicas
            .get(part_name)
            .map(|nodes| nodes.clone())
            .unwrap_or_default()
    }

    /// Drops every replica of a part and returns them.
    pub fn forget(&self, part_name: &str) -> Vec<StorageNodeAddress> {
        self.replicas
            .remove(part_name)
            .map(|(_, nodes)| nodes)
            .unwrap_or_default()
    }

    /// Number of parts with at least one replica.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}
