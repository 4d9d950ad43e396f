use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::types::StorageNodeAddress;

/// The coordinator's view of the cluster: every storage node address ever learned.
///
/// The persisted file (`host:port` per line) is the source of truth. Addresses are
/// only appended, never evicted; a node that went away is noticed when a send to
/// it fails. The file and the in-memory copy are updated under one lock.
pub struct KnownNodes {
    path: PathBuf,
    nodes: Mutex<Vec<StorageNodeAddress>>,
}

impl KnownNodes {
    /// Opens the node list at `path`. With `reset`, the file is truncated first.
    pub async fn open(path: impl Into<PathBuf>, reset: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        if reset || !tokio::fs::try_exists(&path).await? {
            tokio::fs::write(&path, b"")
                .await
                .with_context(|| format!("resetting node list {}", path.display()))?;
            tracing::info!("Node list {} reset", path.display());
        }

        let nodes = read_node_file(&path).await?;
        tracing::info!("Loaded {} storage node(s) from {}", nodes.len(), path.display());

        Ok(Self {
            path,
            nodes: Mutex::new(nodes),
        })
    }

    /// Records a discovered node.
    ///
    /// Returns `Ok(false)` when the address is already persisted. A new address is
    /// appended to the file and the in-memory list is reloaded from disk.
    pub async fn register(&self, addr: &StorageNodeAddress) -> Result<bool> {
        let mut nodes = self.nodes.lock().await;

        let text = read_node_text(&self.path).await?;
        if parse_node_list(&text).contains(addr) {
            tracing::debug!("Storage node {} already known", addr);
            return Ok(false);
        }

        // A hand-edited file may lack its final newline
        let line = if text.is_empty() || text.ends_with('\n') {
            format!("{}\n", addr)
        } else {
            format!("\n{}\n", addr)
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening node list {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        *nodes = read_node_file(&self.path).await?;
        tracing::info!(
            "Registered storage node {} ({} known)",
            addr,
            nodes.len()
        );

        Ok(true)
    }

    /// Re-reads the persisted file, picking up manual edits.
    pub async fn reload(&self) -> Result<usize> {
        let mut nodes = self.nodes.lock().await;
        *nodes = read_node_file(&self.path).await?;
        Ok(nodes.len())
    }

    /// Current node list, in discovery order.
    pub async fn snapshot(&self) -> Vec<StorageNodeAddress> {
        self.nodes.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.nodes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.lock().await.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn read_node_text(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("reading node list {}", path.display())),
    }
}

async fn read_node_file(path: &Path) -> Result<Vec<StorageNodeAddress>> {
    Ok(parse_node_list(&read_node_text(path).await?))
}

/// Parses a node list, skipping blank or malformed lines and duplicates.
pub fn parse_node_list(text: &str) -> Vec<StorageNodeAddress> {
    let mut nodes: Vec<StorageNodeAddress> = Vec::new();

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match line.parse::<StorageNodeAddress>() {
            Ok(addr) if !nodes.contains(&addr) => nodes.push(addr),
            Ok(addr) => tracing::debug!("Duplicate node list entry {}", addr),
            Err(e) => tracing::warn!("Skipping node list line '{}': {}", line, e),
        }
    }

    nodes
}
