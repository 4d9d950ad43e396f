use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::mapping::{MappingEntry, validate_file_name};
use super::server::Coordinator;
use super::splitter::{part_count, part_index, split_file};
use super::types::DistributionReport;
use crate::discovery::types::StorageNodeAddress;
use crate::protocol::codec::{
    copy_exact, read_int, read_size, read_utf, with_deadline, write_size, write_utf,
};
use crate::protocol::commands::{
    DELETE_ERROR_PREFIX, DOWNLOAD_ERROR_PREFIX, DOWNLOAD_PREFIX, FILE_NOT_FOUND,
    INVALID_FILE_NAME_PREFIX, LIST_PREFIX, LIST_SEPARATOR, NO_PARTS_PREFIX,
    REPLICATION_INFO_ACK, REPLICATION_INFO_ERROR_PREFIX, STORE_ERROR_PREFIX, SUCCESS,
};
use crate::storage::client::FetchOutcome;

impl Coordinator {
    async fn reply(&self, stream: &mut TcpStream, message: &str) -> Result<()> {
        with_deadline(self.config.timeouts.io(), write_utf(stream, message)).await
    }

    /// Fresh per-request scratch directory.
    async fn scratch(&self) -> Result<PathBuf> {
        let dir = self.config.scratch_dir().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    async fn discard_scratch(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            tracing::warn!("Failed to clean {}: {}", dir.display(), e);
        }
    }

    // ====== LIST ======

    pub(super) async fn handle_list(&self, stream: &mut TcpStream) -> Result<()> {
        let reply = self.list_reply().await;
        tracing::info!("Sent file list");
        self.reply(stream, &reply).await
    }

    pub async fn list_reply(&self) -> String {
        let names = self.mapping.file_names().await;
        format!("{}{}", LIST_PREFIX, names.join(LIST_SEPARATOR))
    }

    // ====== UPLOAD ======

    pub(super) async fn handle_upload(&self, stream: &mut TcpStream) -> Result<()> {
        let io = self.config.timeouts.io();
        let file_name = with_deadline(io, read_utf(stream)).await?;
        let size = with_deadline(io, read_size(stream)).await?;
        tracing::info!("Receiving {} ({} bytes)", file_name, size);

        if let Err(e) = validate_file_name(&file_name) {
            tracing::warn!("Rejecting upload of '{}': {}", file_name, e);
            copy_exact(stream, &mut tokio::io::sink(), size, io).await?;
            return self
                .reply(stream, &format!("{}{}", INVALID_FILE_NAME_PREFIX, file_name))
                .await;
        }

        let scratch = self.scratch().await?;
        let buffer = scratch.join(format!("{}.upload", Uuid::new_v4()));

        let received = async {
            let mut file = File::create(&buffer).await?;
            copy_exact(stream, &mut file, size, io).await?;
            file.sync_all().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(e) = received {
            self.discard_scratch(&scratch).await;
            // The stream is out of step with the protocol: answer if possible, then close
            if let Err(reply_err) = self
                .reply(stream, &format!("{}{}", STORE_ERROR_PREFIX, e))
                .await
            {
                tracing::debug!("Could not report receive failure: {}", reply_err);
            }
            return Err(e.context(format!("receiving {}", file_name)));
        }

        let distributed = self.distribute(&file_name, &buffer, &scratch).await;
        self.discard_scratch(&scratch).await;

        let reply = match distributed {
            Ok(report) => {
                tracing::info!(
                    "Distributed {}: {}/{} part(s) stored, {} unassigned, {} failed",
                    report.file_name,
                    report.stored,
                    report.planned,
                    report.unassigned,
                    report.failed
                );
                report.reply_message()
            }
            Err(e) => {
                tracing::error!("Distribution of {} failed: {}", file_name, e);
                format!("{}{}", STORE_ERROR_PREFIX, e)
            }
        };
        self.reply(stream, &reply).await
    }

    /// Splits `source` and sends part *i* to node *i* of the current node list.
    ///
    /// An existing file of the same name is deleted first, unless none of the
    /// target nodes answers, in which case it is kept and nothing is sent. Mapping
    /// entries are written, in part order, only for parts a node acknowledged.
    pub async fn distribute(
        &self,
        file_name: &str,
        source: &Path,
        scratch: &Path,
    ) -> Result<DistributionReport> {
        let _file = self.files.lock(file_name).await;

        let nodes = self.nodes.snapshot().await;
        let size = tokio::fs::metadata(source).await?.len();
        let count = part_count(size, nodes.len());
        let targets = &nodes[..count.min(nodes.len())];

        if self.mapping.contains_file(file_name).await {
            if !self.any_reachable(targets).await {
                tracing::warn!("No target node reachable, keeping current {}", file_name);
                let mut report = DistributionReport::new(file_name, count);
                report.unassigned = count - targets.len();
                report.failed = targets.len();
                return Ok(report);
            }
            tracing::info!("Replacing existing file {}", file_name);
            self.remove_file(file_name).await?;
        }

        let parts = split_file(source, scratch, file_name, count, self.config.timeouts.io()).await?;

        let mut report = DistributionReport::new(file_name, count);
        let mut sends = JoinSet::new();
        for part in parts {
            let Some(node) = nodes.get(part.index).cloned() else {
                tracing::warn!("No storage node for {}, part dropped", part.name);
                report.unassigned += 1;
                continue;
            };

            let client = self.storage.clone();
            sends.spawn(async move {
                let sent = client.store_file(&node, &part.name, &part.path).await;
                (part, node, sent)
            });
        }

        let mut stored: Vec<(usize, MappingEntry)> = Vec::new();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((part, node, Ok(size))) => {
                    tracing::info!("Part {} ({} bytes) sent to {}", part.name, size, node);
                    stored.push((part.index, MappingEntry::new(file_name, part.name, node)));
                }
                Ok((part, node, Err(e))) => {
                    tracing::warn!("Failed to send {} to {}: {}", part.name, node, e);
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::error!("Send task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        stored.sort_by_key(|(index, _)| *index);
        let entries: Vec<MappingEntry> = stored.into_iter().map(|(_, entry)| entry).collect();
        self.mapping.append(&entries).await?;
        report.stored = entries.len();

        Ok(report)
    }

    async fn any_reachable(&self, nodes: &[StorageNodeAddress]) -> bool {
        let mut pings = JoinSet::new();
        for node in nodes.iter().cloned() {
            let client = self.storage.clone();
            pings.spawn(async move { client.ping(&node).await.is_ok() });
        }
        while let Some(joined) = pings.join_next().await {
            if matches!(joined, Ok(true)) {
                return true;
            }
        }
        false
    }

    // ====== DOWNLOAD ======

    pub(super) async fn handle_download(&self, stream: &mut TcpStream) -> Result<()> {
        let io = self.config.timeouts.io();
        let file_name = with_deadline(io, read_utf(stream)).await?;
        tracing::info!("Download requested: {}", file_name);

        let scratch = self.scratch().await?;
        let sent = async {
            match self.assemble(&file_name, &scratch).await {
                Ok(assembled) => {
                    let mut file = File::open(&assembled).await?;
                    let size = file.metadata().await?.len();
                    self.reply(stream, &format!("{}{}", DOWNLOAD_PREFIX, file_name))
                        .await?;
                    with_deadline(io, write_size(stream, size)).await?;
                    copy_exact(&mut file, stream, size, io).await?;
                    tracing::info!("Sent {} ({} bytes)", file_name, size);
                }
                Err(e) => {
                    tracing::warn!("Download of {} failed: {}", file_name, e);
                    self.reply(stream, &format!("{}{}", DOWNLOAD_ERROR_PREFIX, e))
                        .await?;
                }
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        self.discard_scratch(&scratch).await;
        sent
    }

    /// Rebuilds `file_name` from its parts into a file inside `scratch`.
    ///
    /// Each part comes from its primary node, or from a registered replica when
    /// the primary cannot deliver it.
    pub async fn assemble(&self, file_name: &str, scratch: &Path) -> Result<PathBuf> {
        let _file = self.files.lock(file_name).await;
        let entries = self.mapping.entries_for(file_name).await;
        if entries.is_empty() {
            bail!("{}{}", NO_PARTS_PREFIX, file_name);
        }

        for (expected, entry) in entries.iter().enumerate() {
            if part_index(file_name, &entry.part_name) != Some(expected) {
                bail!("part {} of {} is missing", expected, file_name);
            }
        }

        let assembled = scratch.join(format!("{}.assembled", Uuid::new_v4()));
        let mut out = File::create(&assembled).await?;

        for entry in entries.iter() {
            let part_path = scratch.join(&entry.part_name);
            self.fetch_with_fallback(entry, &part_path).await?;

            let mut part = File::open(&part_path).await?;
            tokio::io::copy(&mut part, &mut out).await?;
            tokio::fs::remove_file(&part_path).await?;
        }

        out.flush().await?;
        Ok(assembled)
    }

    async fn fetch_with_fallback(&self, entry: &MappingEntry, dest: &Path) -> Result<()> {
        let mut candidates: Vec<StorageNodeAddress> = vec![entry.node.clone()];
        for replica in self.replicas.replicas_of(&entry.part_name) {
            if !candidates.contains(&replica) {
                candidates.push(replica);
            }
        }

        let mut last_error = None;
        for (attempt, node) in candidates.iter().enumerate() {
            if attempt > 0 {
                tracing::info!("Trying replica {} for {}", node, entry.part_name);
            }

            match self.storage.fetch_part(node, &entry.part_name, dest).await {
                Ok(FetchOutcome::Found(size)) => {
                    tracing::debug!("Fetched {} ({} bytes) from {}", entry.part_name, size, node);
                    return Ok(());
                }
                Ok(FetchOutcome::NotFound) => {
                    tracing::warn!("{} does not have {}", node, entry.part_name);
                    last_error = Some(anyhow::anyhow!("{} not found on {}", entry.part_name, node));
                }
                Err(e) => {
                    tracing::warn!("Fetching {} from {} failed: {}", entry.part_name, node, e);
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error.unwrap_or_else(|| anyhow::anyhow!("no known location"));
        Err(cause.context(format!("no reachable copy of {}", entry.part_name)))
    }

    // ====== DELETE ======

    pub(super) async fn handle_delete(&self, stream: &mut TcpStream) -> Result<()> {
        let file_name = with_deadline(self.config.timeouts.io(), read_utf(stream)).await?;
        tracing::info!("Delete requested: {}", file_name);

        let reply = match self.delete_file(&file_name).await {
            Ok(true) => SUCCESS.to_string(),
            Ok(false) => FILE_NOT_FOUND.to_string(),
            Err(e) => {
                tracing::error!("Delete of {} failed: {}", file_name, e);
                format!("{}{}", DELETE_ERROR_PREFIX, e)
            }
        };
        self.reply(stream, &reply).await
    }

    /// Removes a file from the index and asks every node holding one of its parts
    /// (primary or replica) to drop it. Returns `false` for an unknown file.
    pub async fn delete_file(&self, file_name: &str) -> Result<bool> {
        let _file = self.files.lock(file_name).await;
        self.remove_file(file_name).await
    }

    /// Body of `delete_file`; the caller holds the file's lock.
    async fn remove_file(&self, file_name: &str) -> Result<bool> {
        let removed = self.mapping.remove_file(file_name).await?;
        if removed.is_empty() {
            return Ok(false);
        }

        for entry in removed.iter() {
            let mut holders = vec![entry.node.clone()];
            for replica in self.replicas.forget(&entry.part_name) {
                if !holders.contains(&replica) {
                    holders.push(replica);
                }
            }

            for node in holders.iter() {
                match self.storage.delete_part(node, &entry.part_name).await {
                    Ok(true) => tracing::info!("Deleted {} on {}", entry.part_name, node),
                    Ok(false) => tracing::warn!("{} had no copy of {}", node, entry.part_name),
                    Err(e) => {
                        tracing::warn!("Could not delete {} on {}: {}", entry.part_name, node, e)
                    }
                }
            }
        }

        tracing::info!("File {} deleted ({} part(s))", file_name, removed.len());
        Ok(true)
    }

    // ====== REPLICATION INFO ======

    pub(super) async fn handle_replication_info(&self, stream: &mut TcpStream) -> Result<()> {
        let io = self.config.timeouts.io();
        let part_name = with_deadline(io, read_utf(stream)).await?;
        let host = with_deadline(io, read_utf(stream)).await?;
        let port = with_deadline(io, read_int(stream)).await?;

        let reply = match self.record_replica(&part_name, &host, port) {
            Ok(node) => {
                tracing::info!("Replica of {} recorded on {}", part_name, node);
                REPLICATION_INFO_ACK.to_string()
            }
            Err(e) => {
                tracing::warn!("Rejected replication info for {}: {}", part_name, e);
                format!("{}{}", REPLICATION_INFO_ERROR_PREFIX, e)
            }
        };
        self.reply(stream, &reply).await
    }

    pub fn record_replica(&self, part_name: &str, host: &str, port: i32) -> Result<StorageNodeAddress> {
        let port = u16::try_from(port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| anyhow::anyhow!("port {} out of range", port))?;
        if host.trim().is_empty() {
            bail!("empty host");
        }

        let node = StorageNodeAddress::new(host.trim(), port);
        self.replicas.record(part_name, node.clone());
        Ok(node)
    }
}
