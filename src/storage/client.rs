use anyhow::{Context, Result, bail};
use std::path::Path;
use tokio::fs::File;
use tokio::net::TcpStream;

use crate::config::TimeoutConfig;
use crate::discovery::types::StorageNodeAddress;
use crate::protocol::codec::{copy_exact, read_size, read_utf, with_deadline, write_size, write_utf};
use crate::protocol::commands::{
    FAILURE, PART_FOUND, PART_NOT_FOUND, STORE_ACK, StorageCommand, SUCCESS,
};

/// Result of asking a node for a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(u64),
    NotFound,
}

/// Speaks the storage-node protocol: one command per fresh connection.
#[derive(Debug, Clone, Default)]
pub struct StorageClient {
    timeouts: TimeoutConfig,
}

impl StorageClient {
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self { timeouts }
    }

    async fn connect(&self, node: &StorageNodeAddress) -> Result<TcpStream> {
        with_deadline(
            self.timeouts.connect(),
            TcpStream::connect(node.connect_target()),
        )
        .await
        .with_context(|| format!("connecting to storage node {}", node))
    }

    async fn send_command(
        &self,
        stream: &mut TcpStream,
        command: StorageCommand,
        part_name: &str,
    ) -> Result<()> {
        let io = self.timeouts.io();
        with_deadline(io, write_utf(stream, command.as_wire())).await?;
        with_deadline(io, write_utf(stream, part_name)).await?;
        Ok(())
    }

    /// Opens and closes a connection without sending a command.
    pub async fn ping(&self, node: &StorageNodeAddress) -> Result<()> {
        let stream = self.connect(node).await?;
        drop(stream);
        Ok(())
    }

    /// Sends the file at `path` as `part_name` and waits for the node's acknowledgement.
    pub async fn store_file(
        &self,
        node: &StorageNodeAddress,
        part_name: &str,
        path: &Path,
    ) -> Result<u64> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let size = file.metadata().await?.len();

        let io = self.timeouts.io();
        let mut stream = self.connect(node).await?;
        self.send_command(&mut stream, StorageCommand::Store, part_name)
            .await?;
        with_deadline(io, write_size(&mut stream, size)).await?;
        copy_exact(&mut file, &mut stream, size, io)
            .await
            .with_context(|| format!("sending {} to {}", part_name, node))?;

        let reply = with_deadline(io, read_utf(&mut stream)).await?;
        if reply != STORE_ACK {
            bail!("{} refused {}: {}", node, part_name, reply);
        }

        tracing::debug!("Stored {} ({} bytes) on {}", part_name, size, node);
        Ok(size)
    }

    /// Downloads a part into `dest`, creating or truncating it.
    pub async fn fetch_part(
        &self,
        node: &StorageNodeAddress,
        part_name: &str,
        dest: &Path,
    ) -> Result<FetchOutcome> {
        let io = self.timeouts.io();
        let mut stream = self.connect(node).await?;
        self.send_command(&mut stream, StorageCommand::GetPart, part_name)
            .await?;

        let reply = with_deadline(io, read_utf(&mut stream)).await?;
        match reply.as_str() {
            PART_FOUND => {
                let size = with_deadline(io, read_size(&mut stream)).await?;
                let mut file = File::create(dest)
                    .await
                    .with_context(|| format!("creating {}", dest.display()))?;
                copy_exact(&mut stream, &mut file, size, io)
                    .await
                    .with_context(|| format!("fetching {} from {}", part_name, node))?;
                Ok(FetchOutcome::Found(size))
            }
            PART_NOT_FOUND => Ok(FetchOutcome::NotFound),
            other => bail!("unexpected reply from {}: {}", node, other),
        }
    }

    /// Asks a node to drop a part. `Ok(false)` means the node did not have it.
    pub async fn delete_part(&self, node: &StorageNodeAddress, part_name: &str) -> Result<bool> {
        let mut stream = self.connect(node).await?;
        self.send_command(&mut stream, StorageCommand::DeletePart, part_name)
            .await?;

        let reply = with_deadline(self.timeouts.io(), read_utf(&mut stream)).await?;
        match reply.as_str() {
            SUCCESS => Ok(true),
            FAILURE => Ok(false),
            other => bail!("unexpected reply from {}: {}", node, other),
        }
    }
}
