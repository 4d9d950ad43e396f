//! Coordinator Protocol Client
//!
//! A typed client for the coordinator's command loop. One connection carries any
//! number of commands; dropping the client ends the session.

use anyhow::{Context, Result, bail};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

use crate::config::TimeoutConfig;
use crate::discovery::types::StorageNodeAddress;
use crate::protocol::codec::{
    copy_exact, read_size, read_utf, with_deadline, write_int, write_size, write_utf,
};
use crate::protocol::commands::{
    CoordinatorCommand, DOWNLOAD_PREFIX, LIST_PREFIX, LIST_SEPARATOR, REPLICATION_INFO_ACK,
};

/// Reply to a `download` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadReply {
    /// The file was streamed; carries its length.
    Received(u64),
    /// The coordinator answered with an error string instead of a file.
    Refused(String),
}

pub struct CoordinatorClient {
    stream: TcpStream,
    timeouts: TimeoutConfig,
}

impl CoordinatorClient {
    pub async fn connect(addr: &StorageNodeAddress, timeouts: TimeoutConfig) -> Result<Self> {
        let stream = with_deadline(timeouts.connect(), TcpStream::connect(addr.connect_target()))
            .await
            .with_context(|| format!("connecting to coordinator {}", addr))?;

        Ok(Self { stream, timeouts })
    }

    async fn send_command(&mut self, command: &str) -> Result<()> {
        with_deadline(self.timeouts.io(), write_utf(&mut self.stream, command)).await
    }

    async fn read_reply(&mut self) -> Result<String> {
        with_deadline(self.timeouts.io(), read_utf(&mut self.stream)).await
    }

    /// Sends an arbitrary command string and returns the single-string reply.
    pub async fn send_raw(&mut self, command: &str) -> Result<String> {
        self.send_command(command).await?;
        self.read_reply().await
    }

    /// Raw `list` reply.
    pub async fn list(&mut self) -> Result<String> {
        self.send_raw(CoordinatorCommand::List.as_wire()).await
    }

    /// File names from a `list` reply.
    pub async fn list_files(&mut self) -> Result<Vec<String>> {
        let reply = self.list().await?;
        let names = reply
            .strip_prefix(LIST_PREFIX)
            .ok_or_else(|| anyhow::anyhow!("unexpected list reply: {}", reply))?;

        Ok(names
            .split(LIST_SEPARATOR)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn upload(&mut self, file_name: &str, bytes: &[u8]) -> Result<String> {
        let mut reader = bytes;
        self.upload_from(file_name, &mut reader, bytes.len() as u64)
            .await
    }

    pub async fn upload_file(&mut self, file_name: &str, path: &Path) -> Result<String> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let size = file.metadata().await?.len();
        self.upload_from(file_name, &mut file, size).await
    }

    async fn upload_from<R>(&mut self, file_name: &str, reader: &mut R, size: u64) -> Result<String>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let io = self.timeouts.io();
        self.send_command(CoordinatorCommand::Upload.as_wire())
            .await?;
        with_deadline(io, write_utf(&mut self.stream, file_name)).await?;
        with_deadline(io, write_size(&mut self.stream, size)).await?;
        copy_exact(reader, &mut self.stream, size, io).await?;

        // Distribution happens before the reply, so wait past a single io step
        let distribution_limit = io * 10;
        with_deadline(distribution_limit, read_utf(&mut self.stream)).await
    }

    /// Downloads `file_name` into `writer`.
    pub async fn download_into<W>(&mut self, file_name: &str, writer: &mut W) -> Result<DownloadReply>
    where
        W: AsyncWrite + Unpin,
    {
        let io = self.timeouts.io();
        self.send_command(CoordinatorCommand::Download.as_wire())
            .await?;
        with_deadline(io, write_utf(&mut self.stream, file_name)).await?;

        let reply = with_deadline(io * 10, read_utf(&mut self.stream)).await?;
        if !reply.starts_with(DOWNLOAD_PREFIX) {
            return Ok(DownloadReply::Refused(reply));
        }

        let size = with_deadline(io, read_size(&mut self.stream)).await?;
        copy_exact(&mut self.stream, writer, size, io).await?;
        Ok(DownloadReply::Received(size))
    }

    pub async fn delete(&mut self, file_name: &str) -> Result<String> {
        self.send_command(CoordinatorCommand::DeleteFile.as_wire())
            .await?;
        with_deadline(self.timeouts.io(), write_utf(&mut self.stream, file_name)).await?;
        self.read_reply().await
    }

    /// Tells the coordinator that `peer` now holds a copy of `part_name`.
    pub async fn report_replication(&mut self, part_name: &str, peer: &StorageNodeAddress) -> Result<()> {
        let io = self.timeouts.io();
        self.send_command(CoordinatorCommand::ReplicationInfo.as_wire())
            .await?;
        with_deadline(io, write_utf(&mut self.stream, part_name)).await?;
        with_deadline(io, write_utf(&mut self.stream, &peer.host)).await?;
        with_deadline(io, write_int(&mut self.stream, i32::from(peer.port))).await?;

        let reply = self.read_reply().await?;
        if reply != REPLICATION_INFO_ACK {
            bail!("coordinator rejected replication info: {}", reply);
        }
        Ok(())
    }
}
