use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};

use super::part_store::{PartStore, validate_part_name};
use super::replication::{Replicator, build_policy};
use crate::config::StorageNodeConfig;
use crate::discovery::responder::DiscoveryResponder;
use crate::discovery::types::StorageNodeAddress;
use crate::protocol::codec::{
    copy_exact, read_command, read_size, read_utf, with_deadline, write_size, write_utf,
};
use crate::protocol::commands::{
    FAILURE, PART_FOUND, PART_NOT_FOUND, STORE_ACK, STORE_ERROR_PREFIX, StorageCommand, SUCCESS,
    UNKNOWN_COMMAND,
};

pub struct StorageNode {
    config: StorageNodeConfig,
    advertise: StorageNodeAddress,
    store: Arc<PartStore>,
    replicator: Arc<Replicator>,
}

impl StorageNode {
    /// Binds the TCP port and prepares the part directory.
    ///
    /// The advertised address uses the port actually bound, so `bind_addr` may use
    /// port 0.
    pub async fn bind(config: StorageNodeConfig) -> Result<(Arc<Self>, TcpListener)> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("binding storage port {}", config.bind_addr))?;
        let local = listener.local_addr()?;
        let advertise = StorageNodeAddress::new(config.advertise_host.clone(), local.port());

        let store = Arc::new(PartStore::open(&config.storage_dir).await?);
        let existing = store.list_parts().await?;
        tracing::info!(
            "Storage node {} serving {} existing part(s) from {}",
            advertise,
            existing.len(),
            store.root().display()
        );

        let policy = build_policy(&config.replication, &advertise);
        let replicator = Replicator::new(
            store.clone(),
            policy,
            config.coordinator_addr.clone(),
            config.timeouts.clone(),
        );

        let node = Arc::new(Self {
            config,
            advertise,
            store,
            replicator,
        });
        Ok((node, listener))
    }

    pub fn advertise(&self) -> &StorageNodeAddress {
        &self.advertise
    }

    pub fn store(&self) -> &Arc<PartStore> {
        &self.store
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Starts answering discovery probes. Returns the bound UDP address.
    pub async fn start_discovery(&self, shutdown: watch::Receiver<bool>) -> Result<SocketAddr> {
        let responder = DiscoveryResponder::bind(
            self.config.discovery_addr,
            self.advertise.clone(),
            self.config.response_port,
        )
        .await?;
        let local = responder.local_addr()?;
        tokio::spawn(responder.run(shutdown));
        Ok(local)
    }

    /// Accept loop. Returns when `shutdown` fires; the listener is dropped with it.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let limiter = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        tracing::info!("Storage node listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("Storage node {} shutting down", self.advertise);
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let Ok(permit) = limiter.clone().acquire_owned().await else {
                        break;
                    };
                    let node = self.clone();
                    let mut conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        tokio::select! {
                            result = node.handle_connection(stream) => {
                                if let Err(e) = result {
                                    tracing::warn!("Connection from {} failed: {}", peer, e);
                                }
                            }
                            _ = conn_shutdown.changed() => {
                                tracing::debug!("Dropping connection from {}", peer);
                            }
                        }
                    });
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let io = self.config.timeouts.io();
        let Some(command) = with_deadline(io, read_command(&mut stream)).await? else {
            return Ok(());
        };

        match StorageCommand::from_wire(&command) {
            Some(StorageCommand::Store) => self.handle_store(&mut stream).await,
            Some(StorageCommand::GetPart) => self.handle_get_part(&mut stream).await,
            Some(StorageCommand::DeletePart) => self.handle_delete_part(&mut stream).await,
            None => {
                tracing::warn!("Unknown command '{}'", command);
                with_deadline(io, write_utf(&mut stream, UNKNOWN_COMMAND)).await?;
                stream.shutdown().await?;
                Ok(())
            }
        }
    }

    async fn handle_store(&self, stream: &mut TcpStream) -> Result<()> {
        let io = self.config.timeouts.io();
        let part_name = with_deadline(io, read_utf(stream)).await?;
        let size = with_deadline(io, read_size(stream)).await?;
        tracing::info!("Receiving part {} ({} bytes)", part_name, size);

        let received = match validate_part_name(&part_name) {
            Ok(()) => self.store.write_part(&part_name, stream, size, io).await,
            Err(e) => {
                copy_exact(stream, &mut tokio::io::sink(), size, io).await?;
                Err(e)
            }
        };

        if let Err(e) = received {
            tracing::warn!("Failed to store {}: {}", part_name, e);
            let reply = format!("{}{}", STORE_ERROR_PREFIX, e);
            if let Err(reply_err) = with_deadline(io, write_utf(stream, &reply)).await {
                tracing::debug!("Could not report store failure: {}", reply_err);
            }
            return Ok(());
        }

        let acked = with_deadline(io, write_utf(stream, STORE_ACK)).await;
        tracing::info!("Stored part {}", part_name);
        self.replicator.schedule(&part_name);
        acked
    }

    async fn handle_get_part(&self, stream: &mut TcpStream) -> Result<()> {
        let io = self.config.timeouts.io();
        let part_name = with_deadline(io, read_utf(stream)).await?;

        let part = match self.store.open_part(&part_name).await {
            Ok(part) => part,
            Err(e) => {
                tracing::warn!("Refusing GET_PART {}: {}", part_name, e);
                None
            }
        };

        match part {
            Some((mut file, size)) => {
                with_deadline(io, write_utf(stream, PART_FOUND)).await?;
                with_deadline(io, write_size(stream, size)).await?;
                copy_exact(&mut file, stream, size, io).await?;
                tracing::info!("Served part {} ({} bytes)", part_name, size);
            }
            None => {
                tracing::info!("Part {} not found", part_name);
                with_deadline(io, write_utf(stream, PART_NOT_FOUND)).await?;
            }
        }

        Ok(())
    }

    async fn handle_delete_part(&self, stream: &mut TcpStream) -> Result<()> {
        let io = self.config.timeouts.io();
        let part_name = with_deadline(io, read_utf(stream)).await?;

        let deleted = match self.store.delete_part(&part_name).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::warn!("Failed to delete {}: {}", part_name, e);
                false
            }
        };

        if deleted {
            self.replicator.forget(&part_name);
            tracing::info!("Deleted part {}", part_name);
            with_deadline(io, write_utf(stream, SUCCESS)).await
        } else {
            tracing::info!("Nothing to delete for {}", part_name);
            with_deadline(io, write_utf(stream, FAILURE)).await
        }
    }
}
