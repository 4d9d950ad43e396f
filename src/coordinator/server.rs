use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};

use super::locks::FileLocks;
use super::mapping::MappingIndex;
use super::replicas::ReplicationRegistry;
use crate::config::CoordinatorConfig;
use crate::discovery::node_list::KnownNodes;
use crate::discovery::service::DiscoveryService;
use crate::protocol::codec::{read_command, with_deadline, write_utf};
use crate::protocol::commands::{CoordinatorCommand, UNKNOWN_COMMAND};
use crate::storage::client::StorageClient;

/// The primary node: owns the node list, the mapping index and the replica
/// registry, and serves clients on one TCP port. Operations on one file name are
/// serialized through `FileLocks`.
pub struct Coordinator {
    pub(super) config: CoordinatorConfig,
    pub(super) nodes: Arc<KnownNodes>,
    pub(super) mapping: Arc<MappingIndex>,
    pub(super) replicas: Arc<ReplicationRegistry>,
    pub(super) storage: StorageClient,
    pub(super) files: FileLocks,
}

impl Coordinator {
    /// Loads persisted state from the work directory.
    pub async fn new(config: CoordinatorConfig) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(config.scratch_dir())
            .await
            .with_context(|| format!("creating {}", config.scratch_dir().display()))?;

        let nodes = Arc::new(
            KnownNodes::open(config.node_list_path(), config.reset_node_list_on_start).await?,
        );
        let mapping = Arc::new(MappingIndex::open(config.mapping_path()).await?);
        let storage = StorageClient::new(config.timeouts.clone());

        Ok(Arc::new(Self {
            config,
            nodes,
            mapping,
            replicas: Arc::new(ReplicationRegistry::new()),
            storage,
            files: FileLocks::new(),
        }))
    }

    pub fn nodes(&self) -> &Arc<KnownNodes> {
        &self.nodes
    }

    pub fn mapping(&self) -> &Arc<MappingIndex> {
        &self.mapping
    }

    pub fn replicas(&self) -> &Arc<ReplicationRegistry> {
        &self.replicas
    }

    pub fn file_locks(&self) -> &FileLocks {
        &self.files
    }

    /// Starts probing for storage nodes and recording their answers.
    pub async fn start_discovery(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<DiscoveryService>> {
        let discovery = DiscoveryService::bind(self.config.discovery.clone(), self.nodes.clone()).await?;
        discovery.clone().start(shutdown).await;
        Ok(discovery)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("binding coordinator port {}", self.config.bind_addr))
    }

    /// Accept loop. Returns when `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let limiter = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        tracing::info!("Coordinator listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("Coordinator shutting down");
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
                    let coordinator = self.clone();
                    let mut conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        tokio::select! {
                            result = coordinator.handle_connection(stream, peer) => {
                                if let Err(e) = result {
                                    tracing::warn!("Client {} dropped: {}", peer, e);
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

    /// Command loop of one client. Ends when the client disconnects.
    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        tracing::info!("Client connected: {}", peer);

        while let Some(command) = read_command(&mut stream).await? {
            tracing::debug!("Command '{}' from {}", command, peer);

            match CoordinatorCommand::from_wire(&command) {
                Some(CoordinatorCommand::List) => self.handle_list(&mut stream).await?,
                Some(CoordinatorCommand::Upload) => self.handle_upload(&mut stream).await?,
                Some(CoordinatorCommand::Download) => self.handle_download(&mut stream).await?,
                Some(CoordinatorCommand::DeleteFile) => self.handle_delete(&mut stream).await?,
                Some(CoordinatorCommand::ReplicationInfo) => {
                    self.handle_replication_info(&mut stream).await?
                }
                None => {
                    tracing::warn!("Unknown command '{}' from {}", command, peer);
                    with_deadline(self.config.timeouts.io(), write_utf(&mut stream, UNKNOWN_COMMAND))
                        .await?;
                }
            }
        }

        tracing::info!("Client disconnected: {}", peer);
        Ok(())
    }
}
