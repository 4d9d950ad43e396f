use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::info;

use super::node_list::KnownNodes;
use super::types::StorageNodeAddress;
use crate::config::DiscoveryConfig;
use crate::protocol::codec::{decode_datagram, encode_datagram};
use crate::protocol::commands::REQUEST_INFO;

const RECEIVE_BUFFER: usize = 1024;

/// Coordinator half of discovery: periodically probes the broadcast ports and
/// records every `host:port` answer in the known-node list.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    nodes: Arc<KnownNodes>,
    listeners: Vec<Arc<UdpSocket>>,
}

impl DiscoveryService {
    /// Binds one UDP socket per configured response port.
    pub async fn bind(config: DiscoveryConfig, nodes: Arc<KnownNodes>) -> Result<Arc<Self>> {
        let mut listeners = Vec::with_capacity(config.response_ports.len());
        for &port in config.response_ports.iter() {
            let addr = SocketAddr::new(config.listen_host, port);
            let socket = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("binding discovery response port {}", addr))?;
            listeners.push(socket);
        }

        Ok(Self::with_listeners(config, nodes, listeners))
    }

    /// Builds the service around sockets that are already bound.
    pub fn with_listeners(
        config: DiscoveryConfig,
        nodes: Arc<KnownNodes>,
        listeners: Vec<UdpSocket>,
    ) -> Arc<Self> {
        for socket in listeners.iter() {
            if let Ok(addr) = socket.local_addr() {
                info!("Listening for discovery responses on {}", addr);
            }
        }

        Arc::new(Self {
            config,
            nodes,
            listeners: listeners.into_iter().map(Arc::new).collect(),
        })
    }

    /// Addresses actually bound for responses (resolves port 0).
    pub fn response_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }

    pub fn nodes(&self) -> &Arc<KnownNodes> {
        &self.nodes
    }

    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        tracing::info!("Starting discovery service...");

        for socket in self.listeners.iter() {
            let service = self.clone();
            let socket = socket.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = service.receive_loop(socket) => {}
                    _ = shutdown.changed() => {}
                }
            });
        }

        let _broadcast_handle = {
            let service = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = service.broadcast_loop() => {}
                    _ = shutdown.changed() => {}
                }
            })
        };

        tracing::info!(
            "Discovery started: probing ports {:?} every {:?}",
            self.config.broadcast_ports,
            self.config.broadcast_interval()
        );
    }

    async fn broadcast_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.broadcast_interval());

        loop {
            interval.tick().await;

            match self.broadcast_once().await {
                Ok(sent) => tracing::debug!("Sent {} discovery probe(s)", sent),
                Err(e) => tracing::warn!("Discovery broadcast failed: {}", e),
            }
        }
    }

    /// Sends one `REQUEST_INFO` probe to every broadcast port. Returns how many were sent.
    pub async fn broadcast_once(&self) -> Result<usize> {
        let socket = UdpSocket::bind(SocketAddr::new(self.config.listen_host, 0)).await?;
        socket.set_broadcast(true)?;
        let probe = encode_datagram(REQUEST_INFO)?;

        let mut sent = 0;
        for &port in self.config.broadcast_ports.iter() {
            let target = SocketAddr::new(self.config.broadcast_addr, port);
            match socket.send_to(&probe, target).await {
                Ok(_) => sent += 1,
                Err(e) => tracing::debug!("Probe to {} not sent: {}", target, e),
            }
        }

        Ok(sent)
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; RECEIVE_BUFFER];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => match decode_datagram(&buf[..len]) {
                    Ok(response) => {
                        if let Err(e) = self.handle_response(&response).await {
                            tracing::warn!("Bad discovery response from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to decode datagram from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Records one `host:port` response. Returns whether the node was new.
    pub async fn handle_response(&self, response: &str) -> Result<bool> {
        let addr: StorageNodeAddress = response.parse()?;
        self.nodes.register(&addr).await
    }
}
