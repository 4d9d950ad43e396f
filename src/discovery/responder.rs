use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::types::StorageNodeAddress;
use crate::protocol::codec::{decode_datagram, encode_datagram};
use crate::protocol::commands::REQUEST_INFO;

/// Storage-node half of discovery: answers every `REQUEST_INFO` probe with this
/// node's reachable `host:port`, sent to the prober's IP on the response port.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    advertise: StorageNodeAddress,
    response_port: u16,
}

impl DiscoveryResponder {
    pub async fn bind(
        listen_addr: SocketAddr,
        advertise: StorageNodeAddress,
        response_port: u16,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr)
            .await
            .with_context(|| format!("binding discovery port {}", listen_addr))?;
        tracing::info!(
            "Answering discovery probes on {} as {}",
            socket.local_addr()?,
            advertise
        );

        Ok(Self {
            socket,
            advertise,
            response_port,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = self.receive_loop() => {}
            _ = shutdown.changed() => {
                tracing::info!("Discovery responder stopped");
            }
        }
    }

    async fn receive_loop(&self) {
        let mut buf = vec![0u8; 1024];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match decode_datagram(&buf[..len]) {
                    Ok(message) if message == REQUEST_INFO => {
                        if let Err(e) = self.respond(src).await {
                            tracing::warn!("Failed to answer probe from {}: {}", src, e);
                        }
                    }
                    Ok(message) => {
                        tracing::debug!("Ignoring datagram '{}' from {}", message, src);
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

    async fn respond(&self, prober: SocketAddr) -> Result<()> {
        let target = SocketAddr::new(prober.ip(), self.response_port);
        let response = encode_datagram(&self.advertise.to_string())?;
        self.socket.send_to(&response, target).await?;
        tracing::debug!("Sent discovery response {} to {}", self.advertise, target);
        Ok(())
    }
}
