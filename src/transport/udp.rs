//! UDP transport.
//!
//! One datagram per frame. There is no connection to lose, so `reconnect`
//! only rebinds the local socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use super::{BoxFuture, KeepaliveCoordinator, Transport};
use crate::config::TransportConfig;
use crate::error::{LyncnatError, Result};

/// UDP transport bound to an ephemeral local port.
#[derive(Debug)]
pub struct UdpTransport {
    relay: String,
    remote: Option<SocketAddr>,
    socket: Option<UdpSocket>,
    receive_timeout: Duration,
    buffer_size: usize,
    coordinator: Arc<KeepaliveCoordinator>,
}

impl UdpTransport {
    /// Create a transport for `relay` (`host:port`). Nothing is bound until
    /// [`Transport::init`].
    pub fn new(
        relay: impl Into<String>,
        config: &TransportConfig,
        coordinator: Arc<KeepaliveCoordinator>,
    ) -> Self {
        Self {
            relay: relay.into(),
            remote: None,
            socket: None,
            receive_timeout: config.receive_timeout(),
            buffer_size: config.buffer_size,
            coordinator,
        }
    }

    async fn bind(&mut self) -> Result<u16> {
        let remote = tokio::net::lookup_host(&self.relay)
            .await
            .map_err(|e| LyncnatError::Network(format!("Failed to resolve {}: {}", self.relay, e)))?
            .next()
            .ok_or_else(|| LyncnatError::Network(format!("No address for {}", self.relay)))?;

        let local: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| LyncnatError::Network(format!("Failed to bind UDP socket: {}", e)))?;
        let port = socket.local_addr()?.port();

        self.remote = Some(remote);
        self.socket = Some(socket);
        self.coordinator.reset();
        tracing::info!("UDP socket bound to port {} for relay {}", port, remote);
        Ok(port)
    }

    fn socket(&self) -> Result<(&UdpSocket, SocketAddr)> {
        match (&self.socket, self.remote) {
            (Some(socket), Some(remote)) => Ok((socket, remote)),
            _ => Err(LyncnatError::Network(
                "UDP transport not initialized".to_string(),
            )),
        }
    }
}

impl Transport for UdpTransport {
    fn init(&mut self) -> BoxFuture<'_, Result<u16>> {
        Box::pin(self.bind())
    }

    fn send<'a>(&'a mut self, frame: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (socket, remote) = self.socket()?;
            socket
                .send_to(frame, remote)
                .await
                .map_err(|e| LyncnatError::Network(format!("UDP send failed: {}", e)))?;
            Ok(())
        })
    }

    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let (socket, remote) = self.socket()?;
            let mut buf = vec![0u8; self.buffer_size];
            match tokio::time::timeout(self.receive_timeout, socket.recv_from(&mut buf)).await {
                Err(_) => Ok(None),
                Ok(Ok((n, from))) => {
                    if from != remote {
                        tracing::debug!("Dropping datagram from unexpected peer {}", from);
                        return Ok(None);
                    }
                    buf.truncate(n);
                    Ok(Some(buf))
                }
                Ok(Err(e)) => Err(LyncnatError::Network(format!("UDP receive failed: {}", e))),
            }
        })
    }

    fn reconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.socket = None;
            tracing::info!("Rebinding UDP socket");
            self.bind().await.map(|_| ())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.socket = None;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "UDP"
    }

    fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }
}
