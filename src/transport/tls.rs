//! TLS stream transport.
//!
//! TCP wrapped with tokio-rustls. Connecting retries forever with
//! exponential backoff. A failed write or read tears the stream down and
//! reconnects before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::config::{server_name, TrustConfig};
use super::{Backoff, BoxFuture, KeepaliveCoordinator, StreamFrameReader, Transport};
use crate::config::TransportConfig;
use crate::error::{LyncnatError, Result};

/// TLS-over-TCP transport to the relay.
pub struct TlsTransport {
    relay: String,
    server_name: rustls::ServerName,
    connector: TlsConnector,
    stream: Option<TlsStream<TcpStream>>,
    reader: StreamFrameReader,
    read_buf: Vec<u8>,
    receive_timeout: Duration,
    backoff: Backoff,
    coordinator: Arc<KeepaliveCoordinator>,
    local_port: Option<u16>,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("relay", &self.relay)
            .field("connected", &self.stream.is_some())
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl TlsTransport {
    /// Create a transport for `relay` (`host:port`), checking the
    /// certificate against `trust` for `server_name`.
    pub fn new(
        relay: impl Into<String>,
        server_name_str: &str,
        trust: &TrustConfig,
        config: &TransportConfig,
        coordinator: Arc<KeepaliveCoordinator>,
    ) -> Result<Self> {
        Ok(Self {
            relay: relay.into(),
            server_name: server_name(server_name_str)?,
            connector: TlsConnector::from(trust.client_config()?),
            stream: None,
            reader: StreamFrameReader::new(config.buffer_size),
            read_buf: vec![0u8; config.buffer_size],
            receive_timeout: config.receive_timeout(),
            backoff: Backoff::new(config.reconnect_initial()).with_max(config.reconnect_max()),
            coordinator,
            local_port: None,
        })
    }

    async fn try_connect(&mut self) -> Result<u16> {
        let tcp = TcpStream::connect(&self.relay).await?;
        let port = tcp.local_addr()?.port();
        tcp.set_nodelay(true)?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| LyncnatError::Tls(format!("Handshake with {} failed: {}", self.relay, e)))?;

        self.stream = Some(stream);
        self.reader.clear();
        self.local_port = Some(port);
        self.coordinator.reset();
        Ok(port)
    }

    /// Connect, retrying until it works. Each outage starts the schedule over.
    async fn connect(&mut self) -> u16 {
        loop {
            match self.try_connect().await {
                Ok(port) => {
                    self.backoff.reset();
                    tracing::info!("Device socket ready, bound to port {}", port);
                    return port;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        "Unable to connect to {} ({}). Retrying in {} ms",
                        self.relay,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn drop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("TLS shutdown failed: {}", e);
            }
        }
        if self.reader.pending() > 0 {
            tracing::debug!("Discarding {} bytes of a partial frame", self.reader.pending());
        }
        self.reader.clear();
    }
}

impl Transport for TlsTransport {
    fn init(&mut self) -> BoxFuture<'_, Result<u16>> {
        Box::pin(async move { Ok(self.connect().await) })
    }

    fn send<'a>(&'a mut self, frame: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Some(stream) = self.stream.as_mut() else {
                return Err(LyncnatError::Network("TLS transport not connected".to_string()));
            };
            let result = async {
                stream.write_all(frame).await?;
                stream.flush().await
            }
            .await;

            if let Err(e) = result {
                tracing::error!("Write failed, closing socket: {}", e);
                self.drop_stream().await;
                tracing::info!("Connecting again...");
                self.connect().await;
                return Err(LyncnatError::Network(format!("TLS write failed: {}", e)));
            }
            Ok(())
        })
    }

    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            if let Some(frame) = self.reader.next_frame() {
                return Ok(Some(frame));
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(LyncnatError::Network("TLS transport not connected".to_string()));
            };

            let deadline = tokio::time::Instant::now() + self.receive_timeout;
            loop {
                match tokio::time::timeout_at(deadline, stream.read(&mut self.read_buf)).await {
                    Err(_) => return Ok(None),
                    Ok(Ok(0)) => {
                        tracing::warn!("Stream closed on server side");
                        break;
                    }
                    Ok(Ok(n)) => {
                        self.reader.extend(&self.read_buf[..n]);
                        if let Some(frame) = self.reader.next_frame() {
                            return Ok(Some(frame));
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::error!("Read failed, closing socket: {}", e);
                        break;
                    }
                }
            }

            self.drop_stream().await;
            tracing::info!("Connecting again...");
            self.connect().await;
            Ok(None)
        })
    }

    fn reconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.drop_stream().await;
            self.connect().await;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.drop_stream().await;
            self.local_port = None;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "TLS/TCP"
    }

    fn local_port(&self) -> Option<u16> {
        self.local_port
    }
}
