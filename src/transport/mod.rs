//! Transport layer for the LyncNat relay connection.
//!
//! Provides pluggable transport backends:
//! - **UDP**: one datagram per frame, no connection state
//! - **TLS**: TCP stream wrapped in TLS, frames delimited by their length
//!   field, reconnects with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │  Device A    │  │  Device B    │  │  Device C    │
//! │ (main loop)  │  │ (main loop)  │  │ (main loop)  │
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        │  outbound mpsc  │  inbound mpsc   │
//!        └─────────────────┼─────────────────┘
//!                          ▼
//!                ┌───────────────────┐
//!                │  TransportWorker  │── KeepaliveCoordinator
//!                └─────────┬─────────┘
//!                  ┌───────┴────────┐
//!                  ▼                ▼
//!         ┌──────────────┐  ┌──────────────┐
//!         │ UdpTransport │  │ TlsTransport │
//!         └──────────────┘  └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use lyncnat::transport::{KeepaliveCoordinator, TransportWorker};
//!
//! let coordinator = Arc::new(KeepaliveCoordinator::default());
//! let transport = lyncnat::transport::connect(&config, coordinator.clone()).await?;
//! let (handle, _task) = TransportWorker::spawn(
//!     transport,
//!     coordinator,
//!     &config.transport,
//!     config.session.inbound_queue,
//! );
//! let channel = handle.attach(device_uuid, api_key.as_bytes())?;
//! ```

mod backoff;
mod config;
mod framing;
mod keepalive;
mod tls;
mod udp;
mod worker;

pub use backoff::Backoff;
pub use config::{server_name, TrustConfig};
pub use framing::StreamFrameReader;
pub use keepalive::{KeepaliveCoordinator, DEFAULT_KEEPALIVE_TIMEOUT};
pub use tls::TlsTransport;
pub use udp::UdpTransport;
pub use worker::{DeviceChannel, TransportHandle, TransportWorker};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;

/// Boxed future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transport kind selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Datagrams to the relay's UDP port
    Udp,
    /// TLS over TCP (default)
    #[default]
    Tls,
}

impl TransportKind {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tls => "TLS/TCP",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tls" | "tcp" | "ssl" => Ok(Self::Tls),
            _ => Err(format!("Unknown transport kind: {}", s)),
        }
    }
}

/// Transport trait for pluggable relay connections.
///
/// Implementations own the socket. Every successful (re)connect must reset
/// the shared [`KeepaliveCoordinator`].
pub trait Transport: Send {
    /// Open the connection; returns the local port.
    fn init(&mut self) -> BoxFuture<'_, Result<u16>>;

    /// Send one complete frame.
    fn send<'a>(&'a mut self, frame: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Wait up to the receive timeout for one complete frame.
    ///
    /// `Ok(None)` means nothing arrived in time. Must be cancel safe: bytes
    /// already read stay buffered for the next call.
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    /// Drop the current connection and open a new one.
    fn reconnect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Close the connection.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Local port, once initialized.
    fn local_port(&self) -> Option<u16>;
}

/// Build and initialize the transport selected in `config`.
pub async fn connect(
    config: &Config,
    coordinator: Arc<KeepaliveCoordinator>,
) -> Result<Box<dyn Transport>> {
    let mut transport: Box<dyn Transport> = match config.relay.transport {
        TransportKind::Udp => Box::new(UdpTransport::new(
            config.relay.addr(),
            &config.transport,
            coordinator,
        )),
        TransportKind::Tls => {
            let trust = match &config.relay.ca_file {
                Some(path) => TrustConfig::pem_file(path),
                None => {
                    return Err(crate::error::LyncnatError::Config(
                        "relay.ca_file is required for the TLS transport".to_string(),
                    ))
                }
            };
            Box::new(TlsTransport::new(
                config.relay.addr(),
                config.relay.server_name(),
                &trust,
                &config.transport,
                coordinator,
            )?)
        }
    };
    let port = transport.init().await?;
    tracing::info!(
        "{} transport to {} ready on local port {}",
        transport.name(),
        config.relay.addr(),
        port
    );
    Ok(transport)
}

/// Connect the configured transport and start its worker.
pub async fn spawn(config: &Config) -> Result<(TransportHandle, JoinHandle<()>)> {
    let coordinator = Arc::new(KeepaliveCoordinator::new(
        config.session.keepalive_timeout(),
    ));
    let transport = connect(config, coordinator.clone()).await?;
    Ok(TransportWorker::spawn(
        transport,
        coordinator,
        &config.transport,
        config.session.inbound_queue,
    ))
}
