//! Device sessions with the relay.
//!
//! A [`SessionManager`] takes one device from registration to a running
//! session:
//!
//! ```text
//! Unregistered ──register──▶ Registered ──start()──▶ SessionStarting
//!                                                        │
//!                         fatal identity error ◀─────────┤ success
//!                                  │                     ▼
//!                                  ▼                  Running ──stop()──▶ Stopped
//!                               Stopped
//! ```
//!
//! While running, a tokio task ticks at the configured loop frequency. Each
//! tick sends a keepalive when one is due, calls [`Device::tick`] when its
//! period has elapsed and dispatches at most one inbound frame: actions go
//! to the registered handler, status requests are answered with a snapshot
//! of every status component.
//!
//! A device can also be composed of [`Feature`]s, each with its own state,
//! capabilities and tick cadence counted in loop iterations.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lyncnat::session::{FileIdentityStore, OfflineAccount, SessionManager};
//!
//! let (transport, _worker) = lyncnat::transport::spawn(&config).await?;
//! let identity = FileIdentityStore::new("devices.toml");
//! let manager = SessionManager::new(
//!     &config,
//!     Oven::default(),
//!     registry,
//!     transport,
//!     Arc::new(OfflineAccount),
//!     &identity,
//! )
//! .await?;
//! let running = manager.start().await?;
//! running.send_event("finished", None)?;
//! let oven = running.stop().await?;
//! ```

mod account;
mod device;
mod dispatch;
mod feature;
mod identity;
mod manager;
mod state;

pub use account::{AccountService, OfflineAccount};
pub use device::{Device, DeviceContext};
pub use feature::{Feature, FeatureContext};
pub use identity::{identity_store, FileIdentityStore, IdentityStore, MemoryIdentityStore};
pub use manager::{RunningDevice, SessionManager};
pub use state::SessionState;
