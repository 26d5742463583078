//! # LyncNat device runtime
//!
//! Runs a process as a remote "device" on a LyncNat cloud relay. Devices
//! expose actions, events and status components, and talk to the relay over
//! a binary protocol derived from STUN (RFC 5389).
//!
//! ## Features
//!
//! - **Wire codec**: STUN-style framing, TLV attributes, HMAC-SHA1 message
//!   integrity keyed with the device API key
//! - **Argument codec**: typed, bit-packed argument lists for actions and
//!   status snapshots
//! - **Transports**: UDP, or TLS over TCP with reconnect backoff
//! - **Keepalive sharing**: many devices behind one connection send one
//!   heartbeat stream between them
//! - **Sessions**: registration, session start with retry, a ticking main
//!   loop and request dispatch
//! - **Features**: compose a device from parts that bring their own
//!   capabilities and tick cadence
//!
//! ## Protocol Overview
//!
//! ```text
//! Device                          Relay
//!    |                              |
//!    |---- BINDING (start) -------->|
//!    |<--- BINDING success ---------|
//!    |---- KEEPALIVE -------------->|   every 30 s
//!    |<--- KEEPALIVE success -------|
//!    |                              |
//!    |<--- ACTION (ARGUMENTS) ------|
//!    |---- ACTION success --------->|
//!    |<--- STATUS_REQUEST ----------|
//!    |---- success (ARGUMENTS) ---->|
//!    |---- EVENT ------------------>|
//!    |                              |
//!    |---- BINDING (end) ---------->|
//! ```
//!
//! ### Wire Format
//!
//! | Bytes | Field                                     |
//! |-------|-------------------------------------------|
//! | 0–1   | message type (class and method interleaved) |
//! | 2–3   | body length                               |
//! | 4–7   | magic cookie `21 12 A4 42`                |
//! | 8–19  | transaction ID                            |
//! | 20+   | attributes: type, length, padded value    |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lyncnat::capability::CapabilityRegistry;
//! use lyncnat::codec::{ArgumentDef, ArgumentType, ArgumentValue};
//! use lyncnat::session::{identity_store, Device, OfflineAccount, SessionManager};
//! use lyncnat::Config;
//!
//! #[derive(Default)]
//! struct Lamp {
//!     on: bool,
//! }
//!
//! impl Device for Lamp {}
//!
//! let config = Config::from_file("lamp.toml")?;
//! let registry = CapabilityRegistry::<Lamp>::builder()
//!     .action("switch", "turn on or off",
//!         vec![ArgumentDef::new("on", ArgumentType::Boolean)],
//!         |lamp, args| {
//!             lamp.on = args[0].as_bool().unwrap_or(false);
//!             Ok(())
//!         })
//!     .status("on", ArgumentType::Boolean, |lamp| Ok(ArgumentValue::Boolean(lamp.on)))
//!     .build()?;
//!
//! let (transport, _worker) = lyncnat::transport::spawn(&config).await?;
//! let identity = identity_store(&config.device);
//! let running = SessionManager::new(
//!     &config,
//!     Lamp::default(),
//!     registry,
//!     transport,
//!     Arc::new(OfflineAccount),
//!     identity.as_ref(),
//! )
//! .await?
//! .start()
//! .await?;
//! ```

pub mod capability;
pub mod codec;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use capability::{CapabilityRegistry, DeviceDescriptor, DeviceInfo};
pub use codec::{ArgumentDef, ArgumentType, ArgumentValue, Message, MessageClass, MessageFactory};
pub use config::Config;
pub use error::{IdentityFailure, LyncnatError, Result};
pub use session::{
    Device, DeviceContext, Feature, FeatureContext, RunningDevice, SessionManager, SessionState,
};
pub use transport::{KeepaliveCoordinator, Transport, TransportHandle, TransportKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
