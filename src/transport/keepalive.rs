//! Keepalive deduplication for devices sharing one connection.
//!
//! Several devices can sit behind one socket. The relay only needs a steady
//! heartbeat from one of them (the owner, whichever asked first) plus one
//! keepalive from each other device to learn it is reachable there.
//!
//! | Device    | Keepalive passes                          |
//! |-----------|-------------------------------------------|
//! | owner     | always                                    |
//! | non-owner | first one per connection, then suppressed |
//!
//! Acknowledgements are success or error responses with the keepalive
//! method. Once the owner has been acknowledged, a gap longer than the
//! timeout means the connection is dead.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::codec::constants::method;
use crate::codec::{Header, Message};
use crate::error::{LyncnatError, Result};

/// Silence after which the connection is considered down
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Default)]
struct CoordinatorState {
    owner: Option<Uuid>,
    /// Devices whose keepalive went out on this connection, and whether the
    /// relay acknowledged it
    devices: HashMap<Uuid, bool>,
    last_owner_ack: Option<Instant>,
}

/// Per-connection keepalive gate and liveness monitor.
#[derive(Debug)]
pub struct KeepaliveCoordinator {
    timeout: Duration,
    state: Mutex<CoordinatorState>,
}

impl Default for KeepaliveCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_KEEPALIVE_TIMEOUT)
    }
}

impl KeepaliveCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a keepalive from `device` goes on the wire.
    pub fn should_send(&self, device: Uuid) -> bool {
        let mut state = self.state();
        match state.owner {
            None => {
                state.owner = Some(device);
                state.devices.insert(device, false);
                tracing::debug!(%device, "Device became keepalive owner");
                true
            }
            Some(owner) if owner == device => true,
            Some(_) => {
                if state.devices.contains_key(&device) {
                    false
                } else {
                    state.devices.insert(device, false);
                    true
                }
            }
        }
    }

    /// Gate an outbound frame. Anything that is not a keepalive request with
    /// a device identifier passes untouched.
    pub fn gate(&self, frame: &[u8]) -> bool {
        let Ok(header) = Header::from_bytes(frame) else {
            return true;
        };
        if header.method != method::KEEPALIVE || header.class.is_response() {
            return true;
        }
        match Message::decode(frame).ok().and_then(|m| m.device_id()) {
            Some(device) => self.should_send(device),
            None => true,
        }
    }

    /// Note an inbound keepalive acknowledgement.
    ///
    /// Returns true when `message` was one. An acknowledgement without a
    /// device identifier is credited to the owner.
    pub fn record_ack(&self, message: &Message) -> bool {
        if message.method != method::KEEPALIVE || !message.class.is_response() {
            return false;
        }
        let mut state = self.state();
        let Some(device) = message.device_id().or(state.owner) else {
            return true;
        };
        state.devices.insert(device, true);
        if state.owner == Some(device) {
            state.last_owner_ack = Some(Instant::now());
        }
        true
    }

    /// Fail when the owner has gone quiet for longer than the timeout.
    ///
    /// The timer is cleared on failure so the error fires once per outage.
    pub fn check_liveness(&self) -> Result<()> {
        let mut state = self.state();
        if let Some(last) = state.last_owner_ack {
            let silent = last.elapsed();
            if silent > self.timeout {
                state.last_owner_ack = None;
                return Err(LyncnatError::Network(format!(
                    "no keepalive acknowledgement for {}s, connection seems to be down",
                    silent.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// Forget everything; called on every (re)connect.
    pub fn reset(&self) {
        *self.state() = CoordinatorState::default();
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.state().owner
    }

    pub fn is_acknowledged(&self, device: Uuid) -> bool {
        self.state().devices.get(&device).copied().unwrap_or(false)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
