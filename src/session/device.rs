//! The application side of a device.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::MessageFactory;
use crate::error::{LyncnatError, Result};

/// Hooks the session calls on the device's own state.
///
/// Capabilities are declared separately through
/// [`CapabilityRegistry`](crate::capability::CapabilityRegistry); handlers
/// there receive `&mut Self`.
pub trait Device: Send + 'static {
    /// Runs once in [`SessionManager::start`](super::SessionManager::start)
    /// before anything goes on the wire.
    fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Periodic callback from the main loop.
    fn tick(&mut self, _ctx: &DeviceContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Minimum time between two [`tick`](Self::tick) calls. `None` runs it
    /// on every loop iteration.
    fn tick_period(&self) -> Option<Duration> {
        None
    }
}

/// Outbound side of a running session: events, logs and subscriptions.
///
/// Frames are queued without waiting. A full outbound queue is reported as
/// a network error and the frame is dropped.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    device: Uuid,
    factory: MessageFactory,
    outbound: mpsc::Sender<Vec<u8>>,
    events: Arc<HashSet<String>>,
}

impl DeviceContext {
    pub(crate) fn new(
        device: Uuid,
        factory: MessageFactory,
        outbound: mpsc::Sender<Vec<u8>>,
        events: HashSet<String>,
    ) -> Self {
        Self {
            device,
            factory,
            outbound,
            events: Arc::new(events),
        }
    }

    pub fn device(&self) -> Uuid {
        self.device
    }

    /// Send a declared event. `payload` defaults to empty.
    pub fn send_event(&self, name: &str, payload: Option<&[u8]>) -> Result<()> {
        if !self.events.contains(name) {
            return Err(LyncnatError::UnknownCapability(format!("event '{}'", name)));
        }
        let frame = self
            .factory
            .event_request(self.device, name, payload.unwrap_or_default())?;
        self.queue(frame)?;
        tracing::debug!(device = %self.device, "Event '{}' queued", name);
        Ok(())
    }

    /// Send a log line to the relay at `level`.
    pub fn send_log(&self, level: u8, message: &str) -> Result<()> {
        self.queue(self.factory.log_request(self.device, level, message)?)
    }

    pub fn subscribe(&self, event: &str) -> Result<()> {
        self.queue(self.factory.subscription_request(self.device, event, true)?)
    }

    pub fn unsubscribe(&self, event: &str) -> Result<()> {
        self.queue(
            self.factory
                .subscription_request(self.device, event, false)?,
        )
    }

    pub(crate) fn queue(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                LyncnatError::Network("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                LyncnatError::Network("transport worker has stopped".to_string())
            }
        })
    }
}
