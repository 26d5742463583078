//! Transport worker: one task per physical connection.
//!
//! The worker owns the [`Transport`]. Each pass of its loop:
//!
//! 1. applies attach/detach requests,
//! 2. polls for one inbound frame (bounded by the receive timeout),
//! 3. decodes it, records keepalive acknowledgements and routes it,
//! 4. drains the outbound queue through the keepalive gate,
//! 5. checks keepalive liveness and reconnects on failure.
//!
//! A frame whose DEVICE-ID names an attached device goes only to that
//! device. Anything else goes to every attached device. Frames carrying
//! MESSAGE-INTEGRITY are verified with the receiving device's key first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{KeepaliveCoordinator, Transport};
use crate::codec::{integrity, Message};
use crate::config::TransportConfig;
use crate::error::{LyncnatError, Result};

/// Pause after a failed receive before polling again
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Upper bound on the final flush and close once the worker stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A device's end of the shared connection.
#[derive(Debug)]
pub struct DeviceChannel {
    pub device: Uuid,
    /// Frames to send; keepalives pass through the coordinator gate.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Decoded frames addressed to this device, in arrival order.
    pub inbound: mpsc::Receiver<Message>,
}

enum Command {
    Attach {
        device: Uuid,
        key: Vec<u8>,
        inbound: mpsc::Sender<Message>,
    },
    Detach {
        device: Uuid,
    },
}

struct Attached {
    key: Vec<u8>,
    inbound: mpsc::Sender<Message>,
}

/// Cloneable handle to a running worker.
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    outbound: mpsc::Sender<Vec<u8>>,
    coordinator: Arc<KeepaliveCoordinator>,
    cancel: CancellationToken,
    inbound_capacity: usize,
    transport_name: &'static str,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("transport", &self.transport_name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TransportHandle {
    /// Register `device` and get its channel. `key` verifies inbound
    /// integrity for this device.
    pub fn attach(&self, device: Uuid, key: &[u8]) -> Result<DeviceChannel> {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_capacity);
        self.commands
            .send(Command::Attach {
                device,
                key: key.to_vec(),
                inbound: inbound_tx,
            })
            .map_err(|_| LyncnatError::Network("transport worker has stopped".to_string()))?;
        Ok(DeviceChannel {
            device,
            outbound: self.outbound.clone(),
            inbound: inbound_rx,
        })
    }

    /// Unregister `device`. The worker stops after the last one leaves.
    pub fn detach(&self, device: Uuid) {
        // A stopped worker has nothing left to detach from
        let _ = self.commands.send(Command::Detach { device });
    }

    pub fn coordinator(&self) -> &Arc<KeepaliveCoordinator> {
        &self.coordinator
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the worker regardless of attached devices.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the worker has been told to stop.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport_name
    }
}

/// Owns a transport and moves frames between it and attached devices.
pub struct TransportWorker {
    transport: Box<dyn Transport>,
    coordinator: Arc<KeepaliveCoordinator>,
    devices: HashMap<Uuid, Attached>,
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    had_devices: bool,
}

impl TransportWorker {
    /// Spawn the worker task for an initialized transport.
    pub fn spawn(
        transport: Box<dyn Transport>,
        coordinator: Arc<KeepaliveCoordinator>,
        config: &TransportConfig,
        inbound_capacity: usize,
    ) -> (TransportHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let cancel = CancellationToken::new();

        let handle = TransportHandle {
            commands: command_tx,
            outbound: outbound_tx,
            coordinator: coordinator.clone(),
            cancel: cancel.clone(),
            inbound_capacity: inbound_capacity.max(1),
            transport_name: transport.name(),
        };

        let worker = Self {
            transport,
            coordinator,
            devices: HashMap::new(),
            commands: command_rx,
            outbound: outbound_rx,
            cancel,
            had_devices: false,
        };
        let task = tokio::spawn(worker.run());
        (handle, task)
    }

    async fn run(mut self) {
        tracing::info!("{} worker started", self.transport.name());

        while !self.cancel.is_cancelled() {
            self.apply_commands();
            if self.had_devices && self.devices.is_empty() {
                tracing::debug!("Last device detached, stopping worker");
                self.cancel.cancel();
                break;
            }

            let received = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                received = self.transport.receive() => received,
            };
            match received {
                Ok(Some(frame)) => self.route(&frame),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Receive failed: {}", e);
                    tokio::time::sleep(RECEIVE_ERROR_PAUSE).await;
                }
            }

            // Stream transports reconnect inside send, so both of these can
            // block for as long as the relay is unreachable
            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.drain_outbound() => {}
            }

            if let Err(e) = self.coordinator.check_liveness() {
                tracing::warn!("{}. Reconnecting...", e);
                let reconnected = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break,
                    reconnected = self.transport.reconnect() => reconnected,
                };
                if let Err(e) = reconnected {
                    tracing::error!("Reconnect failed: {}", e);
                }
            }
        }

        // Flush whatever the devices queued on their way out
        let finish = async {
            self.drain_outbound().await;
            self.transport.close().await
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, finish).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Closing transport failed: {}", e),
            Err(_) => tracing::warn!("Transport did not close within {:?}", SHUTDOWN_GRACE),
        }
        tracing::info!("{} worker stopped", self.transport.name());
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Attach {
                    device,
                    key,
                    inbound,
                } => {
                    tracing::debug!(%device, "Device attached");
                    self.devices.insert(device, Attached { key, inbound });
                    self.had_devices = true;
                }
                Command::Detach { device } => {
                    tracing::debug!(%device, "Device detached");
                    self.devices.remove(&device);
                }
            }
        }
    }

    fn route(&mut self, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Dropping frame: {}", e);
                return;
            }
        };

        if self.coordinator.record_ack(&message) {
            tracing::trace!("Keepalive acknowledged");
            return;
        }

        let targets: Vec<Uuid> = match message.device_id() {
            Some(device) if self.devices.contains_key(&device) => vec![device],
            _ => self.devices.keys().copied().collect(),
        };

        let mut closed = Vec::new();
        for device in targets {
            let Some(attached) = self.devices.get(&device) else {
                continue;
            };
            if let Err(e) = integrity::verify(frame, &attached.key) {
                tracing::warn!(%device, "Dropping {} frame: {}", message.class, e);
                continue;
            }
            match attached.inbound.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%device, "Inbound queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(device),
            }
        }
        for device in closed {
            self.devices.remove(&device);
        }
    }

    async fn drain_outbound(&mut self) {
        while let Ok(frame) = self.outbound.try_recv() {
            if !self.coordinator.gate(&frame) {
                tracing::trace!("Keepalive suppressed");
                continue;
            }
            if let Err(e) = self.transport.send(&frame).await {
                tracing::warn!("Send failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::constants::{attr, method};
    use crate::codec::{MessageClass, MessageFactory};
    use crate::transport::BoxFuture;

    /// In-memory transport: frames pushed into `inject` arrive as received,
    /// sent frames show up on `sent`.
    struct MockTransport {
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        sent: mpsc::UnboundedSender<Vec<u8>>,
        reconnects: Arc<std::sync::atomic::AtomicUsize>,
        reconnect_hangs: Arc<std::sync::atomic::AtomicBool>,
        coordinator: Arc<KeepaliveCoordinator>,
    }

    impl Transport for MockTransport {
        fn init(&mut self) -> BoxFuture<'_, Result<u16>> {
            Box::pin(async { Ok(40000) })
        }

        fn send<'a>(&'a mut self, frame: &'a [u8]) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                let _ = self.sent.send(frame.to_vec());
                Ok(())
            })
        }

        fn receive(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
            Box::pin(async move {
                match tokio::time::timeout(Duration::from_millis(5), self.incoming.recv()).await {
                    Ok(frame) => Ok(frame),
                    Err(_) => Ok(None),
                }
            })
        }

        fn reconnect(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.reconnects
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if self.reconnect_hangs.load(std::sync::atomic::Ordering::SeqCst) {
                    // Relay unreachable: a stream transport would keep retrying
                    std::future::pending::<()>().await;
                }
                self.coordinator.reset();
                Ok(())
            })
        }

        fn close(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn name(&self) -> &'static str {
            "mock"
        }

        fn local_port(&self) -> Option<u16> {
            Some(40000)
        }
    }

    struct Harness {
        handle: TransportHandle,
        task: JoinHandle<()>,
        inject: mpsc::UnboundedSender<Vec<u8>>,
        sent: mpsc::UnboundedReceiver<Vec<u8>>,
        reconnects: Arc<std::sync::atomic::AtomicUsize>,
        reconnect_hangs: Arc<std::sync::atomic::AtomicBool>,
    }

    fn harness(coordinator: KeepaliveCoordinator) -> Harness {
        let coordinator = Arc::new(coordinator);
        let (inject, incoming) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let reconnects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let reconnect_hangs = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let transport = MockTransport {
            incoming,
            sent: sent_tx,
            reconnects: reconnects.clone(),
            reconnect_hangs: reconnect_hangs.clone(),
            coordinator: coordinator.clone(),
        };
        let (handle, task) = TransportWorker::spawn(
            Box::new(transport),
            coordinator,
            &TransportConfig::default(),
            8,
        );
        Harness {
            handle,
            task,
            inject,
            sent,
            reconnects,
            reconnect_hangs,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    fn action_for(device: Uuid, factory: &MessageFactory) -> Vec<u8> {
        Message::new(MessageClass::Request, method::ACTION)
            .with_attribute(attr::USERNAME, b"relay".to_vec())
            .with_attribute(attr::NAME, b"bake".to_vec())
            .with_attribute(attr::DEVICE_ID, device.as_bytes().to_vec())
            .encode(Some(factory.key()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_device_id() {
        let h = harness(KeepaliveCoordinator::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let fa = MessageFactory::new("u", "key-a");
        let fb = MessageFactory::new("u", "key-b");
        let mut ca = h.handle.attach(a, fa.key()).unwrap();
        let mut cb = h.handle.attach(b, fb.key()).unwrap();

        h.inject.send(action_for(b, &fb)).unwrap();
        let got = next(&mut cb.inbound).await;
        assert_eq!(got.device_id(), Some(b));
        assert!(ca.inbound.try_recv().is_err());

        // No DEVICE-ID, no integrity: everyone gets it
        let broadcast = Message::new(MessageClass::Indication, method::NOTIFICATION)
            .encode(None)
            .unwrap();
        h.inject.send(broadcast).unwrap();
        next(&mut ca.inbound).await;
        next(&mut cb.inbound).await;

        h.handle.shutdown();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_drops_frames_with_bad_integrity() {
        let h = harness(KeepaliveCoordinator::default());
        let a = Uuid::new_v4();
        let mut ca = h.handle.attach(a, b"right-key").unwrap();

        let wrong = MessageFactory::new("u", "wrong-key");
        h.inject.send(action_for(a, &wrong)).unwrap();
        let right = MessageFactory::new("u", "right-key");
        h.inject.send(action_for(a, &right)).unwrap();

        // Only the correctly signed frame comes through
        let got = next(&mut ca.inbound).await;
        assert_eq!(got.attribute_str(attr::NAME), Some("bake"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ca.inbound.try_recv().is_err());

        h.handle.shutdown();
    }

    #[tokio::test]
    async fn test_keepalives_are_gated_and_acks_consumed() {
        let mut h = harness(KeepaliveCoordinator::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let f = MessageFactory::new("u", "k");
        let mut ca = h.handle.attach(a, f.key()).unwrap();
        let cb = h.handle.attach(b, f.key()).unwrap();

        for _ in 0..2 {
            ca.outbound.send(f.keepalive(a).unwrap()).await.unwrap();
            cb.outbound.send(f.keepalive(b).unwrap()).await.unwrap();
        }
        let mut sent = Vec::new();
        while sent.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(2), h.sent.recv())
                .await
                .unwrap()
                .unwrap();
            sent.push(Message::decode(&frame).unwrap().device_id().unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.sent.try_recv().is_err(), "second keepalive from b leaked");
        assert_eq!(sent.iter().filter(|d| **d == a).count(), 2);
        assert_eq!(sent.iter().filter(|d| **d == b).count(), 1);

        let ack = Message::new(MessageClass::Success, method::KEEPALIVE)
            .with_attribute(attr::DEVICE_ID, a.as_bytes().to_vec())
            .encode(None)
            .unwrap();
        h.inject.send(ack).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.handle.coordinator().is_acknowledged(a));
        assert!(ca.inbound.try_recv().is_err(), "acks are not routed");

        h.handle.shutdown();
    }

    #[tokio::test]
    async fn test_liveness_failure_reconnects() {
        let h = harness(KeepaliveCoordinator::new(Duration::from_millis(20)));
        let a = Uuid::new_v4();
        let f = MessageFactory::new("u", "k");
        let ca = h.handle.attach(a, f.key()).unwrap();
        ca.outbound.send(f.keepalive(a).unwrap()).await.unwrap();

        let ack = Message::new(MessageClass::Success, method::KEEPALIVE)
            .encode(None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.inject.send(ack).unwrap();

        let mut reconnected = false;
        for _ in 0..100 {
            if h.reconnects.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                reconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reconnected);
        h.handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stuck_reconnect() {
        let h = harness(KeepaliveCoordinator::new(Duration::from_millis(20)));
        h.reconnect_hangs
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let a = Uuid::new_v4();
        let f = MessageFactory::new("u", "k");
        let ca = h.handle.attach(a, f.key()).unwrap();
        ca.outbound.send(f.keepalive(a).unwrap()).await.unwrap();

        let ack = Message::new(MessageClass::Success, method::KEEPALIVE)
            .encode(None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.inject.send(ack).unwrap();

        for _ in 0..100 {
            if h.reconnects.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.reconnects.load(std::sync::atomic::Ordering::SeqCst) > 0);

        // The device is still attached, so only shutdown can end the task
        h.handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("worker ignored shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_after_last_detach() {
        let h = harness(KeepaliveCoordinator::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _ca = h.handle.attach(a, b"k").unwrap();
        let _cb = h.handle.attach(b, b"k").unwrap();

        h.handle.detach(a);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.handle.is_running());

        h.handle.detach(b);
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(!h.handle.is_running());
        assert!(h.handle.attach(a, b"k").is_err());
    }
}
