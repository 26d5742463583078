//! Several devices behind one UDP connection share a single heartbeat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lyncnat::codec::constants::method;
use lyncnat::codec::{Message, MessageFactory};
use lyncnat::config::TransportConfig;
use lyncnat::transport::{KeepaliveCoordinator, Transport, TransportWorker, UdpTransport};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use uuid::Uuid;

const KEY: &str = "shared-key";

async fn collect(relay: &UdpSocket, quiet: Duration) -> Vec<Message> {
    let mut frames = Vec::new();
    let mut buf = vec![0u8; 2048];
    while let Ok(received) = timeout(quiet, relay.recv_from(&mut buf)).await {
        let (n, _) = received.unwrap();
        frames.push(Message::decode_verified(&buf[..n], KEY.as_bytes()).unwrap());
    }
    frames
}

#[tokio::test]
async fn test_only_owner_repeats_keepalives() {
    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = TransportConfig {
        receive_timeout_ms: 10,
        ..TransportConfig::default()
    };

    let coordinator = Arc::new(KeepaliveCoordinator::default());
    let mut transport = UdpTransport::new(
        relay.local_addr().unwrap().to_string(),
        &config,
        coordinator.clone(),
    );
    transport.init().await.unwrap();
    let (handle, _task) = TransportWorker::spawn(Box::new(transport), coordinator, &config, 8);

    let factory = MessageFactory::new("owner", KEY);
    let devices = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let channels: Vec<_> = devices
        .iter()
        .map(|device| handle.attach(*device, KEY.as_bytes()).unwrap())
        .collect();

    for _ in 0..2 {
        for channel in &channels {
            channel
                .outbound
                .send(factory.keepalive(channel.device).unwrap())
                .await
                .unwrap();
        }
    }

    let frames = collect(&relay, Duration::from_millis(300)).await;
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for frame in &frames {
        assert_eq!(frame.method, method::KEEPALIVE);
        *counts.entry(frame.device_id().unwrap()).or_default() += 1;
    }

    assert_eq!(counts[&devices[0]], 2);
    assert_eq!(counts[&devices[1]], 1);
    assert_eq!(counts[&devices[2]], 1);
    assert_eq!(handle.coordinator().owner(), Some(devices[0]));
}

#[tokio::test]
async fn test_acks_are_not_delivered_to_devices() {
    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = TransportConfig {
        receive_timeout_ms: 10,
        ..TransportConfig::default()
    };

    let coordinator = Arc::new(KeepaliveCoordinator::default());
    let mut transport = UdpTransport::new(
        relay.local_addr().unwrap().to_string(),
        &config,
        coordinator.clone(),
    );
    transport.init().await.unwrap();
    let (handle, _task) = TransportWorker::spawn(Box::new(transport), coordinator, &config, 8);

    let device = Uuid::new_v4();
    let mut channel = handle.attach(device, KEY.as_bytes()).unwrap();
    let factory = MessageFactory::new("owner", KEY);
    channel
        .outbound
        .send(factory.keepalive(device).unwrap())
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, from) = timeout(Duration::from_secs(5), relay.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let keepalive = Message::decode_verified(&buf[..n], KEY.as_bytes()).unwrap();

    let relay_factory = MessageFactory::new("relay", KEY);
    let ack = relay_factory
        .success_response(&keepalive, Vec::new(), None)
        .unwrap();
    relay.send_to(&ack, from).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while !handle.coordinator().is_acknowledged(device) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(channel.inbound.try_recv().is_err());
}
