//! End-to-end transport layer tests.
//!
//! These run the UDP and TLS transports against real sockets on localhost.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lyncnat::codec::constants::method;
use lyncnat::codec::{Message, MessageClass, MessageFactory};
use lyncnat::config::TransportConfig;
use lyncnat::transport::{
    KeepaliveCoordinator, TlsTransport, Transport, TransportWorker, TrustConfig, UdpTransport,
};
use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

fn transport_config() -> TransportConfig {
    TransportConfig {
        receive_timeout_ms: 50,
        reconnect_initial_ms: 10,
        reconnect_max_ms: 100,
        ..TransportConfig::default()
    }
}

/// Test CA and a `localhost` server certificate signed by it.
struct TestPki {
    ca_der: Vec<u8>,
    acceptor: TlsAcceptor,
}

fn test_pki() -> TestPki {
    let mut ca_params = CertificateParams::new(Vec::new());
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = Certificate::from_params(ca_params).unwrap();

    let leaf = Certificate::from_params(CertificateParams::new(vec!["localhost".to_string()]))
        .unwrap();
    let leaf_der = leaf.serialize_der_with_signer(&ca).unwrap();
    let key_der = leaf.serialize_private_key_der();

    let server = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(leaf_der)],
            rustls::PrivateKey(key_der),
        )
        .unwrap();

    TestPki {
        ca_der: ca.serialize_der().unwrap(),
        acceptor: TlsAcceptor::from(Arc::new(server)),
    }
}

/// Accept TLS connections forever, handing each stream to the test
async fn tls_relay(
    acceptor: TlsAcceptor,
) -> (SocketAddr, mpsc::UnboundedReceiver<TlsStream<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            if let Ok(stream) = acceptor.accept(tcp).await {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        }
    });
    (addr, rx)
}

async fn receive_frame(transport: &mut dyn Transport) -> Vec<u8> {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(frame) = transport.receive().await.unwrap() {
                return frame;
            }
        }
    })
    .await
    .expect("no frame within 5s")
}

#[tokio::test]
async fn test_tls_frames_split_across_writes() {
    let pki = test_pki();
    let (addr, mut accepted) = tls_relay(pki.acceptor.clone()).await;

    let coordinator = Arc::new(KeepaliveCoordinator::default());
    let mut transport = TlsTransport::new(
        addr.to_string(),
        "localhost",
        &TrustConfig::der(pki.ca_der.clone()),
        &transport_config(),
        coordinator,
    )
    .unwrap();
    let port = transport.init().await.unwrap();
    assert_eq!(transport.local_port(), Some(port));
    let mut server = accepted.recv().await.unwrap();

    // One frame in two writes, then two frames in one write
    let factory = MessageFactory::new("relay", "key");
    let first = factory.keepalive(Uuid::new_v4()).unwrap();
    let second = factory.end_session(Uuid::new_v4()).unwrap();
    let third = factory.keepalive(Uuid::new_v4()).unwrap();

    server.write_all(&first[..7]).await.unwrap();
    server.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.write_all(&first[7..]).await.unwrap();
    let mut both = second.clone();
    both.extend_from_slice(&third);
    server.write_all(&both).await.unwrap();
    server.flush().await.unwrap();

    assert_eq!(receive_frame(&mut transport).await, first);
    assert_eq!(receive_frame(&mut transport).await, second);
    assert_eq!(receive_frame(&mut transport).await, third);

    // Client to server
    transport.send(&first).await.unwrap();
    let mut buf = vec![0u8; first.len()];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, first);

    transport.close().await.unwrap();
    assert_eq!(transport.local_port(), None);
}

#[tokio::test]
async fn test_tls_reconnects_after_server_close() {
    let pki = test_pki();
    let (addr, mut accepted) = tls_relay(pki.acceptor.clone()).await;

    let coordinator = Arc::new(KeepaliveCoordinator::default());
    let mut transport = TlsTransport::new(
        addr.to_string(),
        "localhost",
        &TrustConfig::der(pki.ca_der.clone()),
        &transport_config(),
        coordinator.clone(),
    )
    .unwrap();
    transport.init().await.unwrap();
    let mut server = accepted.recv().await.unwrap();

    let owner = Uuid::new_v4();
    assert!(coordinator.should_send(owner));
    assert_eq!(coordinator.owner(), Some(owner));

    server.shutdown().await.unwrap();
    drop(server);

    // The read sees EOF and the transport dials again
    let nothing = timeout(Duration::from_secs(5), transport.receive())
        .await
        .unwrap()
        .unwrap();
    assert!(nothing.is_none());
    let mut server = timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(coordinator.owner(), None);

    let factory = MessageFactory::new("relay", "key");
    let frame = factory.keepalive(owner).unwrap();
    server.write_all(&frame).await.unwrap();
    server.flush().await.unwrap();
    assert_eq!(receive_frame(&mut transport).await, frame);
}

#[tokio::test]
async fn test_tls_rejects_untrusted_relay() {
    let relay_pki = test_pki();
    let other_pki = test_pki();
    let (addr, _accepted) = tls_relay(relay_pki.acceptor.clone()).await;

    let mut transport = TlsTransport::new(
        addr.to_string(),
        "localhost",
        &TrustConfig::der(other_pki.ca_der.clone()),
        &transport_config(),
        Arc::new(KeepaliveCoordinator::default()),
    )
    .unwrap();

    // Connecting retries forever, so init never completes
    let result = timeout(Duration::from_millis(300), transport.init()).await;
    assert!(result.is_err());
}

#[test]
fn test_tls_rejects_bad_server_name() {
    let pki = test_pki();
    let result = TlsTransport::new(
        "127.0.0.1:1",
        "not a hostname!",
        &TrustConfig::der(pki.ca_der),
        &transport_config(),
        Arc::new(KeepaliveCoordinator::default()),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn test_udp_transport_exchanges_datagrams() {
    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = relay.local_addr().unwrap();

    let mut transport = UdpTransport::new(
        addr.to_string(),
        &transport_config(),
        Arc::new(KeepaliveCoordinator::default()),
    );
    let port = transport.init().await.unwrap();
    assert_ne!(port, 0);

    // Nothing waiting
    assert!(transport.receive().await.unwrap().is_none());

    let factory = MessageFactory::new("device", "key");
    let frame = factory.keepalive(Uuid::new_v4()).unwrap();
    transport.send(&frame).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, from) = relay.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &frame[..]);
    assert_eq!(from.port(), port);

    relay.send_to(&frame, from).await.unwrap();
    assert_eq!(receive_frame(&mut transport).await, frame);
}

#[tokio::test]
async fn test_worker_over_udp_delivers_to_device() {
    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = relay.local_addr().unwrap();
    let config = transport_config();

    let coordinator = Arc::new(KeepaliveCoordinator::default());
    let mut transport = UdpTransport::new(addr.to_string(), &config, coordinator.clone());
    transport.init().await.unwrap();
    let (handle, task) = TransportWorker::spawn(Box::new(transport), coordinator, &config, 8);
    assert_eq!(handle.transport_name(), "UDP");

    let device = Uuid::new_v4();
    let mut channel = handle.attach(device, b"key").unwrap();
    let factory = MessageFactory::new("device", "key");
    channel
        .outbound
        .send(factory.end_session(device).unwrap())
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, from) = timeout(Duration::from_secs(5), relay.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let request = Message::decode_verified(&buf[..n], b"key").unwrap();
    assert_eq!(request.method, method::BINDING);

    let relay_factory = MessageFactory::new("relay", "key");
    let reply = relay_factory
        .success_response(&request, Vec::new(), None)
        .unwrap();
    relay.send_to(&reply, from).await.unwrap();

    let delivered = timeout(Duration::from_secs(5), channel.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.class, MessageClass::Success);
    assert_eq!(delivered.transaction_id, request.transaction_id);

    handle.detach(device);
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(!handle.is_running());
}
