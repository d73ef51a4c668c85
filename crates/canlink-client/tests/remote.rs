//! Client against an in-process gateway

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use canlink_client::{register, ClientError, GatewayClient, RemoteAdapter, GATEWAY};
use canlink_core::{
    Adapter, AdapterError, CancelToken, Config, Frame, PortInfo, RegistryBuilder,
};
use canlink_gateway::{FixedPorts, GatewayServer};
use pretty_assertions::assert_eq;
use tokio::task::JoinHandle;

struct Gateway {
    _dir: tempfile::TempDir,
    path: PathBuf,
    handle: JoinHandle<()>,
    shutdown: CancelToken,
}

async fn gateway() -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("canlink.sock");
    let mut builder = RegistryBuilder::new();
    canlink_adapters::register_all(&mut builder).unwrap();
    let ports = FixedPorts(vec![PortInfo {
        name: "/dev/ttyUSB3".to_string(),
        kind: "usb".to_string(),
        description: Some("FT232R USB UART".to_string()),
        ..Default::default()
    }]);
    let server = GatewayServer::bind(&path, Arc::new(builder.build()))
        .await
        .unwrap()
        .with_ports(Arc::new(ports));
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(async move { server.serve().await.unwrap() });
    Gateway {
        _dir: dir,
        path,
        handle,
        shutdown,
    }
}

async fn next(rx: &mut tokio::sync::mpsc::Receiver<Frame>) -> Frame {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame in time")
        .expect("channel open")
}

#[tokio::test]
async fn test_control_calls() {
    let gw = gateway().await;
    let client = GatewayClient::new(&gw.path);

    client.ping().await.unwrap();
    assert_eq!(client.send_command(b"status").await.unwrap(), b"unknown command".to_vec());

    let adapters = client.list_adapters().await.unwrap();
    assert!(adapters.iter().any(|info| info.name == "Loopback"));
    assert!(adapters.iter().any(|info| info.name == "ELM327" && info.requires_serial_port));

    let ports = client.list_ports().await.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].description.as_deref(), Some("FT232R USB UART"));

    client.quit().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), gw.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        client.ping().await,
        Err(ClientError::ConnectionFailed(_))
    ));
}

#[tokio::test]
async fn test_remote_loopback() {
    let gw = gateway().await;
    let adapter = RemoteAdapter::new(&gw.path, "Loopback", Config::default());
    assert_eq!(adapter.name(), GATEWAY);
    let mut rx = adapter.recv().unwrap();
    adapter.connect(&CancelToken::new()).await.unwrap();

    let tx = adapter.sender();
    for (id, byte) in [(0x7E0u32, 0x10u8), (0x7E1, 0x11), (0x18DA10F1, 0x12)] {
        tx.send(Frame::outgoing(id, vec![0x02u8, byte])).await.unwrap();
    }
    for (id, byte) in [(0x7E0u32, 0x10u8), (0x7E1, 0x11), (0x18DA10F1, 0x12)] {
        let frame = next(&mut rx).await;
        assert_eq!(frame.id(), id);
        assert_eq!(frame.data(), &[0x02, byte]);
    }

    adapter.close().await.unwrap();
    adapter.close().await.unwrap();
    gw.shutdown.cancel();
}

#[tokio::test]
async fn test_remote_filter_applies_on_gateway() {
    let gw = gateway().await;
    let adapter = RemoteAdapter::new(&gw.path, "Loopback", Config::default());
    let mut rx = adapter.recv().unwrap();
    adapter.connect(&CancelToken::new()).await.unwrap();

    adapter.set_filter(&[0x7E8]).await.unwrap();
    let tx = adapter.sender();
    tx.send(Frame::outgoing(0x7E0, vec![1u8])).await.unwrap();
    tx.send(Frame::outgoing(0x7E8, vec![2u8])).await.unwrap();
    assert_eq!(next(&mut rx).await.id(), 0x7E8);

    adapter.close().await.unwrap();
    gw.shutdown.cancel();
}

#[tokio::test]
async fn test_filter_before_connect_travels_in_hello() {
    let gw = gateway().await;
    let adapter = RemoteAdapter::new(&gw.path, "Loopback", Config::default());
    adapter.set_filter(&[0x7E9]).await.unwrap();
    let mut rx = adapter.recv().unwrap();
    adapter.connect(&CancelToken::new()).await.unwrap();

    let tx = adapter.sender();
    tx.send(Frame::outgoing(0x7E8, vec![1u8])).await.unwrap();
    tx.send(Frame::outgoing(0x7E9, vec![2u8])).await.unwrap();
    assert_eq!(next(&mut rx).await.id(), 0x7E9);

    adapter.close().await.unwrap();
    gw.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_remote_adapter_is_handshake_error() {
    let gw = gateway().await;
    let adapter = RemoteAdapter::new(&gw.path, "Vector XL", Config::default());
    match adapter.connect(&CancelToken::new()).await {
        Err(AdapterError::Handshake(reason)) => assert!(reason.contains("Vector XL")),
        other => panic!("expected a handshake error, got {:?}", other),
    }
    gw.shutdown.cancel();
}

#[tokio::test]
async fn test_gateway_shutdown_reported() {
    let gw = gateway().await;
    let adapter = RemoteAdapter::new(&gw.path, "Loopback", Config::default());
    let mut errors = adapter.errors().unwrap();
    adapter.connect(&CancelToken::new()).await.unwrap();

    gw.shutdown.cancel();
    let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, AdapterError::TransportIo(_)));
    assert!(err.is_fatal());
    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_registered_as_gateway() {
    let gw = gateway().await;
    let mut builder = RegistryBuilder::new();
    register(&mut builder, &gw.path, "Loopback").unwrap();
    let registry = builder.build();
    assert!(registry.describe(GATEWAY).unwrap().description.contains("Loopback"));

    let adapter = registry.new_adapter(GATEWAY, Config::default()).unwrap();
    let mut rx = adapter.recv().unwrap();
    adapter.connect(&CancelToken::new()).await.unwrap();
    adapter
        .sender()
        .send(Frame::outgoing(0x123, vec![0xAAu8]))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.data(), &[0xAA]);
    adapter.close().await.unwrap();
    gw.shutdown.cancel();
}
