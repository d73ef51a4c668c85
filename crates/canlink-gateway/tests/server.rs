//! Gateway server over a real Unix socket

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use canlink_core::{Config, Frame, PortInfo, RegistryBuilder};
use canlink_gateway::{
    guard, hello, read_message, write_message, FixedPorts, GatewayError, GatewayServer, Message,
};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

struct Running {
    _dir: tempfile::TempDir,
    path: PathBuf,
    handle: JoinHandle<()>,
}

async fn start() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("canlink.sock");
    let handle = spawn_server(&path).await;
    Running {
        _dir: dir,
        path,
        handle,
    }
}

async fn spawn_server(path: &Path) -> JoinHandle<()> {
    let mut builder = RegistryBuilder::new();
    canlink_adapters::register_all(&mut builder).unwrap();
    let ports = FixedPorts(vec![PortInfo {
        name: "/dev/ttyACM0".to_string(),
        kind: "usb".to_string(),
        vid: Some(0x0403),
        pid: Some(0x6001),
        ..Default::default()
    }]);
    let server = GatewayServer::bind(path, Arc::new(builder.build()))
        .await
        .unwrap()
        .with_ports(Arc::new(ports));
    tokio::spawn(async move { server.serve().await.unwrap() })
}

async fn request(path: &Path, msg: Message) -> Option<Message> {
    let mut stream = UnixStream::connect(path).await.unwrap();
    write_message(&mut stream, &msg).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), read_message(&mut stream))
        .await
        .unwrap()
        .unwrap()
}

async fn next_frame(stream: &mut UnixStream) -> Frame {
    match tokio::time::timeout(Duration::from_secs(2), read_message(stream)).await {
        Ok(Ok(Some(Message::Frame(frame)))) => frame,
        other => panic!("expected a frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_and_discovery() {
    let gw = start().await;

    assert_eq!(
        request(&gw.path, Message::Command(b"ping".to_vec())).await,
        Some(Message::CommandReply(b"pong".to_vec()))
    );

    match request(&gw.path, Message::ListAdapters).await {
        Some(Message::Adapters(list)) => {
            let names: Vec<_> = list.iter().map(|info| info.name.as_str()).collect();
            for name in ["CANBridge", "CANUSB", "ELM327", "Loopback", "SLCAN"] {
                assert!(names.contains(&name), "{} missing from {:?}", name, names);
            }
        }
        other => panic!("unexpected reply {:?}", other),
    }

    match request(&gw.path, Message::ListPorts).await {
        Some(Message::Ports(ports)) => {
            assert_eq!(ports.len(), 1);
            assert_eq!(ports[0].vid, Some(0x0403));
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn test_loopback_session() {
    let gw = start().await;
    let mut stream = UnixStream::connect(&gw.path).await.unwrap();
    write_message(&mut stream, &Message::Hello(hello("Loopback", &Config::default())))
        .await
        .unwrap();
    let sentinel = next_frame(&mut stream).await;
    assert_eq!(sentinel.id(), 0);
    assert_eq!(sentinel.data(), b"OK");

    for id in [0x7E0u32, 0x7E1, 0x7E2] {
        write_message(&mut stream, &Message::Frame(Frame::outgoing(id, vec![0x02u8, 0x3E, 0x00])))
            .await
            .unwrap();
    }
    for id in [0x7E0u32, 0x7E1, 0x7E2] {
        let frame = next_frame(&mut stream).await;
        assert_eq!(frame.id(), id);
        assert_eq!(frame.data(), &[0x02, 0x3E, 0x00]);
    }

    // A session in progress does not block control calls
    assert_eq!(
        request(&gw.path, Message::Command(b"ping".to_vec())).await,
        Some(Message::CommandReply(b"pong".to_vec()))
    );
}

#[tokio::test]
async fn test_serial_adapter_without_port_fails_session() {
    let gw = start().await;
    let mut stream = UnixStream::connect(&gw.path).await.unwrap();
    let config = Config::new("/nonexistent/ttyCAN9");
    write_message(&mut stream, &Message::Hello(hello("SLCAN", &config)))
        .await
        .unwrap();
    let sentinel = next_frame(&mut stream).await;
    assert_eq!(sentinel.id(), 0);
    assert_ne!(sentinel.data(), b"OK");
}

#[tokio::test]
async fn test_quit_stops_server_and_sessions() {
    let gw = start().await;
    let mut session = UnixStream::connect(&gw.path).await.unwrap();
    write_message(&mut session, &Message::Hello(hello("Loopback", &Config::default())))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut session).await.data(), b"OK");

    assert_eq!(
        request(&gw.path, Message::Command(b"quit".to_vec())).await,
        Some(Message::CommandReply(b"bye".to_vec()))
    );
    tokio::time::timeout(Duration::from_secs(5), gw.handle)
        .await
        .unwrap()
        .unwrap();

    assert!(!gw.path.exists());
    // The live session was closed with the server
    let end = tokio::time::timeout(Duration::from_secs(2), read_message(&mut session))
        .await
        .unwrap();
    assert!(matches!(end, Ok(None) | Err(_)));
}

#[tokio::test]
async fn test_second_instance_refused() {
    let gw = start().await;
    assert!(guard::is_running(&gw.path).await);

    let mut builder = RegistryBuilder::new();
    canlink_adapters::register_all(&mut builder).unwrap();
    let second = GatewayServer::bind(&gw.path, Arc::new(builder.build())).await;
    assert!(matches!(second, Err(GatewayError::AlreadyRunning(_))));

    // The first instance still owns the socket
    assert_eq!(
        request(&gw.path, Message::Command(b"ping".to_vec())).await,
        Some(Message::CommandReply(b"pong".to_vec()))
    );
}

#[tokio::test]
async fn test_stale_socket_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("canlink.sock");
    {
        // Bound then dropped: the file stays behind with nobody listening
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
    }
    assert!(path.exists());
    assert!(!guard::is_running(&path).await);

    let _server = spawn_server(&path).await;
    assert_eq!(
        request(&path, Message::Command(b"ping".to_vec())).await,
        Some(Message::CommandReply(b"pong".to_vec()))
    );
}
