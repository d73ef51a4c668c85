//! Gateway server
//!
//! Accepts connections on a per-user Unix socket. The first message of a
//! connection decides what it is:
//!
//! - `HELLO` opens a streaming [`Session`] that owns one adapter
//! - `COMMAND`, `LIST_ADAPTERS`, `LIST_PORTS` get one reply, then the
//!   connection is closed
//!
//! Control-plane calls only read the registry and the port list; they never
//! touch a live session.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use canlink_core::{CancelToken, Registry};
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::GatewayResult;
use crate::guard;
use crate::ports::{PortLister, SerialPorts};
use crate::session::Session;
use crate::wire::{read_message, write_message, Message};

/// How long `serve` waits for live sessions to close their adapters on shutdown
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Connection handler shared by every accepted stream
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<Registry>,
    ports: Arc<dyn PortLister>,
    shutdown: CancelToken,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>, ports: Arc<dyn PortLister>, shutdown: CancelToken) -> Self {
        Self {
            registry,
            ports,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serve one connection until it ends
    pub async fn handle<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = split(stream);
        let first = match read_message(&mut reader).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("Connection closed before first message");
                return;
            }
            Err(err) => {
                warn!(error = %err, "Unreadable first message");
                return;
            }
        };

        let reply = match first {
            Message::Hello(meta) => {
                let session = Session::new(self.registry.clone(), self.shutdown.child());
                debug!(session = %session.id(), "Session requested");
                session.run(meta, reader, writer).await;
                return;
            }
            Message::Command(command) => {
                let (reply, quit) = self.command(&command);
                if let Err(err) = write_message(&mut writer, &reply).await {
                    debug!(error = %err, "Command reply not delivered");
                }
                if quit {
                    info!("Shutdown requested by client");
                    self.shutdown.cancel();
                }
                return;
            }
            Message::ListAdapters => Message::Adapters(self.registry.list()),
            Message::ListPorts => match self.ports.list() {
                Ok(ports) => Message::Ports(ports),
                Err(err) => {
                    warn!(error = %err, "Port enumeration failed");
                    Message::Ports(Vec::new())
                }
            },
            other => {
                warn!(msg_type = other.msg_type(), "Unexpected first message");
                return;
            }
        };
        if let Err(err) = write_message(&mut writer, &reply).await {
            debug!(error = %err, "Discovery reply not delivered");
        }
    }

    /// Reply to a unary command. The flag asks for server shutdown.
    fn command(&self, command: &[u8]) -> (Message, bool) {
        let text = String::from_utf8_lossy(command);
        debug!(command = %text.trim(), "Command");
        match text.trim() {
            "ping" => (Message::CommandReply(b"pong".to_vec()), false),
            "quit" => (Message::CommandReply(b"bye".to_vec()), true),
            _ => (Message::CommandReply(b"unknown command".to_vec()), false),
        }
    }
}

/// A gateway bound to its socket path
pub struct GatewayServer {
    path: PathBuf,
    listener: UnixListener,
    registry: Arc<Registry>,
    ports: Arc<dyn PortLister>,
    shutdown: CancelToken,
    drain_grace: Duration,
}

impl GatewayServer {
    /// Claim `path` and bind it.
    ///
    /// Fails with `AlreadyRunning` when another gateway answers on `path`.
    pub async fn bind(path: impl AsRef<Path>, registry: Arc<Registry>) -> GatewayResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        guard::claim(&path).await?;

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        info!(path = %path.display(), adapters = registry.len(), "Gateway listening");

        Ok(Self {
            path,
            listener,
            registry,
            ports: Arc::new(SerialPorts),
            shutdown: CancelToken::new(),
            drain_grace: DEFAULT_DRAIN_GRACE,
        })
    }

    pub fn with_ports(mut self, ports: Arc<dyn PortLister>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Cancelling this token stops the server and every live session
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until shutdown, then close every session and
    /// remove the socket file
    pub async fn serve(self) -> GatewayResult<()> {
        let gateway = Gateway::new(self.registry.clone(), self.ports.clone(), self.shutdown.clone());
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let gateway = gateway.clone();
                        connections.spawn(async move { gateway.handle(stream).await });
                    }
                    Err(err) => {
                        error!(error = %err, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = done {
                        if err.is_panic() {
                            warn!(error = %err, "Connection handler panicked");
                        }
                    }
                }
            }
        }

        self.shutdown.cancel();
        let live = connections.len();
        if live > 0 {
            info!(connections = live, "Closing live connections");
        }
        let drained = tokio::time::timeout(self.drain_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Connections did not close within grace period, aborting");
            connections.abort_all();
        }

        drop(self.listener);
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Socket file not removed"),
        }
        info!("Gateway stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedPorts;
    use canlink_core::{PortInfo, RegistryBuilder};
    use tokio::io::duplex;

    fn gateway(shutdown: CancelToken) -> Gateway {
        let mut builder = RegistryBuilder::new();
        canlink_adapters::register_all(&mut builder).unwrap();
        let ports = FixedPorts(vec![PortInfo {
            name: "/dev/ttyUSB0".to_string(),
            kind: "usb".to_string(),
            ..Default::default()
        }]);
        Gateway::new(Arc::new(builder.build()), Arc::new(ports), shutdown)
    }

    async fn exchange(gateway: &Gateway, request: Message) -> Option<Message> {
        let (mut client, server) = duplex(64 * 1024);
        let serve = gateway.handle(server);
        let ask = async {
            write_message(&mut client, &request).await.unwrap();
            read_message(&mut client).await.unwrap()
        };
        let ((), reply) = tokio::join!(serve, ask);
        reply
    }

    #[tokio::test]
    async fn test_commands() {
        let shutdown = CancelToken::new();
        let gateway = gateway(shutdown.clone());

        let reply = exchange(&gateway, Message::Command(b"ping".to_vec())).await;
        assert_eq!(reply, Some(Message::CommandReply(b"pong".to_vec())));
        let reply = exchange(&gateway, Message::Command(b"reboot".to_vec())).await;
        assert_eq!(reply, Some(Message::CommandReply(b"unknown command".to_vec())));
        assert!(!shutdown.is_cancelled());

        let reply = exchange(&gateway, Message::Command(b"quit".to_vec())).await;
        assert_eq!(reply, Some(Message::CommandReply(b"bye".to_vec())));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_discovery() {
        let gateway = gateway(CancelToken::new());
        match exchange(&gateway, Message::ListAdapters).await {
            Some(Message::Adapters(list)) => {
                assert_eq!(list, gateway.registry().list());
                assert!(list.iter().any(|info| info.name == "Loopback"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        match exchange(&gateway, Message::ListPorts).await {
            Some(Message::Ports(ports)) => assert_eq!(ports[0].name, "/dev/ttyUSB0"),
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
