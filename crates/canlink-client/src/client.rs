//! Unary control calls against a running gateway

use std::path::{Path, PathBuf};
use std::time::Duration;

use canlink_core::{AdapterInfo, PortInfo};
use canlink_gateway::{read_message, write_message, Message};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Default time allowed for one request and its reply
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Control-plane client. Every call uses its own short-lived connection.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    path: PathBuf,
    timeout: Duration,
}

impl GatewayClient {
    /// Client for the gateway listening on `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw unary command; returns the reply bytes
    pub async fn send_command(&self, command: &[u8]) -> ClientResult<Vec<u8>> {
        match self.call(Message::Command(command.to_vec())).await? {
            Message::CommandReply(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }

    /// Liveness check
    pub async fn ping(&self) -> ClientResult<()> {
        let reply = self.send_command(b"ping").await?;
        if reply != b"pong" {
            return Err(ClientError::UnexpectedReply(
                String::from_utf8_lossy(&reply).into_owned(),
            ));
        }
        Ok(())
    }

    /// Ask the gateway to shut down
    pub async fn quit(&self) -> ClientResult<()> {
        let reply = self.send_command(b"quit").await?;
        if reply != b"bye" {
            return Err(ClientError::UnexpectedReply(
                String::from_utf8_lossy(&reply).into_owned(),
            ));
        }
        Ok(())
    }

    /// Adapters registered in the gateway
    pub async fn list_adapters(&self) -> ClientResult<Vec<AdapterInfo>> {
        match self.call(Message::ListAdapters).await? {
            Message::Adapters(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }

    /// Serial ports visible to the gateway host
    pub async fn list_ports(&self) -> ClientResult<Vec<PortInfo>> {
        match self.call(Message::ListPorts).await? {
            Message::Ports(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&self, request: Message) -> ClientResult<Message> {
        debug!(path = %self.path.display(), msg_type = request.msg_type(), "Gateway request");
        let exchange = async {
            let mut stream = UnixStream::connect(&self.path).await.map_err(|e| {
                ClientError::ConnectionFailed(format!("{}: {}", self.path.display(), e))
            })?;
            write_message(&mut stream, &request).await?;
            read_message(&mut stream).await?.ok_or(ClientError::Disconnected)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

fn unexpected(msg: &Message) -> ClientError {
    ClientError::UnexpectedReply(format!("message type {}", msg.msg_type()))
}
