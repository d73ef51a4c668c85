//! Single-instance guard for the gateway socket

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::wire::{read_message, write_message, Message};

/// How long a live gateway has to answer the probe ping
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// `true` when a gateway at `path` answers `ping` with `pong`
pub async fn is_running(path: &Path) -> bool {
    let probe = async {
        let mut stream = UnixStream::connect(path).await?;
        write_message(&mut stream, &Message::Command(b"ping".to_vec())).await?;
        read_message(&mut stream).await
    };
    match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
        Ok(Ok(Some(Message::CommandReply(reply)))) => reply == b"pong",
        Ok(Ok(_)) => false,
        Ok(Err(err)) => {
            debug!(path = %path.display(), error = %err, "No gateway answering");
            false
        }
        Err(_) => {
            debug!(path = %path.display(), "Gateway probe timed out");
            false
        }
    }
}

/// Make `path` available for binding.
///
/// Fails with `AlreadyRunning` when a live gateway owns it; otherwise a stale
/// socket file left by a dead process is removed.
pub async fn claim(path: &Path) -> GatewayResult<()> {
    if !path.exists() {
        return Ok(());
    }
    if is_running(path).await {
        return Err(GatewayError::AlreadyRunning(path.to_path_buf()));
    }
    warn!(path = %path.display(), "Removing stale gateway socket");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
