use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::runtime::SocketConfigurator;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to connect to {address}:{port}: {reason}")]
    Connect {
        address: String,
        port: u16,
        reason: String,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Outbound connection commands are pushed over, one line per command.
pub struct CommandChannel {
    stream: TcpStream,
    peer: String,
    timeout: Duration,
}

impl CommandChannel {
    pub async fn connect(
        sockets: &SocketConfigurator,
        address: &str,
        port: u16,
        limit: Duration,
    ) -> Result<Self, CommandError> {
        let stream = sockets
            .connect(address, port, limit)
            .await
            .map_err(|err| CommandError::Connect {
                address: address.to_string(),
                port,
                reason: err.to_string(),
            })?;
        debug!(address, port, "command channel open");
        Ok(Self {
            stream,
            peer: format!("{address}:{port}"),
            timeout: limit,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Writes `command\n`, bounded by the channel timeout.
    pub async fn send(&mut self, command: &str) -> Result<(), CommandError> {
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');
        let limit = self.timeout;
        let write = async {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.flush().await
        };
        timeout(limit, write)
            .await
            .map_err(|_| CommandError::Timeout(limit))??;
        metrics::counter!("commands.sent").increment(1);
        Ok(())
    }
}
