use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::runtime::SocketConfigurator;

use super::ClientInfo;

const MAX_REPLY_BYTES: u64 = 64 * 1024;

/// Failures of a single request/reply exchange. A failed probe only skips
/// that client.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {client}: {reason}")]
    Connect { client: String, reason: String },
    #[error("timed out talking to {client}")]
    Timeout { client: String },
    #[error("i/o error talking to {client}: {reason}")]
    Io { client: String, reason: String },
}

/// Short request/reply primitive used for negotiation.
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    async fn send_and_await_reply(
        &self,
        client: &ClientInfo,
        payload: &str,
    ) -> Result<String, TransportError>;
}

/// Opens one TCP connection per exchange, writes the payload and reads a
/// single line back.
#[derive(Clone)]
pub struct TcpReplyTransport {
    sockets: SocketConfigurator,
    timeout: Duration,
}

impl TcpReplyTransport {
    pub fn new(timeout: Duration) -> Self {
        Self::with_sockets(SocketConfigurator::new(), timeout)
    }

    pub fn with_sockets(sockets: SocketConfigurator, timeout: Duration) -> Self {
        Self { sockets, timeout }
    }
}

#[async_trait]
impl ReplyTransport for TcpReplyTransport {
    async fn send_and_await_reply(
        &self,
        client: &ClientInfo,
        payload: &str,
    ) -> Result<String, TransportError> {
        let stream = self
            .sockets
            .connect(&client.address, client.port, self.timeout)
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::TimedOut => TransportError::Timeout {
                    client: client.to_string(),
                },
                _ => TransportError::Connect {
                    client: client.to_string(),
                    reason: err.to_string(),
                },
            })?;

        let exchange = async move {
            let (reader, mut writer) = stream.into_split();
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await?;
            let mut reply = String::new();
            BufReader::new(reader)
                .take(MAX_REPLY_BYTES)
                .read_line(&mut reply)
                .await?;
            Ok::<_, io::Error>(reply)
        };

        let reply = timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout {
                client: client.to_string(),
            })?
            .map_err(|err| TransportError::Io {
                client: client.to_string(),
                reason: err.to_string(),
            })?;
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }
}
