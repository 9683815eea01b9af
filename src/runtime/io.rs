use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::warn;

/// Hook trait used by [`SocketConfigurator`] to apply platform-specific options.
pub trait SocketConfigHook: Send + Sync {
    fn configure_tcp_client(&self, socket: &TcpSocket) -> io::Result<()>;
    fn configure_tcp_listener(&self, socket: &TcpSocket) -> io::Result<()>;
}

#[derive(Default)]
struct SystemSocketConfig;

impl SocketConfigHook for SystemSocketConfig {
    fn configure_tcp_client(&self, socket: &TcpSocket) -> io::Result<()> {
        socket.set_nodelay(true)?;

        let sock_ref = SockRef::from(socket);
        let _ = sock_ref.set_keepalive(true);

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
            let _ = sock_ref.set_tcp_keepalive(&keepalive);
        }

        Ok(())
    }

    fn configure_tcp_listener(&self, socket: &TcpSocket) -> io::Result<()> {
        socket.set_reuseaddr(true)?;
        Ok(())
    }
}

/// Helper responsible for applying socket configuration and capturing failures.
#[derive(Clone)]
pub struct SocketConfigurator {
    hook: Arc<dyn SocketConfigHook>,
}

impl SocketConfigurator {
    pub fn new() -> Self {
        Self {
            hook: Arc::new(SystemSocketConfig),
        }
    }

    pub fn with_hook<H>(hook: H) -> Self
    where
        H: SocketConfigHook + 'static,
    {
        Self {
            hook: Arc::new(hook),
        }
    }

    pub fn configure_tcp_client(&self, socket: &TcpSocket) {
        if let Err(err) = self.hook.configure_tcp_client(socket) {
            metrics::counter!("socket.config_errors", "kind" => "client").increment(1);
            warn!(error = %err, "failed to configure TCP socket");
        }
    }

    pub fn configure_tcp_listener(&self, socket: &TcpSocket) {
        if let Err(err) = self.hook.configure_tcp_listener(socket) {
            metrics::counter!("socket.config_errors", "kind" => "listener").increment(1);
            warn!(error = %err, "failed to configure TCP listener");
        }
    }

    /// Resolves `address:port` and connects to the first address that answers
    /// within `limit`.
    pub async fn connect(&self, address: &str, port: u16, limit: Duration) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = timeout(limit, lookup_host((address, port)))
            .await
            .map_err(|_| timed_out("address lookup"))??
            .collect();
        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address}:{port} did not resolve"),
        );
        for addr in addrs {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            self.configure_tcp_client(&socket);
            match timeout(limit, socket.connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => last_err = err,
                Err(_) => last_err = timed_out("connect"),
            }
        }
        Err(last_err)
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        self.configure_tcp_listener(&socket);
        socket.bind(addr)?;
        socket.listen(1024)
    }
}

impl Default for SocketConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

fn timed_out(stage: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{stage} timed out"))
}
