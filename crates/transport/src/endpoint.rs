//! Stream endpoints: Unix domain sockets and TCP

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Socket file name under `$HOME` when nothing else is configured
pub const DEFAULT_SOCKET_NAME: &str = ".dstu-agent.sock";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Nowhere to bind: no endpoint given and HOME is not set")]
    NoEndpoint,

    #[error("Bind failed on {endpoint}: {source}")]
    BindFailed { endpoint: String, source: io::Error },

    #[error("Connect to {endpoint} failed: {source}")]
    ConnectFailed { endpoint: String, source: io::Error },

    #[error("Accept failed: {0}")]
    AcceptFailed(io::Error),

    #[error("Path {0} exists and is not a socket")]
    NotASocket(String),
}

/// Where an agent listens or a client connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// `host:port`; an empty host means all interfaces
    Tcp(String),
}

impl Endpoint {
    /// `$HOME/.dstu-agent.sock`
    pub fn default_unix() -> Result<Self, TransportError> {
        let home = std::env::var_os("HOME").ok_or(TransportError::NoEndpoint)?;
        Ok(Endpoint::Unix(PathBuf::from(home).join(DEFAULT_SOCKET_NAME)))
    }

    /// Interpret a bind string the way the agent's `--bind`/`--tcp` flags do
    pub fn from_bind(bind: Option<&str>, tcp: bool) -> Result<Self, TransportError> {
        match bind.filter(|b| !b.is_empty()) {
            Some(bind) if tcp => Ok(Endpoint::Tcp(bind.to_owned())),
            Some(bind) => Ok(Self::from_uri(bind)),
            None if tcp => Err(TransportError::NoEndpoint),
            None => Self::default_unix(),
        }
    }

    /// `tcp://host:port`, `unix:///path` or a bare path
    pub fn from_uri(s: &str) -> Self {
        if let Some(addr) = s.strip_prefix("tcp://") {
            return Endpoint::Tcp(addr.to_owned());
        }
        let path = s.strip_prefix("unix://").unwrap_or(s);
        Endpoint::Unix(PathBuf::from(path))
    }

    fn tcp_addr(addr: &str) -> String {
        match addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => addr.to_owned(),
        }
    }

    pub async fn connect(&self) -> Result<Connection, TransportError> {
        let result = match self {
            Endpoint::Unix(path) => UnixStream::connect(path).await.map(Connection::Unix),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(Self::tcp_addr(addr)).await;
                stream.and_then(|s| {
                    s.set_nodelay(true)?;
                    Ok(Connection::Tcp(s))
                })
            }
        };
        result.map_err(|source| TransportError::ConnectFailed {
            endpoint: self.to_string(),
            source,
        })
    }

    /// Bind a listener. A stale Unix socket file is replaced; the new one is
    /// made owner-only.
    pub async fn bind(&self) -> Result<Listener, TransportError> {
        let bind_failed = |source| TransportError::BindFailed {
            endpoint: self.to_string(),
            source,
        };

        match self {
            Endpoint::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path).map_err(bind_failed)?;
                restrict_permissions(path);
                info!(socket = %path.display(), "Listening on unix socket");
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(Self::tcp_addr(addr))
                    .await
                    .map_err(bind_failed)?;
                if let Ok(local) = listener.local_addr() {
                    info!(%local, "Listening on tcp");
                }
                Ok(Listener::Tcp(listener))
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_uri(s))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), TransportError> {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return Ok(());
    };

    use std::os::unix::fs::FileTypeExt;
    if !metadata.file_type().is_socket() {
        return Err(TransportError::NotASocket(path.display().to_string()));
    }

    debug!(socket = %path.display(), "Removing stale socket");
    std::fs::remove_file(path).map_err(|source| TransportError::BindFailed {
        endpoint: path.display().to_string(),
        source,
    })
}

fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(socket = %path.display(), "Failed to chmod 0600: {}", e);
    }
}

/// Bound listener
pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    /// Accept the next connection; the string describes the peer for logs
    pub async fn accept(&self) -> Result<(Connection, String), TransportError> {
        match self {
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await.map_err(TransportError::AcceptFailed)?;
                Ok((Connection::Unix(stream), path.display().to_string()))
            }
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::AcceptFailed)?;
                let _ = stream.set_nodelay(true);
                Ok((Connection::Tcp(stream), addr.to_string()))
            }
        }
    }

    /// The endpoint clients should use to reach this listener
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }

    /// Remove the socket file of a Unix listener
    pub fn cleanup(&self) {
        if let Listener::Unix { path, .. } = self {
            match std::fs::remove_file(path) {
                Ok(()) => info!(socket = %path.display(), "Removed socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(socket = %path.display(), "Failed to remove socket: {}", e),
            }
        }
    }
}

/// Either kind of connected stream
#[derive(Debug)]
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
