//! Byte transports the session runs over.
//!
//! A `Transport` is just a boxed reader/writer pair plus whatever owns the
//! underlying resource (a child process, for instance). The session layer never
//! looks past `AsyncRead`/`AsyncWrite`, so in-memory streams work the same as
//! sockets:
//!
//! ```ignore
//! let (client, server) = tokio::io::duplex(64 * 1024);
//! let (read, write) = tokio::io::split(client);
//! let transport = Transport::from_io(read, write);
//! ```

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable holding the editor's listen address.
pub const ADDRESS_ENV: &str = "EDITOR_RPC_ADDRESS";

/// How long `shutdown` waits for a child process before killing it.
const CHILD_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Boxed read half of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Unpin>;
/// Boxed write half of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin>;

/// Errors raised while establishing a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to connect to a socket or TCP address.
    #[error("Connection to {target} failed: {source}")]
    ConnectionFailed {
        /// Address or path we tried.
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to spawn the child process.
    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        /// Program name from argv[0].
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Bad transport parameters (empty argv, malformed address...).
    #[error("Invalid transport: {0}")]
    Invalid(String),
}

/// Which kind of connection to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP `host:port`.
    Tcp { host: String, port: u16 },
    /// UNIX domain socket (or named pipe on Windows).
    Socket(PathBuf),
    /// This process's stdin/stdout (we were spawned by the editor).
    Stdio,
    /// Spawn `argv` and talk over its stdin/stdout.
    Child(Vec<String>),
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            TransportKind::Socket(path) => write!(f, "socket {}", path.display()),
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::Child(argv) => write!(f, "child '{}'", argv.join(" ")),
        }
    }
}

impl TransportKind {
    /// Interpret an address string: `host:port` is TCP, anything else a socket path.
    pub fn from_address(address: &str) -> Self {
        let address = address.trim();
        if let Some((host, port)) = address.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if !host.is_empty() && !host.contains('/') && !host.contains('\\') {
                    return TransportKind::Tcp {
                        host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
                        port,
                    };
                }
            }
        }
        TransportKind::Socket(PathBuf::from(address))
    }

    /// Read the address from `EDITOR_RPC_ADDRESS`, if set and non-empty.
    pub fn from_env() -> Option<Self> {
        std::env::var(ADDRESS_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| Self::from_address(&value))
    }

    /// Open the transport.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(&self) -> Result<Transport, TransportError> {
        info!("Connecting to {}", self);
        match self {
            TransportKind::Tcp { host, port } => connect_tcp(host, *port).await,
            TransportKind::Socket(path) => connect_socket(path).await,
            TransportKind::Stdio => Ok(connect_stdio()),
            TransportKind::Child(argv) => spawn_child(argv),
        }
    }
}

/// Resolve the default socket path for an editor listening locally.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/editor-rpc.sock` (Linux standard)
/// 2. `~/Library/Caches/editor-rpc.sock` (macOS)
/// 3. `/tmp/editor-rpc.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("editor-rpc.sock");
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join("editor-rpc.sock");
    }

    PathBuf::from("/tmp/editor-rpc.sock")
}

/// An open duplex byte stream.
pub struct Transport {
    pub(crate) reader: BoxedReader,
    pub(crate) writer: BoxedWriter,
    /// Child process handle, owned so `shutdown` can reap it.
    child: Option<Child>,
    is_stdio: bool,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("child", &self.child.as_ref().and_then(Child::id))
            .field("is_stdio", &self.is_stdio)
            .finish()
    }
}

impl Transport {
    /// Wrap an arbitrary reader/writer pair.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
            is_stdio: false,
        }
    }

    /// Whether this transport is the process's own stdio.
    pub fn is_stdio(&self) -> bool {
        self.is_stdio
    }

    /// Pid of the spawned child, if any.
    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Close the write side and reap the child process if there is one.
    pub(crate) async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Transport shutdown: {}", e);
        }

        let Some(child) = self.child.as_mut() else {
            return;
        };

        // Closing stdin usually makes the child exit; give it a moment.
        match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("Child process exited with {}", status),
            Ok(Err(e)) => warn!("Error waiting for child process: {}", e),
            Err(_) => {
                warn!("Child process didn't exit gracefully, killing");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill child process: {}", e);
                }
            }
        }
    }
}

async fn connect_tcp(host: &str, port: u16) -> Result<Transport, TransportError> {
    let stream = tokio::net::TcpStream::connect((host, port))
        .await
        .map_err(|source| TransportError::ConnectionFailed {
            target: format!("{}:{}", host, port),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }
    let (read_half, write_half) = stream.into_split();
    Ok(Transport::from_io(read_half, write_half))
}

#[cfg(unix)]
async fn connect_socket(path: &std::path::Path) -> Result<Transport, TransportError> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::ConnectionFailed {
            target: path.display().to_string(),
            source,
        })?;
    let (read_half, write_half) = stream.into_split();
    Ok(Transport::from_io(read_half, write_half))
}

#[cfg(windows)]
async fn connect_socket(path: &std::path::Path) -> Result<Transport, TransportError> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new()
        .open(path)
        .map_err(|source| TransportError::ConnectionFailed {
            target: path.display().to_string(),
            source,
        })?;
    let (read_half, write_half) = tokio::io::split(pipe);
    Ok(Transport::from_io(read_half, write_half))
}

fn connect_stdio() -> Transport {
    info!("Preparing stdin/stdout for streaming data");
    let mut transport = Transport::from_io(tokio::io::stdin(), tokio::io::stdout());
    transport.is_stdio = true;
    transport
}

fn spawn_child(argv: &[String]) -> Result<Transport, TransportError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| TransportError::Invalid("child argv is empty".to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TransportError::SpawnFailed {
            program: program.clone(),
            source,
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::Invalid("child stdin was not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Invalid("child stdout was not captured".to_string()))?;

    info!("Spawned child process {:?} ({})", child.id(), program);

    let mut transport = Transport::from_io(stdout, stdin);
    transport.child = Some(child);
    Ok(transport)
}
