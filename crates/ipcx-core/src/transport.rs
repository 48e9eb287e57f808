//! Local connection-oriented channel: Unix domain sockets, or named pipes on
//! Windows.
//!
//! Connections are handed out already split so that a session can keep the
//! write half behind its own lock while the read loop owns the read half.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One accepted or opened connection.
pub struct Connection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Connection {
    fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Listening endpoint. Must be created and used inside a tokio runtime.
pub struct Listener {
    path: PathBuf,
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(windows)]
    next: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl Listener {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl Listener {
    /// Bind a Unix socket, replacing a stale socket file left at `path`.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let inner = tokio::net::UnixListener::bind(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }

    pub async fn accept(&mut self) -> io::Result<Connection> {
        let (stream, _addr) = self.inner.accept().await?;
        let (reader, writer) = stream.into_split();
        Ok(Connection::from_split(reader, writer))
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(windows)]
impl Listener {
    /// Create the first instance of the named pipe at `path`.
    pub fn bind(path: &Path) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            next,
        })
    }

    /// Wait for a client on the pending instance, then queue a fresh one.
    pub async fn accept(&mut self) -> io::Result<Connection> {
        use tokio::net::windows::named_pipe::ServerOptions;

        self.next.connect().await?;
        let fresh = ServerOptions::new().create(&self.path)?;
        let connected = std::mem::replace(&mut self.next, fresh);
        let (reader, writer) = tokio::io::split(connected);
        Ok(Connection::from_split(reader, writer))
    }
}

/// Open a client connection to `path`.
#[cfg(unix)]
pub async fn connect(path: &Path) -> io::Result<Connection> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (reader, writer) = stream.into_split();
    Ok(Connection::from_split(reader, writer))
}

/// Open a client connection to `path`, retrying while every pipe instance is busy.
#[cfg(windows)]
pub async fn connect(path: &Path) -> io::Result<Connection> {
    use crate::config::IpcConfig;
    use tokio::net::windows::named_pipe::ClientOptions;
    use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

    let client = loop {
        match ClientOptions::new().open(path) {
            Ok(client) => break client,
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(IpcConfig::PIPE_BUSY_RETRY).await;
    };
    let (reader, writer) = tokio::io::split(client);
    Ok(Connection::from_split(reader, writer))
}
