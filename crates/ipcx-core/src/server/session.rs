//! Per-connection session state and its receive loop.
//!
//! A session is shared between the server's session table and any in-flight
//! dispatch. Leaving the table does not close it: the session first becomes
//! `Disconnecting` and only reaches `Closed` once the last dispatch holding it
//! has finished.

use super::ServerInner;
use crate::protocol::{read_frame, write_frame};
use crate::transport::{BoxedReader, BoxedWriter};
use crate::{IpcError, Result};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::debug;

/// Identifier of one connection, unique for the lifetime of the server value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, waiting for the connect handler's verdict.
    Accepting,
    Active,
    /// Out of the session table, possibly still referenced by a dispatch.
    Disconnecting,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    in_flight: usize,
}

/// Server-side state for one client connection.
pub struct Session {
    id: ClientId,
    lifecycle: Mutex<Lifecycle>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
}

impl Session {
    pub(crate) fn new(id: ClientId, writer: BoxedWriter) -> Self {
        Self {
            id,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Accepting,
                in_flight: 0,
            }),
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().expect("session lock poisoned").state
    }

    /// Number of dispatches currently holding this session.
    pub fn in_flight(&self) -> usize {
        self.lifecycle.lock().expect("session lock poisoned").in_flight
    }

    /// `Accepting -> Active`, once the connect handler admitted the client.
    pub(crate) fn activate(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("session lock poisoned");
        if lifecycle.state == SessionState::Accepting {
            lifecycle.state = SessionState::Active;
            true
        } else {
            false
        }
    }

    /// `Accepting -> Closed`, for a vetoed connection.
    pub(crate) fn reject(&self) {
        let mut lifecycle = self.lifecycle.lock().expect("session lock poisoned");
        if lifecycle.state == SessionState::Accepting {
            lifecycle.state = SessionState::Closed;
        }
    }

    /// Move to `Disconnecting`. Returns false if the session was already on
    /// its way out, so the caller fires the disconnect event at most once.
    pub(crate) fn mark_disconnecting(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("session lock poisoned");
        match lifecycle.state {
            SessionState::Accepting | SessionState::Active => {
                lifecycle.state = SessionState::Disconnecting;
                true
            }
            SessionState::Disconnecting | SessionState::Closed => false,
        }
    }

    /// Close now if no dispatch holds the session; otherwise the last
    /// `DispatchGuard` to drop does it.
    pub(crate) fn release(&self) {
        let mut lifecycle = self.lifecycle.lock().expect("session lock poisoned");
        if lifecycle.state == SessionState::Disconnecting && lifecycle.in_flight == 0 {
            lifecycle.state = SessionState::Closed;
        }
    }

    /// Pin an `Active` session for the duration of one dispatch.
    pub(crate) fn begin_dispatch(self: &Arc<Self>) -> Option<DispatchGuard> {
        let mut lifecycle = self.lifecycle.lock().expect("session lock poisoned");
        if lifecycle.state != SessionState::Active {
            return None;
        }
        lifecycle.in_flight += 1;
        Some(DispatchGuard {
            session: Arc::clone(self),
        })
    }

    /// Write one frame. Writes on a session never interleave.
    pub(crate) async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => write_frame(writer, payload).await,
            None => Err(IpcError::Disconnected),
        }
    }

    /// Shut down and drop the write half, waiting for a write in progress.
    pub(crate) async fn close_transport(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut writer) = writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of {} transport failed: {}", self.id, e);
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

/// Holds a session open while a dispatch runs against it.
pub(crate) struct DispatchGuard {
    session: Arc<Session>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let mut lifecycle = self
            .session
            .lifecycle
            .lock()
            .expect("session lock poisoned");
        lifecycle.in_flight -= 1;
        if lifecycle.in_flight == 0 && lifecycle.state == SessionState::Disconnecting {
            lifecycle.state = SessionState::Closed;
        }
    }
}

/// Receive loop for one session.
///
/// Frames are handed to the server one at a time, so requests from a client
/// are answered in arrival order. End of stream, a transport error or a
/// protocol violation tears the session down. A stop signal just returns; the
/// worker closes the remaining sessions itself.
pub(crate) async fn read_loop(
    server: Weak<ServerInner>,
    id: ClientId,
    mut reader: BoxedReader,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            return;
        }

        let frame = tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            result = read_frame(&mut reader) => result,
        };

        let Some(server) = server.upgrade() else {
            return;
        };

        let outcome = match frame {
            Ok(Some(frame)) => server.handle_message(id, frame).await,
            Ok(None) => Err(IpcError::Disconnected),
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            debug!("Session {} ended: {}", id, e);
            server.handle_disconnect(id).await;
            return;
        }
    }
}
