//! IPC server: accepts local connections and dispatches calls to registered
//! collections.
//!
//! `initialize` binds the endpoint and starts one worker thread. That thread
//! owns a current-thread tokio runtime which drives the accept loop and every
//! session's receive loop, so dispatch for a request runs on the worker, in
//! arrival order per client. Event handlers and registered functions are
//! always invoked with no server lock held; they may call back into the
//! server (register a collection, replace a handler, and so on).
//!
//! # Shutdown
//!
//! `finalize` blocks until the worker has stopped accepting, finished the
//! dispatch in progress and closed every session. There is no timeout: a
//! function or handler that never returns blocks `finalize` forever.

mod handlers;
mod session;

pub use session::{ClientId, Session, SessionState};

use crate::config::IpcConfig;
use crate::error::CallError;
use crate::protocol::{self, CallResponse};
use crate::registry::{Collection, Registry};
use crate::transport::{Connection, Listener};
use crate::value::Value;
use crate::{IpcError, Result};
use handlers::EventHandlers;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Host-facing IPC server.
///
/// Dropping the server finalizes it.
pub struct Server {
    inner: Arc<ServerInner>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    endpoint: PathBuf,
    stop_tx: watch::Sender<bool>,
    thread: JoinHandle<()>,
}

/// State shared between the host-facing `Server` and its worker.
///
/// The worker only holds a `Weak` to it; the `Server` joins the worker
/// before this is released.
pub(crate) struct ServerInner {
    sessions: Mutex<HashMap<ClientId, Arc<Session>>>,
    registry: Mutex<Registry>,
    handlers: EventHandlers,
    next_client_id: AtomicU64,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                sessions: Mutex::new(HashMap::new()),
                registry: Mutex::new(Registry::new()),
                handlers: EventHandlers::default(),
                next_client_id: AtomicU64::new(1),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Bind the local endpoint at `path` and start the worker thread.
    ///
    /// Fails with `IpcError::Bind` when already initialized or when the
    /// endpoint cannot be created; the server is left unchanged.
    pub fn initialize(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut worker = self.worker.lock().expect("worker lock poisoned");
        if let Some(running) = worker.as_ref() {
            return Err(IpcError::bind(
                path,
                format!("server already initialized on {:?}", running.endpoint),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::channel();
        let server = Arc::downgrade(&self.inner);
        let endpoint = path.clone();

        let thread = std::thread::Builder::new()
            .name(IpcConfig::WORKER_THREAD_NAME.to_string())
            .spawn(move || worker_main(server, endpoint, stop_rx, ready_tx))
            .map_err(|e| IpcError::bind_io(e, path.clone()))?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(IpcError::bind(
                path.clone(),
                "server worker exited during startup",
            ))
        });
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        info!("IPC server listening on {:?}", path);
        *worker = Some(Worker {
            endpoint: path,
            stop_tx,
            thread,
        });
        Ok(())
    }

    /// Stop the worker, close every session and clear the registry.
    ///
    /// The disconnect handler fires once for each session still open.
    /// Safe to call repeatedly, and when never initialized.
    pub fn finalize(&self) {
        let worker = self.worker.lock().expect("worker lock poisoned").take();

        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(true);
            if worker.thread.thread().id() == std::thread::current().id() {
                warn!("finalize called from the server worker; not waiting for it to exit");
            } else if worker.thread.join().is_err() {
                error!("IPC server worker panicked");
            }
        }

        // Normally empty: the worker closes its sessions before exiting.
        self.inner.detach_all();

        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .clear();
    }

    pub fn is_initialized(&self) -> bool {
        self.worker.lock().expect("worker lock poisoned").is_some()
    }

    /// The endpoint the server is bound to, if initialized.
    pub fn endpoint(&self) -> Option<PathBuf> {
        self.worker
            .lock()
            .expect("worker lock poisoned")
            .as_ref()
            .map(|w| w.endpoint.clone())
    }

    /// Replace the connect handler. Returning `false` vetoes the connection.
    pub fn set_connect_handler<F>(&self, handler: F)
    where
        F: Fn(ClientId) -> bool + Send + Sync + 'static,
    {
        self.inner.handlers.set_connect(Arc::new(handler));
    }

    /// Replace the disconnect handler.
    pub fn set_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn(ClientId) + Send + Sync + 'static,
    {
        self.inner.handlers.set_disconnect(Arc::new(handler));
    }

    /// Replace the message handler, which sees every raw inbound frame
    /// before it is dispatched.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(ClientId, &[u8]) + Send + Sync + 'static,
    {
        self.inner.handlers.set_message(Arc::new(handler));
    }

    /// Register a collection. A name already in use is rejected with
    /// `IpcError::DuplicateName` and the existing collection is kept.
    pub fn register_collection(&self, collection: Collection) -> Result<()> {
        let name = collection.name().to_string();
        let count = collection.functions().len();
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .register(collection)?;
        debug!("Registered collection '{}' with {} function(s)", name, count);
        Ok(())
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .names()
    }

    /// Invoke `collection.function(args)` on behalf of `client`.
    ///
    /// The client must have an active session. Errors are per-call and never
    /// affect the session.
    pub fn call_function(
        &self,
        client: ClientId,
        collection: &str,
        function: &str,
        args: &[Value],
    ) -> std::result::Result<Vec<Value>, CallError> {
        self.inner.call_function(client, collection, function, args)
    }

    /// Ids of the sessions in the session table, ascending.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .inner
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .len()
    }

    pub fn session_state(&self, client: ClientId) -> Option<SessionState> {
        self.inner.session(client).map(|s| s.state())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl ServerInner {
    fn session(&self, id: ClientId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .get(&id)
            .cloned()
    }

    fn call_function(
        &self,
        client: ClientId,
        collection: &str,
        function: &str,
        args: &[Value],
    ) -> std::result::Result<Vec<Value>, CallError> {
        let session = self
            .session(client)
            .ok_or_else(|| CallError::not_found(format!("unknown client {}", client)))?;
        let _guard = session
            .begin_dispatch()
            .ok_or_else(|| CallError::not_found(format!("{} is disconnecting", client)))?;

        let function = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .lookup(collection, function)?;
        function.invoke(client, args)
    }

    /// Admit a freshly accepted connection, subject to capacity and the
    /// connect handler.
    async fn admit(self: &Arc<Self>, conn: Connection, stop_rx: watch::Receiver<bool>) {
        let Connection { reader, writer } = conn;
        let id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, writer));

        let admitted = {
            let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
            if sessions.len() >= IpcConfig::MAX_CONNECTIONS {
                false
            } else {
                sessions.insert(id, Arc::clone(&session));
                true
            }
        };
        if !admitted {
            warn!(
                "Rejecting IPC connection {}: at max capacity ({})",
                id,
                IpcConfig::MAX_CONNECTIONS
            );
            session.reject();
            session.close_transport().await;
            return;
        }

        if !self.handlers.emit_connect(id) {
            self.sessions
                .lock()
                .expect("sessions lock poisoned")
                .remove(&id);
            session.reject();
            session.close_transport().await;
            info!("IPC connection {} vetoed by connect handler", id);
            return;
        }

        session.activate();
        debug!("IPC connection {} active", id);
        tokio::spawn(session::read_loop(Arc::downgrade(self), id, reader, stop_rx));
    }

    /// Handle one inbound frame: decode, dispatch, answer with exactly one
    /// response frame.
    ///
    /// An error return means the session can no longer be used (malformed
    /// frame, write failure) and must be torn down.
    pub(crate) async fn handle_message(&self, id: ClientId, frame: Vec<u8>) -> Result<()> {
        let Some(session) = self.session(id) else {
            return Err(IpcError::Disconnected);
        };

        self.handlers.emit_message(id, &frame);

        let request = protocol::decode_request(&frame).map_err(|e| {
            warn!("Protocol violation from {}: {}", id, e);
            e
        })?;

        let response =
            match self.call_function(id, &request.collection, &request.function, &request.args) {
                Ok(values) => CallResponse::success(request.id, values),
                Err(err) => {
                    debug!(
                        "Call {}.{} from {} failed: {}",
                        request.collection, request.function, id, err
                    );
                    CallResponse::failure(request.id, err)
                }
            };

        let mut payload = protocol::encode_response(&response)?;
        if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
            let err = CallError::handler_failure(format!(
                "response of {} bytes exceeds maximum {}",
                payload.len(),
                IpcConfig::MAX_MESSAGE_SIZE
            ));
            payload = protocol::encode_response(&CallResponse::failure(request.id, err))?;
        }

        session.send(&payload).await
    }

    /// Take the session out of the table and close it. No-op if another path
    /// already removed it.
    pub(crate) async fn handle_disconnect(&self, id: ClientId) {
        let removed = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .remove(&id);
        if let Some(session) = removed {
            self.teardown(session).await;
        }
    }

    async fn teardown(&self, session: Arc<Session>) {
        self.begin_teardown(&session);
        session.close_transport().await;
        session.release();
    }

    fn begin_teardown(&self, session: &Session) {
        if session.mark_disconnecting() {
            debug!("IPC connection {} disconnected", session.id());
            self.handlers.emit_disconnect(session.id());
        }
    }

    fn drain_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .drain()
            .map(|(_, session)| session)
            .collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    /// Close every session; run by the worker on shutdown.
    async fn close_all(&self) {
        for session in self.drain_sessions() {
            self.teardown(session).await;
        }
    }

    /// Close every session without touching transports, for sessions whose
    /// worker is gone. The transports close when the last reference drops.
    fn detach_all(&self) {
        for session in self.drain_sessions() {
            self.begin_teardown(&session);
            session.release();
        }
    }
}

fn worker_main(
    server: Weak<ServerInner>,
    endpoint: PathBuf,
    stop_rx: watch::Receiver<bool>,
    ready_tx: mpsc::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(IpcError::bind_io(e, endpoint)));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match Listener::bind(&endpoint) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready_tx.send(Err(IpcError::bind_io(e, endpoint)));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));

        accept_loop(&server, listener, stop_rx).await;

        info!("IPC server shutting down");
        if let Some(server) = server.upgrade() {
            server.close_all().await;
        }
    });
}

async fn accept_loop(
    server: &Weak<ServerInner>,
    mut listener: Listener,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let Some(server) = server.upgrade() else {
                    break;
                };
                match accepted {
                    Ok(conn) => server.admit(conn, stop_rx.clone()).await,
                    Err(e) => error!("IPC accept error: {}", e),
                }
            }
        }
    }
}
