//! IPC client for calling functions exposed by a `Server`.
//!
//! Connects to the server's local endpoint and provides `call()` for
//! synchronous request/response invocation.
//!
//! # Thread Safety
//!
//! The client uses a tokio `Mutex` to serialize access to the connection,
//! allowing safe concurrent use from multiple async tasks. Calls from one
//! client are therefore answered in the order they were issued.

use crate::config::IpcConfig;
use crate::protocol::{
    decode_response, encode_request, read_frame, write_frame, CallRequest, CallResponse,
};
use crate::transport::{self, Connection};
use crate::value::Value;
use crate::{IpcError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Client side of one connection to a server.
pub struct IpcClient {
    conn: Mutex<Connection>,
    endpoint: PathBuf,
    next_id: AtomicU64,
}

impl IpcClient {
    /// Connect to the server listening at `path`.
    ///
    /// Uses the configured connection timeout from `IpcConfig`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let endpoint = path.as_ref().to_path_buf();
        let conn = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, transport::connect(&endpoint))
            .await
            .map_err(|_| IpcError::Timeout(IpcConfig::CONNECT_TIMEOUT))??;

        debug!("IPC client connected to {:?}", endpoint);

        Ok(Self {
            conn: Mutex::new(conn),
            endpoint,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call `collection.function(args)` and return its values.
    ///
    /// A non-Ok response becomes `IpcError::Remote`.
    pub async fn call(
        &self,
        collection: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        self.call_raw(collection, function, args)
            .await?
            .into_result()
    }

    /// Call and return the full response, whatever its status.
    ///
    /// If the connection is broken, returns `Disconnected`.
    pub async fn call_raw(
        &self,
        collection: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<CallResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = CallRequest::new(id, collection, function, args);
        let request_bytes = encode_request(&request)?;

        let mut conn = self.conn.lock().await;
        let Connection { reader, writer } = &mut *conn;

        write_frame(writer, &request_bytes)
            .await
            .map_err(|e| {
                if e.is_disconnect() {
                    IpcError::Disconnected
                } else {
                    e
                }
            })?;

        let response_bytes = tokio::time::timeout(IpcConfig::CALL_TIMEOUT, read_frame(reader))
            .await
            .map_err(|_| IpcError::Timeout(IpcConfig::CALL_TIMEOUT))?
            .map_err(|_| IpcError::Disconnected)?
            .ok_or(IpcError::Disconnected)?;

        let response = decode_response(&response_bytes)?;
        if response.id != id {
            return Err(IpcError::Decode {
                message: format!("response id {} does not match request id {}", response.id, id),
            });
        }
        Ok(response)
    }

    /// Get the endpoint this client is connected to.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }
}
