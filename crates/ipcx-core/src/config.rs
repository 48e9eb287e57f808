//! Centralized configuration for the ipcx transport.
//!
//! Limits and timings shared by the server, the client and the host binary.

use std::path::PathBuf;
use std::time::Duration;

/// Transport and dispatch limits.
pub struct IpcConfig;

impl IpcConfig {
    /// Largest accepted frame payload.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Sessions admitted at once; further connections are closed on accept.
    pub const MAX_CONNECTIONS: usize = 64;

    // Client timeouts
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Delay between attempts while a named pipe reports all instances busy.
    pub const PIPE_BUSY_RETRY: Duration = Duration::from_millis(50);

    pub const WORKER_THREAD_NAME: &'static str = "ipcx-server";
    pub const DEFAULT_ENDPOINT_NAME: &'static str = "ipcx";
}

/// Default local endpoint for the current platform.
///
/// A socket file in the temp directory on Unix, a pipe name on Windows.
pub fn default_endpoint() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\{}", IpcConfig::DEFAULT_ENDPOINT_NAME))
    }

    #[cfg(not(windows))]
    {
        std::env::temp_dir().join(format!("{}.sock", IpcConfig::DEFAULT_ENDPOINT_NAME))
    }
}
