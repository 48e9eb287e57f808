//! ipcx - local inter-process RPC over Unix domain sockets and named pipes.
//!
//! A host process exposes named collections of functions through a
//! [`Server`]; client processes connect to its local endpoint and call those
//! functions with typed [`Value`] arguments, one request and one response at
//! a time.
//!
//! # Example
//!
//! ```rust,no_run
//! use ipcx::{Collection, Function, Server, Value, ValueType};
//!
//! # fn main() -> ipcx::Result<()> {
//! let server = Server::new();
//! server.register_collection(Collection::new("math").with_function(Function::new(
//!     "add",
//!     vec![ValueType::Int64, ValueType::Int64],
//!     vec![ValueType::Int64],
//!     |_client, args| {
//!         let a = args[0].as_i64().unwrap_or_default();
//!         let b = args[1].as_i64().unwrap_or_default();
//!         Ok(vec![Value::Int64(a + b)])
//!     },
//! )))?;
//!
//! server.set_disconnect_handler(|client| println!("{} left", client));
//! server.initialize("/tmp/ipcx-example.sock")?;
//! // ... serve until the host shuts down
//! server.finalize();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use client::IpcClient;
pub use config::{default_endpoint, IpcConfig};
pub use error::{CallError, FunctionError, IpcError, Result};
pub use protocol::{CallRequest, CallResponse, Status};
pub use registry::{Collection, Function, FunctionResult, Registry};
pub use server::{ClientId, Server, SessionState};
pub use value::{Value, ValueType};
