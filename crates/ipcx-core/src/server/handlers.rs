//! Single-slot event handler bindings.
//!
//! Each event type has exactly one slot. Setting a handler replaces the
//! previous one; there is no multicast. Handlers are cloned out of their slot
//! and invoked with no lock held, so a handler may call back into the server.
//!
//! A panicking handler is logged and contained. A panic in the connect
//! handler counts as a veto.

use super::session::ClientId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::error;

pub(crate) type ConnectHandler = Arc<dyn Fn(ClientId) -> bool + Send + Sync>;
pub(crate) type DisconnectHandler = Arc<dyn Fn(ClientId) + Send + Sync>;
pub(crate) type MessageHandler = Arc<dyn Fn(ClientId, &[u8]) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventHandlers {
    connect: RwLock<Option<ConnectHandler>>,
    disconnect: RwLock<Option<DisconnectHandler>>,
    message: RwLock<Option<MessageHandler>>,
}

impl EventHandlers {
    pub fn set_connect(&self, handler: ConnectHandler) {
        *self.connect.write().expect("connect handler lock poisoned") = Some(handler);
    }

    pub fn set_disconnect(&self, handler: DisconnectHandler) {
        *self.disconnect.write().expect("disconnect handler lock poisoned") = Some(handler);
    }

    pub fn set_message(&self, handler: MessageHandler) {
        *self.message.write().expect("message handler lock poisoned") = Some(handler);
    }

    /// Ask the connect handler whether to admit `id`. No handler admits everyone.
    pub fn emit_connect(&self, id: ClientId) -> bool {
        let handler = self
            .connect
            .read()
            .expect("connect handler lock poisoned")
            .clone();
        match handler {
            Some(handler) => contain("connect", id, || handler(id)).unwrap_or(false),
            None => true,
        }
    }

    pub fn emit_disconnect(&self, id: ClientId) {
        let handler = self
            .disconnect
            .read()
            .expect("disconnect handler lock poisoned")
            .clone();
        if let Some(handler) = handler {
            contain("disconnect", id, || handler(id));
        }
    }

    pub fn emit_message(&self, id: ClientId, frame: &[u8]) {
        let handler = self
            .message
            .read()
            .expect("message handler lock poisoned")
            .clone();
        if let Some(handler) = handler {
            contain("message", id, || handler(id, frame));
        }
    }
}

/// Run a host handler, turning a panic into `None`.
fn contain<T>(event: &str, id: ClientId, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!("{} handler panicked for {}", event, id);
            None
        }
    }
}
