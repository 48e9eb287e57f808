//! Wire protocol: framing plus call request/response payloads.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! A request names one function inside one collection; the response echoes
//! the request id and carries either the returned values or an error message.

use crate::config::IpcConfig;
use crate::error::CallError;
use crate::value::Value;
use crate::{IpcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Outcome of a dispatched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    /// Unknown collection or function.
    NotFound,
    /// Argument count or type does not match the signature.
    ArgumentError,
    /// The function ran and failed.
    HandlerFailure,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::NotFound => "not_found",
            Status::ArgumentError => "argument_error",
            Status::HandlerFailure => "handler_failure",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One call: `collection.function(args...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: u64,
    pub collection: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl CallRequest {
    pub fn new(
        id: u64,
        collection: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            id,
            collection: collection.into(),
            function: function.into(),
            args,
        }
    }
}

/// Answer to exactly one `CallRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallResponse {
    /// Create a success response.
    pub fn success(id: u64, values: Vec<Value>) -> Self {
        Self {
            id,
            status: Status::Ok,
            values,
            error: None,
        }
    }

    /// Create an error response from a dispatch failure.
    pub fn failure(id: u64, err: CallError) -> Self {
        Self {
            id,
            status: err.status,
            values: Vec::new(),
            error: Some(err.message),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Convert into the values, or an `IpcError::Remote` for non-Ok statuses.
    pub fn into_result(self) -> Result<Vec<Value>> {
        match self.status {
            Status::Ok => Ok(self.values),
            status => Err(IpcError::Remote {
                status,
                message: self.error.unwrap_or_default(),
            }),
        }
    }
}

fn decode_error(what: &str, err: serde_json::Error) -> IpcError {
    IpcError::Decode {
        message: format!("invalid {}: {}", what, err),
    }
}

pub fn encode_request(request: &CallRequest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<CallRequest> {
    serde_json::from_slice(bytes).map_err(|e| decode_error("call request", e))
}

pub fn encode_response(response: &CallResponse) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<CallResponse> {
    serde_json::from_slice(bytes).map_err(|e| decode_error("call response", e))
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(IpcError::FrameTooLarge {
            size: len,
            max: IpcConfig::MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(IpcError::FrameTooLarge {
            size: payload.len(),
            max: IpcConfig::MAX_MESSAGE_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
