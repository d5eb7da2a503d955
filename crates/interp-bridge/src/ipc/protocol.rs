//! Shared protocol types and framing.
//!
//! Each message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON-RPC 2.0 payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//!
//! -> {"jsonrpc":"2.0","method":"plus","params":[1,2],"id":7,"debug":false}
//! <- {"jsonrpc":"2.0","result":3,"id":7}
//! <- {"jsonrpc":"2.0","error":{"code":-32000,"message":"...",
//!        "data":{"type":"AssertionError","traceback":"Traceback ..."}},"id":7}
//! ```

use crate::config::BridgeConfig;
use crate::error::{BridgeError, RemoteError, Result};
use crate::marshal::Value;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// Outcome of one call: a result value or a structured remote failure.
pub type Response = std::result::Result<Value, RemoteError>;

/// One named call with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub handler: String,
    pub args: Vec<Value>,
    /// Ask the remote side to enrich any failure with source context.
    pub debug: bool,
}

impl Request {
    pub fn new(handler: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            handler: handler.into(),
            args,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub debug: bool,
}

impl RpcRequest {
    pub fn new(request: Request, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: request.handler,
            params: request.args,
            id: Some(serde_json::Value::Number(id.into())),
            debug: request.debug,
        }
    }

    pub fn into_request(self) -> Request {
        Request {
            handler: self.method,
            args: self.params,
            debug: self.debug,
        }
    }
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<serde_json::Value>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(id: Option<serde_json::Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response carrying a remote failure.
    pub fn error(id: Option<serde_json::Value>, code: i32, err: RemoteError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: err.message,
                data: Some(RpcErrorData {
                    type_name: err.remote_type_name,
                    traceback: err.remote_traceback,
                }),
            }),
            id,
        }
    }

    /// Collapse the envelope into a call outcome.
    ///
    /// A JSON `null` result deserializes as `None`, so a missing result is `Null`.
    pub fn into_response(self) -> Response {
        match self.error {
            Some(err) => Err(err.into_remote()),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<RpcErrorData>,
}

impl RpcError {
    /// Rebuild the remote failure. Errors without data keep their code as the type.
    pub fn into_remote(self) -> RemoteError {
        match self.data {
            Some(data) => RemoteError {
                remote_type_name: data.type_name,
                message: self.message,
                remote_traceback: data.traceback,
            },
            None => RemoteError::new(format!("RpcError{}", self.code), self.message),
        }
    }
}

/// Remote exception details carried in `error.data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorData {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub traceback: String,
}

/// Read a length-prefixed frame from an async reader.
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

    if len > BridgeConfig::MAX_FRAME_SIZE {
        return Err(BridgeError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            BridgeConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > BridgeConfig::MAX_FRAME_SIZE {
        return Err(BridgeError::protocol(format!(
            "frame size {} exceeds maximum {}",
            payload.len(),
            BridgeConfig::MAX_FRAME_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
