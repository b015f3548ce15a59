//! Wire format for Kite sessions.
//!
//! Every message is a length-prefixed JSON-RPC 2.0 envelope:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests carry the caller's identity and credential alongside the
//! arguments, so the receiving side can authenticate the first call on a
//! connection without a separate handshake:
//!
//! ```json
//! {"jsonrpc":"2.0","method":"square","id":7,
//!  "params":{"kite":{...},"authentication":{"type":"token","key":"..."},"withArgs":4}}
//! ```

use crate::auth::Authentication;
use crate::config::ProtocolConfig;
use crate::identity::KiteIdentity;
use crate::{KiteError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Parameters of every request and notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOptions {
    /// Identity the caller claims.
    #[serde(default)]
    pub kite: KiteIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
    #[serde(default)]
    pub with_args: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&KiteError> for RpcError {
    fn from(err: &KiteError) -> Self {
        Self {
            code: err.to_rpc_error_code(),
            message: err.to_string(),
            data: None,
        }
    }
}

/// A JSON-RPC 2.0 envelope as it appears on the wire.
///
/// Requests, notifications and responses share one shape; [`Envelope::classify`]
/// tells them apart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// An inbound envelope after classification.
#[derive(Debug, Clone)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        outcome: std::result::Result<Value, RpcError>,
    },
}

impl Envelope {
    fn base() -> Self {
        Self {
            jsonrpc: ProtocolConfig::JSONRPC_VERSION.to_string(),
            ..Self::default()
        }
    }

    /// Outbound request with a correlation id.
    pub fn request(id: u64, method: &str, options: &CallOptions) -> Result<Self> {
        Ok(Self {
            method: Some(method.to_string()),
            params: Some(serde_json::to_value(options)?),
            id: Some(Value::from(id)),
            ..Self::base()
        })
    }

    /// Outbound notification: no id, no response expected.
    pub fn notification(method: &str, options: &CallOptions) -> Result<Self> {
        Ok(Self {
            method: Some(method.to_string()),
            params: Some(serde_json::to_value(options)?),
            ..Self::base()
        })
    }

    pub fn success(id: Value, result: Value) -> Self {
        Self {
            result: Some(result),
            id: Some(id),
            ..Self::base()
        }
    }

    pub fn error(id: Option<Value>, error: RpcError) -> Self {
        Self {
            error: Some(error),
            id,
            ..Self::base()
        }
    }

    /// Decide what kind of message this is.
    ///
    /// `method` + `id` is a request, `method` alone a notification, no
    /// `method` a response. A response must carry an id and exactly one of
    /// `result` or `error`; a missing `result` on success is read as null.
    pub fn classify(self) -> Result<Message> {
        if self.jsonrpc != ProtocolConfig::JSONRPC_VERSION {
            return Err(KiteError::Protocol {
                message: format!("expected jsonrpc {}", ProtocolConfig::JSONRPC_VERSION),
            });
        }

        match (self.method, self.id) {
            (Some(method), Some(id)) if !id.is_null() => Ok(Message::Request {
                id,
                method,
                params: self.params.unwrap_or(Value::Null),
            }),
            (Some(method), _) => Ok(Message::Notification {
                method,
                params: self.params.unwrap_or(Value::Null),
            }),
            (None, Some(id)) => {
                let outcome = match self.error {
                    Some(err) => Err(err),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                Ok(Message::Response { id, outcome })
            }
            (None, None) => Err(KiteError::Protocol {
                message: "envelope has neither method nor id".to_string(),
            }),
        }
    }
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

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(KiteError::Protocol {
            message: format!(
                "message size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_MESSAGE_SIZE
            ),
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
    if payload.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(KiteError::Protocol {
            message: format!(
                "message size {} exceeds maximum {}",
                payload.len(),
                ProtocolConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
