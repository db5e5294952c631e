//! Error types for client operations

use std::io;
use std::time::Duration;

use strand_json_rpc_server::{JsonRpcErrorObject, JsonRpcTransportError};
use thiserror::Error;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Writing to or reading from the stream failed
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Params could not be encoded, or a result did not decode into the
    /// requested type
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with an error object
    #[error("Server returned error: {0}")]
    Rpc(#[from] JsonRpcErrorObject),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The client was closed, or the server ended the stream, before a
    /// response arrived
    #[error("Client is closed")]
    Closed,
}

impl ClientError {
    /// Get the error code if the server answered with an error
    pub fn error_code(&self) -> Option<i64> {
        match self {
            Self::Rpc(error) => Some(error.code),
            _ => None,
        }
    }

    pub fn is_rpc_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    pub fn rpc_error(&self) -> Option<&JsonRpcErrorObject> {
        match self {
            Self::Rpc(error) => Some(error),
            _ => None,
        }
    }

    /// Check if the same call might succeed if sent again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Rpc(error) => matches!(error.code, -32099..=-32000),
            _ => false,
        }
    }
}

impl From<JsonRpcTransportError> for ClientError {
    fn from(error: JsonRpcTransportError) -> Self {
        match error {
            JsonRpcTransportError::IoError(e) => Self::Transport(e),
            JsonRpcTransportError::JsonParseError(e) => Self::Json(e),
            other => Self::Transport(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}
