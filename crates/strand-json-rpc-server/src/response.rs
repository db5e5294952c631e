use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

use crate::error::JsonRpcErrorObject;
use crate::types::{JsonRpcVersion, RequestId};

/// A JSON-RPC response.
///
/// `result` and `error` are mutually exclusive; use [`Response::success`] and
/// [`Response::error`] to build one. The `id` is always written, `null` when
/// the request it answers could not be identified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response<R> {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
    #[serde(default)]
    pub id: RequestId,
}

/// Response with the result kept as an undecoded JSON fragment
pub type RawResponse = Response<Box<RawValue>>;

impl<R> Response<R> {
    pub fn success(id: RequestId, result: R) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: RequestId, error: JsonRpcErrorObject) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Split into the outcome, dropping the envelope
    pub fn into_result(self) -> Result<Option<R>, JsonRpcErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

impl Response<Value> {
    /// Error response for input that could not be read as a request
    pub fn invalid_request() -> Self {
        Self::error(RequestId::Null, JsonRpcErrorObject::invalid_request())
    }
}

impl RawResponse {
    /// Result as raw JSON text, `null` when absent
    pub fn result_json(&self) -> &str {
        self.result.as_deref().map_or("null", RawValue::get)
    }
}
