use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::types::{JsonRpcVersion, RequestId};

/// A JSON-RPC request.
///
/// A present `id` makes this a call that expects a response; an absent one
/// (or an explicit `null` on the wire) makes it a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request<P> {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<P>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

/// Request with params kept as an undecoded JSON fragment
pub type RawRequest = Request<Box<RawValue>>;

impl<P> Request<P> {
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Option<P>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            method: method.into(),
            params,
            id,
        }
    }

    /// Create a call (a request that expects a response)
    pub fn call(id: impl Into<RequestId>, method: impl Into<String>, params: P) -> Self {
        Self::new(Some(id.into()), method, Some(params))
    }

    /// Create a notification (a request without an id)
    pub fn notification(method: impl Into<String>, params: P) -> Self {
        Self::new(None, method, Some(params))
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

impl RawRequest {
    /// Params as raw JSON text, `null` when absent
    pub fn params_json(&self) -> &str {
        self.params.as_deref().map_or("null", RawValue::get)
    }
}
