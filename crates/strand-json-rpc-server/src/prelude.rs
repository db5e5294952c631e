//! # JSON-RPC Prelude
//!
//! ```rust
//! use strand_json_rpc_server::prelude::*;
//! ```

pub use crate::batch::Batch;
pub use crate::error::{JsonRpcErrorCode, JsonRpcErrorObject, JsonRpcTransportError};
pub use crate::handler::{BoxError, CallContext, HandlerResult, JsonRpcHandler, call, notify};
pub use crate::listener::Listener;
pub use crate::request::{RawRequest, Request};
pub use crate::response::{RawResponse, Response};
pub use crate::server::{Server, ServerBuilder};
pub use crate::types::{JsonRpcVersion, RequestId};

// Standard error codes
pub use crate::error_codes::*;
