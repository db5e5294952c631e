//! # Client Prelude
//!
//! ```rust
//! use strand_json_rpc_client::prelude::*;
//! ```

pub use crate::client::{BatchRequest, BatchResponse, Client};
pub use crate::config::ClientConfig;
pub use crate::error::{ClientError, ClientResult};

pub use strand_json_rpc_server::{JsonRpcErrorCode, JsonRpcErrorObject, RequestId};
pub use tokio_util::sync::CancellationToken;

pub use std::time::Duration;
