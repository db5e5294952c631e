//! # JSON-RPC 2.0 over byte streams
//!
//! Protocol types, stream framing and a server for JSON-RPC 2.0 peers that
//! talk over any bidirectional byte stream (TCP, Unix sockets, in-memory
//! pipes). The companion `strand-json-rpc-client` crate builds on the types
//! defined here.
//!
//! ## Features
//! - Integer, string and null request ids, with strict decoding
//! - Single messages and batches, answered in the shape they arrived in
//! - Typed handlers via [`call`] and [`notify`]
//! - Server-wide bound on concurrently running handlers
//!
//! ```no_run
//! use strand_json_rpc_server::{BoxError, Server, call};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new();
//! server.on("add", call(|_cx, params: Vec<i64>| async move {
//!     Ok::<_, BoxError>(params.iter().sum::<i64>())
//! }));
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:4000").await?;
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod prelude;
pub mod request;
pub mod response;
pub mod server;
pub mod types;

pub use batch::Batch;
pub use codec::{FrameReader, write_message};
pub use config::{ConfigError, ServerConfig};
pub use error::{JsonRpcErrorCode, JsonRpcErrorObject, JsonRpcTransportError, ProtocolError};
pub use handler::{BoxError, CallContext, HandlerResult, JsonRpcHandler, call, notify};
pub use listener::Listener;
pub use request::{RawRequest, Request};
pub use response::{RawResponse, Response};
pub use server::{Server, ServerBuilder};
pub use types::{JsonRpcVersion, RequestId};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Server error range: -32099 to -32000
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;
}
