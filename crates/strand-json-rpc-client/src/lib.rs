//! # JSON-RPC 2.0 Client
//!
//! A client for JSON-RPC 2.0 peers reachable over any bidirectional byte
//! stream. Calls are correlated with their responses by id, so a single
//! [`Client`] can be shared by many concurrent callers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strand_json_rpc_client::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:4000").await?;
//!     let client = Client::new(stream);
//!
//!     let sum: f64 = client.call("add", [1.0, 2.0, 3.0]).await?;
//!     println!("sum = {sum}");
//!
//!     client.notify("log", "done").await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod prelude;

pub use client::{BatchRequest, BatchResponse, Client};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};

pub use strand_json_rpc_server::{JsonRpcErrorObject, RequestId};
pub use tokio_util::sync::CancellationToken;
