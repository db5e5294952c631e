use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::JsonRpcErrorObject;
use crate::request::RawRequest;
use crate::types::RequestId;

/// Error type produced by handlers.
///
/// A boxed [`JsonRpcErrorObject`] is sent to the peer as-is; anything else is
/// reported as an opaque internal error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for JSON-RPC method handlers
pub type HandlerResult = Result<Value, BoxError>;

/// Per-dispatch context handed to handlers
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Sequence number of the connection the request arrived on
    pub connection_id: u64,
    /// Id of the request, `None` for notifications
    pub request_id: Option<RequestId>,
    pub method: String,
    cancellation: CancellationToken,
}

impl CallContext {
    pub fn new(
        connection_id: u64,
        request_id: Option<RequestId>,
        method: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            request_id,
            method: method.into(),
            cancellation,
        }
    }

    /// Context for dispatching outside a connection, never cancelled
    pub fn detached(request: &RawRequest) -> Self {
        Self::new(0, request.id.clone(), &request.method, CancellationToken::new())
    }

    pub fn is_notification(&self) -> bool {
        self.request_id.is_none()
    }

    /// Fires when the connection closes or the server shuts down
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Uniform dispatch contract between the server and method implementations
#[async_trait]
pub trait JsonRpcHandler: Send + Sync {
    /// Handle one request. The returned value becomes the `result` member;
    /// it is discarded when the request is a notification.
    async fn handle(&self, cx: CallContext, request: &RawRequest) -> HandlerResult;
}

fn decode_params<I: DeserializeOwned>(request: &RawRequest) -> Result<I, BoxError> {
    serde_json::from_str(request.params_json()).map_err(|e| {
        debug!(method = %request.method, error = %e, "Rejecting params");
        JsonRpcErrorObject::invalid_params().into()
    })
}

/// Handler for a method that produces a result. See [`call`].
pub struct CallHandler<F, I> {
    f: F,
    _input: PhantomData<fn(I)>,
}

/// Wrap `f` as a handler for a method that returns a result.
///
/// Params are decoded into `I`; a decode failure is reported as
/// `Invalid params` without exposing the decoder's message.
///
/// ```
/// use strand_json_rpc_server::{CallContext, Server, call};
///
/// let server = Server::new();
/// server.on("add", call(|_cx: CallContext, params: Vec<i64>| async move {
///     Ok::<_, std::convert::Infallible>(params.iter().sum::<i64>())
/// }));
/// ```
pub fn call<F, Fut, I, O, E>(f: F) -> CallHandler<F, I>
where
    F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    CallHandler {
        f,
        _input: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, I, O, E> JsonRpcHandler for CallHandler<F, I>
where
    F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    async fn handle(&self, cx: CallContext, request: &RawRequest) -> HandlerResult {
        let params: I = decode_params(request)?;
        let output = (self.f)(cx, params).await.map_err(Into::into)?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Handler for a method that produces no result. See [`notify`].
pub struct NotifyHandler<F, I> {
    f: F,
    _input: PhantomData<fn(I)>,
}

/// Wrap `f` as a handler for a notification-style method.
///
/// Same params contract as [`call`]. When such a method is invoked with an
/// id the peer receives a `null` result.
pub fn notify<F, Fut, I, E>(f: F) -> NotifyHandler<F, I>
where
    F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    NotifyHandler {
        f,
        _input: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, I, E> JsonRpcHandler for NotifyHandler<F, I>
where
    F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    async fn handle(&self, cx: CallContext, request: &RawRequest) -> HandlerResult {
        let params: I = decode_params(request)?;
        (self.f)(cx, params).await.map_err(Into::into)?;
        Ok(Value::Null)
    }
}
