//! Method registry and stream serving.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::codec::{FrameReader, write_message};
use crate::config::{ConfigError, ServerConfig};
use crate::error::{JsonRpcErrorObject, JsonRpcTransportError};
use crate::handler::{BoxError, CallContext, HandlerResult, JsonRpcHandler};
use crate::listener::Listener;
use crate::request::RawRequest;
use crate::response::Response;

type Reply = Batch<Response<Value>>;

struct ServerInner {
    /// Sorted by method name
    methods: RwLock<Vec<(String, Arc<dyn JsonRpcHandler>)>>,
    limiter: Arc<Semaphore>,
    config: ServerConfig,
    shutdown: CancellationToken,
    connections: AtomicU64,
}

/// JSON-RPC 2.0 server.
///
/// Cloning is cheap and every clone shares the registry, the concurrency
/// bound and the shutdown signal.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::from_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    fn from_config(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                methods: RwLock::new(Vec::new()),
                limiter: Arc::new(Semaphore::new(config.max_concurrent_calls)),
                config,
                shutdown: CancellationToken::new(),
                connections: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Register `handler` for `name`, replacing any handler already there
    pub fn on<H>(&self, name: impl Into<String>, handler: H)
    where
        H: JsonRpcHandler + 'static,
    {
        self.register(name.into(), Arc::new(handler));
    }

    fn register(&self, name: String, handler: Arc<dyn JsonRpcHandler>) {
        let mut methods = self.inner.methods.write();
        match methods.binary_search_by(|(registered, _)| registered.as_str().cmp(&name)) {
            Ok(idx) => methods[idx].1 = handler,
            Err(idx) => methods.insert(idx, (name, handler)),
        }
    }

    /// Registered method names in sorted order
    pub fn methods(&self) -> Vec<String> {
        self.inner
            .methods
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn JsonRpcHandler>> {
        let methods = self.inner.methods.read();
        methods
            .binary_search_by(|(registered, _)| registered.as_str().cmp(name))
            .ok()
            .map(|idx| methods[idx].1.clone())
    }

    /// Route `request` to the handler registered under its method name
    pub async fn dispatch(&self, cx: CallContext, request: &RawRequest) -> HandlerResult {
        match self.lookup(&request.method) {
            Some(handler) => handler.handle(cx, request).await,
            None => Err(JsonRpcErrorObject::method_not_found().into()),
        }
    }

    /// Serve requests arriving on `stream` until the peer closes it, a read
    /// fails, or the server shuts down.
    ///
    /// Each JSON unit is answered before the next one is read. Calls inside
    /// a batch run concurrently, bounded by `max_concurrent_calls`.
    pub async fn serve_for_one<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let connection = self.inner.connections.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.inner.shutdown.child_token();
        let _cancel_on_exit = token.clone().drop_guard();

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, self.inner.config.max_frame_bytes);
        info!(connection, "Connection opened");

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => {
                    debug!(connection, "Server shutting down, closing connection");
                    break;
                }
                frame = reader.next_frame() => frame,
            };

            let reply = match frame {
                Ok(Some(unit)) => self.process_unit(connection, &token, unit).await,
                Ok(None) => break,
                Err(JsonRpcTransportError::IoError(e)) => {
                    warn!(connection, error = %e, "Read failed");
                    break;
                }
                Err(e) => {
                    debug!(connection, error = %e, "Unreadable input");
                    Some(Batch::single(Response::invalid_request()))
                }
            };

            if let Some(reply) = reply
                && let Err(e) = write_message(&mut write_half, &reply).await
            {
                warn!(connection, error = %e, "Write failed");
                break;
            }
        }

        info!(connection, "Connection closed");
    }

    async fn process_unit(
        &self,
        connection: u64,
        token: &CancellationToken,
        unit: Box<RawValue>,
    ) -> Option<Reply> {
        let Batch {
            is_batch,
            mut messages,
        } = match Batch::split(unit) {
            Ok(batch) => batch,
            Err(e) => {
                debug!(connection, error = %e, "Batch is not a JSON array of values");
                return Some(Batch::single(Response::invalid_request()));
            }
        };

        if !is_batch {
            let message = messages.pop()?;
            let request = match parse_request(connection, &message) {
                Ok(request) => request,
                Err(response) => return Some(Batch::single(response)),
            };
            let _permit = self.acquire().await?;
            let cx = context_for(connection, token, &request);
            return self.respond(cx, request).await.map(Batch::single);
        }

        if messages.is_empty() {
            debug!(connection, "Empty batch");
            return Some(Batch::single(Response::invalid_request()));
        }

        debug!(connection, size = messages.len(), "Dispatching batch");
        let mut responses = Vec::with_capacity(messages.len());
        let mut tasks = JoinSet::new();

        for message in messages {
            let request = match parse_request(connection, &message) {
                Ok(request) => request,
                Err(response) => {
                    responses.push(response);
                    continue;
                }
            };
            let Some(permit) = self.acquire().await else {
                break;
            };
            let server = self.clone();
            let cx = context_for(connection, token, &request);
            tasks.spawn(async move {
                let _permit = permit;
                server.respond(cx, request).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => {}
                Err(e) => warn!(connection, error = %e, "Dispatch task failed"),
            }
        }

        Some(Batch::batch(responses))
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.limiter.clone().acquire_owned().await.ok()
    }

    /// Run one request and build its response, `None` for notifications
    async fn respond(&self, cx: CallContext, request: RawRequest) -> Option<Response<Value>> {
        let connection = cx.connection_id;
        debug!(connection, method = %request.method, id = ?request.id, "Dispatching request");

        let result = AssertUnwindSafe(self.dispatch(cx, &request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(connection, method = %request.method, "Handler panicked");
                Err(JsonRpcErrorObject::internal_error().into())
            });

        match (request.id, result) {
            (Some(id), Ok(value)) => Some(Response::success(id, value)),
            (Some(id), Err(e)) => Some(Response::error(id, to_error_object(e))),
            (None, Ok(_)) => None,
            (None, Err(e)) => {
                debug!(connection, method = %request.method, error = %e, "Notification failed");
                None
            }
        }
    }

    /// Accept connections from `listener` and serve each on its own task.
    ///
    /// Returns the first accept error, or `Ok(())` once [`Server::shutdown`]
    /// is called.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<(), JsonRpcTransportError> {
        info!("Server accepting connections");
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => None,
                accepted = listener.accept() => Some(accepted),
            };
            let Some(accepted) = accepted else {
                info!("Server stopped");
                listener.close().await?;
                return Ok(());
            };
            let stream = accepted.inspect_err(|e| warn!(error = %e, "Accept failed"))?;

            let server = self.clone();
            tokio::spawn(async move { server.serve_for_one(stream).await });
        }
    }

    /// Stop accepting, end every connection loop and cancel every in-flight
    /// handler's [`CallContext`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

#[async_trait]
impl JsonRpcHandler for Server {
    async fn handle(&self, cx: CallContext, request: &RawRequest) -> HandlerResult {
        self.dispatch(cx, request).await
    }
}

fn parse_request(connection: u64, message: &RawValue) -> Result<RawRequest, Response<Value>> {
    serde_json::from_str(message.get()).map_err(|e| {
        debug!(connection, error = %e, "Invalid request");
        Response::invalid_request()
    })
}

fn context_for(connection: u64, token: &CancellationToken, request: &RawRequest) -> CallContext {
    CallContext::new(
        connection,
        request.id.clone(),
        &request.method,
        token.clone(),
    )
}

fn to_error_object(error: BoxError) -> JsonRpcErrorObject {
    match error.downcast::<JsonRpcErrorObject>() {
        Ok(object) => *object,
        Err(other) => {
            debug!(error = %other, "Handler failed");
            JsonRpcErrorObject::internal_error()
        }
    }
}

/// Builder for [`Server`]
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    methods: Vec<(String, Arc<dyn JsonRpcHandler>)>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.config.max_concurrent_calls = max;
        self
    }

    pub fn max_frame_bytes(mut self, max: usize) -> Self {
        self.config.max_frame_bytes = max;
        self
    }

    pub fn method<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: JsonRpcHandler + 'static,
    {
        self.methods.push((name.into(), Arc::new(handler)));
        self
    }

    pub fn build(self) -> Result<Server, ConfigError> {
        let server = Server::with_config(self.config)?;
        for (name, handler) in self.methods {
            server.register(name, handler);
        }
        Ok(server)
    }
}
