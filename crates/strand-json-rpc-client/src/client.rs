//! Client implementation: request writer, pending-call table and the
//! background response reader.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::value::RawValue;
use strand_json_rpc_server::codec::{FrameReader, write_message};
use strand_json_rpc_server::{
    Batch, JsonRpcErrorObject, JsonRpcTransportError, RawResponse, Request, RequestId,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Calls awaiting a response, keyed by the id minted for them
struct Pending {
    next_id: i64,
    waiters: HashMap<i64, oneshot::Sender<RawResponse>>,
    closed: bool,
}

impl Pending {
    fn register(&mut self) -> (i64, oneshot::Receiver<RawResponse>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        (id, rx)
    }
}

struct ClientInner {
    writer: tokio::sync::Mutex<Writer>,
    pending: Mutex<Pending>,
    shutdown: CancellationToken,
    config: ClientConfig,
}

impl ClientInner {
    /// Route a response to the call waiting for it
    fn deliver(&self, response: RawResponse) {
        let Some(id) = response.id.as_i64() else {
            debug!(id = %response.id, "Dropping response without an integer id");
            return;
        };

        let waiter = self.pending.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                // The receiver may have been dropped since; nothing to do then.
                let _ = tx.send(response);
            }
            None => debug!(id, "Dropping response for unknown or abandoned call"),
        }
    }

    fn deliver_unit(&self, unit: Box<RawValue>) {
        let messages = match Batch::split(unit) {
            Ok(batch) => batch.messages,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable response unit");
                return;
            }
        };

        for message in messages {
            match serde_json::from_str::<RawResponse>(message.get()) {
                Ok(response) => self.deliver(response),
                Err(e) => debug!(error = %e, "Skipping malformed response"),
            }
        }
    }

    /// Mark the client closed and wake every waiting call with `Closed`
    fn fail_pending(&self) {
        let mut pending = self.pending.lock();
        pending.closed = true;
        if !pending.waiters.is_empty() {
            debug!(count = pending.waiters.len(), "Failing pending calls");
        }
        // Dropping the senders resolves every receiver with an error.
        pending.waiters.clear();
    }
}

/// Removes its ids from the pending table when dropped, covering write
/// failure, cancellation, timeout and abandonment of the waiting future.
struct PendingGuard<'a> {
    pending: &'a Mutex<Pending>,
    ids: Vec<i64>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        for id in &self.ids {
            pending.waiters.remove(id);
        }
    }
}

/// One entry of a [`Client::batch`] call
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub method: String,
    pub params: Value,
    /// Send without an id and expect no response
    pub is_notify: bool,
}

impl BatchRequest {
    pub fn call(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            is_notify: false,
        }
    }

    pub fn notify(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            is_notify: true,
        }
    }
}

/// Outcome of one call in a batch, paired with what was sent
#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub method: String,
    pub params: Value,
    pub result: Option<Box<RawValue>>,
    pub error: Option<JsonRpcErrorObject>,
}

impl BatchResponse {
    /// Decode the result, or surface the server's error
    pub fn decode<R: DeserializeOwned>(&self) -> ClientResult<R> {
        if let Some(error) = &self.error {
            return Err(ClientError::Rpc(error.clone()));
        }
        let json = self.result.as_deref().map_or("null", RawValue::get);
        Ok(serde_json::from_str(json)?)
    }
}

/// JSON-RPC 2.0 client over a byte stream.
///
/// Responses are read by a background task and matched to waiting calls by
/// id, so any number of calls may be in flight at once from shared
/// references. Dropping the client stops that task and fails outstanding
/// calls with [`ClientError::Closed`].
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start a client on `stream`. Must be called within a Tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, ClientConfig::default())
    }

    pub fn with_config<S>(stream: S, config: ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FrameReader::new(read_half, config.max_frame_bytes);

        let inner = Arc::new(ClientInner {
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            pending: Mutex::new(Pending {
                next_id: 1,
                waiters: HashMap::new(),
                closed: false,
            }),
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(inner.clone(), reader));
        Self { inner }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Number of calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed
    }

    /// Call `method` and decode its result into `R`
    pub async fn call<P, R>(&self, method: &str, params: P) -> ClientResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_inner(method, params, None).await
    }

    /// Like [`Client::call`], but gives up with [`ClientError::Cancelled`]
    /// once `cancel` fires. Nothing is sent to the server on cancellation.
    pub async fn call_with_cancel<P, R>(
        &self,
        method: &str,
        params: P,
        cancel: &CancellationToken,
    ) -> ClientResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_inner(method, params, Some(cancel)).await
    }

    async fn call_inner<P, R>(
        &self,
        method: &str,
        params: P,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = encode_params(params)?;
        let deadline = self.deadline();

        let (id, rx) = {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(ClientError::Closed);
            }
            pending.register()
        };
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            ids: vec![id],
        };

        debug!(method, id, "Sending call");
        let request = Request::new(Some(RequestId::Number(id)), method, params);
        self.write(&request).await?;

        let response = self.wait(rx, cancel, deadline).await?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        let json = response.result.as_deref().map_or("null", RawValue::get);
        Ok(serde_json::from_str(json)?)
    }

    /// Send a notification. Returns once it is written; the server sends no
    /// response.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let params = encode_params(params)?;
        debug!(method, "Sending notification");
        self.write(&Request::new(None, method, params)).await
    }

    /// Send `requests` as one batch.
    ///
    /// The result has one slot per request, in request order: `None` for
    /// notifications, the server's answer for calls. Cancellation, timeout
    /// or closure fails the whole batch.
    pub async fn batch(&self, requests: Vec<BatchRequest>) -> ClientResult<Vec<Option<BatchResponse>>> {
        self.batch_inner(requests, None).await
    }

    pub async fn batch_with_cancel(
        &self,
        requests: Vec<BatchRequest>,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<Option<BatchResponse>>> {
        self.batch_inner(requests, Some(cancel)).await
    }

    async fn batch_inner(
        &self,
        requests: Vec<BatchRequest>,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<Vec<Option<BatchResponse>>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let deadline = self.deadline();

        let mut messages = Vec::with_capacity(requests.len());
        let mut receivers = Vec::with_capacity(requests.len());
        let mut ids = Vec::new();
        {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(ClientError::Closed);
            }
            for request in &requests {
                let id = if request.is_notify {
                    receivers.push(None);
                    None
                } else {
                    let (id, rx) = pending.register();
                    ids.push(id);
                    receivers.push(Some(rx));
                    Some(RequestId::Number(id))
                };
                let params = (!request.params.is_null()).then_some(&request.params);
                messages.push(Request::new(id, request.method.as_str(), params));
            }
        }
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            ids,
        };

        debug!(size = messages.len(), "Sending batch");
        self.write(&Batch::batch(messages)).await?;

        let mut responses = Vec::with_capacity(requests.len());
        for (request, receiver) in requests.into_iter().zip(receivers) {
            let Some(rx) = receiver else {
                responses.push(None);
                continue;
            };
            let response = self.wait(rx, cancel, deadline).await?;
            responses.push(Some(BatchResponse {
                method: request.method,
                params: request.params,
                result: response.result,
                error: response.error,
            }));
        }
        Ok(responses)
    }

    /// Stop the reader, fail pending calls with [`ClientError::Closed`] and
    /// shut down the write side of the stream.
    pub async fn close(&self) -> ClientResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        info!("Closing client");
        self.inner.shutdown.cancel();
        self.inner.fail_pending();

        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner.config.request_timeout.map(|t| Instant::now() + t)
    }

    async fn write<T: Serialize + ?Sized>(&self, message: &T) -> ClientResult<()> {
        let mut writer = self.inner.writer.lock().await;
        write_message(&mut *writer, message).await.map_err(|e| {
            warn!(error = %e, "Failed to write request");
            ClientError::from(e)
        })
    }

    async fn wait(
        &self,
        rx: oneshot::Receiver<RawResponse>,
        cancel: Option<&CancellationToken>,
        deadline: Option<Instant>,
    ) -> ClientResult<RawResponse> {
        tokio::select! {
            response = rx => response.map_err(|_| ClientError::Closed),
            _ = cancelled(cancel) => Err(ClientError::Cancelled),
            _ = expired(deadline) => Err(ClientError::Timeout(
                self.inner.config.request_timeout.unwrap_or_default(),
            )),
        }
    }
}

impl Drop for Client {
    /// Stops the reader task and wakes outstanding calls; the stream closes
    /// once the reader lets go of it.
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.fail_pending();
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Params that encode to `null` are left off the wire
fn encode_params<P: Serialize>(params: P) -> ClientResult<Option<Value>> {
    let value = serde_json::to_value(params)?;
    Ok((!value.is_null()).then_some(value))
}

async fn read_loop<R>(inner: Arc<ClientInner>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(unit)) => inner.deliver_unit(unit),
            Ok(None) => {
                debug!("Server closed the stream");
                break;
            }
            Err(JsonRpcTransportError::IoError(e)) => {
                warn!(error = %e, "Read failed");
                break;
            }
            Err(e) => debug!(error = %e, "Skipping unreadable input"),
        }
    }

    inner.fail_pending();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use strand_json_rpc_server::{RawRequest, Response};
    use tokio::io::DuplexStream;

    /// Server side of a duplex pipe, driven by hand
    struct Peer {
        reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn next_raw(&mut self) -> Box<RawValue> {
            self.reader.next_frame().await.unwrap().unwrap()
        }

        async fn next_request(&mut self) -> RawRequest {
            serde_json::from_str(self.next_raw().await.get()).unwrap()
        }

        async fn send(&mut self, message: Value) {
            write_message(&mut self.writer, &message).await.unwrap();
        }

        async fn reply(&mut self, id: &RequestId, result: Value) {
            let response = Response::success(id.clone(), result);
            write_message(&mut self.writer, &response).await.unwrap();
        }
    }

    fn pair(config: ClientConfig) -> (Client, Peer) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (read_half, writer) = tokio::io::split(theirs);
        let peer = Peer {
            reader: FrameReader::new(read_half, 1 << 20),
            writer,
        };
        (Client::with_config(ours, config), peer)
    }

    async fn settle(client: &Client, expected: usize) {
        for _ in 0..100 {
            if client.pending_calls() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("pending calls never reached {expected}");
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client, mut peer) = pair(ClientConfig::default());
        let server = tokio::spawn(async move {
            let request = peer.next_request().await;
            assert_eq!(request.method, "add");
            assert_eq!(request.params_json(), "[1,2,3]");
            assert_eq!(request.id, Some(RequestId::Number(1)));
            peer.reply(request.id.as_ref().unwrap(), json!(6)).await;
            peer
        });

        let sum: i64 = client.call("add", vec![1, 2, 3]).await.unwrap();
        assert_eq!(sum, 6);
        assert_eq!(client.pending_calls(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response() {
        let (client, mut peer) = pair(ClientConfig::default());
        tokio::spawn(async move {
            let request = peer.next_request().await;
            let response: Response<Value> =
                Response::error(request.id.unwrap(), JsonRpcErrorObject::method_not_found());
            write_message(&mut peer.writer, &response).await.unwrap();
            peer
        });

        let err = client.call::<_, Value>("noSuch", ()).await.unwrap_err();
        assert_eq!(err.error_code(), Some(-32601));
    }

    #[tokio::test]
    async fn test_null_params_are_omitted() {
        let (client, mut peer) = pair(ClientConfig::default());
        client.notify("ping", ()).await.unwrap();
        client.notify("ping", Option::<i64>::None).await.unwrap();
        client.notify("ping", json!({"x": 1})).await.unwrap();

        assert_eq!(peer.next_raw().await.get(), r#"{"jsonrpc":"2.0","method":"ping"}"#);
        assert_eq!(peer.next_raw().await.get(), r#"{"jsonrpc":"2.0","method":"ping"}"#);
        assert_eq!(
            peer.next_raw().await.get(),
            r#"{"jsonrpc":"2.0","method":"ping","params":{"x":1}}"#
        );
    }

    #[tokio::test]
    async fn test_result_type_mismatch() {
        let (client, mut peer) = pair(ClientConfig::default());
        tokio::spawn(async move {
            let request = peer.next_request().await;
            peer.reply(request.id.as_ref().unwrap(), json!("six")).await;
            peer
        });

        let err = client.call::<_, i64>("add", [1]).await.unwrap_err();
        assert!(matches!(err, ClientError::Json(_)));
    }

    #[tokio::test]
    async fn test_cancel_removes_pending_entry() {
        let (client, mut peer) = pair(ClientConfig::default());
        let cancel = CancellationToken::new();

        let call = client.call_with_cancel::<_, i64>("slow", (), &cancel);
        let canceller = async {
            let request = peer.next_request().await;
            cancel.cancel();
            request
        };
        let (result, request) = tokio::join!(call, canceller);
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(client.pending_calls(), 0);

        // The late answer is dropped and the client keeps working.
        peer.reply(request.id.as_ref().unwrap(), json!(1)).await;
        let next = async {
            let request = peer.next_request().await;
            assert_eq!(request.id, Some(RequestId::Number(2)));
            peer.reply(request.id.as_ref().unwrap(), json!(2)).await;
        };
        let (value, ()) = tokio::join!(client.call::<_, i64>("fast", ()), next);
        assert_eq!(value.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropped_call_deregisters() {
        let (client, mut peer) = pair(ClientConfig::default());
        {
            let call = client.call::<_, Value>("never", ());
            let _ = tokio::time::timeout(Duration::from_millis(20), call).await;
        }
        let _ = peer.next_request().await;
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let config = ClientConfig::default().with_request_timeout(Duration::from_millis(20));
        let (client, _peer) = pair(config);

        let err = client.call::<_, Value>("never", ()).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(d) if d == Duration::from_millis(20)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_in_flight_calls() {
        let (client, _peer) = pair(ClientConfig::default());
        let client = Arc::new(client);

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Value>("a", ()).await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, Value>("b", ()).await }
        });
        settle(&client, 2).await;

        client.close().await.unwrap();
        assert!(matches!(first.await.unwrap(), Err(ClientError::Closed)));
        assert!(matches!(second.await.unwrap(), Err(ClientError::Closed)));

        assert!(matches!(client.call::<_, Value>("c", ()).await, Err(ClientError::Closed)));
        assert!(matches!(client.notify("d", ()).await, Err(ClientError::Closed)));
        assert!(client.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_stream_end_fails_pending_calls() {
        let (client, mut peer) = pair(ClientConfig::default());
        let server = async move {
            let _ = peer.next_request().await;
            drop(peer);
        };
        let (result, ()) = tokio::join!(client.call::<_, Value>("a", ()), server);
        assert!(matches!(result, Err(ClientError::Closed)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_batch_results_are_positional() {
        let (client, mut peer) = pair(ClientConfig::default());
        let server = tokio::spawn(async move {
            let unit = peer.next_raw().await;
            let batch = Batch::split(unit).unwrap();
            assert!(batch.is_batch);
            let requests: Vec<RawRequest> = batch
                .messages
                .iter()
                .map(|m| serde_json::from_str(m.get()).unwrap())
                .collect();
            assert_eq!(requests.len(), 3);
            assert!(requests[1].is_notification());

            // Answer out of order, with some noise for unknown ids.
            let mut replies = vec![json!({"jsonrpc": "2.0", "result": "stray", "id": 99})];
            for request in requests.iter().rev().filter(|r| !r.is_notification()) {
                let id = request.id.clone().unwrap();
                replies.push(json!({"jsonrpc": "2.0", "result": request.method, "id": id}));
            }
            peer.send(Value::Array(replies)).await;
            peer
        });

        let responses = client
            .batch(vec![
                BatchRequest::call("first", json!([1])),
                BatchRequest::notify("log", json!("hi")),
                BatchRequest::call("third", Value::Null),
            ])
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(responses.len(), 3);
        let first = responses[0].as_ref().unwrap();
        assert_eq!(first.method, "first");
        assert_eq!(first.params, json!([1]));
        assert_eq!(first.decode::<String>().unwrap(), "first");
        assert!(responses[1].is_none());
        assert_eq!(responses[2].as_ref().unwrap().decode::<String>().unwrap(), "third");
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_cancel_abandons_all() {
        let (client, mut peer) = pair(ClientConfig::default());
        let cancel = CancellationToken::new();

        let batch = client.batch_with_cancel(
            vec![BatchRequest::call("a", Value::Null), BatchRequest::call("b", Value::Null)],
            &cancel,
        );
        let canceller = async {
            let _ = peer.next_raw().await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(batch, canceller);
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let (client, _peer) = pair(ClientConfig::default());
        assert!(client.batch(Vec::new()).await.unwrap().is_empty());
    }
}
