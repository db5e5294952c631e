//! TCP Calculator Example
//!
//! Serves `add`, `sub`, `div` and a `log` notification on a TCP port.
//! Try it with netcat:
//!
//! ```text
//! cargo run --example tcp_calculator -- --port 4000
//! echo '{"jsonrpc":"2.0","method":"add","params":[1,2,3],"id":1}' | nc 127.0.0.1 4000
//! ```

use anyhow::Result;
use serde::Deserialize;
use strand_json_rpc_server::{BoxError, CallContext, JsonRpcErrorObject, Server, call, notify};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Deserialize)]
struct Operands {
    a: f64,
    b: f64,
}

fn calculator() -> Result<Server> {
    let server = Server::builder()
        .max_concurrent_calls(16)
        .method(
            "add",
            call(|_cx, values: Vec<f64>| async move { Ok::<_, BoxError>(values.iter().sum::<f64>()) }),
        )
        .method(
            "sub",
            call(|_cx, op: Operands| async move { Ok::<_, BoxError>(op.a - op.b) }),
        )
        .method(
            "div",
            call(|_cx, op: Operands| async move {
                if op.b == 0.0 {
                    return Err(JsonRpcErrorObject::custom(1, "Division by zero"));
                }
                Ok(op.a / op.b)
            }),
        )
        .method(
            "log",
            notify(|cx: CallContext, line: String| async move {
                info!(connection = cx.connection_id, "client says: {}", line);
                Ok::<_, BoxError>(())
            }),
        )
        .build()?;
    Ok(server)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = args
        .iter()
        .position(|arg| arg == "--port")
        .and_then(|i| args.get(i + 1))
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(4000);

    let server = calculator()?;
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Calculator listening on {}", listener.local_addr()?);
    info!("Methods: {:?}", server.methods());

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            stopper.shutdown();
        }
    });

    server.serve(listener).await?;
    Ok(())
}
