//! TCP server loop shared by every daemon.

use crate::protocol::{Params, Request, Response, MAX_LINE_BYTES};
use async_trait::async_trait;
use obs_core::{DaemonCore, ObsError, ObsResult};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Bound on reading the request line from a connected client.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long in-flight calls may take to answer once the worker has stopped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A daemon that can be served over RPC.
///
/// The common methods (`get_info`, `ping`, `status`, `shutdown`) are answered from
/// [`core`](RpcDaemon::core); [`call`](RpcDaemon::call) handles the daemon's own methods.
#[async_trait]
pub trait RpcDaemon: Send + Sync + 'static {
    type Info: Clone + Serialize + Send + Sync + 'static;

    fn core(&self) -> &Arc<DaemonCore<Self::Info>>;

    async fn call(&self, method: &str, params: &Params) -> ObsResult<Value>;
}

/// Error for a method the daemon does not serve.
pub fn unknown_method(daemon: &str, method: &str) -> ObsError {
    ObsError::InvalidArgument(format!("Unknown method '{}' for daemon {}", method, daemon))
}

/// Serialize a command result.
pub fn to_value<T: Serialize>(value: T) -> ObsResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Answer one request.
pub async fn dispatch<D: RpcDaemon + ?Sized>(daemon: &D, request: &Request) -> ObsResult<Value> {
    let params = Params::from_value(request.params.clone())?;
    let core = daemon.core();
    match request.method.as_str() {
        "get_info" => {
            let force_update = params.get_or("force_update", false)?;
            let snapshot = core.get_info(force_update).await?;
            to_value(&*snapshot)
        }
        "ping" => to_value(core.ping()?),
        "status" => to_value(core.status()),
        "shutdown" => to_value(core.shutdown()),
        method => daemon.call(method, &params).await,
    }
}

/// Bind the daemon's listening socket.
pub async fn bind(addr: &str) -> ObsResult<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("RPC server listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serve requests until the daemon's worker has stopped.
///
/// Calls already accepted are given a short grace period to answer, so the client that
/// sent `shutdown` still gets its acknowledgement.
pub async fn serve<D: RpcDaemon>(listener: TcpListener, daemon: Arc<D>) -> ObsResult<()> {
    let core = Arc::clone(daemon.core());
    let stopped = core.wait_stopped();
    tokio::pin!(stopped);
    let mut clients = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let daemon = Arc::clone(&daemon);
                        let span = info_span!("rpc", daemon = %core.id(), client = %addr);
                        clients.spawn(
                            async move {
                                if let Err(e) = handle_client(socket, addr, daemon).await {
                                    warn!("Client {} error: {}", addr, e);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => error!("Accept error: {}", e),
                }
            }
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
            _ = &mut stopped => break,
        }
    }

    info!(daemon = %core.id(), "Worker stopped, closing RPC server");
    drop(listener);
    let drain = async { while clients.join_next().await.is_some() {} };
    if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Abandoning calls still running after shutdown");
        clients.abort_all();
    }
    Ok(())
}

async fn handle_client<D: RpcDaemon>(
    socket: TcpStream,
    addr: SocketAddr,
    daemon: Arc<D>,
) -> ObsResult<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE_BYTES as u64);
    let mut line = String::new();

    let n = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ObsError::Timeout(format!(
                "No request from {} within {:.0}s",
                addr,
                READ_TIMEOUT.as_secs_f64()
            )))
        }
    };
    if n == 0 {
        debug!("Client {} disconnected without a request", addr);
        return Ok(());
    }

    let response = match Request::decode(&line) {
        Ok(request) => {
            debug!(id = request.id, method = %request.method, "Request");
            let result = dispatch(daemon.as_ref(), &request).await;
            if let Err(e) = &result {
                info!(method = %request.method, "Refused: {}", e);
            }
            Response::from_result(request.id, result)
        }
        Err(e) => {
            error!("Failed to decode request: {}", e);
            Response::from_result(0, Err(e))
        }
    };

    write_half.write_all(response.encode()?.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}
