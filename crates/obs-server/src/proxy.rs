//! Client side of the RPC transport.
//!
//! [`DaemonProxy`] implements the same control traits as the in-process daemon handles,
//! so the exposure queue can drive daemons in other processes without knowing it.

use crate::protocol::{Request, Response, MAX_LINE_BYTES};
use async_trait::async_trait;
use obs_core::capabilities::Compass;
use obs_core::control::{
    CameraControl, FilterControl, FilterUnitInfo, MountControl, MountInfo, Pingable,
};
use obs_core::exposure::Exposure;
use obs_core::{DaemonStatus, ObsError, ObsResult, Snapshot};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Connection to one daemon's RPC server.
#[derive(Debug)]
pub struct DaemonProxy {
    id: String,
    addr: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl DaemonProxy {
    pub fn new(id: impl Into<String>, addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Make one call. Connect, send and receive share the proxy's timeout.
    pub async fn call(&self, method: &str, params: Value) -> ObsResult<Value> {
        let request = Request::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        debug!(daemon = %self.id, id = request.id, method, "Calling");
        match timeout(self.timeout, self.exchange(&request)).await {
            Ok(result) => result?.into_result(),
            Err(_) => Err(ObsError::Timeout(format!(
                "No reply from {} to {} within {:.1}s",
                self.id,
                method,
                self.timeout.as_secs_f64()
            ))),
        }
    }

    /// Make one call and decode the result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> ObsResult<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| {
            ObsError::Rpc(format!("Unexpected reply from {} to {}: {}", self.id, method, e))
        })
    }

    async fn exchange(&self, request: &Request) -> ObsResult<Response> {
        let rpc_err = |e: std::io::Error| ObsError::Rpc(format!("{} ({}): {}", self.id, self.addr, e));
        let mut stream = TcpStream::connect(&self.addr).await.map_err(rpc_err)?;
        stream
            .write_all(request.encode()?.as_bytes())
            .await
            .map_err(rpc_err)?;

        let mut reader = BufReader::new(stream).take(MAX_LINE_BYTES as u64);
        let mut line = String::new();
        if reader.read_line(&mut line).await.map_err(rpc_err)? == 0 {
            return Err(ObsError::Rpc(format!(
                "{} closed the connection without replying",
                self.id
            )));
        }
        let response = Response::decode(&line)?;
        if response.id != request.id && response.id != 0 {
            return Err(ObsError::Rpc(format!(
                "Reply id {} does not match request id {}",
                response.id, request.id
            )));
        }
        Ok(response)
    }

    pub async fn get_info<I: DeserializeOwned>(&self, force_update: bool) -> ObsResult<Snapshot<I>> {
        self.call_as("get_info", json!({ "force_update": force_update }))
            .await
    }

    pub async fn status(&self) -> ObsResult<DaemonStatus> {
        self.call_as("status", Value::Null).await
    }

    pub async fn shutdown(&self) -> ObsResult<String> {
        self.call_as("shutdown", Value::Null).await
    }
}

#[async_trait]
impl Pingable for DaemonProxy {
    async fn ping(&self) -> ObsResult<String> {
        self.call_as("ping", Value::Null).await
    }
}

#[async_trait]
impl FilterControl for DaemonProxy {
    async fn filter_info(&self, force_update: bool) -> ObsResult<BTreeMap<u32, FilterUnitInfo>> {
        self.call_as("filter_info", json!({ "force_update": force_update }))
            .await
    }

    async fn home_filters(&self, uts: &[u32]) -> ObsResult<String> {
        self.call_as("home_filters", json!({ "uts": uts })).await
    }

    async fn set_filters(&self, targets: &BTreeMap<u32, String>) -> ObsResult<String> {
        self.call_as("set_filters", json!({ "targets": targets }))
            .await
    }
}

#[async_trait]
impl MountControl for DaemonProxy {
    async fn mount_info(&self, force_update: bool) -> ObsResult<MountInfo> {
        self.call_as("mount_info", json!({ "force_update": force_update }))
            .await
    }

    async fn offset(&self, direction: Compass, distance: f64) -> ObsResult<String> {
        self.call_as(
            "offset",
            json!({ "direction": direction.to_string(), "distance": distance }),
        )
        .await
    }
}

#[async_trait]
impl CameraControl for DaemonProxy {
    async fn take_exposure(&self, exposure: &Exposure) -> ObsResult<String> {
        self.call_as("take_exposure", json!({ "exposure": exposure }))
            .await
    }

    async fn is_exposing(&self) -> ObsResult<bool> {
        self.call_as("is_exposing", Value::Null).await
    }
}
