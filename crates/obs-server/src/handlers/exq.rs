use crate::protocol::Params;
use crate::server::{to_value, unknown_method, RpcDaemon};
use async_trait::async_trait;
use obs_core::{DaemonCore, ObsResult};
use obs_daemons::exq::{ExposureRequest, ExqInfo};
use obs_daemons::ExqDaemon;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
impl RpcDaemon for ExqDaemon {
    type Info = ExqInfo;

    fn core(&self) -> &Arc<DaemonCore<ExqInfo>> {
        ExqDaemon::core(self)
    }

    async fn call(&self, method: &str, params: &Params) -> ObsResult<Value> {
        let ack = match method {
            "add" => self.add(params.parse::<ExposureRequest>()?)?,
            "clear" => self.clear()?,
            "get" => self.get()?,
            "get_simple" => self.get_simple()?,
            "pause" => self.pause()?,
            "resume" => self.resume()?,
            other => return Err(unknown_method("exq", other)),
        };
        to_value(ack)
    }
}
