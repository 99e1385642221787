use crate::protocol::Params;
use crate::server::{to_value, unknown_method, RpcDaemon};
use async_trait::async_trait;
use obs_core::{DaemonCore, ObsResult};
use obs_daemons::dome::{DomeInfo, MoveSide};
use obs_daemons::DomeDaemon;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
impl RpcDaemon for DomeDaemon {
    type Info = DomeInfo;

    fn core(&self) -> &Arc<DaemonCore<DomeInfo>> {
        DomeDaemon::core(self)
    }

    async fn call(&self, method: &str, params: &Params) -> ObsResult<Value> {
        let ack = match method {
            "open_dome" | "close_dome" => {
                let side = params.get_or("side", MoveSide::Both.to_string())?.parse::<MoveSide>()?;
                let frac = params.get_or("frac", 1.0)?;
                if method == "open_dome" {
                    self.open_dome(side, frac).await?
                } else {
                    self.close_dome(side, frac).await?
                }
            }
            "halt_dome" => self.halt_dome()?,
            "set_autoclose" => {
                let enabled = params.switch("command")?;
                let timeout = params.opt::<f64>("timeout")?;
                self.set_autoclose(enabled, timeout).await?
            }
            "set_autodehum" => self.set_autodehum(params.switch("command")?).await?,
            "override_dehumidifier" => {
                self.override_dehumidifier(params.switch("command")?).await?
            }
            "set_alarm" => self.set_alarm(params.switch("command")?).await?,
            "sound_alarm" => self.sound_alarm().await?,
            "set_heartbeat" => self.set_heartbeat(params.switch("command")?).await?,
            "override_windshield" => self.override_windshield(params.switch("command")?).await?,
            "set_autoshield" => self.set_autoshield(params.switch("command")?).await?,
            other => return Err(unknown_method("dome", other)),
        };
        to_value(ack)
    }
}
