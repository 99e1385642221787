use crate::protocol::Params;
use crate::server::{to_value, unknown_method, RpcDaemon};
use async_trait::async_trait;
use obs_core::capabilities::Compass;
use obs_core::control::{FilterControl, MountControl, MountInfo};
use obs_core::exposure::Exposure;
use obs_core::{DaemonCore, ObsError, ObsResult};
use obs_daemons::cam::CamInfo;
use obs_daemons::filt::FiltInfo;
use obs_daemons::foc::FocInfo;
use obs_daemons::power::PowerInfo;
use obs_daemons::{CamDaemon, FiltDaemon, FocDaemon, MntDaemon, PowerDaemon};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
impl RpcDaemon for FiltDaemon {
    type Info = FiltInfo;

    fn core(&self) -> &Arc<DaemonCore<FiltInfo>> {
        FiltDaemon::core(self)
    }

    async fn call(&self, method: &str, params: &Params) -> ObsResult<Value> {
        match method {
            "filter_info" => {
                let force_update = params.get_or("force_update", false)?;
                to_value(self.filter_info(force_update).await?)
            }
            "home_filters" => to_value(self.home_filters(&params.get::<Vec<u32>>("uts")?).await?),
            "set_filters" => {
                let targets: BTreeMap<u32, String> = params.get("targets")?;
                to_value(self.set_filters(&targets).await?)
            }
            other => Err(unknown_method("filt", other)),
        }
    }
}

#[async_trait]
impl RpcDaemon for CamDaemon {
    type Info = CamInfo;

    fn core(&self) -> &Arc<DaemonCore<CamInfo>> {
        CamDaemon::core(self)
    }

    async fn call(&self, method: &str, params: &Params) -> ObsResult<Value> {
        match method {
            "take_exposure" => {
                let exposure: Exposure = params.get("exposure")?;
                to_value(self.take_exposure(&exposure).await?)
            }
            "abort_exposure" => {
                to_value(self.abort_exposure(&params.get::<Vec<u32>>("uts")?).await?)
            }
            "is_exposing" => to_value(self.is_exposing().await?),
            other => Err(unknown_method("cam", other)),
        }
    }
}

#[async_trait]
impl RpcDaemon for MntDaemon {
    type Info = MountInfo;

    fn core(&self) -> &Arc<DaemonCore<MountInfo>> {
        MntDaemon::core(self)
    }

    async fn call(&self, method: &str, params: &Params) -> ObsResult<Value> {
        match method {
            "mount_info" => {
                let force_update = params.get_or("force_update", false)?;
                to_value(self.mount_info(force_update).await?)
            }
            "offset" => {
                let direction: Compass = params
                    .get::<String>("direction")?
                    .parse()
                    .map_err(ObsError::InvalidArgument)?;
                let distance: f64 = params.get("distance")?;
                to_value(MntDaemon::offset(self, direction, distance).await?)
            }
            "track" => to_value(self.track().await?),
            "park" => to_value(self.park().await?),
            "halt" => to_value(self.halt()),
            other => Err(unknown_method("mnt", other)),
        }
    }
}

#[async_trait]
impl RpcDaemon for FocDaemon {
    type Info = FocInfo;

    fn core(&self) -> &Arc<DaemonCore<FocInfo>> {
        FocDaemon::core(self)
    }

    async fn call(&self, method: &str, params: &Params) -> ObsResult<Value> {
        match method {
            "move_focuser" => {
                let steps: BTreeMap<u32, i64> = params.get("steps")?;
                to_value(self.move_focuser(&steps).await?)
            }
            "set_focuser" => {
                let positions: BTreeMap<u32, i64> = params.get("positions")?;
                to_value(self.set_focuser(&positions).await?)
            }
            "home_focuser" => to_value(self.home_focuser(&params.get::<Vec<u32>>("uts")?).await?),
            other => Err(unknown_method("foc", other)),
        }
    }
}

#[async_trait]
impl RpcDaemon for PowerDaemon {
    type Info = PowerInfo;

    fn core(&self) -> &Arc<DaemonCore<PowerInfo>> {
        PowerDaemon::core(self)
    }

    async fn call(&self, method: &str, params: &Params) -> ObsResult<Value> {
        let outlets = || params.get::<Vec<String>>("outlets");
        match method {
            "on" => to_value(self.on(&outlets()?)?),
            "off" => to_value(self.off(&outlets()?)?),
            "reboot" => to_value(self.reboot(&outlets()?)?),
            other => Err(unknown_method("power", other)),
        }
    }
}
