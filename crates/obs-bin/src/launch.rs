//! Build daemons from the configuration and serve them.

use anyhow::{bail, Context, Result};
use obs_core::adapter::AdapterSlot;
use obs_core::capabilities::{
    CameraUnit, DomeUnit, FilterWheel, FocuserUnit, Heartbeat, MountUnit, QuickCloseButton, Relay,
};
use obs_core::config::ObsConfig;
use obs_core::control::{CameraControl, FilterControl, MountControl};
use obs_core::site::{ConditionsSource, FileConditions, FileStatus};
use obs_core::{LoopTiming, ObsResult};
use obs_daemons::cam::CameraSlot;
use obs_daemons::dome::{DomeHardware, DomeSettings, BUTTON, DEHUMIDIFIER, DOME, HEARTBEAT};
use obs_daemons::exq::{ExqDependencies, ExqSettings};
use obs_daemons::filt::FilterUnit;
use obs_daemons::foc::FocuserSlot;
use obs_daemons::{CamDaemon, DomeDaemon, ExqDaemon, FiltDaemon, FocDaemon, MntDaemon, PowerDaemon};
use obs_driver_mock::{
    MockButton, MockCamera, MockDome, MockFilterWheel, MockFocuser, MockHeartbeat, MockMount,
    MockRelay,
};
use obs_server::{DaemonProxy, RpcDaemon};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

const FAKE_FOCUSER_LIMIT: i64 = 2000;
const FAKE_FOCUSER_SPEED: f64 = 500.0;

/// Daemons served by this process.
#[derive(Default)]
pub struct Launched {
    pub servers: JoinSet<ObsResult<()>>,
    stops: Vec<Box<dyn Fn() -> String + Send>>,
}

impl Launched {
    /// Ask every daemon to shut down.
    pub fn shutdown_all(&self) {
        for stop in &self.stops {
            stop();
        }
    }

    async fn serve<D: RpcDaemon>(&mut self, config: &ObsConfig, daemon: D) -> Result<()> {
        let id = daemon.core().id().to_string();
        let addr = config
            .daemons
            .get(&id)
            .with_context(|| format!("No address configured for {}", id))?
            .socket_addr();
        let listener = obs_server::bind(&addr)
            .await
            .with_context(|| format!("Cannot listen on {} for {}", addr, id))?;
        let core = Arc::clone(daemon.core());
        self.stops.push(Box::new(move || core.shutdown()));
        self.servers.spawn(obs_server::serve(listener, Arc::new(daemon)));
        info!(daemon = %id, %addr, "Daemon serving");
        Ok(())
    }
}

/// Start the named daemons.
pub async fn launch(config: &ObsConfig, ids: &[String]) -> Result<Launched> {
    if !config.fake {
        bail!("Only the simulated hardware adapters are available; set `fake = true`");
    }
    let timing = config.timing.loop_timing();
    let mut launched = Launched::default();
    for id in ids {
        match id.as_str() {
            "dome" => launched.serve(config, start_dome(config, timing)).await?,
            "exq" => launched.serve(config, start_exq(config, timing)?).await?,
            "filt" => launched.serve(config, start_filt(config, timing)).await?,
            "cam" => launched.serve(config, start_cam(config, timing)).await?,
            "mnt" => {
                let mount = Arc::new(MockMount::new()) as Arc<dyn MountUnit>;
                launched.serve(config, MntDaemon::start(mount, timing).0).await?
            }
            "foc" => launched.serve(config, start_foc(config, timing)).await?,
            "power" => launched.serve(config, start_power(config, timing)).await?,
            other => bail!("Unknown daemon '{}'", other),
        }
    }
    Ok(launched)
}

fn start_dome(config: &ObsConfig, timing: LoopTiming) -> DomeDaemon {
    let paths = &config.paths;
    let conditions = FileConditions::new(
        paths.conditions_file(),
        Duration::from_secs(paths.max_conditions_age_secs),
    );
    let hardware = DomeHardware {
        dome: AdapterSlot::fixed(DOME, Arc::new(MockDome::new()) as Arc<dyn DomeUnit>),
        heartbeat: AdapterSlot::fixed(
            HEARTBEAT,
            Arc::new(MockHeartbeat::new()) as Arc<dyn Heartbeat>,
        ),
        dehumidifier: config.dome.has_dehumidifier.then(|| {
            AdapterSlot::fixed(DEHUMIDIFIER, Arc::new(MockRelay::new(false)) as Arc<dyn Relay>)
        }),
        button: config.dome.quick_close_button.then(|| {
            AdapterSlot::fixed(
                BUTTON,
                Arc::new(MockButton::new()) as Arc<dyn QuickCloseButton>,
            )
        }),
        conditions: Arc::new(conditions) as Arc<dyn ConditionsSource>,
        site: FileStatus::new(paths.status_file(), paths.emergency_file()),
    };
    DomeDaemon::start(hardware, DomeSettings::from(&config.dome), timing).0
}

fn start_exq(config: &ObsConfig, timing: LoopTiming) -> Result<ExqDaemon> {
    let proxy = |id: &str| -> Result<Arc<DaemonProxy>> {
        let addr = config
            .daemons
            .get(id)
            .with_context(|| format!("No address configured for {}", id))?;
        Ok(Arc::new(DaemonProxy::new(
            id,
            addr.socket_addr(),
            config.rpc.timeout(),
        )))
    };
    let deps = ExqDependencies {
        filt: proxy("filt")? as Arc<dyn FilterControl>,
        cam: proxy("cam")? as Arc<dyn CameraControl>,
        mnt: proxy("mnt")? as Arc<dyn MountControl>,
    };
    let (exq, _) = ExqDaemon::start(ExqSettings::from_config(config), deps, timing)?;
    Ok(exq)
}

fn start_filt(config: &ObsConfig, timing: LoopTiming) -> FiltDaemon {
    let units = config
        .ut_filters()
        .into_iter()
        .filter(|(_, filters)| !filters.is_empty())
        .map(|(ut, filters)| {
            let wheel = Arc::new(MockFilterWheel::new(filters.len())) as Arc<dyn FilterWheel>;
            FilterUnit::new(ut, filters, wheel)
        })
        .collect();
    FiltDaemon::start(units, timing).0
}

fn start_cam(config: &ObsConfig, timing: LoopTiming) -> CamDaemon {
    let cameras = config
        .ut_filters()
        .into_keys()
        .map(|ut| CameraSlot::new(ut, Arc::new(MockCamera::new()) as Arc<dyn CameraUnit>))
        .collect();
    CamDaemon::start(cameras, timing).0
}

fn start_foc(config: &ObsConfig, timing: LoopTiming) -> FocDaemon {
    let focusers = config
        .ut_filters()
        .into_keys()
        .map(|ut| {
            let focuser = MockFocuser::new(FAKE_FOCUSER_LIMIT, FAKE_FOCUSER_SPEED);
            FocuserSlot::new(ut, Arc::new(focuser) as Arc<dyn FocuserUnit>)
        })
        .collect();
    FocDaemon::start(focusers, timing).0
}

fn start_power(config: &ObsConfig, timing: LoopTiming) -> PowerDaemon {
    let outlets = config
        .power
        .outlets
        .iter()
        .map(|name| (name.clone(), Arc::new(MockRelay::new(true)) as Arc<dyn Relay>))
        .collect();
    PowerDaemon::start(outlets, config.power.reboot_delay(), timing).0
}
