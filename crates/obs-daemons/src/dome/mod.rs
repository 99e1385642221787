//! Dome daemon.
//!
//! Drives the two shutter sides and supervises them: on every re-sync the worker reads the
//! dome, heartbeat, dehumidifier, quick-close button, site mode, emergency marker and
//! conditions, then runs the mode, lockdown, autoclose, autodehum and windshield checks in
//! that order. Engineering mode skips every automatic check.
//!
//! Commands issued through [`DomeDaemon`] are validated against a freshly forced snapshot
//! and written into a [`DomeMailbox`]; the worker drains the mailbox each tick with a halt
//! taking priority over any motion drained with it.

mod info;
mod lockdown;
mod motion;
mod worker;

pub use info::{DomeInfo, DomeState};
pub use lockdown::{evaluate_lockdown, Lockdown, LockdownTracker, LockdownTriggers};
pub use motion::{ActiveMove, MotionInfo, MoveAction, MovePhase, MoveRequest, MoveSide};

use chrono::{DateTime, Utc};
use obs_core::adapter::AdapterSlot;
use obs_core::capabilities::{DomeUnit, Heartbeat, MoveDirection, QuickCloseButton, Relay};
use obs_core::config::DomeConfig;
use obs_core::site::{ConditionsSource, FileStatus, Mode};
use obs_core::{DaemonCore, LoopTiming, ObsError, ObsResult, Snapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use worker::DomeWorker;

/// Adapter names, as they appear in `bad_hardware`.
pub const DOME: &str = "dome";
pub const HEARTBEAT: &str = "heartbeat";
pub const DEHUMIDIFIER: &str = "dehumidifier";
pub const BUTTON: &str = "button";

/// Supervision parameters with units resolved.
#[derive(Debug, Clone)]
pub struct DomeSettings {
    pub move_timeout: Duration,
    pub alarm_settle: Duration,
    pub alarm_duration: Duration,
    pub hatch_open_delay: Duration,
    pub windshield_permitted: bool,
    pub windshield_position: f64,
    pub windspeed_upper: f64,
    pub windspeed_lower: f64,
    pub humidity_upper: f64,
    pub humidity_lower: f64,
    pub temperature_lower: f64,
    pub temperature_upper: f64,
}

impl From<&DomeConfig> for DomeSettings {
    fn from(config: &DomeConfig) -> Self {
        Self {
            move_timeout: Duration::from_secs(config.move_timeout_secs),
            alarm_settle: Duration::from_secs(config.alarm_settle_secs),
            alarm_duration: Duration::from_secs(5),
            hatch_open_delay: Duration::from_secs(config.hatch_open_delay_secs),
            windshield_permitted: config.windshield_permitted,
            windshield_position: config.windshield_position,
            windspeed_upper: config.shield_windgust,
            windspeed_lower: config.windspeed_lower(),
            humidity_upper: config.max_internal_humidity,
            humidity_lower: config.humidity_lower(),
            temperature_lower: config.min_internal_temperature,
            temperature_upper: config.temperature_upper(),
        }
    }
}

impl Default for DomeSettings {
    fn default() -> Self {
        Self::from(&DomeConfig::default())
    }
}

/// Everything the dome worker reads from or drives.
pub struct DomeHardware {
    pub dome: AdapterSlot<dyn DomeUnit>,
    pub heartbeat: AdapterSlot<dyn Heartbeat>,
    pub dehumidifier: Option<AdapterSlot<dyn Relay>>,
    pub button: Option<AdapterSlot<dyn QuickCloseButton>>,
    pub conditions: Arc<dyn ConditionsSource>,
    pub site: FileStatus,
}

/// Requested autoclose setting. `until` re-enables autoclose automatically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutocloseSetting {
    pub enabled: bool,
    pub until: Option<DateTime<Utc>>,
}

/// Pending commands, at most one per category.
#[derive(Debug, Clone, Default)]
pub struct DomeCommands {
    pub halt: bool,
    pub motion: Option<MoveRequest>,
    pub autoclose: Option<AutocloseSetting>,
    pub autodehum: Option<bool>,
    pub dehumidifier: Option<bool>,
    pub alarm: Option<bool>,
    pub sound_alarm: bool,
    pub heartbeat: Option<bool>,
    pub windshield: Option<bool>,
    pub autoshield: Option<bool>,
}

/// Shared between the RPC handlers and the worker.
#[derive(Debug, Default)]
pub struct DomeMailbox {
    pub commands: DomeCommands,
    /// Direction of the move the worker is running, kept current by the worker.
    pub in_flight: Option<MoveDirection>,
}

impl DomeMailbox {
    /// Take every pending command, leaving the mailbox empty.
    pub fn take(&mut self) -> DomeCommands {
        std::mem::take(&mut self.commands)
    }
}

/// Handle to a running dome daemon.
#[derive(Clone)]
pub struct DomeDaemon {
    core: Arc<DaemonCore<DomeInfo>>,
    mailbox: Arc<Mutex<DomeMailbox>>,
    settings: Arc<DomeSettings>,
    has_dehumidifier: bool,
}

impl DomeDaemon {
    /// Start the worker and return the handle with the worker's join handle.
    pub fn start(
        hardware: DomeHardware,
        settings: DomeSettings,
        timing: LoopTiming,
    ) -> (Self, JoinHandle<()>) {
        let core = DaemonCore::new("dome", timing);
        let mailbox = Arc::new(Mutex::new(DomeMailbox::default()));
        let settings = Arc::new(settings);
        let has_dehumidifier = hardware.dehumidifier.is_some();
        let worker = DomeWorker::new(hardware, Arc::clone(&settings), Arc::clone(&mailbox));
        let handle = core.spawn(worker);
        (
            Self {
                core,
                mailbox,
                settings,
                has_dehumidifier,
            },
            handle,
        )
    }

    pub fn core(&self) -> &Arc<DaemonCore<DomeInfo>> {
        &self.core
    }

    pub async fn get_info(&self, force_update: bool) -> ObsResult<Arc<Snapshot<DomeInfo>>> {
        self.core.get_info(force_update).await
    }

    pub async fn open_dome(&self, side: MoveSide, frac: f64) -> ObsResult<String> {
        let request = MoveRequest::new(MoveDirection::Open, side, frac)?;
        self.request_move(request).await
    }

    pub async fn close_dome(&self, side: MoveSide, frac: f64) -> ObsResult<String> {
        let request = MoveRequest::new(MoveDirection::Close, side, frac)?;
        self.request_move(request).await
    }

    async fn request_move(&self, request: MoveRequest) -> ObsResult<String> {
        let direction = request.direction;
        let snapshot = self.core.get_info(true).await?;
        let info = &snapshot.info;
        if direction == MoveDirection::Open && info.lockdown.is_active() {
            return Err(ObsError::HardwareStatus("Dome is in lockdown".to_string()));
        }
        if snapshot.health.bad_hardware.contains(DOME) {
            return Err(ObsError::HardwareStatus("Cannot connect to dome".to_string()));
        }
        let (Some(a_side), Some(b_side)) = (info.a_side, info.b_side) else {
            return Err(ObsError::HardwareStatus("Dome status unknown".to_string()));
        };

        let mut mailbox = self.mailbox.lock();
        let pending = mailbox.commands.motion.map(|m| m.direction);
        if mailbox.in_flight == Some(direction) || pending == Some(direction) {
            return Err(ObsError::HardwareStatus(format!(
                "Dome is already {}",
                direction.verb_ing()
            )));
        }
        let Some(side) = request.side.narrow(direction, a_side, b_side) else {
            return Ok(match direction {
                MoveDirection::Open => "Dome is already open".to_string(),
                MoveDirection::Close => "Dome is already closed".to_string(),
            });
        };
        let request = MoveRequest { side, ..request };
        mailbox.commands.motion = Some(request);

        let verb = match direction {
            MoveDirection::Open => "Opening",
            MoveDirection::Close => "Closing",
        };
        info!(%side, frac = request.frac, "Starting: {} dome", verb.to_lowercase());
        Ok(format!("{} dome ({} {})", verb, side, request.frac))
    }

    /// Stop all motion. Discards any move requested but not yet started.
    pub fn halt_dome(&self) -> ObsResult<String> {
        let mut mailbox = self.mailbox.lock();
        mailbox.commands.halt = true;
        mailbox.commands.motion = None;
        info!("Starting: Halting dome");
        Ok("Halting dome".to_string())
    }

    /// Enable or disable autoclose. A disable with `timeout_secs` lapses by itself.
    pub async fn set_autoclose(&self, enabled: bool, timeout_secs: Option<f64>) -> ObsResult<String> {
        if let Some(secs) = timeout_secs {
            if !(secs.is_finite() && secs >= 0.0) {
                return Err(ObsError::InvalidArgument(
                    "Timeout must be a positive number (time in seconds)".to_string(),
                ));
            }
        }
        let info = self.fresh_info().await?;
        check_mode(info.mode, enabled, "autoclose", &[Mode::Robotic])?;

        if enabled {
            if info.autoclose_enabled {
                return Ok("Autoclose already enabled".to_string());
            }
            self.mailbox.lock().commands.autoclose = Some(AutocloseSetting {
                enabled: true,
                until: None,
            });
            return Ok("Enabling autoclose".to_string());
        }

        if !info.autoclose_enabled && timeout_secs.is_none() && info.autoclose_timeout.is_none() {
            return Ok("Autoclose already disabled".to_string());
        }
        let until = match timeout_secs {
            Some(secs) => Some(
                chrono::Duration::try_milliseconds((secs * 1000.0) as i64)
                    .and_then(|timeout| Utc::now().checked_add_signed(timeout))
                    .ok_or_else(|| {
                        ObsError::InvalidArgument(format!("Timeout of {}s is too long", secs))
                    })?,
            ),
            None => None,
        };
        self.mailbox.lock().commands.autoclose = Some(AutocloseSetting {
            enabled: false,
            until,
        });
        Ok(match timeout_secs {
            Some(secs) => format!("Disabling autoclose for {:.1} minutes", secs / 60.0),
            None => "Disabling autoclose".to_string(),
        })
    }

    pub async fn set_autodehum(&self, enabled: bool) -> ObsResult<String> {
        let snapshot = self.core.get_info(true).await?;
        self.check_dehumidifier(&snapshot)?;
        check_mode(snapshot.info.mode, enabled, "autodehum", &[Mode::Robotic])?;
        Ok(self.toggle("autodehum", enabled, snapshot.info.autodehum_enabled, |c| {
            c.autodehum = Some(enabled)
        }))
    }

    /// Switch the dehumidifier directly.
    pub async fn override_dehumidifier(&self, on: bool) -> ObsResult<String> {
        let snapshot = self.core.get_info(true).await?;
        self.check_dehumidifier(&snapshot)?;
        let state = if on { "on" } else { "off" };
        if snapshot.info.dehumidifier_on == Some(on) {
            return Ok(format!("Dehumidifier already {}", state));
        }
        self.mailbox.lock().commands.dehumidifier = Some(on);
        info!("Turning {} dehumidifier (manual command)", state);
        Ok(format!("Turning dehumidifier {}", state))
    }

    pub async fn set_alarm(&self, enabled: bool) -> ObsResult<String> {
        let info = self.fresh_info().await?;
        check_mode(info.mode, enabled, "alarm", &[Mode::Robotic])?;
        Ok(self.toggle("alarm", enabled, info.alarm_enabled, |c| c.alarm = Some(enabled)))
    }

    pub async fn sound_alarm(&self) -> ObsResult<String> {
        let snapshot = self.core.get_info(true).await?;
        if snapshot.health.bad_hardware.contains(DOME) {
            return Err(ObsError::HardwareStatus("Cannot connect to dome".to_string()));
        }
        if !snapshot.info.alarm_enabled {
            return Err(ObsError::HardwareStatus("Alarm is disabled".to_string()));
        }
        self.mailbox.lock().commands.sound_alarm = true;
        Ok("Sounding alarm".to_string())
    }

    pub async fn set_heartbeat(&self, enabled: bool) -> ObsResult<String> {
        let snapshot = self.core.get_info(true).await?;
        if snapshot.health.bad_hardware.contains(HEARTBEAT) {
            return Err(ObsError::HardwareStatus("Cannot connect to heartbeat".to_string()));
        }
        check_mode(
            snapshot.info.mode,
            enabled,
            "heartbeat",
            &[Mode::Robotic, Mode::Manual],
        )?;
        Ok(self.toggle("heartbeat", enabled, snapshot.info.heartbeat_enabled, |c| {
            c.heartbeat = Some(enabled)
        }))
    }

    /// Turn windshield mode on or off directly.
    pub async fn override_windshield(&self, enabled: bool) -> ObsResult<String> {
        let info = self.fresh_info().await?;
        check_mode(info.mode, enabled, "windshielding", &[])?;
        if enabled && !self.settings.windshield_permitted {
            return Err(ObsError::HardwareStatus(
                "Windshielding is disabled system-wide".to_string(),
            ));
        }
        Ok(self.toggle("windshield mode", enabled, info.windshield_enabled, |c| {
            c.windshield = Some(enabled)
        }))
    }

    pub async fn set_autoshield(&self, enabled: bool) -> ObsResult<String> {
        let info = self.fresh_info().await?;
        check_mode(info.mode, enabled, "autoshield", &[Mode::Robotic])?;
        if enabled && !self.settings.windshield_permitted {
            return Err(ObsError::HardwareStatus(
                "Windshielding is disabled system-wide".to_string(),
            ));
        }
        Ok(self.toggle("autoshield", enabled, info.autoshield_enabled, |c| {
            c.autoshield = Some(enabled)
        }))
    }

    async fn fresh_info(&self) -> ObsResult<DomeInfo> {
        Ok(self.core.get_info(true).await?.info.clone())
    }

    fn check_dehumidifier(&self, snapshot: &Snapshot<DomeInfo>) -> ObsResult<()> {
        if !self.has_dehumidifier {
            return Err(ObsError::InvalidArgument("Dome has no dehumidifier".to_string()));
        }
        if snapshot.health.bad_hardware.contains(DEHUMIDIFIER) {
            return Err(ObsError::HardwareStatus(
                "Cannot connect to dehumidifier".to_string(),
            ));
        }
        Ok(())
    }

    fn toggle(
        &self,
        what: &str,
        enabled: bool,
        current: bool,
        set: impl FnOnce(&mut DomeCommands),
    ) -> String {
        let state = if enabled { "enabled" } else { "disabled" };
        if current == enabled {
            return format!("{} already {}", capitalise(what), state);
        }
        set(&mut self.mailbox.lock().commands);
        let verb = if enabled { "Enabling" } else { "Disabling" };
        info!("{} {}", verb, what);
        format!("{} {}", verb, what)
    }
}

/// Reject enabling anything in engineering mode and disabling it in the listed modes.
fn check_mode(mode: Mode, enable: bool, what: &str, no_disable_in: &[Mode]) -> ObsResult<()> {
    if enable && mode == Mode::Engineering {
        return Err(ObsError::HardwareStatus(format!(
            "Cannot enable {} in engineering mode",
            what
        )));
    }
    if !enable && no_disable_in.contains(&mode) {
        return Err(ObsError::HardwareStatus(format!(
            "Cannot disable {} in {} mode",
            what, mode
        )));
    }
    Ok(())
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
