//! Dome control loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use obs_core::capabilities::{DomeStatus, HeartbeatStatus, MoveDirection};
use obs_core::site::{ConditionsReport, Emergency, Mode};
use obs_core::{TickContext, Worker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::info::{DomeInfo, DomeState};
use super::lockdown::{LockdownTracker, LockdownTriggers};
use super::motion::{ActiveMove, MoveAction, MoveRequest, MoveSide};
use super::{DomeCommands, DomeHardware, DomeMailbox, DomeSettings};

const CONDITIONS: &str = "conditions";
const SITE_MODE: &str = "site_mode";
const EMERGENCY: &str = "emergency";

pub(super) struct DomeWorker {
    hw: DomeHardware,
    settings: Arc<DomeSettings>,
    mailbox: Arc<Mutex<DomeMailbox>>,

    // Readings from the last re-sync
    status: Option<DomeStatus>,
    heartbeat_status: Option<HeartbeatStatus>,
    dehumidifier_on: Option<bool>,
    button_pressed: Option<bool>,
    conditions: ConditionsReport,
    emergency: Emergency,
    mode: Mode,
    old_mode: Option<Mode>,
    hatch_open_since: Option<Instant>,

    lockdown: LockdownTracker,
    active: Option<ActiveMove>,
    autoclosing: bool,
    shielding: bool,
    last_move_time: Option<DateTime<Utc>>,

    alarm_enabled: bool,
    heartbeat_enabled: bool,
    autodehum_enabled: bool,
    autoclose_enabled: bool,
    autoclose_timeout: Option<DateTime<Utc>>,
    autoshield_enabled: bool,
    windshield_enabled: bool,

    /// The heartbeat unit needs `heartbeat_enabled` pushed to it.
    heartbeat_pending: bool,
    dehumidifier_pending: Option<bool>,
}

impl DomeWorker {
    pub(super) fn new(
        hw: DomeHardware,
        settings: Arc<DomeSettings>,
        mailbox: Arc<Mutex<DomeMailbox>>,
    ) -> Self {
        Self {
            hw,
            settings,
            mailbox,
            status: None,
            heartbeat_status: None,
            dehumidifier_on: None,
            button_pressed: None,
            conditions: ConditionsReport::default(),
            emergency: Emergency::default(),
            mode: Mode::default(),
            old_mode: None,
            hatch_open_since: None,
            lockdown: LockdownTracker::default(),
            active: None,
            autoclosing: false,
            shielding: false,
            last_move_time: None,
            alarm_enabled: true,
            heartbeat_enabled: true,
            autodehum_enabled: true,
            autoclose_enabled: true,
            autoclose_timeout: None,
            autoshield_enabled: true,
            windshield_enabled: false,
            heartbeat_pending: true,
            dehumidifier_pending: None,
        }
    }

    fn dome_state(&self) -> Option<DomeState> {
        self.status.map(|s| DomeState::from_sides(s.a_side, s.b_side))
    }

    async fn read_hardware(&mut self, ctx: &mut TickContext) {
        self.status = self
            .hw
            .dome
            .call(ctx, |d| async move { d.status().await }.boxed())
            .await;

        if self.heartbeat_enabled {
            self.hw
                .heartbeat
                .call(ctx, |h| async move { h.beat().await }.boxed())
                .await;
        }
        let heartbeat = self
            .hw
            .heartbeat
            .call(ctx, |h| async move { h.status().await }.boxed())
            .await;
        if heartbeat == Some(HeartbeatStatus::Closing)
            && self.heartbeat_status != Some(HeartbeatStatus::Closing)
        {
            warn!("Heartbeat unit is closing the dome");
        }
        self.heartbeat_status = heartbeat;

        if let Some(slot) = self.hw.dehumidifier.as_mut() {
            self.dehumidifier_on = slot
                .call(ctx, |r| async move { r.is_on().await }.boxed())
                .await;
        }
        if let Some(slot) = self.hw.button.as_mut() {
            self.button_pressed = slot
                .call(ctx, |b| async move { b.pressed().await }.boxed())
                .await;
        }

        self.conditions = match self.hw.conditions.report().await {
            Ok(report) => {
                ctx.clear_failure(CONDITIONS);
                report
            }
            Err(err) => {
                ctx.log_failure(CONDITIONS, &err);
                ConditionsReport {
                    bad: true,
                    bad_reasons: vec!["conditions unavailable".to_string()],
                    ..Default::default()
                }
            }
        };
    }

    fn read_site(&mut self, ctx: &mut TickContext) {
        match self.hw.site.mode() {
            Ok(mode) => {
                ctx.clear_failure(SITE_MODE);
                self.mode = mode;
            }
            Err(err) => ctx.log_failure(SITE_MODE, &err),
        }
        self.emergency = match self.hw.site.emergency() {
            Ok(emergency) => {
                ctx.clear_failure(EMERGENCY);
                emergency
            }
            // The marker exists but could not be read
            Err(err) => {
                ctx.log_failure(EMERGENCY, &err);
                Emergency {
                    active: true,
                    reasons: vec!["unknown".to_string()],
                }
            }
        };
        match self.status.map(|s| s.hatch_open) {
            Some(true) => {
                self.hatch_open_since.get_or_insert_with(Instant::now);
            }
            Some(false) => self.hatch_open_since = None,
            None => {}
        }
    }

    /// Force the automatic behaviours the current mode requires.
    fn mode_check(&mut self, previous: Option<Mode>) {
        let mode = self.mode;
        match mode {
            Mode::Robotic => {
                force(&mut self.alarm_enabled, true, mode, "alarm");
                if force(&mut self.heartbeat_enabled, true, mode, "heartbeat") {
                    self.heartbeat_pending = true;
                }
                force(&mut self.autodehum_enabled, true, mode, "autodehum");
                if force(&mut self.autoclose_enabled, true, mode, "autoclose") {
                    self.autoclose_timeout = None;
                }
                if self.settings.windshield_permitted {
                    force(&mut self.autoshield_enabled, true, mode, "autoshield");
                }
            }
            Mode::Manual => {
                if force(&mut self.heartbeat_enabled, true, mode, "heartbeat") {
                    self.heartbeat_pending = true;
                }
                // Only on entering manual mode, so the operator can change them afterwards
                if previous != Some(Mode::Manual) {
                    force(&mut self.alarm_enabled, true, mode, "alarm");
                    force(&mut self.autodehum_enabled, true, mode, "autodehum");
                    if force(&mut self.autoclose_enabled, true, mode, "autoclose") {
                        self.autoclose_timeout = None;
                    }
                    if self.settings.windshield_permitted {
                        force(&mut self.autoshield_enabled, true, mode, "autoshield");
                    }
                }
            }
            Mode::Engineering => {
                force(&mut self.alarm_enabled, false, mode, "alarm");
                if force(&mut self.heartbeat_enabled, false, mode, "heartbeat") {
                    self.heartbeat_pending = true;
                }
                force(&mut self.autodehum_enabled, false, mode, "autodehum");
                force(&mut self.autoclose_enabled, false, mode, "autoclose");
                self.autoclose_timeout = None;
                force(&mut self.autoshield_enabled, false, mode, "autoshield");
                force(&mut self.windshield_enabled, false, mode, "windshield mode");
                self.shielding = false;
                self.autoclosing = false;
            }
        }
    }

    fn lockdown_check(&mut self) {
        if self.mode == Mode::Engineering {
            self.lockdown.reset();
            return;
        }
        let hatch_open_robotic = self.mode == Mode::Robotic
            && self
                .hatch_open_since
                .is_some_and(|since| since.elapsed() > self.settings.hatch_open_delay);
        let triggers = LockdownTriggers {
            button_pressed: self.button_pressed.unwrap_or(false),
            hatch_open_robotic,
            emergency: self
                .emergency
                .active
                .then(|| self.emergency.reasons.clone()),
            conditions_bad: self
                .conditions
                .bad
                .then(|| self.conditions.bad_reasons.clone()),
        };
        self.lockdown.update(&triggers, self.autoclose_enabled);
    }

    async fn autoclose_check(&mut self, ctx: &mut TickContext) {
        let Some(state) = self.dome_state() else {
            return;
        };
        if !self.autoclose_enabled {
            match self.autoclose_timeout {
                Some(until) if ctx.now() >= until => {
                    warn!("Autoclose timeout exceeded, turning autoclose on");
                    self.autoclose_enabled = true;
                    self.autoclose_timeout = None;
                }
                _ => return,
            }
        }

        let closing_fully = self
            .active
            .as_ref()
            .is_some_and(|m| m.direction() == MoveDirection::Close && m.request().frac >= 1.0);
        if self.lockdown.state().is_active() && state != DomeState::Closed && !closing_fully {
            warn!(reasons = %self.lockdown.reasons().join(", "), "Autoclosing dome due to lockdown");
            if let Some(active) = self.active.take() {
                warn!("Stopping {} to close", active.direction().verb_ing());
                self.halt_hardware(ctx).await;
            }
            self.alarm_enabled = true;
            self.begin_move(MoveRequest::full(MoveDirection::Close));
            self.autoclosing = true;
            ctx.request_check();
        }

        if self.autoclosing && state == DomeState::Closed {
            warn!("Autoclose complete");
            self.autoclosing = false;
        }
    }

    fn autodehum_check(&mut self) {
        if !self.autodehum_enabled || self.hw.dehumidifier.is_none() {
            return;
        }
        let (Some(state), Some(on)) = (self.dome_state(), self.dehumidifier_on) else {
            return;
        };
        let (Some(humidity), Some(temperature)) =
            (self.conditions.humidity, self.conditions.temperature)
        else {
            debug!("No internal conditions, skipping autodehum");
            return;
        };
        let s = &self.settings;
        if state != DomeState::Closed {
            if on {
                info!("Dome is open, turning off dehumidifier");
                self.dehumidifier_pending = Some(false);
            }
        } else if !on {
            if humidity > s.humidity_upper {
                info!(humidity, limit = s.humidity_upper, "Internal humidity above limit, turning on dehumidifier");
                self.dehumidifier_pending = Some(true);
            } else if temperature < s.temperature_lower {
                info!(temperature, limit = s.temperature_lower, "Internal temperature below limit, turning on dehumidifier");
                self.dehumidifier_pending = Some(true);
            }
        } else if humidity < s.humidity_lower && temperature > s.temperature_upper {
            info!(humidity, temperature, "Internal conditions back within limits, turning off dehumidifier");
            self.dehumidifier_pending = Some(false);
        }
    }

    fn autoshield_check(&mut self) {
        if !self.autoshield_enabled {
            return;
        }
        let Some(windspeed) = self.conditions.windspeed else {
            return;
        };
        if !self.windshield_enabled && windspeed > self.settings.windspeed_upper {
            info!(windspeed, limit = self.settings.windspeed_upper, "Windspeed above limit, enabling windshield mode");
            self.windshield_enabled = true;
        } else if self.windshield_enabled && windspeed < self.settings.windspeed_lower {
            info!(windspeed, limit = self.settings.windspeed_lower, "Windspeed below limit, disabling windshield mode");
            self.windshield_enabled = false;
        }
    }

    fn windshield_check(&mut self, ctx: &mut TickContext) {
        let Some(state) = self.dome_state() else {
            return;
        };
        if self.active.is_some() || self.lockdown.state().is_active() {
            return;
        }
        if self.windshield_enabled && !self.shielding && state == DomeState::Open {
            info!(position = self.settings.windshield_position, "Moving dome to windshield position");
            self.alarm_enabled = true;
            let request = MoveRequest {
                direction: MoveDirection::Close,
                side: MoveSide::Both,
                frac: self.settings.windshield_position,
            };
            self.begin_move(request);
            self.shielding = true;
            ctx.request_check();
        } else if !self.windshield_enabled && self.shielding {
            if state == DomeState::Open {
                info!("Windshield mode off, reopening dome");
                self.alarm_enabled = true;
                self.begin_move(MoveRequest::full(MoveDirection::Open));
                ctx.request_check();
            }
            self.shielding = false;
        }
    }

    fn begin_move(&mut self, request: MoveRequest) {
        self.mailbox.lock().in_flight = Some(request.direction);
        self.active = Some(ActiveMove::new(request));
    }

    fn finish_move(&mut self, ctx: &mut TickContext) {
        self.active = None;
        self.mailbox.lock().in_flight = None;
        self.last_move_time = Some(ctx.now());
        ctx.request_check();
    }

    async fn halt_hardware(&mut self, ctx: &mut TickContext) {
        let halted = self
            .hw
            .dome
            .call(ctx, |d| async move { d.halt().await }.boxed())
            .await;
        if halted.is_none() {
            error!("Failed to halt dome");
        }
    }

    async fn apply_move_request(&mut self, request: MoveRequest, ctx: &mut TickContext) {
        if request.direction == MoveDirection::Open && self.lockdown.state().is_active() {
            warn!("Ignoring open request, dome is in lockdown");
            return;
        }
        if let Some(active) = &self.active {
            if active.direction() == request.direction {
                warn!("Dome is already {}, ignoring request", request.direction.verb_ing());
                return;
            }
            info!("Stopping {} before {}", active.direction().verb_ing(), request.direction.verb_ing());
            self.halt_hardware(ctx).await;
            self.active = None;
        }
        self.shielding = false;
        self.begin_move(request);
        ctx.request_check();
    }

    fn apply_settings(&mut self, commands: &DomeCommands, ctx: &mut TickContext) {
        let mut changed = false;
        if let Some(setting) = commands.autoclose {
            if setting.enabled {
                info!("Enabling autoclose");
                self.autoclose_timeout = None;
            } else {
                match setting.until {
                    Some(until) => info!(%until, "Disabling autoclose until timeout"),
                    None => info!("Disabling autoclose"),
                }
                self.autoclose_timeout = setting.until;
            }
            self.autoclose_enabled = setting.enabled;
            changed = true;
        }
        for (value, flag, what) in [
            (commands.alarm, &mut self.alarm_enabled, "alarm"),
            (commands.autodehum, &mut self.autodehum_enabled, "autodehum"),
            (commands.autoshield, &mut self.autoshield_enabled, "autoshield"),
            (commands.windshield, &mut self.windshield_enabled, "windshield mode"),
        ] {
            if let Some(value) = value {
                info!("{} {}", if value { "Enabling" } else { "Disabling" }, what);
                *flag = value;
                changed = true;
            }
        }
        if let Some(enabled) = commands.heartbeat {
            if enabled != self.heartbeat_enabled {
                self.heartbeat_enabled = enabled;
                self.heartbeat_pending = true;
            }
            changed = true;
        }
        if let Some(on) = commands.dehumidifier {
            self.dehumidifier_pending = Some(on);
        }
        if changed {
            ctx.request_check();
        }
    }

    async fn push_outputs(&mut self, ctx: &mut TickContext) {
        if std::mem::take(&mut self.heartbeat_pending) {
            let enabled = self.heartbeat_enabled;
            info!("{} heartbeat", if enabled { "Enabling" } else { "Disabling" });
            self.hw
                .heartbeat
                .call(ctx, move |h| async move { h.set_enabled(enabled).await }.boxed())
                .await;
            ctx.request_check();
        }
        if let Some(on) = self.dehumidifier_pending.take() {
            if let Some(slot) = self.hw.dehumidifier.as_mut() {
                info!("Turning {} dehumidifier", if on { "on" } else { "off" });
                slot.call(ctx, move |r| async move { r.set(on).await }.boxed())
                    .await;
                ctx.request_check();
            }
        }
    }

    async fn sound_alarm(&mut self, ctx: &mut TickContext) {
        let duration = self.settings.alarm_duration;
        let sounded = self
            .hw
            .dome
            .call(ctx, move |d| async move { d.sound_alarm(duration).await }.boxed())
            .await;
        if sounded.is_none() {
            error!("Failed to sound alarm");
        }
    }

    async fn advance_move(&mut self, ctx: &mut TickContext) {
        if self.active.is_none() {
            return;
        }
        let Some(status) = self
            .hw
            .dome
            .call(ctx, |d| async move { d.status().await }.boxed())
            .await
        else {
            return;
        };
        let (settle, timeout) = (self.settings.alarm_settle, self.settings.move_timeout);
        let alarm = self.alarm_enabled;
        let action = match self.active.as_mut() {
            Some(active) => active.poll(&status, alarm, settle, timeout, Instant::now()),
            None => return,
        };
        match action {
            MoveAction::Wait => {}
            MoveAction::SoundAlarm(side) => {
                debug!(%side, "Sounding alarm before moving");
                self.sound_alarm(ctx).await;
            }
            MoveAction::Start {
                side,
                direction,
                frac,
            } => {
                let started = self
                    .hw
                    .dome
                    .call(ctx, move |d| async move { d.start_move(side, direction, frac).await }.boxed())
                    .await;
                if started.is_none() {
                    error!(%side, "Failed to start {} dome", direction.verb_ing());
                    self.finish_move(ctx);
                } else {
                    ctx.request_check();
                }
            }
            MoveAction::Finished => {
                info!("Finished moving");
                self.finish_move(ctx);
            }
            MoveAction::TimedOut(side) => {
                error!(%side, "Moving timed out");
                self.halt_hardware(ctx).await;
                self.finish_move(ctx);
            }
            MoveAction::Failed(side) => {
                error!(%side, "Dome side reported an error, stopping");
                self.halt_hardware(ctx).await;
                self.finish_move(ctx);
            }
        }
    }

    fn info(&self, old_mode: Option<Mode>) -> DomeInfo {
        let s = &self.settings;
        DomeInfo {
            a_side: self.status.map(|st| st.a_side),
            b_side: self.status.map(|st| st.b_side),
            dome: self.dome_state(),
            hatch_closed: self.status.map(|st| !st.hatch_open),
            heartbeat_status: self.heartbeat_status,
            dehumidifier_on: self.dehumidifier_on,
            button_pressed: self.button_pressed,
            windspeed: self.conditions.windspeed,
            temperature: self.conditions.temperature,
            humidity: self.conditions.humidity,
            windspeed_upper: s.windspeed_upper,
            windspeed_lower: s.windspeed_lower,
            humidity_upper: s.humidity_upper,
            humidity_lower: s.humidity_lower,
            temperature_lower: s.temperature_lower,
            temperature_upper: s.temperature_upper,
            conditions_bad: self.conditions.bad,
            conditions_bad_reasons: self.conditions.bad_reasons.clone(),
            emergency: self.emergency.active,
            emergency_reasons: self.emergency.reasons.clone(),
            mode: self.mode,
            old_mode,
            lockdown: self.lockdown.state(),
            lockdown_reasons: self.lockdown.reasons().to_vec(),
            autoclosing: self.autoclosing,
            shielding: self.shielding,
            motion: self.active.as_ref().map(ActiveMove::info),
            last_move_time: self.last_move_time,
            alarm_enabled: self.alarm_enabled,
            heartbeat_enabled: self.heartbeat_enabled,
            autodehum_enabled: self.autodehum_enabled,
            autoclose_enabled: self.autoclose_enabled,
            autoclose_timeout: self.autoclose_timeout,
            autoshield_enabled: self.autoshield_enabled,
            windshield_enabled: self.windshield_enabled,
        }
    }
}

/// Set `flag` to `value`, logging the change. Returns whether it changed.
fn force(flag: &mut bool, value: bool, mode: Mode, what: &str) -> bool {
    if *flag == value {
        return false;
    }
    info!(
        "System is in {} mode, {} {}",
        mode,
        if value { "enabling" } else { "disabling" },
        what
    );
    *flag = value;
    true
}

#[async_trait]
impl Worker for DomeWorker {
    type Info = DomeInfo;

    async fn sync(&mut self, ctx: &mut TickContext) -> DomeInfo {
        self.read_hardware(ctx).await;
        self.read_site(ctx);

        let previous = self.old_mode;
        self.mode_check(previous);
        self.lockdown_check();
        if self.mode != Mode::Engineering {
            self.autoclose_check(ctx).await;
            self.autodehum_check();
            if self.settings.windshield_permitted {
                self.autoshield_check();
                self.windshield_check(ctx);
            }
        }
        self.old_mode = Some(self.mode);
        self.info(previous)
    }

    async fn execute(&mut self, ctx: &mut TickContext) {
        let commands = self.mailbox.lock().take();

        if commands.halt {
            if let Some(request) = commands.motion {
                warn!("Dropping {} request, halt takes priority", request.direction.verb_ing());
            }
            info!("Halting dome");
            self.halt_hardware(ctx).await;
            self.shielding = false;
            self.finish_move(ctx);
        } else if let Some(request) = commands.motion {
            self.apply_move_request(request, ctx).await;
        }

        self.apply_settings(&commands, ctx);
        if commands.sound_alarm {
            info!("Sounding alarm");
            self.sound_alarm(ctx).await;
        }
        self.push_outputs(ctx).await;
        self.advance_move(ctx).await;
    }
}
