//! Simulated dome: two shutter sides, a hatch, a siren, plus the heartbeat unit,
//! dehumidifier relay and quick-close button that live alongside it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use obs_core::capabilities::{
    DomeSide, DomeStatus, DomeUnit, Heartbeat, HeartbeatStatus, MoveDirection, QuickCloseButton,
    Relay, SideState,
};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::faults::Faults;

const EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
struct SideMotion {
    from: f64,
    target: f64,
    started: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct SideSim {
    /// 0 closed, 1 fully open
    position: f64,
    motion: Option<SideMotion>,
}

impl SideSim {
    /// Advance the simulation to `now`.
    fn update(&mut self, now: Instant, travel_time: Duration) {
        if let Some(m) = self.motion {
            let covered = now.duration_since(m.started).as_secs_f64() / travel_time.as_secs_f64();
            let distance = (m.target - m.from).abs();
            if covered >= distance {
                self.position = m.target;
                self.motion = None;
            } else if m.target > m.from {
                self.position = m.from + covered;
            } else {
                self.position = m.from - covered;
            }
        }
    }

    fn state(&self) -> SideState {
        match self.motion {
            Some(m) if m.target > m.from => SideState::Opening,
            Some(_) => SideState::Closing,
            None if self.position <= EPS => SideState::Closed,
            None if self.position >= 1.0 - EPS => SideState::FullOpen,
            None => SideState::PartOpen,
        }
    }
}

#[derive(Debug, Default)]
struct DomeSim {
    a_side: SideSim,
    b_side: SideSim,
    hatch_open: bool,
    alarms: u32,
    stuck: bool,
}

impl DomeSim {
    fn side_mut(&mut self, side: DomeSide) -> &mut SideSim {
        match side {
            DomeSide::ASide => &mut self.a_side,
            DomeSide::BSide => &mut self.b_side,
        }
    }
}

/// Simulated dome motion unit.
///
/// Each side covers its full travel in `travel_time`; positions are computed from the
/// clock on every read, so a motion progresses without any background task.
#[derive(Debug)]
pub struct MockDome {
    state: Mutex<DomeSim>,
    travel_time: Duration,
    faults: Faults,
}

impl MockDome {
    /// A closed dome with a 200ms full travel time.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockDomeBuilder {
        MockDomeBuilder::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub fn set_hatch_open(&self, open: bool) {
        self.state.lock().hatch_open = open;
    }

    /// Make motion commands accepted but without effect, so motions time out.
    pub fn set_stuck(&self, stuck: bool) {
        self.state.lock().stuck = stuck;
    }

    /// Number of times the siren was sounded.
    pub fn alarm_count(&self) -> u32 {
        self.state.lock().alarms
    }

    /// Current side positions (0 closed, 1 open).
    pub fn positions(&self) -> (f64, f64) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.a_side.update(now, self.travel_time);
        state.b_side.update(now, self.travel_time);
        (state.a_side.position, state.b_side.position)
    }
}

impl Default for MockDome {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`MockDome`].
#[derive(Debug)]
pub struct MockDomeBuilder {
    travel_time: Duration,
    open: bool,
    faults: Faults,
}

impl Default for MockDomeBuilder {
    fn default() -> Self {
        Self {
            travel_time: Duration::from_millis(200),
            open: false,
            faults: Faults::none(),
        }
    }
}

impl MockDomeBuilder {
    pub fn travel_time(mut self, travel_time: Duration) -> Self {
        self.travel_time = travel_time;
        self
    }

    /// Start with both sides fully open.
    pub fn open(mut self) -> Self {
        self.open = true;
        self
    }

    pub fn faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn build(self) -> MockDome {
        let position = if self.open { 1.0 } else { 0.0 };
        let state = DomeSim {
            a_side: SideSim {
                position,
                motion: None,
            },
            b_side: SideSim {
                position,
                motion: None,
            },
            ..Default::default()
        };
        MockDome {
            state: Mutex::new(state),
            travel_time: self.travel_time,
            faults: self.faults,
        }
    }
}

#[async_trait]
impl DomeUnit for MockDome {
    async fn status(&self) -> Result<DomeStatus> {
        self.faults.check("dome", "status")?;
        let mut state = self.state.lock();
        let now = Instant::now();
        state.a_side.update(now, self.travel_time);
        state.b_side.update(now, self.travel_time);
        Ok(DomeStatus {
            a_side: state.a_side.state(),
            b_side: state.b_side.state(),
            hatch_open: state.hatch_open,
        })
    }

    async fn start_move(&self, side: DomeSide, direction: MoveDirection, frac: f64) -> Result<()> {
        self.faults.check("dome", "start_move")?;
        if !(frac > 0.0 && frac <= 1.0) {
            bail!("invalid move fraction {}", frac);
        }
        let mut state = self.state.lock();
        if state.stuck {
            debug!(%side, "Dome stuck, ignoring move");
            return Ok(());
        }
        let now = Instant::now();
        let travel_time = self.travel_time;
        let sim = state.side_mut(side);
        sim.update(now, travel_time);
        let target = match direction {
            MoveDirection::Open => (sim.position + frac).min(1.0),
            MoveDirection::Close => (sim.position - frac).max(0.0),
        };
        debug!(%side, ?direction, from = sim.position, target, "Dome side moving");
        sim.motion = ((target - sim.position).abs() > EPS).then_some(SideMotion {
            from: sim.position,
            target,
            started: now,
        });
        Ok(())
    }

    async fn halt(&self) -> Result<()> {
        self.faults.check("dome", "halt")?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Instant::now();
        for sim in [&mut state.a_side, &mut state.b_side] {
            sim.update(now, self.travel_time);
            sim.motion = None;
        }
        Ok(())
    }

    async fn sound_alarm(&self, duration: Duration) -> Result<()> {
        self.faults.check("dome", "sound_alarm")?;
        debug!(secs = duration.as_secs_f64(), "Dome siren sounding");
        self.state.lock().alarms += 1;
        Ok(())
    }
}

/// Simulated heartbeat (deadman) unit.
#[derive(Debug)]
pub struct MockHeartbeat {
    state: Mutex<(HeartbeatStatus, u64)>,
    faults: Faults,
}

impl MockHeartbeat {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((HeartbeatStatus::Disabled, 0)),
            faults: Faults::none(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Number of beats received.
    pub fn beats(&self) -> u64 {
        self.state.lock().1
    }

    /// Simulate the unit timing out and closing the dome by itself.
    pub fn trip(&self) {
        self.state.lock().0 = HeartbeatStatus::Closing;
    }
}

impl Default for MockHeartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Heartbeat for MockHeartbeat {
    async fn status(&self) -> Result<HeartbeatStatus> {
        self.faults.check("heartbeat", "status")?;
        Ok(self.state.lock().0)
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.faults.check("heartbeat", "set_enabled")?;
        self.state.lock().0 = if enabled {
            HeartbeatStatus::Enabled
        } else {
            HeartbeatStatus::Disabled
        };
        Ok(())
    }

    async fn beat(&self) -> Result<()> {
        self.faults.check("heartbeat", "beat")?;
        self.state.lock().1 += 1;
        Ok(())
    }
}

/// Simulated switched outlet.
#[derive(Debug, Default)]
pub struct MockRelay {
    on: Mutex<bool>,
    faults: Faults,
}

impl MockRelay {
    pub fn new(on: bool) -> Self {
        Self {
            on: Mutex::new(on),
            faults: Faults::none(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub fn get(&self) -> bool {
        *self.on.lock()
    }
}

#[async_trait]
impl Relay for MockRelay {
    async fn is_on(&self) -> Result<bool> {
        self.faults.check("relay", "is_on")?;
        Ok(*self.on.lock())
    }

    async fn set(&self, on: bool) -> Result<()> {
        self.faults.check("relay", "set")?;
        *self.on.lock() = on;
        Ok(())
    }
}

/// Simulated quick-close button.
#[derive(Debug, Default)]
pub struct MockButton {
    pressed: Mutex<bool>,
    faults: Faults,
}

impl MockButton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub fn set_pressed(&self, pressed: bool) {
        *self.pressed.lock() = pressed;
    }
}

#[async_trait]
impl QuickCloseButton for MockButton {
    async fn pressed(&self) -> Result<bool> {
        self.faults.check("button", "pressed")?;
        Ok(*self.pressed.lock())
    }
}
