//! Simulated mount.

use anyhow::{bail, Result};
use async_trait::async_trait;
use obs_core::capabilities::{Compass, MountStatus, MountUnit};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::faults::Faults;

#[derive(Debug)]
struct MountSim {
    status: MountStatus,
    /// Status to adopt once the current slew finishes
    slewing: Option<(MountStatus, Instant)>,
    offsets: Vec<(Compass, f64)>,
}

/// A mount whose offsets and parks take `slew_time`.
#[derive(Debug)]
pub struct MockMount {
    slew_time: Duration,
    state: Mutex<MountSim>,
    faults: Faults,
}

impl MockMount {
    /// A tracking mount with 20ms slews.
    pub fn new() -> Self {
        Self::with_slew_time(MountStatus::Tracking, Duration::from_millis(20))
    }

    pub fn with_slew_time(status: MountStatus, slew_time: Duration) -> Self {
        Self {
            slew_time,
            state: Mutex::new(MountSim {
                status,
                slewing: None,
                offsets: Vec::new(),
            }),
            faults: Faults::none(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub fn set_status(&self, status: MountStatus) {
        let mut state = self.state.lock();
        state.status = status;
        state.slewing = None;
    }

    /// Every offset received, in order.
    pub fn offsets(&self) -> Vec<(Compass, f64)> {
        self.state.lock().offsets.clone()
    }

    fn settle(state: &mut MountSim) {
        if let Some((status, done)) = state.slewing {
            if Instant::now() >= done {
                state.status = status;
                state.slewing = None;
            }
        }
    }

    fn slew_to(&self, state: &mut MountSim, then: MountStatus) {
        state.status = MountStatus::Slewing;
        state.slewing = Some((then, Instant::now() + self.slew_time));
    }
}

impl Default for MockMount {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MountUnit for MockMount {
    async fn status(&self) -> Result<MountStatus> {
        self.faults.check("mount", "status")?;
        let mut state = self.state.lock();
        Self::settle(&mut state);
        Ok(state.status)
    }

    async fn offset(&self, direction: Compass, distance: f64) -> Result<()> {
        self.faults.check("mount", "offset")?;
        let mut state = self.state.lock();
        Self::settle(&mut state);
        if !state.status.can_offset() {
            bail!("mount cannot offset while {:?}", state.status);
        }
        debug!(%direction, distance, "Mount offsetting");
        state.offsets.push((direction, distance));
        self.slew_to(&mut state, MountStatus::Tracking);
        Ok(())
    }

    async fn track(&self) -> Result<()> {
        self.faults.check("mount", "track")?;
        let mut state = self.state.lock();
        Self::settle(&mut state);
        if state.status == MountStatus::MotorsOff {
            bail!("mount motors are off");
        }
        state.status = MountStatus::Tracking;
        state.slewing = None;
        Ok(())
    }

    async fn park(&self) -> Result<()> {
        self.faults.check("mount", "park")?;
        let mut state = self.state.lock();
        Self::settle(&mut state);
        self.slew_to(&mut state, MountStatus::Parked);
        Ok(())
    }

    async fn halt(&self) -> Result<()> {
        self.faults.check("mount", "halt")?;
        let mut state = self.state.lock();
        state.status = MountStatus::Stopped;
        state.slewing = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offset_slews_then_tracks() {
        let mount = MockMount::with_slew_time(MountStatus::Tracking, Duration::from_millis(10));
        mount.offset(Compass::E, 1.32).await.unwrap();
        assert_eq!(mount.status().await.unwrap(), MountStatus::Slewing);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mount.status().await.unwrap(), MountStatus::Tracking);
        assert_eq!(mount.offsets(), vec![(Compass::E, 1.32)]);
    }

    #[tokio::test]
    async fn test_parked_mount_refuses_offset() {
        let mount = MockMount::with_slew_time(MountStatus::Parked, Duration::from_millis(10));
        assert!(mount.offset(Compass::N, 1.0).await.is_err());
        mount.track().await.unwrap();
        mount.halt().await.unwrap();
        assert_eq!(mount.status().await.unwrap(), MountStatus::Stopped);
    }
}
