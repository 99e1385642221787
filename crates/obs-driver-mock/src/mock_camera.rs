//! Simulated camera.

use anyhow::{bail, Result};
use async_trait::async_trait;
use obs_core::capabilities::{CameraState, CameraUnit};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::faults::Faults;

#[derive(Debug, Default)]
struct CameraSim {
    /// End of exposure and end of readout
    busy_until: Option<(Instant, Instant)>,
    frames: u64,
    darks: u64,
}

/// A camera whose exposures take `exptime * time_scale` plus a fixed readout.
///
/// `time_scale` lets tests ask for a "30 s" exposure that completes in milliseconds.
#[derive(Debug)]
pub struct MockCamera {
    readout: Duration,
    time_scale: f64,
    state: Mutex<CameraSim>,
    faults: Faults,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::with_timing(Duration::from_millis(100), 1.0)
    }

    pub fn with_timing(readout: Duration, time_scale: f64) -> Self {
        Self {
            readout,
            time_scale,
            state: Mutex::new(CameraSim::default()),
            faults: Faults::none(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Completed frames, including darks.
    pub fn frames(&self) -> u64 {
        let mut state = self.state.lock();
        Self::settle(&mut state);
        state.frames
    }

    pub fn darks(&self) -> u64 {
        self.state.lock().darks
    }

    fn settle(state: &mut CameraSim) {
        if let Some((_, done)) = state.busy_until {
            if Instant::now() >= done {
                state.busy_until = None;
                state.frames += 1;
            }
        }
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraUnit for MockCamera {
    async fn state(&self) -> Result<CameraState> {
        self.faults.check("camera", "state")?;
        let mut state = self.state.lock();
        Self::settle(&mut state);
        Ok(match state.busy_until {
            None => CameraState::Ready,
            Some((exposed, _)) if Instant::now() < exposed => CameraState::Exposing,
            Some(_) => CameraState::Reading,
        })
    }

    async fn start_exposure(&self, exptime: Duration, binning: u32, dark: bool) -> Result<()> {
        self.faults.check("camera", "start_exposure")?;
        if binning == 0 {
            bail!("binning must be at least 1");
        }
        let mut state = self.state.lock();
        Self::settle(&mut state);
        if state.busy_until.is_some() {
            bail!("camera is busy");
        }
        let exposed = Instant::now() + exptime.mul_f64(self.time_scale);
        debug!(exptime = exptime.as_secs_f64(), binning, dark, "Camera exposing");
        state.busy_until = Some((exposed, exposed + self.readout));
        if dark {
            state.darks += 1;
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.faults.check("camera", "abort")?;
        self.state.lock().busy_until = None;
        Ok(())
    }
}
