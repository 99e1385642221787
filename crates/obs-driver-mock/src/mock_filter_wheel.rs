//! Simulated filter wheel.

use anyhow::{bail, Result};
use async_trait::async_trait;
use obs_core::capabilities::{FilterWheel, FilterWheelState};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::faults::Faults;

#[derive(Debug)]
struct WheelSim {
    homed: bool,
    position: Option<usize>,
    /// Position and homed state to adopt once the current move finishes
    pending: Option<(usize, Instant)>,
}

/// A filter wheel with `slots` positions. Every move or home takes `move_time`.
#[derive(Debug)]
pub struct MockFilterWheel {
    slots: usize,
    move_time: Duration,
    state: Mutex<WheelSim>,
    faults: Faults,
}

impl MockFilterWheel {
    pub fn new(slots: usize) -> Self {
        Self::with_move_time(slots, Duration::from_millis(30))
    }

    pub fn with_move_time(slots: usize, move_time: Duration) -> Self {
        Self {
            slots,
            move_time,
            state: Mutex::new(WheelSim {
                homed: false,
                position: None,
                pending: None,
            }),
            faults: Faults::none(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    fn settle(state: &mut WheelSim) {
        if let Some((position, done)) = state.pending {
            if Instant::now() >= done {
                state.position = Some(position);
                state.homed = true;
                state.pending = None;
            }
        }
    }
}

#[async_trait]
impl FilterWheel for MockFilterWheel {
    async fn state(&self) -> Result<FilterWheelState> {
        self.faults.check("filter_wheel", "state")?;
        let mut state = self.state.lock();
        Self::settle(&mut state);
        Ok(FilterWheelState {
            homed: state.homed,
            position: state.position,
            moving: state.pending.is_some(),
        })
    }

    async fn home(&self) -> Result<()> {
        self.faults.check("filter_wheel", "home")?;
        let mut state = self.state.lock();
        Self::settle(&mut state);
        if state.pending.is_some() {
            bail!("filter wheel is moving");
        }
        debug!("Filter wheel homing");
        state.homed = false;
        state.position = None;
        state.pending = Some((0, Instant::now() + self.move_time));
        Ok(())
    }

    async fn move_to(&self, position: usize) -> Result<()> {
        self.faults.check("filter_wheel", "move_to")?;
        if position >= self.slots {
            bail!("invalid filter position {} (wheel has {} slots)", position, self.slots);
        }
        let mut state = self.state.lock();
        Self::settle(&mut state);
        if !state.homed {
            bail!("filter wheel not homed");
        }
        if state.pending.is_some() {
            bail!("filter wheel is moving");
        }
        debug!(position, "Filter wheel moving");
        state.pending = Some((position, Instant::now() + self.move_time));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_home_then_move() {
        let wheel = MockFilterWheel::with_move_time(5, Duration::from_millis(10));
        assert!(!wheel.state().await.unwrap().homed);
        assert!(wheel.move_to(2).await.is_err());

        wheel.home().await.unwrap();
        assert!(wheel.state().await.unwrap().moving);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let state = wheel.state().await.unwrap();
        assert!(state.homed);
        assert_eq!(state.position, Some(0));

        wheel.move_to(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(wheel.state().await.unwrap().position, Some(3));
        assert!(wheel.move_to(7).await.is_err());
    }
}
