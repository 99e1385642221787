//! Simulated focuser.

use anyhow::{bail, Result};
use async_trait::async_trait;
use obs_core::capabilities::{FocuserState, FocuserUnit};
use parking_lot::Mutex;
use std::time::Instant;

use crate::faults::Faults;

#[derive(Debug)]
struct FocuserSim {
    position: i64,
    motion: Option<(i64, i64, Instant)>,
}

/// A focuser moving at `steps_per_sec` within `0..=limit`.
#[derive(Debug)]
pub struct MockFocuser {
    limit: i64,
    steps_per_sec: f64,
    state: Mutex<FocuserSim>,
    faults: Faults,
}

impl MockFocuser {
    pub fn new(limit: i64, steps_per_sec: f64) -> Self {
        Self {
            limit,
            steps_per_sec,
            state: Mutex::new(FocuserSim {
                position: 0,
                motion: None,
            }),
            faults: Faults::none(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    fn settle(&self, state: &mut FocuserSim) {
        if let Some((from, target, started)) = state.motion {
            let moved = (started.elapsed().as_secs_f64() * self.steps_per_sec) as i64;
            let distance = (target - from).abs();
            if moved >= distance {
                state.position = target;
                state.motion = None;
            } else {
                state.position = from + moved * (target - from).signum();
            }
        }
    }

    fn start(&self, target: i64) -> Result<()> {
        if target < 0 || target > self.limit {
            bail!("target position {} outside 0..={}", target, self.limit);
        }
        let mut state = self.state.lock();
        self.settle(&mut state);
        if state.motion.is_some() {
            bail!("focuser is moving");
        }
        state.motion = Some((state.position, target, Instant::now()));
        Ok(())
    }
}

#[async_trait]
impl FocuserUnit for MockFocuser {
    async fn state(&self) -> Result<FocuserState> {
        self.faults.check("focuser", "state")?;
        let mut state = self.state.lock();
        self.settle(&mut state);
        Ok(FocuserState {
            position: state.position,
            moving: state.motion.is_some(),
        })
    }

    async fn move_to(&self, position: i64) -> Result<()> {
        self.faults.check("focuser", "move_to")?;
        self.start(position)
    }

    async fn home(&self) -> Result<()> {
        self.faults.check("focuser", "home")?;
        self.start(0)
    }

    fn limit(&self) -> i64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_move_and_home() {
        let focuser = MockFocuser::new(10_000, 100_000.0);
        focuser.move_to(500).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(focuser.state().await.unwrap().position, 500);

        assert!(focuser.move_to(20_000).await.is_err());
        focuser.home().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let state = focuser.state().await.unwrap();
        assert_eq!(state.position, 0);
        assert!(!state.moving);
    }
}
