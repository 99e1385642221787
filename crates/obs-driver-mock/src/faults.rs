//! Fault injection shared by the simulated devices.
//!
//! Every mock device holds a [`Faults`] handle and checks it at the start of each
//! operation. Tests keep a clone of the handle to break or repair the device while a
//! daemon is running against it.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A specific failure to inject.
#[derive(Debug, Clone)]
pub enum FaultScenario {
    /// Fail `operation` after `count` successful calls
    FailAfterN { operation: &'static str, count: u32 },
    /// Fail every call to `operation`
    AlwaysFail { operation: &'static str },
    /// Fail every operation, as if the cable was pulled
    CommunicationLoss,
}

#[derive(Debug, Default)]
struct FaultState {
    scenarios: Vec<FaultScenario>,
    counts: HashMap<&'static str, u32>,
}

/// Shared, clonable fault injection handle.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    state: Arc<Mutex<FaultState>>,
}

impl Faults {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn scenario(scenario: FaultScenario) -> Self {
        let faults = Self::none();
        faults.inject(scenario);
        faults
    }

    pub fn inject(&self, scenario: FaultScenario) {
        self.state.lock().scenarios.push(scenario);
    }

    /// Remove every scenario and reset the counters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.scenarios.clear();
        state.counts.clear();
    }

    pub fn set_communication_lost(&self, lost: bool) {
        let mut state = self.state.lock();
        state
            .scenarios
            .retain(|s| !matches!(s, FaultScenario::CommunicationLoss));
        if lost {
            state.scenarios.push(FaultScenario::CommunicationLoss);
        }
    }

    /// Check whether `operation` on `device` should fail.
    pub fn check(&self, device: &str, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock();
        let count = {
            let c = state.counts.entry(operation).or_insert(0);
            *c += 1;
            *c
        };
        for scenario in &state.scenarios {
            match scenario {
                FaultScenario::CommunicationLoss => {
                    return Err(anyhow!("{}: communication lost", device));
                }
                FaultScenario::AlwaysFail { operation: op } if *op == operation => {
                    return Err(anyhow!("{}: injected failure in {}", device, operation));
                }
                FaultScenario::FailAfterN {
                    operation: op,
                    count: n,
                } if *op == operation && count > *n => {
                    return Err(anyhow!(
                        "{}: injected failure in {} after {} operations",
                        device,
                        operation,
                        n
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
