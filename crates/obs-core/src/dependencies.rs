//! Dependency daemon monitoring.

use crate::control::Pingable;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct DependencyState {
    first_failure: Option<Instant>,
    bad: bool,
}

/// Pings a fixed set of dependency daemons on every re-sync.
///
/// A single failed ping is tolerated: a dependency is only marked bad once it has failed
/// on two checks at least `grace` apart. One successful ping clears it.
pub struct DependencyMonitor {
    grace: Duration,
    targets: Vec<(String, Arc<dyn Pingable>)>,
    states: BTreeMap<String, DependencyState>,
}

impl DependencyMonitor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            targets: Vec::new(),
            states: BTreeMap::new(),
        }
    }

    pub fn with(mut self, id: impl Into<String>, target: Arc<dyn Pingable>) -> Self {
        let id = id.into();
        self.states.insert(id.clone(), DependencyState::default());
        self.targets.push((id, target));
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|(id, _)| id.as_str())
    }

    /// Ping every dependency and return the set currently considered bad.
    pub async fn check(&mut self) -> BTreeSet<String> {
        let now = Instant::now();
        for (id, target) in &self.targets {
            let state = self.states.entry(id.clone()).or_default();
            match target.ping().await {
                Ok(_) => {
                    if state.bad {
                        info!(dependency = %id, "Dependency recovered");
                    }
                    *state = DependencyState::default();
                }
                Err(err) => match state.first_failure {
                    None => state.first_failure = Some(now),
                    Some(first) => {
                        if !state.bad && now.duration_since(first) >= self.grace {
                            warn!(dependency = %id, error = %err, "Dependency not responding");
                            state.bad = true;
                        }
                    }
                },
            }
        }
        self.bad()
    }

    /// Dependencies marked bad at the last check.
    pub fn bad(&self) -> BTreeSet<String> {
        self.states
            .iter()
            .filter(|(_, s)| s.bad)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
