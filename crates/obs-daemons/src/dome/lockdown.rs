//! Lockdown evaluation.
//!
//! A lockdown is raised while any trigger holds. Whether it acts on the dome depends on
//! autoclose: with autoclose disabled the lockdown is still computed and published, but
//! marked `ignored` so nothing moves.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Published lockdown state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lockdown {
    #[default]
    Clear,
    Active,
    Ignored,
}

impl Lockdown {
    pub fn is_active(self) -> bool {
        self == Lockdown::Active
    }
}

/// Inputs to one lockdown evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockdownTriggers {
    pub button_pressed: bool,
    /// Hatch open for longer than the allowed delay while in robotic mode.
    pub hatch_open_robotic: bool,
    /// Reasons listed in the emergency shutdown file, if it exists.
    pub emergency: Option<Vec<String>>,
    /// Reasons the conditions are bad, if they are.
    pub conditions_bad: Option<Vec<String>>,
}

impl LockdownTriggers {
    pub fn any(&self) -> bool {
        self.button_pressed
            || self.hatch_open_robotic
            || self.emergency.is_some()
            || self.conditions_bad.is_some()
    }

    /// One human-readable reason per active trigger, in a fixed order.
    pub fn reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.button_pressed {
            reasons.push("quick-close button pressed".to_string());
        }
        if self.hatch_open_robotic {
            reasons.push("hatch open in robotic mode".to_string());
        }
        if let Some(emergency) = &self.emergency {
            reasons.push(format!("emergency shutdown ({})", emergency.join(", ")));
        }
        if let Some(conditions) = &self.conditions_bad {
            reasons.push(format!("conditions bad ({})", conditions.join(", ")));
        }
        reasons
    }
}

/// Map triggers and the autoclose setting to a lockdown state.
pub fn evaluate_lockdown(triggers: &LockdownTriggers, autoclose_enabled: bool) -> Lockdown {
    match (triggers.any(), autoclose_enabled) {
        (false, _) => Lockdown::Clear,
        (true, true) => Lockdown::Active,
        (true, false) => Lockdown::Ignored,
    }
}

/// Lockdown state carried between re-syncs, so changes are logged once.
#[derive(Debug, Clone, Default)]
pub struct LockdownTracker {
    state: Lockdown,
    reasons: Vec<String>,
}

impl LockdownTracker {
    pub fn state(&self) -> Lockdown {
        self.state
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    /// Re-evaluate and log any change in state or reasons.
    pub fn update(&mut self, triggers: &LockdownTriggers, autoclose_enabled: bool) -> Lockdown {
        let state = evaluate_lockdown(triggers, autoclose_enabled);
        let reasons = triggers.reasons();
        let changed = state != self.state || reasons != self.reasons;
        match state {
            Lockdown::Active if changed => {
                warn!(reasons = %reasons.join(", "), "Lockdown");
            }
            Lockdown::Ignored if changed => {
                warn!(reasons = %reasons.join(", "), "IGNORING lockdown, autoclose is disabled");
            }
            Lockdown::Clear if self.state != Lockdown::Clear => {
                info!("Lockdown lifted");
            }
            _ => {}
        }
        self.state = state;
        self.reasons = reasons;
        state
    }

    /// Drop any lockdown, used when entering engineering mode.
    pub fn reset(&mut self) {
        if self.state != Lockdown::Clear {
            info!("Lockdown lifted, engineering mode");
        }
        self.state = Lockdown::Clear;
        self.reasons.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers(button: bool, hatch: bool, emergency: bool, conditions: bool) -> LockdownTriggers {
        LockdownTriggers {
            button_pressed: button,
            hatch_open_robotic: hatch,
            emergency: emergency.then(|| vec!["ups".to_string()]),
            conditions_bad: conditions.then(|| vec!["rain".to_string(), "windspeed".to_string()]),
        }
    }

    #[test]
    fn test_truth_table() {
        for bits in 0u8..16 {
            let t = triggers(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0);
            let any = bits != 0;
            for autoclose in [true, false] {
                let expected = match (any, autoclose) {
                    (false, _) => Lockdown::Clear,
                    (true, true) => Lockdown::Active,
                    (true, false) => Lockdown::Ignored,
                };
                assert_eq!(evaluate_lockdown(&t, autoclose), expected, "bits {bits:04b}");
            }
        }
    }

    #[test]
    fn test_reasons_are_ordered() {
        let t = triggers(true, false, true, true);
        assert_eq!(
            t.reasons(),
            vec![
                "quick-close button pressed".to_string(),
                "emergency shutdown (ups)".to_string(),
                "conditions bad (rain, windspeed)".to_string(),
            ]
        );
    }

    #[test]
    fn test_tracker_transitions() {
        let mut tracker = LockdownTracker::default();
        assert_eq!(tracker.update(&triggers(false, true, false, false), false), Lockdown::Ignored);
        assert_eq!(tracker.reasons(), ["hatch open in robotic mode".to_string()]);

        assert_eq!(tracker.update(&triggers(false, true, false, false), true), Lockdown::Active);
        assert!(tracker.state().is_active());

        assert_eq!(tracker.update(&LockdownTriggers::default(), true), Lockdown::Clear);
        assert!(tracker.reasons().is_empty());
    }
}
