//! Dome status record published in every snapshot.

use chrono::{DateTime, Utc};
use obs_core::capabilities::{HeartbeatStatus, SideState};
use obs_core::site::Mode;
use serde::{Deserialize, Serialize};

use super::lockdown::Lockdown;
use super::motion::MotionInfo;

/// Overall shutter state derived from both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomeState {
    Closed,
    Open,
    Moving,
    Error,
}

impl DomeState {
    pub fn from_sides(a_side: SideState, b_side: SideState) -> Self {
        if a_side == SideState::Error || b_side == SideState::Error {
            DomeState::Error
        } else if a_side.is_moving() || b_side.is_moving() {
            DomeState::Moving
        } else if a_side == SideState::Closed && b_side == SideState::Closed {
            DomeState::Closed
        } else {
            DomeState::Open
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomeInfo {
    // Hardware readings, `None` when the adapter could not be read
    pub a_side: Option<SideState>,
    pub b_side: Option<SideState>,
    pub dome: Option<DomeState>,
    pub hatch_closed: Option<bool>,
    pub heartbeat_status: Option<HeartbeatStatus>,
    pub dehumidifier_on: Option<bool>,
    pub button_pressed: Option<bool>,

    // Conditions
    pub windspeed: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub windspeed_upper: f64,
    pub windspeed_lower: f64,
    pub humidity_upper: f64,
    pub humidity_lower: f64,
    pub temperature_lower: f64,
    pub temperature_upper: f64,
    pub conditions_bad: bool,
    pub conditions_bad_reasons: Vec<String>,

    // Site status
    pub emergency: bool,
    pub emergency_reasons: Vec<String>,
    pub mode: Mode,
    pub old_mode: Option<Mode>,

    // Supervisor state
    pub lockdown: Lockdown,
    pub lockdown_reasons: Vec<String>,
    pub autoclosing: bool,
    pub shielding: bool,
    pub motion: Option<MotionInfo>,
    pub last_move_time: Option<DateTime<Utc>>,

    pub alarm_enabled: bool,
    pub heartbeat_enabled: bool,
    pub autodehum_enabled: bool,
    pub autoclose_enabled: bool,
    pub autoclose_timeout: Option<DateTime<Utc>>,
    pub autoshield_enabled: bool,
    pub windshield_enabled: bool,
}

impl DomeInfo {
    pub fn is_closed(&self) -> bool {
        self.dome == Some(DomeState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dome_state_from_sides() {
        use SideState::*;
        assert_eq!(DomeState::from_sides(Closed, Closed), DomeState::Closed);
        assert_eq!(DomeState::from_sides(Closed, PartOpen), DomeState::Open);
        assert_eq!(DomeState::from_sides(Opening, Closed), DomeState::Moving);
        assert_eq!(DomeState::from_sides(Error, Closing), DomeState::Error);
    }
}
