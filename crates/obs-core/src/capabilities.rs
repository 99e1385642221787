//! Hardware capability traits.
//!
//! Each device class the daemons drive is described by one small async trait. A daemon
//! never talks to vendor code directly; it holds `Arc<dyn Trait>` adapters obtained from a
//! connector (see [`crate::adapter::AdapterSlot`]), so the same worker runs against real
//! drivers or the simulated ones in `obs-driver-mock`.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Never blocks for the duration of a physical motion: motion commands start the
//!   motion and return, progress is observed by polling the status method
//!
//! # Example
//!
//! ```rust,ignore
//! async fn wait_side_closed(dome: &dyn DomeUnit, side: DomeSide) -> anyhow::Result<()> {
//!     dome.start_move(side, MoveDirection::Close, 1.0).await?;
//!     loop {
//!         let status = dome.status().await?;
//!         if status.side(side) == SideState::Closed {
//!             return Ok(());
//!         }
//!         tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Dome
// =============================================================================

/// One half of the dome shutter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomeSide {
    ASide,
    BSide,
}

impl DomeSide {
    pub fn name(self) -> &'static str {
        match self {
            DomeSide::ASide => "a_side",
            DomeSide::BSide => "b_side",
        }
    }
}

impl std::fmt::Display for DomeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of a shutter motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Open,
    Close,
}

impl MoveDirection {
    pub fn opposite(self) -> Self {
        match self {
            MoveDirection::Open => MoveDirection::Close,
            MoveDirection::Close => MoveDirection::Open,
        }
    }

    /// Present participle, used in acknowledgements ("opening", "closing").
    pub fn verb_ing(self) -> &'static str {
        match self {
            MoveDirection::Open => "opening",
            MoveDirection::Close => "closing",
        }
    }
}

/// Reported position of one shutter side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideState {
    Closed,
    PartOpen,
    FullOpen,
    Opening,
    Closing,
    Error,
}

impl SideState {
    pub fn is_moving(self) -> bool {
        matches!(self, SideState::Opening | SideState::Closing)
    }
}

/// Raw dome readings returned by the motion unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomeStatus {
    pub a_side: SideState,
    pub b_side: SideState,
    pub hatch_open: bool,
}

impl DomeStatus {
    pub fn side(&self, side: DomeSide) -> SideState {
        match side {
            DomeSide::ASide => self.a_side,
            DomeSide::BSide => self.b_side,
        }
    }
}

/// Dome shutter motion unit.
#[async_trait]
pub trait DomeUnit: Send + Sync {
    /// Read both shutter sides and the hatch.
    async fn status(&self) -> Result<DomeStatus>;

    /// Start moving one side towards open or closed.
    ///
    /// `frac` is the fraction of the full travel to cover, in `(0, 1]`. Returns once the
    /// motion has started.
    async fn start_move(&self, side: DomeSide, direction: MoveDirection, frac: f64)
        -> Result<()>;

    /// Stop all shutter motion immediately.
    async fn halt(&self) -> Result<()>;

    /// Sound the dome siren for `duration`. Returns immediately.
    async fn sound_alarm(&self, duration: Duration) -> Result<()>;
}

// =============================================================================
// Heartbeat / deadman
// =============================================================================

/// State of the independent heartbeat (deadman) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Enabled,
    Disabled,
    /// The unit lost contact with the daemon and is closing the dome by itself.
    Closing,
    Error,
}

/// Deadman unit that closes the dome if the control software stops answering.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn status(&self) -> Result<HeartbeatStatus>;

    /// Enable or disable the deadman.
    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Tell the unit the daemon is alive. Called every re-sync while enabled.
    async fn beat(&self) -> Result<()>;
}

// =============================================================================
// Relays, outlets and buttons
// =============================================================================

/// A switched outlet or relay (dehumidifier, PDU outlet).
#[async_trait]
pub trait Relay: Send + Sync {
    async fn is_on(&self) -> Result<bool>;
    async fn set(&self, on: bool) -> Result<()>;
}

/// The physical quick-close button inside the dome.
#[async_trait]
pub trait QuickCloseButton: Send + Sync {
    async fn pressed(&self) -> Result<bool>;
}

// =============================================================================
// Filter wheel
// =============================================================================

/// Raw filter wheel readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterWheelState {
    pub homed: bool,
    /// Current slot, `None` until the wheel has been homed.
    pub position: Option<usize>,
    pub moving: bool,
}

/// A filter wheel on one unit telescope.
#[async_trait]
pub trait FilterWheel: Send + Sync {
    async fn state(&self) -> Result<FilterWheelState>;

    /// Start homing. Returns once the wheel has started moving.
    async fn home(&self) -> Result<()>;

    /// Start moving to slot `position`. The wheel must be homed.
    async fn move_to(&self, position: usize) -> Result<()>;
}

// =============================================================================
// Camera
// =============================================================================

/// Raw camera state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Ready,
    Exposing,
    Reading,
}

impl CameraState {
    pub fn is_busy(self) -> bool {
        !matches!(self, CameraState::Ready)
    }
}

/// A camera on one unit telescope.
#[async_trait]
pub trait CameraUnit: Send + Sync {
    async fn state(&self) -> Result<CameraState>;

    /// Start an exposure. `dark` keeps the shutter closed.
    async fn start_exposure(&self, exptime: Duration, binning: u32, dark: bool) -> Result<()>;

    async fn abort(&self) -> Result<()>;
}

// =============================================================================
// Mount
// =============================================================================

/// Mount status as reported to clients and to the exposure queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountStatus {
    Tracking,
    Slewing,
    Parked,
    Stopped,
    MotorsOff,
}

impl MountStatus {
    /// Whether the mount can be commanded to move from this state.
    pub fn can_offset(self) -> bool {
        !matches!(
            self,
            MountStatus::Parked | MountStatus::Stopped | MountStatus::MotorsOff
        )
    }
}

/// Compass direction for small mount offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compass {
    N,
    E,
    S,
    W,
}

impl std::str::FromStr for Compass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "N" => Ok(Compass::N),
            "E" => Ok(Compass::E),
            "S" => Ok(Compass::S),
            "W" => Ok(Compass::W),
            other => Err(format!("Invalid direction \"{}\", must be N, E, S or W", other)),
        }
    }
}

impl std::fmt::Display for Compass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Compass::N => "N",
            Compass::E => "E",
            Compass::S => "S",
            Compass::W => "W",
        };
        f.write_str(s)
    }
}

/// The telescope mount.
#[async_trait]
pub trait MountUnit: Send + Sync {
    async fn status(&self) -> Result<MountStatus>;

    /// Start a small offset of `distance` arcseconds. Tracking resumes when it completes.
    async fn offset(&self, direction: Compass, distance: f64) -> Result<()>;

    async fn track(&self) -> Result<()>;

    async fn park(&self) -> Result<()>;

    async fn halt(&self) -> Result<()>;
}

// =============================================================================
// Focuser
// =============================================================================

/// Raw focuser readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocuserState {
    pub position: i64,
    pub moving: bool,
}

/// A focuser on one unit telescope.
#[async_trait]
pub trait FocuserUnit: Send + Sync {
    async fn state(&self) -> Result<FocuserState>;

    /// Start moving to an absolute step position.
    async fn move_to(&self, position: i64) -> Result<()>;

    /// Start moving back to the zero position.
    async fn home(&self) -> Result<()>;

    /// Travel limit in steps.
    fn limit(&self) -> i64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compass_parse() {
        assert_eq!("n".parse::<Compass>().unwrap(), Compass::N);
        assert_eq!("W".parse::<Compass>().unwrap(), Compass::W);
        assert!("X".parse::<Compass>().is_err());
    }

    #[test]
    fn test_mount_can_offset() {
        assert!(MountStatus::Tracking.can_offset());
        assert!(MountStatus::Slewing.can_offset());
        assert!(!MountStatus::Parked.can_offset());
        assert!(!MountStatus::Stopped.can_offset());
        assert!(!MountStatus::MotorsOff.can_offset());
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(MoveDirection::Open.opposite(), MoveDirection::Close);
        assert_eq!(MoveDirection::Close.verb_ing(), "closing");
    }
}
