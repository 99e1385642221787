//! Simulated observatory hardware.
//!
//! Every device implements the matching `obs_core::capabilities` trait and can be handed
//! to a daemon in place of a real driver. Motions are simulated from the clock: a command
//! records when it started and every status read computes where the device is now, so no
//! background tasks are needed.
//!
//! # Available Mock Devices
//!
//! - [`MockDome`] - two shutter sides with a configurable travel time, hatch and siren
//! - [`MockHeartbeat`] - deadman unit
//! - [`MockRelay`] - switched outlet (dehumidifier, PDU outlet)
//! - [`MockButton`] - quick-close button
//! - [`MockFilterWheel`] - filter wheel that must be homed before moving
//! - [`MockCamera`] - camera with scaled exposure time and fixed readout
//! - [`MockMount`] - mount with timed offsets and parks
//! - [`MockFocuser`] - stepper focuser
//! - [`MockConditions`] - settable conditions feed
//!
//! All devices carry a [`Faults`] handle for injecting failures.

pub mod faults;
mod mock_camera;
mod mock_conditions;
mod mock_dome;
mod mock_filter_wheel;
mod mock_focuser;
mod mock_mount;

pub use faults::{FaultScenario, Faults};
pub use mock_camera::MockCamera;
pub use mock_conditions::MockConditions;
pub use mock_dome::{MockButton, MockDome, MockDomeBuilder, MockHeartbeat, MockRelay};
pub use mock_filter_wheel::MockFilterWheel;
pub use mock_focuser::MockFocuser;
pub use mock_mount::MockMount;
