//! The observatory daemons.
//!
//! Every daemon is a [`DaemonCore`](obs_core::DaemonCore) running a worker that owns its
//! hardware adapters. Command methods on the daemon handles validate against a fresh
//! snapshot, leave the work in a mailbox and return a short acknowledgement; the worker
//! picks the work up on its next tick.
//!
//! - [`dome`]: shutter control and the safety supervisor
//! - [`exq`]: the exposure queue, which drives [`filt`], [`cam`] and [`mnt`]
//! - [`foc`], [`power`]: focusers and switched outlets

pub mod cam;
pub mod dome;
pub mod exq;
pub mod filt;
pub mod foc;
pub mod mnt;
pub mod power;

pub use cam::CamDaemon;
pub use dome::DomeDaemon;
pub use exq::ExqDaemon;
pub use filt::FiltDaemon;
pub use foc::FocDaemon;
pub use mnt::MntDaemon;
pub use power::PowerDaemon;
