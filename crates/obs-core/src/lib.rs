//! Core building blocks for the observatory daemons.
//!
//! - [`error`]: the shared error taxonomy
//! - [`capabilities`]: hardware adapter traits
//! - [`daemon`]: the control-loop skeleton every daemon runs on
//! - [`adapter`]: reconnecting adapter slots
//! - [`dependencies`]: dependency daemon monitoring
//! - [`retry`]: bounded-wait helpers
//! - [`site`]: mode, emergency shutdown and conditions sources
//! - [`exposure`]: exposures, the persisted queue and the set counter
//! - [`control`]: daemon-level interfaces used by the exposure queue
//! - [`config`], [`logging`]: process bootstrap

pub mod adapter;
pub mod capabilities;
pub mod config;
pub mod control;
pub mod daemon;
pub mod dependencies;
pub mod error;
pub mod exposure;
pub mod logging;
pub mod retry;
pub mod site;

pub use daemon::{DaemonCore, DaemonStatus, Health, LoopTiming, Snapshot, TickContext, Worker};
pub use error::{ErrorKind, ObsError, ObsResult};
