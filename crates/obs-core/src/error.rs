//! Error types shared by every daemon.
//!
//! `ObsError` is the single error type returned across the daemon command surface.
//! The variants follow the observatory error taxonomy:
//!
//! - **`InvalidArgument`**: malformed or out-of-range command parameters. Raised before any
//!   command is stored, so a rejected command never reaches the worker.
//! - **`HardwareStatus`**: the command is well formed but refused because of the current
//!   safety, mode or motion state (e.g. "dome is in lockdown", "already opening").
//! - **`Dependency`**: a daemon this daemon relies on is not reachable.
//! - **`Timeout`**: a bounded wait (motion, forced status refresh, cross-daemon poll)
//!   exceeded its budget.
//! - **`StaleLoop`**: the worker has not ticked recently. Only produced by `ping`.
//!
//! The remaining variants wrap lower-level failures (adapter errors inside the worker,
//! transport failures, configuration, I/O, persisted-file parsing).
//!
//! Each variant maps to a stable [`ErrorKind`] so an error can cross the RPC boundary and
//! be rebuilt into the same variant on the client side with [`ObsError::from_kind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the daemon error type.
pub type ObsResult<T> = std::result::Result<T, ObsError>;

/// Machine-readable error category, stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    HardwareStatus,
    Dependency,
    Timeout,
    StaleLoop,
    Hardware,
    Rpc,
    Config,
    Io,
    Serialization,
    Parse,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::HardwareStatus => "hardware_status",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Timeout => "timeout",
            ErrorKind::StaleLoop => "stale_loop",
            ErrorKind::Hardware => "hardware",
            ErrorKind::Rpc => "rpc",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Parse => "parse",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the observatory daemons.
#[derive(Error, Debug)]
pub enum ObsError {
    /// Command parameters are malformed or out of range.
    ///
    /// **Recovery Strategy**: Fix the request. Nothing was stored, so retrying the same
    /// request will fail the same way.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Command refused because of the daemon's current safety, mode or motion state.
    ///
    /// **Error Type**: Transient. The state may change (lockdown lifted, motion finished,
    /// mode switched).
    ///
    /// # Example
    ///
    /// ```rust
    /// use obs_core::error::ObsError;
    ///
    /// fn check_lockdown(lockdown: bool) -> Result<(), ObsError> {
    ///     if lockdown {
    ///         return Err(ObsError::HardwareStatus("Dome is in lockdown".into()));
    ///     }
    ///     Ok(())
    /// }
    /// ```
    #[error("Hardware status error: {0}")]
    HardwareStatus(String),

    /// A dependency daemon is not reachable.
    ///
    /// **Recovery Strategy**: Check that the named daemons are running. The dependency
    /// state is re-evaluated on every re-sync, so the error clears by itself.
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// A bounded wait exceeded its budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The worker loop has not ticked within the configured ping lifetime.
    ///
    /// Used by external supervisors as a liveness probe; the daemon process is still
    /// answering RPCs but its control loop is hung.
    #[error("Control loop stale: last tick {elapsed_secs:.1}s ago")]
    StaleLoop { elapsed_secs: f64 },

    /// A hardware adapter call failed.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// The RPC transport failed (connection refused, connection dropped, bad frame).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted file (queue, counter, flags) could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<figment::Error> for ObsError {
    fn from(err: figment::Error) -> Self {
        ObsError::Config(err.to_string())
    }
}

impl ObsError {
    /// The wire category for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ObsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ObsError::HardwareStatus(_) => ErrorKind::HardwareStatus,
            ObsError::Dependency(_) => ErrorKind::Dependency,
            ObsError::Timeout(_) => ErrorKind::Timeout,
            ObsError::StaleLoop { .. } => ErrorKind::StaleLoop,
            ObsError::Hardware(_) => ErrorKind::Hardware,
            ObsError::Rpc(_) => ErrorKind::Rpc,
            ObsError::Config(_) => ErrorKind::Config,
            ObsError::Io(_) => ErrorKind::Io,
            ObsError::Serialization(_) => ErrorKind::Serialization,
            ObsError::Parse(_) => ErrorKind::Parse,
        }
    }

    /// The message without the category prefix added by `Display`.
    pub fn message(&self) -> String {
        match self {
            ObsError::InvalidArgument(msg)
            | ObsError::HardwareStatus(msg)
            | ObsError::Dependency(msg)
            | ObsError::Timeout(msg)
            | ObsError::Hardware(msg)
            | ObsError::Rpc(msg)
            | ObsError::Config(msg)
            | ObsError::Parse(msg) => msg.clone(),
            ObsError::StaleLoop { elapsed_secs } => format!("{:.1}", elapsed_secs),
            ObsError::Io(e) => e.to_string(),
            ObsError::Serialization(e) => e.to_string(),
        }
    }

    /// Rebuild an error received over the wire.
    ///
    /// Wrapped library errors (`Io`, `Serialization`) cannot be reconstructed exactly
    /// and come back as their message inside an equivalent variant.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidArgument => ObsError::InvalidArgument(message),
            ErrorKind::HardwareStatus => ObsError::HardwareStatus(message),
            ErrorKind::Dependency => ObsError::Dependency(message),
            ErrorKind::Timeout => ObsError::Timeout(message),
            ErrorKind::StaleLoop => ObsError::StaleLoop {
                elapsed_secs: message.parse().unwrap_or(f64::NAN),
            },
            ErrorKind::Hardware => ObsError::Hardware(message),
            ErrorKind::Rpc => ObsError::Rpc(message),
            ErrorKind::Config => ObsError::Config(message),
            ErrorKind::Io => ObsError::Io(std::io::Error::other(message)),
            ErrorKind::Serialization => ObsError::Parse(message),
            ErrorKind::Parse => ObsError::Parse(message),
        }
    }

    /// Wrap an adapter failure.
    pub fn hardware(err: impl std::fmt::Display) -> Self {
        ObsError::Hardware(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ObsError::HardwareStatus("Dome is in lockdown".to_string());
        assert_eq!(err.to_string(), "Hardware status error: Dome is in lockdown");
    }

    #[test]
    fn test_stale_loop_display() {
        let err = ObsError::StaleLoop { elapsed_secs: 12.34 };
        assert_eq!(err.to_string(), "Control loop stale: last tick 12.3s ago");
    }

    #[test]
    fn test_kind_survives_the_wire() {
        let errors = vec![
            ObsError::InvalidArgument("bad side".into()),
            ObsError::HardwareStatus("already opening".into()),
            ObsError::Dependency("filt".into()),
            ObsError::Timeout("info".into()),
            ObsError::StaleLoop { elapsed_secs: 3.0 },
        ];
        for err in errors {
            let rebuilt = ObsError::from_kind(err.kind(), err.message());
            assert_eq!(rebuilt.kind(), err.kind());
            assert_eq!(rebuilt.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_kind_label() {
        assert_eq!(ErrorKind::InvalidArgument.to_string(), "invalid_argument");
        let json = serde_json::to_string(&ErrorKind::StaleLoop).unwrap();
        assert_eq!(json, "\"stale_loop\"");
    }
}
