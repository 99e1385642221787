//! Observatory configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (every section optional, an empty file is valid)
//! 2. Environment variables prefixed with `OBS_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use obs_core::config::ObsConfig;
//!
//! let config = ObsConfig::load_from("config/obs.toml")?;
//! println!("Dome RPC port: {}", config.daemons.dome.port);
//! # Ok::<(), obs_core::error::ObsError>(())
//! ```
//!
//! `OBS_DOME__MOVE_TIMEOUT_SECS=60` overrides `[dome] move_timeout_secs`.

use crate::capabilities::Compass;
use crate::daemon::LoopTiming;
use crate::error::{ObsError, ObsResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub daemons: DaemonsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub dome: DomeConfig,
    #[serde(default)]
    pub exq: ExqConfig,
    #[serde(default)]
    pub power: PowerConfig,
    /// UT id (as a string key) to its filter names. An empty list means no filter wheel.
    #[serde(default = "default_uts")]
    pub uts: BTreeMap<String, Vec<String>>,
    /// Use the simulated hardware adapters.
    #[serde(default = "default_true")]
    pub fake: bool,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Worker loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_check_period_ms")]
    pub check_period_ms: u64,
    #[serde(default = "default_info_timeout_ms")]
    pub info_timeout_ms: u64,
    /// Ping staleness bound (0 = disabled)
    #[serde(default = "default_pinglife_secs")]
    pub pinglife_secs: u64,
}

/// RPC client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
}

/// Address of one daemon's RPC server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonAddress {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

impl DaemonAddress {
    fn local(port: u16) -> Self {
        Self {
            host: default_host(),
            port,
        }
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// RPC addresses of every daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonsConfig {
    #[serde(default = "default_dome_addr")]
    pub dome: DaemonAddress,
    #[serde(default = "default_exq_addr")]
    pub exq: DaemonAddress,
    #[serde(default = "default_filt_addr")]
    pub filt: DaemonAddress,
    #[serde(default = "default_cam_addr")]
    pub cam: DaemonAddress,
    #[serde(default = "default_mnt_addr")]
    pub mnt: DaemonAddress,
    #[serde(default = "default_foc_addr")]
    pub foc: DaemonAddress,
    #[serde(default = "default_power_addr")]
    pub power: DaemonAddress,
}

/// Daemon identifiers, in port order.
pub const DAEMON_IDS: [&str; 7] = ["dome", "exq", "filt", "cam", "mnt", "foc", "power"];

impl DaemonsConfig {
    pub fn get(&self, id: &str) -> Option<&DaemonAddress> {
        match id {
            "dome" => Some(&self.dome),
            "exq" => Some(&self.exq),
            "filt" => Some(&self.filt),
            "cam" => Some(&self.cam),
            "mnt" => Some(&self.mnt),
            "foc" => Some(&self.foc),
            "power" => Some(&self.power),
            _ => None,
        }
    }
}

/// Site file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,
    /// Conditions feed older than this counts as bad
    #[serde(default = "default_max_conditions_age")]
    pub max_conditions_age_secs: u64,
}

impl PathsConfig {
    pub fn emergency_file(&self) -> PathBuf {
        self.file_path.join("EMERGENCY-SHUTDOWN")
    }

    pub fn status_file(&self) -> PathBuf {
        self.file_path.join("status_flags.json")
    }

    pub fn conditions_file(&self) -> PathBuf {
        self.file_path.join("conditions_flags.json")
    }

    pub fn queue_file(&self) -> PathBuf {
        self.file_path.join("exposure_queue")
    }

    pub fn set_number_file(&self) -> PathBuf {
        self.file_path.join("set_number")
    }
}

/// Dome supervision parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomeConfig {
    /// Hard per-side motion timeout
    #[serde(default = "default_move_timeout")]
    pub move_timeout_secs: u64,
    /// Delay between sounding the alarm and starting a motion
    #[serde(default = "default_alarm_settle")]
    pub alarm_settle_secs: u64,
    /// Hatch open longer than this in robotic mode triggers lockdown
    #[serde(default = "default_hatch_open_delay")]
    pub hatch_open_delay_secs: u64,
    #[serde(default = "default_true")]
    pub has_dehumidifier: bool,
    #[serde(default = "default_true")]
    pub quick_close_button: bool,
    #[serde(default)]
    pub windshield_permitted: bool,
    /// Fraction each side is closed to when shielding
    #[serde(default = "default_windshield_position")]
    pub windshield_position: f64,
    #[serde(default = "default_shield_windgust")]
    pub shield_windgust: f64,
    #[serde(default = "default_max_internal_humidity")]
    pub max_internal_humidity: f64,
    #[serde(default = "default_min_internal_temperature")]
    pub min_internal_temperature: f64,
}

/// Exposure queue parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExqConfig {
    #[serde(default)]
    pub dithering: bool,
    /// Offset direction and distance in arcseconds, cycled through within a set
    #[serde(default = "default_dither_pattern")]
    pub dither_pattern: Vec<(Compass, f64)>,
    /// A waiting acquisition stage is abandoned after this long
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_dependency_grace")]
    pub dependency_grace_secs: u64,
}

/// Switched outlets of the power daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    #[serde(default = "default_outlets")]
    pub outlets: Vec<String>,
    /// Off time between the two halves of a reboot
    #[serde(default = "default_reboot_delay")]
    pub reboot_delay_secs: u64,
}

impl PowerConfig {
    pub fn reboot_delay(&self) -> Duration {
        Duration::from_secs(self.reboot_delay_secs)
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_tick_ms() -> u64 {
    100
}

fn default_check_period_ms() -> u64 {
    3000
}

fn default_info_timeout_ms() -> u64 {
    30_000
}

fn default_pinglife_secs() -> u64 {
    10
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_dome_addr() -> DaemonAddress {
    DaemonAddress::local(9001)
}

fn default_exq_addr() -> DaemonAddress {
    DaemonAddress::local(9002)
}

fn default_filt_addr() -> DaemonAddress {
    DaemonAddress::local(9003)
}

fn default_cam_addr() -> DaemonAddress {
    DaemonAddress::local(9004)
}

fn default_mnt_addr() -> DaemonAddress {
    DaemonAddress::local(9005)
}

fn default_foc_addr() -> DaemonAddress {
    DaemonAddress::local(9006)
}

fn default_power_addr() -> DaemonAddress {
    DaemonAddress::local(9007)
}

fn default_outlets() -> Vec<String> {
    ["mount", "cams", "filts", "focs", "heaters"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_reboot_delay() -> u64 {
    5
}

fn default_file_path() -> PathBuf {
    PathBuf::from("var")
}

fn default_max_conditions_age() -> u64 {
    600
}

fn default_move_timeout() -> u64 {
    40
}

fn default_alarm_settle() -> u64 {
    5
}

fn default_hatch_open_delay() -> u64 {
    30
}

fn default_windshield_position() -> f64 {
    0.5
}

fn default_shield_windgust() -> f64 {
    40.0
}

fn default_max_internal_humidity() -> f64 {
    75.0
}

fn default_min_internal_temperature() -> f64 {
    1.0
}

fn default_dither_pattern() -> Vec<(Compass, f64)> {
    vec![
        (Compass::N, 1.00),
        (Compass::E, 1.32),
        (Compass::S, 1.54),
        (Compass::W, 1.61),
        (Compass::N, 1.21),
        (Compass::E, 1.22),
    ]
}

fn default_stage_timeout() -> u64 {
    300
}

fn default_dependency_grace() -> u64 {
    5
}

fn default_uts() -> BTreeMap<String, Vec<String>> {
    let filters: Vec<String> = ["L", "R", "G", "B", "C"].iter().map(|f| f.to_string()).collect();
    (1..=4).map(|ut| (ut.to_string(), filters.clone())).collect()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            check_period_ms: default_check_period_ms(),
            info_timeout_ms: default_info_timeout_ms(),
            pinglife_secs: default_pinglife_secs(),
        }
    }
}

impl TimingConfig {
    pub fn loop_timing(&self) -> LoopTiming {
        LoopTiming {
            tick: Duration::from_millis(self.tick_ms),
            check_period: Duration::from_millis(self.check_period_ms),
            info_timeout: Duration::from_millis(self.info_timeout_ms),
            pinglife: (self.pinglife_secs > 0).then(|| Duration::from_secs(self.pinglife_secs)),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DaemonsConfig {
    fn default() -> Self {
        Self {
            dome: default_dome_addr(),
            exq: default_exq_addr(),
            filt: default_filt_addr(),
            cam: default_cam_addr(),
            mnt: default_mnt_addr(),
            foc: default_foc_addr(),
            power: default_power_addr(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            file_path: default_file_path(),
            max_conditions_age_secs: default_max_conditions_age(),
        }
    }
}

impl Default for DomeConfig {
    fn default() -> Self {
        Self {
            move_timeout_secs: default_move_timeout(),
            alarm_settle_secs: default_alarm_settle(),
            hatch_open_delay_secs: default_hatch_open_delay(),
            has_dehumidifier: true,
            quick_close_button: true,
            windshield_permitted: false,
            windshield_position: default_windshield_position(),
            shield_windgust: default_shield_windgust(),
            max_internal_humidity: default_max_internal_humidity(),
            min_internal_temperature: default_min_internal_temperature(),
        }
    }
}

impl DomeConfig {
    /// Autoshield turns off once gusts drop below this.
    pub fn windspeed_lower(&self) -> f64 {
        self.shield_windgust - 5.0
    }

    /// Autodehum releases once humidity drops below this.
    pub fn humidity_lower(&self) -> f64 {
        self.max_internal_humidity - 10.0
    }

    /// Autodehum releases once temperature rises above this.
    pub fn temperature_upper(&self) -> f64 {
        self.min_internal_temperature + 1.0
    }
}

impl Default for ExqConfig {
    fn default() -> Self {
        Self {
            dithering: false,
            dither_pattern: default_dither_pattern(),
            stage_timeout_secs: default_stage_timeout(),
            dependency_grace_secs: default_dependency_grace(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            outlets: default_outlets(),
            reboot_delay_secs: default_reboot_delay(),
        }
    }
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            timing: TimingConfig::default(),
            rpc: RpcConfig::default(),
            daemons: DaemonsConfig::default(),
            paths: PathsConfig::default(),
            dome: DomeConfig::default(),
            exq: ExqConfig::default(),
            power: PowerConfig::default(),
            uts: default_uts(),
            fake: true,
        }
    }
}

impl ObsConfig {
    /// Load configuration from a TOML file and `OBS_` environment variables
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ObsResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("OBS_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without consulting the environment.
    pub fn from_toml_str(toml: &str) -> ObsResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ObsResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ObsError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ObsError::Config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.timing.tick_ms == 0 {
            return Err(ObsError::Config("timing.tick_ms must be positive".into()));
        }

        if !(0.0..=1.0).contains(&self.dome.windshield_position) {
            return Err(ObsError::Config(format!(
                "Invalid windshield_position {}. Must be 0-1",
                self.dome.windshield_position
            )));
        }

        if self.exq.dither_pattern.is_empty() {
            return Err(ObsError::Config("exq.dither_pattern must not be empty".into()));
        }

        for key in self.uts.keys() {
            if key.parse::<u32>().is_err() {
                return Err(ObsError::Config(format!("Invalid UT id '{}'", key)));
            }
        }

        let mut outlets = std::collections::HashSet::new();
        if let Some(dup) = self.power.outlets.iter().find(|o| !outlets.insert(o.as_str())) {
            return Err(ObsError::Config(format!("Duplicate power outlet '{}'", dup)));
        }

        let mut ports = std::collections::HashSet::new();
        for id in DAEMON_IDS {
            if let Some(addr) = self.daemons.get(id) {
                if !ports.insert(addr.socket_addr()) {
                    return Err(ObsError::Config(format!(
                        "Duplicate daemon address: {}",
                        addr.socket_addr()
                    )));
                }
            }
        }

        Ok(())
    }

    /// UT ids with their filter lists. Only valid after `validate`.
    pub fn ut_filters(&self) -> BTreeMap<u32, Vec<String>> {
        self.uts
            .iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|ut| (ut, v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_valid() {
        let config = ObsConfig::from_toml_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.daemons.dome.port, 9001);
        assert_eq!(config.daemons.power.port, 9007);
        assert_eq!(config.dome.move_timeout_secs, 40);
        assert_eq!(config.exq.dither_pattern.len(), 6);
        assert_eq!(config.power.outlets.len(), 5);
        assert_eq!(config.ut_filters().len(), 4);
        assert!(config.fake);
    }

    #[test]
    fn test_partial_sections() {
        let config = ObsConfig::from_toml_str(
            r#"
            [dome]
            move_timeout_secs = 60
            windshield_permitted = true

            [daemons.exq]
            port = 9100

            [uts]
            1 = ["L", "R"]
            2 = []

            [exq]
            dithering = true
            dither_pattern = [["S", 2.0]]
            "#,
        )
        .unwrap();
        assert_eq!(config.dome.move_timeout_secs, 60);
        assert_eq!(config.dome.alarm_settle_secs, 5);
        assert!(config.dome.windshield_permitted);
        assert_eq!(config.daemons.exq.port, 9100);
        assert_eq!(config.daemons.exq.host, "127.0.0.1");
        assert_eq!(config.exq.dither_pattern, vec![(Compass::S, 2.0)]);

        let uts = config.ut_filters();
        assert_eq!(uts.len(), 2);
        assert!(uts[&2].is_empty());
    }

    #[test]
    fn test_thresholds() {
        let dome = DomeConfig::default();
        assert_eq!(dome.windspeed_lower(), 35.0);
        assert_eq!(dome.humidity_lower(), 65.0);
        assert_eq!(dome.temperature_upper(), 2.0);
    }

    #[test]
    fn test_invalid_values() {
        assert!(ObsConfig::from_toml_str("[logging]\nlevel = \"loud\"").is_err());
        assert!(ObsConfig::from_toml_str("[dome]\nwindshield_position = 2.0").is_err());
        assert!(ObsConfig::from_toml_str("[daemons.exq]\nport = 9001").is_err());
    }

    #[test]
    fn test_loop_timing() {
        let timing = TimingConfig {
            pinglife_secs: 0,
            ..TimingConfig::default()
        };
        let lt = timing.loop_timing();
        assert_eq!(lt.tick, Duration::from_millis(100));
        assert_eq!(lt.pinglife, None);
    }
}
