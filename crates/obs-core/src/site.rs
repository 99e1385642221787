//! Site-wide status sources: operating mode, emergency shutdown and weather conditions.
//!
//! These are plain files written by other site processes. The dome daemon reads them on
//! every re-sync; none of them are cached between reads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Observatory operating mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Robotic,
    Manual,
    Engineering,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "robotic" => Ok(Mode::Robotic),
            "manual" => Ok(Mode::Manual),
            "engineering" => Ok(Mode::Engineering),
            other => Err(format!("Invalid mode: \"{}\"", other)),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Robotic => "robotic",
            Mode::Manual => "manual",
            Mode::Engineering => "engineering",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusFlags {
    mode: String,
    #[serde(default)]
    observer: String,
}

const ROBOTIC_OBSERVER: &str = "pilot";

/// Emergency shutdown state read from the marker file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emergency {
    pub active: bool,
    pub reasons: Vec<String>,
}

/// Mode flags file plus the emergency shutdown marker.
#[derive(Debug, Clone)]
pub struct FileStatus {
    status_file: PathBuf,
    emergency_file: PathBuf,
}

impl FileStatus {
    pub fn new(status_file: impl Into<PathBuf>, emergency_file: impl Into<PathBuf>) -> Self {
        Self {
            status_file: status_file.into(),
            emergency_file: emergency_file.into(),
        }
    }

    /// Current mode. A missing or corrupt flags file is rewritten with the default.
    pub fn mode(&self) -> Result<Mode> {
        let parsed = std::fs::read_to_string(&self.status_file)
            .ok()
            .and_then(|text| serde_json::from_str::<StatusFlags>(&text).ok())
            .and_then(|flags| flags.mode.parse::<Mode>().ok());
        match parsed {
            Some(mode) => Ok(mode),
            None => {
                warn!(path = %self.status_file.display(), "Status file corrupted, rewriting defaults");
                self.write(Mode::default(), ROBOTIC_OBSERVER)?;
                Ok(Mode::default())
            }
        }
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let observer = match mode {
            Mode::Robotic => ROBOTIC_OBSERVER.to_string(),
            _ => std::fs::read_to_string(&self.status_file)
                .ok()
                .and_then(|text| serde_json::from_str::<StatusFlags>(&text).ok())
                .map(|flags| flags.observer)
                .unwrap_or_default(),
        };
        self.write(mode, &observer)
    }

    fn write(&self, mode: Mode, observer: &str) -> Result<()> {
        let flags = StatusFlags {
            mode: mode.to_string(),
            observer: observer.to_string(),
        };
        if let Some(parent) = self.status_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.status_file, serde_json::to_string(&flags)?)
            .with_context(|| format!("writing {}", self.status_file.display()))
    }

    /// Whether the emergency marker exists, with the reasons listed inside it.
    pub fn emergency(&self) -> Result<Emergency> {
        if !self.emergency_file.is_file() {
            return Ok(Emergency::default());
        }
        let text = std::fs::read_to_string(&self.emergency_file)
            .with_context(|| format!("reading {}", self.emergency_file.display()))?;
        let mut reasons: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if reasons.is_empty() {
            reasons.push("unknown".to_string());
        }
        Ok(Emergency {
            active: true,
            reasons,
        })
    }

    /// Create the marker file, appending any reason not already listed.
    pub fn create_shutdown_file(&self, reasons: &[&str]) -> Result<()> {
        let existing = self.emergency()?;
        let mut lines: Vec<String> = if existing.active {
            existing
                .reasons
                .into_iter()
                .filter(|r| r != "unknown")
                .collect()
        } else {
            Vec::new()
        };
        let reasons: Vec<&str> = if reasons.is_empty() {
            vec!["no reason given"]
        } else {
            reasons.to_vec()
        };
        for reason in reasons {
            if !lines.iter().any(|l| l == reason) {
                lines.push(reason.to_string());
            }
        }
        if let Some(parent) = self.emergency_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut text = lines.join("\n");
        text.push('\n');
        std::fs::write(&self.emergency_file, text)?;
        Ok(())
    }
}

/// Summary of the conditions feed consumed by the dome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionsReport {
    pub bad: bool,
    pub bad_reasons: Vec<String>,
    /// Wind gust speed, km/h.
    pub windspeed: Option<f64>,
    /// Internal temperature, Celsius.
    pub temperature: Option<f64>,
    /// Internal relative humidity, percent.
    pub humidity: Option<f64>,
}

/// Source of the conditions signal.
#[async_trait]
pub trait ConditionsSource: Send + Sync {
    async fn report(&self) -> Result<ConditionsReport>;
}

/// Reads `conditions_flags.json`.
///
/// The file holds one integer per flag (`0` good, non-zero bad) with a matching
/// `<flag>_update_time` key, the `info_flags` and `ignored_flags` lists, the
/// `current_time` the feed was written, and an optional `weather` block with `windgust`,
/// `int_temperature` and `int_humidity`.
#[derive(Debug, Clone)]
pub struct FileConditions {
    path: PathBuf,
    max_age: Duration,
}

impl FileConditions {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Evaluate a conditions document against the clock.
    pub fn evaluate(data: &serde_json::Value, now: DateTime<Utc>, max_age: Duration) -> Result<ConditionsReport> {
        let obj = data
            .as_object()
            .context("conditions file is not a JSON object")?;

        let list = |key: &str| -> Vec<String> {
            obj.get(key)
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default()
        };
        let info_flags = list("info_flags");
        let ignored_flags = list("ignored_flags");

        let mut flags: BTreeMap<String, i64> = BTreeMap::new();
        for key in obj.keys() {
            if let Some(flag) = key.strip_suffix("_update_time") {
                let value = obj.get(flag).and_then(|v| v.as_i64()).unwrap_or(1);
                flags.insert(flag.to_string(), value);
            }
        }

        let current = obj
            .get("current_time")
            .and_then(|v| v.as_str())
            .context("conditions file has no current_time")?;
        let current = parse_time(current)?;
        let age = (now - current).to_std().unwrap_or(Duration::ZERO);
        flags.insert("age".to_string(), i64::from(age > max_age));

        let bad_reasons: Vec<String> = flags
            .iter()
            .filter(|(flag, value)| {
                **value > 0 && !info_flags.contains(*flag) && !ignored_flags.contains(*flag)
            })
            .map(|(flag, _)| flag.clone())
            .collect();

        let weather = obj.get("weather");
        let number = |key: &str| weather.and_then(|w| w.get(key)).and_then(|v| v.as_f64());

        Ok(ConditionsReport {
            bad: !bad_reasons.is_empty(),
            bad_reasons,
            windspeed: number("windgust"),
            temperature: number("int_temperature"),
            humidity: number("int_humidity"),
        })
    }
}

#[async_trait]
impl ConditionsSource for FileConditions {
    async fn report(&self) -> Result<ConditionsReport> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("cannot read {}", self.path.display()))?;
        let data: serde_json::Value = serde_json::from_str(&text)?;
        Self::evaluate(&data, Utc::now(), self.max_age)
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .with_context(|| format!("invalid time \"{}\"", s))?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_mode_rewritten_when_missing() {
        let dir = tempdir().unwrap();
        let status = FileStatus::new(dir.path().join("status_flags.json"), dir.path().join("STOP"));
        assert_eq!(status.mode().unwrap(), Mode::Robotic);
        assert!(dir.path().join("status_flags.json").exists());

        status.set_mode(Mode::Engineering).unwrap();
        assert_eq!(status.mode().unwrap(), Mode::Engineering);

        std::fs::write(dir.path().join("status_flags.json"), "{\"mode\": \"party\"}").unwrap();
        assert_eq!(status.mode().unwrap(), Mode::Robotic);
    }

    #[test]
    fn test_emergency_file() {
        let dir = tempdir().unwrap();
        let status = FileStatus::new(dir.path().join("status_flags.json"), dir.path().join("STOP"));
        assert!(!status.emergency().unwrap().active);

        std::fs::write(dir.path().join("STOP"), "").unwrap();
        assert_eq!(status.emergency().unwrap().reasons, vec!["unknown".to_string()]);

        status.create_shutdown_file(&["ups low", "ups low", "fire"]).unwrap();
        let emergency = status.emergency().unwrap();
        assert!(emergency.active);
        assert_eq!(emergency.reasons, vec!["ups low".to_string(), "fire".to_string()]);
    }

    #[test]
    fn test_conditions_evaluation() {
        let now = Utc::now();
        let data = json!({
            "rain": 1, "rain_update_time": "2024-01-01 00:00:00",
            "windspeed": 0, "windspeed_update_time": "2024-01-01 00:00:00",
            "dark": 1, "dark_update_time": "2024-01-01 00:00:00",
            "clouds": 1, "clouds_update_time": "2024-01-01 00:00:00",
            "info_flags": ["dark"],
            "ignored_flags": ["clouds"],
            "current_time": now.to_rfc3339(),
            "weather": {"windgust": 12.5, "int_temperature": 8.0, "int_humidity": 40.0}
        });
        let report = FileConditions::evaluate(&data, now, Duration::from_secs(600)).unwrap();
        assert!(report.bad);
        assert_eq!(report.bad_reasons, vec!["rain".to_string()]);
        assert_eq!(report.windspeed, Some(12.5));
        assert_eq!(report.humidity, Some(40.0));
    }

    #[test]
    fn test_stale_conditions_are_bad() {
        let now = Utc::now();
        let data = json!({
            "rain": 0, "rain_update_time": "2024-01-01 00:00:00",
            "info_flags": [], "ignored_flags": [],
            "current_time": "2024-01-01 00:00:00"
        });
        let report = FileConditions::evaluate(&data, now, Duration::from_secs(600)).unwrap();
        assert_eq!(report.bad_reasons, vec!["age".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_conditions_file_is_an_error() {
        let dir = tempdir().unwrap();
        let source = FileConditions::new(dir.path().join("nope.json"), Duration::from_secs(600));
        assert!(source.report().await.is_err());
    }
}
