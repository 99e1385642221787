//! Settable conditions feed.

use anyhow::Result;
use async_trait::async_trait;
use obs_core::site::{ConditionsReport, ConditionsSource};
use parking_lot::Mutex;

use crate::faults::Faults;

/// A conditions source whose report is set directly by the test or simulation.
#[derive(Debug)]
pub struct MockConditions {
    report: Mutex<ConditionsReport>,
    faults: Faults,
}

impl MockConditions {
    /// Good conditions, calm and dry.
    pub fn new() -> Self {
        Self {
            report: Mutex::new(ConditionsReport {
                bad: false,
                bad_reasons: Vec::new(),
                windspeed: Some(5.0),
                temperature: Some(10.0),
                humidity: Some(40.0),
            }),
            faults: Faults::none(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Mark conditions bad for the given reasons, or good if `reasons` is empty.
    pub fn set_bad(&self, reasons: &[&str]) {
        let mut report = self.report.lock();
        report.bad_reasons = reasons.iter().map(|r| r.to_string()).collect();
        report.bad = !report.bad_reasons.is_empty();
    }

    pub fn set_weather(&self, windspeed: f64, temperature: f64, humidity: f64) {
        let mut report = self.report.lock();
        report.windspeed = Some(windspeed);
        report.temperature = Some(temperature);
        report.humidity = Some(humidity);
    }
}

impl Default for MockConditions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConditionsSource for MockConditions {
    async fn report(&self) -> Result<ConditionsReport> {
        self.faults.check("conditions", "report")?;
        Ok(self.report.lock().clone())
    }
}
