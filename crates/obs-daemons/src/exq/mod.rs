//! Exposure queue daemon.
//!
//! Holds a persisted FIFO of exposures and runs them one at a time through the
//! [`Acquisition`] state machine, which drives the filter, mount and camera daemons through
//! the control traits in `obs_core::control`. The daemon starts paused; pausing only stops
//! the next pop, never the exposure in flight.

mod acquisition;
mod worker;

pub use acquisition::{Acquisition, AcquisitionControls, AcquisitionSettings, ExposureState};

use obs_core::capabilities::Compass;
use obs_core::config::ObsConfig;
use obs_core::control::{CameraControl, FilterControl, MountControl};
use obs_core::dependencies::DependencyMonitor;
use obs_core::exposure::{clean_field, Exposure, ExposureQueue, FrameType, SetCounter};
use obs_core::{DaemonCore, LoopTiming, ObsError, ObsResult, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use worker::ExqWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Paused,
    Working,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExqInfo {
    pub status: QueueStatus,
    pub queue_length: usize,
    pub exposing: bool,
    pub current_exposure: Option<Exposure>,
    pub exposure_state: ExposureState,
    pub latest_set_number: u64,
    pub dependency_error: bool,
}

/// Parameters of an `add` call, as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRequest {
    pub uts: Vec<u32>,
    pub exptime: f64,
    #[serde(default = "default_nexp")]
    pub nexp: u32,
    #[serde(default)]
    pub filt: Option<String>,
    #[serde(default = "default_binning")]
    pub binning: u32,
    #[serde(default = "default_frametype")]
    pub frametype: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_imgtype")]
    pub imgtype: String,
    #[serde(default)]
    pub glance: bool,
    #[serde(default)]
    pub db_id: Option<i64>,
}

fn default_nexp() -> u32 {
    1
}

fn default_binning() -> u32 {
    1
}

fn default_frametype() -> String {
    "normal".to_string()
}

fn default_target() -> String {
    "NA".to_string()
}

fn default_imgtype() -> String {
    "SCIENCE".to_string()
}

impl ExposureRequest {
    pub fn new(uts: Vec<u32>, exptime: f64, filt: Option<&str>) -> Self {
        Self {
            uts,
            exptime,
            nexp: default_nexp(),
            filt: filt.map(String::from),
            binning: default_binning(),
            frametype: default_frametype(),
            target: default_target(),
            imgtype: default_imgtype(),
            glance: false,
            db_id: None,
        }
    }
}

/// Exposure queue parameters with files and units resolved.
#[derive(Debug, Clone)]
pub struct ExqSettings {
    /// UTs with cameras and the filters each can use. An empty list means no filter wheel.
    pub ut_filters: BTreeMap<u32, Vec<String>>,
    pub dithering: bool,
    pub dither_pattern: Vec<(Compass, f64)>,
    pub stage_timeout: Duration,
    pub dependency_grace: Duration,
    pub queue_file: PathBuf,
    pub set_number_file: PathBuf,
}

impl ExqSettings {
    pub fn from_config(config: &ObsConfig) -> Self {
        Self {
            ut_filters: config.ut_filters(),
            dithering: config.exq.dithering,
            dither_pattern: config.exq.dither_pattern.clone(),
            stage_timeout: Duration::from_secs(config.exq.stage_timeout_secs),
            dependency_grace: Duration::from_secs(config.exq.dependency_grace_secs),
            queue_file: config.paths.queue_file(),
            set_number_file: config.paths.set_number_file(),
        }
    }
}

/// Handles to the daemons the queue drives.
#[derive(Clone)]
pub struct ExqDependencies {
    pub filt: Arc<dyn FilterControl>,
    pub cam: Arc<dyn CameraControl>,
    pub mnt: Arc<dyn MountControl>,
}

#[derive(Clone)]
pub struct ExqDaemon {
    core: Arc<DaemonCore<ExqInfo>>,
    queue: Arc<ExposureQueue>,
    paused: Arc<AtomicBool>,
    sets: Arc<SetCounter>,
    ut_filters: Arc<BTreeMap<u32, Vec<String>>>,
}

impl ExqDaemon {
    /// Load the persisted queue and start the worker.
    ///
    /// The mount is only a dependency when dithering is enabled.
    pub fn start(
        settings: ExqSettings,
        deps: ExqDependencies,
        timing: LoopTiming,
    ) -> ObsResult<(Self, JoinHandle<()>)> {
        let queue = Arc::new(ExposureQueue::load(&settings.queue_file)?);
        if !queue.is_empty() {
            info!(items = queue.len(), "Loaded exposure queue");
        }
        let sets = Arc::new(SetCounter::new(&settings.set_number_file));
        let paused = Arc::new(AtomicBool::new(true));

        let mut monitor = DependencyMonitor::new(settings.dependency_grace)
            .with("cam", Arc::new(Arc::clone(&deps.cam)))
            .with("filt", Arc::new(Arc::clone(&deps.filt)));
        let mnt = if settings.dithering {
            monitor = monitor.with("mnt", Arc::new(Arc::clone(&deps.mnt)));
            Some(deps.mnt)
        } else {
            None
        };

        let acquisition = Acquisition::new(
            AcquisitionControls {
                filt: deps.filt,
                cam: deps.cam,
                mnt,
            },
            AcquisitionSettings {
                dither_pattern: if settings.dithering {
                    settings.dither_pattern.clone()
                } else {
                    Vec::new()
                },
                stage_timeout: settings.stage_timeout,
                mount_settle: timing.tick,
            },
        );

        let latest_set_number = sets.latest()?;
        let worker = ExqWorker {
            queue: Arc::clone(&queue),
            paused: Arc::clone(&paused),
            sets: Arc::clone(&sets),
            deps: monitor,
            acquisition,
            current: None,
            latest_set_number,
            last_status: None,
            held: false,
        };
        let core = DaemonCore::new("exq", timing);
        let handle = core.spawn(worker);
        Ok((
            Self {
                core,
                queue,
                paused,
                sets,
                ut_filters: Arc::new(settings.ut_filters),
            },
            handle,
        ))
    }

    pub fn core(&self) -> &Arc<DaemonCore<ExqInfo>> {
        &self.core
    }

    pub async fn get_info(&self, force_update: bool) -> ObsResult<Arc<Snapshot<ExqInfo>>> {
        self.core.get_info(force_update).await
    }

    /// Fail fast while any dependency is marked bad.
    fn check_dependencies(&self) -> ObsResult<()> {
        let Some(snapshot) = self.core.latest() else {
            return Ok(());
        };
        let bad = &snapshot.health.bad_dependencies;
        if bad.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = bad.iter().map(String::as_str).collect();
        Err(ObsError::Dependency(format!(
            "Dependencies are not running: {}",
            ids.join(", ")
        )))
    }

    /// Validate a request and append its exposures as one new set.
    pub fn add(&self, request: ExposureRequest) -> ObsResult<String> {
        self.check_dependencies()?;

        let known: Vec<u32> = self.ut_filters.keys().copied().collect();
        if let Some(ut) = request.uts.iter().find(|ut| !self.ut_filters.contains_key(ut)) {
            return Err(ObsError::InvalidArgument(format!(
                "Unit telescope ID {} not in list {:?}",
                ut, known
            )));
        }
        if request.uts.is_empty() {
            return Err(ObsError::InvalidArgument(format!(
                "No unit telescopes given, must be from {:?}",
                known
            )));
        }
        if !(request.exptime.is_finite() && request.exptime >= 0.0) {
            return Err(ObsError::InvalidArgument(
                "Exposure time must be >= 0".to_string(),
            ));
        }
        if request.nexp < 1 {
            return Err(ObsError::InvalidArgument(
                "Number of exposures must be >= 1".to_string(),
            ));
        }
        if request.binning < 1 {
            return Err(ObsError::InvalidArgument(
                "Binning factor must be a positive integer".to_string(),
            ));
        }
        let frametype: FrameType = request.frametype.parse()?;

        let filt = request.filt.filter(|f| f != "X");
        let mut uts = request.uts.clone();
        uts.sort_unstable();
        uts.dedup();
        if let Some(filt) = &filt {
            // UTs that cannot use the filter are dropped rather than refused
            uts.retain(|ut| {
                self.ut_filters
                    .get(ut)
                    .is_some_and(|filters| filters.iter().any(|f| f == filt))
            });
            if uts.is_empty() {
                return Err(ObsError::InvalidArgument(format!("Unknown filter: {}", filt)));
            }
        }

        let target = clean_field(&request.target);
        let imgtype = clean_field(&request.imgtype).to_uppercase();
        // Queue order follows set order
        let (set_num, length) = self.sets.next_with(|set_num| {
            let exposures: Vec<Exposure> = (1..=request.nexp)
                .map(|set_pos| Exposure {
                    uts: uts.clone(),
                    exptime: request.exptime,
                    filt: filt.clone(),
                    binning: request.binning,
                    frametype,
                    target: target.clone(),
                    imgtype: imgtype.clone(),
                    glance: request.glance,
                    set_num: Some(set_num),
                    set_pos,
                    set_tot: request.nexp,
                    db_id: request.db_id,
                })
                .collect();
            Ok((set_num, self.queue.extend(exposures)?))
        })?;
        self.core.request_check();

        let kind = if request.glance { "glance" } else { "exposure" };
        let filt_name = filt.as_deref().unwrap_or("X");
        info!(
            set_num,
            nexp = request.nexp,
            "Added {:.0}s {} {}, now {} in queue",
            request.exptime,
            filt_name,
            kind,
            length
        );

        let mut ack = format!(
            "Added {}{:.0}s {} {}{}, now {} items in queue",
            if request.nexp > 1 {
                format!("{}x ", request.nexp)
            } else {
                String::new()
            },
            request.exptime,
            filt_name,
            kind,
            if request.nexp > 1 { "s" } else { "" },
            length
        );
        if self.paused.load(Ordering::SeqCst) {
            ack.push_str(" [paused]");
        }
        Ok(ack)
    }

    pub fn clear(&self) -> ObsResult<String> {
        self.check_dependencies()?;
        let count = self.queue.len();
        self.queue.clear()?;
        self.core.request_check();
        info!(count, "Cleared items from queue");
        Ok("Queue cleared".to_string())
    }

    /// Readable listing of the queue.
    pub fn get(&self) -> ObsResult<String> {
        self.check_dependencies()?;
        Ok(self.queue.get())
    }

    pub fn get_simple(&self) -> ObsResult<String> {
        self.check_dependencies()?;
        Ok(self.queue.get_simple())
    }

    pub fn pause(&self) -> ObsResult<String> {
        self.check_dependencies()?;
        if self.paused.swap(true, Ordering::SeqCst) {
            return Ok("Queue already paused".to_string());
        }
        self.core.request_check();
        info!("Pausing queue");
        Ok("Queue paused".to_string())
    }

    pub fn resume(&self) -> ObsResult<String> {
        self.check_dependencies()?;
        if !self.paused.swap(false, Ordering::SeqCst) {
            return Ok("Queue already resumed".to_string());
        }
        self.core.request_check();
        info!("Resuming queue");
        Ok("Queue resumed".to_string())
    }
}
