//! Camera daemon.
//!
//! Starts exposures on the cameras of the requested unit telescopes and reports their
//! state. Readout and file handling happen in the camera hardware interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use obs_core::adapter::AdapterSlot;
use obs_core::capabilities::{CameraState, CameraUnit};
use obs_core::control::{CameraControl, Pingable};
use obs_core::exposure::Exposure;
use obs_core::{DaemonCore, LoopTiming, ObsError, ObsResult, Snapshot, TickContext, Worker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub status: CameraState,
    pub exposing: bool,
    /// Exposures started since the daemon came up.
    pub exposure_count: u64,
    pub last_exposure_start: Option<DateTime<Utc>>,
}

pub type CamInfo = BTreeMap<u32, CameraInfo>;

pub struct CameraSlot {
    pub ut: u32,
    pub camera: AdapterSlot<dyn CameraUnit>,
}

impl CameraSlot {
    pub fn new(ut: u32, camera: Arc<dyn CameraUnit>) -> Self {
        Self {
            ut,
            camera: AdapterSlot::fixed(camera_name(ut), camera),
        }
    }
}

fn camera_name(ut: u32) -> String {
    format!("cam{}", ut)
}

#[derive(Debug, Default)]
struct CamCommands {
    exposure: Option<Exposure>,
    abort: BTreeSet<u32>,
}

#[derive(Clone)]
pub struct CamDaemon {
    core: Arc<DaemonCore<CamInfo>>,
    mailbox: Arc<Mutex<CamCommands>>,
    uts: Arc<Vec<u32>>,
}

impl CamDaemon {
    pub fn start(cameras: Vec<CameraSlot>, timing: LoopTiming) -> (Self, JoinHandle<()>) {
        let uts = cameras.iter().map(|c| c.ut).collect();
        let mailbox = Arc::new(Mutex::new(CamCommands::default()));
        let worker = CamWorker {
            cameras,
            mailbox: Arc::clone(&mailbox),
            counts: BTreeMap::new(),
            last_start: BTreeMap::new(),
        };
        let core = DaemonCore::new("cam", timing);
        let handle = core.spawn(worker);
        (
            Self {
                core,
                mailbox,
                uts: Arc::new(uts),
            },
            handle,
        )
    }

    pub fn core(&self) -> &Arc<DaemonCore<CamInfo>> {
        &self.core
    }

    pub async fn get_info(&self, force_update: bool) -> ObsResult<Arc<Snapshot<CamInfo>>> {
        self.core.get_info(force_update).await
    }

    fn check_uts(&self, uts: &[u32]) -> ObsResult<()> {
        if uts.is_empty() {
            return Err(ObsError::InvalidArgument("No unit telescopes given".to_string()));
        }
        if let Some(ut) = uts.iter().find(|ut| !self.uts.contains(ut)) {
            return Err(ObsError::InvalidArgument(format!(
                "Unit telescope ID {} not in list {:?}",
                ut, self.uts
            )));
        }
        Ok(())
    }

    fn check_connected(snapshot: &Snapshot<CamInfo>, ut: u32) -> ObsResult<&CameraInfo> {
        if snapshot.health.bad_hardware.contains(&camera_name(ut)) {
            return Err(ObsError::HardwareStatus(format!(
                "Cannot connect to camera {}",
                ut
            )));
        }
        snapshot
            .info
            .get(&ut)
            .ok_or_else(|| ObsError::HardwareStatus(format!("Camera {} status unknown", ut)))
    }

    /// Start an exposure on every camera the exposure names.
    pub async fn take_exposure(&self, exposure: &Exposure) -> ObsResult<String> {
        self.check_uts(&exposure.uts)?;
        if !(exposure.exptime.is_finite() && exposure.exptime >= 0.0) {
            return Err(ObsError::InvalidArgument(
                "Exposure time must be >= 0".to_string(),
            ));
        }
        if self.mailbox.lock().exposure.is_some() {
            return Err(ObsError::HardwareStatus(
                "Cameras are already exposing".to_string(),
            ));
        }
        let snapshot = self.core.get_info(true).await?;
        for &ut in &exposure.uts {
            if Self::check_connected(&snapshot, ut)?.status.is_busy() {
                return Err(ObsError::HardwareStatus(format!(
                    "Camera {} is already exposing",
                    ut
                )));
            }
        }

        let mut mailbox = self.mailbox.lock();
        if mailbox.exposure.is_some() {
            return Err(ObsError::HardwareStatus(
                "Cameras are already exposing".to_string(),
            ));
        }
        mailbox.exposure = Some(exposure.clone());
        Ok(format!(
            "Taking {:.1}s {} exposure on cameras {:?}",
            exposure.exptime,
            if exposure.is_dark() { "dark" } else { "normal" },
            exposure.uts
        ))
    }

    pub async fn abort_exposure(&self, uts: &[u32]) -> ObsResult<String> {
        self.check_uts(uts)?;
        let mut mailbox = self.mailbox.lock();
        if let Some(pending) = &mut mailbox.exposure {
            pending.uts.retain(|ut| !uts.contains(ut));
            if pending.uts.is_empty() {
                mailbox.exposure = None;
            }
        }
        mailbox.abort.extend(uts.iter().copied());
        Ok(uts
            .iter()
            .map(|ut| format!("Camera {}: Aborting exposure", ut))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    pub async fn is_exposing(&self) -> ObsResult<bool> {
        if self.mailbox.lock().exposure.is_some() {
            return Ok(true);
        }
        let snapshot = self.core.get_info(true).await?;
        for &ut in self.uts.iter() {
            if Self::check_connected(&snapshot, ut)?.exposing {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl Pingable for CamDaemon {
    async fn ping(&self) -> ObsResult<String> {
        self.core.ping()
    }
}

#[async_trait]
impl CameraControl for CamDaemon {
    async fn take_exposure(&self, exposure: &Exposure) -> ObsResult<String> {
        CamDaemon::take_exposure(self, exposure).await
    }

    async fn is_exposing(&self) -> ObsResult<bool> {
        CamDaemon::is_exposing(self).await
    }
}

struct CamWorker {
    cameras: Vec<CameraSlot>,
    mailbox: Arc<Mutex<CamCommands>>,
    counts: BTreeMap<u32, u64>,
    last_start: BTreeMap<u32, DateTime<Utc>>,
}

#[async_trait]
impl Worker for CamWorker {
    type Info = CamInfo;

    async fn sync(&mut self, ctx: &mut TickContext) -> CamInfo {
        let mut info = CamInfo::new();
        for slot in &mut self.cameras {
            if let Some(status) = slot
                .camera
                .call(ctx, |c| async move { c.state().await }.boxed())
                .await
            {
                info.insert(
                    slot.ut,
                    CameraInfo {
                        status,
                        exposing: status.is_busy(),
                        exposure_count: self.counts.get(&slot.ut).copied().unwrap_or(0),
                        last_exposure_start: self.last_start.get(&slot.ut).copied(),
                    },
                );
            }
        }
        info
    }

    async fn execute(&mut self, ctx: &mut TickContext) {
        let commands = std::mem::take(&mut *self.mailbox.lock());

        for slot in &mut self.cameras {
            if commands.abort.contains(&slot.ut) {
                warn!(ut = slot.ut, "Aborting exposure");
                slot.camera
                    .call(ctx, |c| async move { c.abort().await }.boxed())
                    .await;
                ctx.request_check();
            }
        }

        let Some(exposure) = commands.exposure else {
            return;
        };
        let exptime = Duration::from_secs_f64(exposure.exptime);
        let binning = exposure.binning;
        let dark = exposure.is_dark();
        info!(
            uts = ?exposure.uts,
            exptime = exposure.exptime,
            binning,
            dark,
            "Starting exposure"
        );
        for slot in &mut self.cameras {
            if !exposure.uts.contains(&slot.ut) {
                continue;
            }
            let started = slot
                .camera
                .call(ctx, move |c| {
                    async move { c.start_exposure(exptime, binning, dark).await }.boxed()
                })
                .await;
            if started.is_some() {
                *self.counts.entry(slot.ut).or_default() += 1;
                self.last_start.insert(slot.ut, ctx.now());
            }
        }
        ctx.request_check();
    }
}
