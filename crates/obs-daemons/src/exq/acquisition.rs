//! Acquisition state machine for one exposure.
//!
//! ```text
//! init -> mount_dithering -> filters_homing -> filters_homed -> filters_setting
//!      -> filters_set -> mount_tracking -> cameras_exposing -> none
//! ```
//!
//! Each handler either returns the next state or `None` to wait for the next tick. Stages
//! that do not apply are skipped within the same tick. A failed call to a dependency
//! daemon is logged and retried on the next tick; a stage that has not advanced within
//! the stage timeout abandons the exposure.

use chrono::{DateTime, Utc};
use obs_core::capabilities::{Compass, MountStatus};
use obs_core::control::{CameraControl, FilterControl, FilterUnitInfo, MountControl};
use obs_core::exposure::Exposure;
use obs_core::retry::Deadline;
use obs_core::{ObsError, TickContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureState {
    #[default]
    None,
    Init,
    MountDithering,
    FiltersHoming,
    FiltersHomed,
    FiltersSetting,
    FiltersSet,
    MountTracking,
    CamerasExposing,
}

impl std::fmt::Display for ExposureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExposureState::None => "none",
            ExposureState::Init => "init",
            ExposureState::MountDithering => "mount_dithering",
            ExposureState::FiltersHoming => "filters_homing",
            ExposureState::FiltersHomed => "filters_homed",
            ExposureState::FiltersSetting => "filters_setting",
            ExposureState::FiltersSet => "filters_set",
            ExposureState::MountTracking => "mount_tracking",
            ExposureState::CamerasExposing => "cameras_exposing",
        };
        f.write_str(s)
    }
}

/// The daemons an acquisition drives.
#[derive(Clone)]
pub struct AcquisitionControls {
    pub filt: Arc<dyn FilterControl>,
    pub cam: Arc<dyn CameraControl>,
    /// Only needed when dithering.
    pub mnt: Option<Arc<dyn MountControl>>,
}

#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Offsets cycled through for the second and later exposures of a set. Empty disables
    /// dithering.
    pub dither_pattern: Vec<(Compass, f64)>,
    pub stage_timeout: Duration,
    /// How long the mount must have been tracking after a dither before exposing.
    pub mount_settle: Duration,
}

pub struct Acquisition {
    controls: AcquisitionControls,
    settings: AcquisitionSettings,
    state: ExposureState,
    stage: Deadline,
    dithering: bool,
    dither_time: Option<DateTime<Utc>>,
}

impl Acquisition {
    pub fn new(controls: AcquisitionControls, settings: AcquisitionSettings) -> Self {
        let stage = Deadline::new(settings.stage_timeout);
        Self {
            controls,
            settings,
            state: ExposureState::None,
            stage,
            dithering: false,
            dither_time: None,
        }
    }

    pub fn state(&self) -> ExposureState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ExposureState::None
    }

    /// Begin a freshly popped exposure.
    pub fn start(&mut self) {
        self.dithering = false;
        self.dither_time = None;
        self.enter(ExposureState::Init);
    }

    /// Give the current stage a fresh timeout, after the machine was held back.
    pub fn restart_stage(&mut self) {
        self.stage = Deadline::new(self.settings.stage_timeout);
    }

    fn enter(&mut self, state: ExposureState) {
        self.state = state;
        self.stage = Deadline::new(self.settings.stage_timeout);
    }

    /// Advance as far as possible this tick. Returns the states entered, in order.
    pub async fn step(&mut self, exposure: &Exposure, ctx: &mut TickContext) -> Vec<ExposureState> {
        let mut entered = Vec::new();
        loop {
            let next = match self.state {
                ExposureState::None => break,
                ExposureState::Init => self.init(exposure, ctx).await,
                ExposureState::MountDithering => self.mount_dithering(exposure, ctx).await,
                ExposureState::FiltersHoming => self.filters_homing(exposure, ctx).await,
                ExposureState::FiltersHomed => self.filters_homed(exposure, ctx).await,
                ExposureState::FiltersSetting => self.filters_setting(exposure, ctx).await,
                ExposureState::FiltersSet => self.filters_set(ctx).await,
                ExposureState::MountTracking => self.mount_tracking(exposure, ctx).await,
                ExposureState::CamerasExposing => self.cameras_exposing(ctx).await,
            };
            match next {
                Some(state) => {
                    self.enter(state);
                    entered.push(state);
                }
                None => {
                    if self.stage.expired() {
                        error!(
                            state = %self.state,
                            timeout_secs = self.stage.budget().as_secs_f64(),
                            "Exposure stage timed out, abandoning exposure"
                        );
                        self.enter(ExposureState::None);
                        entered.push(ExposureState::None);
                    }
                    break;
                }
            }
        }
        entered
    }

    async fn init(&mut self, exposure: &Exposure, ctx: &mut TickContext) -> Option<ExposureState> {
        self.dithering = false;
        let mnt = match &self.controls.mnt {
            Some(mnt) if !self.settings.dither_pattern.is_empty() && !exposure.is_dark() => {
                Arc::clone(mnt)
            }
            _ => return Some(ExposureState::MountDithering),
        };

        let info = match mnt.mount_info(true).await {
            Ok(info) => info,
            Err(err) => return waiting(ctx, "exq_mount", err),
        };
        if !info.status.can_offset() {
            warn!(status = ?info.status, "Cannot move mount, skipping dither");
        } else if exposure.set_pos > 1 {
            let pattern = &self.settings.dither_pattern;
            let (direction, distance) = pattern[(exposure.set_pos as usize - 2) % pattern.len()];
            info!(%direction, distance, "Offsetting the mount");
            if let Err(err) = mnt.offset(direction, distance).await {
                return waiting(ctx, "exq_mount", err);
            }
            self.dither_time = Some(Utc::now());
            self.dithering = true;
        }
        ctx.clear_failure("exq_mount");
        Some(ExposureState::MountDithering)
    }

    async fn mount_dithering(
        &mut self,
        exposure: &Exposure,
        ctx: &mut TickContext,
    ) -> Option<ExposureState> {
        if exposure.filt.is_none() {
            return Some(ExposureState::FiltersSet);
        }
        let info = self.filter_info(false, ctx).await?;
        let uts = filter_uts(exposure, &info);
        if uts.iter().all(|ut| info.get(ut).is_some_and(|u| u.homed)) {
            return Some(ExposureState::FiltersHomed);
        }
        info!(uts = ?uts, "Homing filter wheels");
        if let Err(err) = self.controls.filt.home_filters(&uts).await {
            return waiting(ctx, "exq_filt", err);
        }
        Some(ExposureState::FiltersHoming)
    }

    async fn filters_homing(
        &mut self,
        exposure: &Exposure,
        ctx: &mut TickContext,
    ) -> Option<ExposureState> {
        let info = self.filter_info(true, ctx).await?;
        let uts = filter_uts(exposure, &info);
        if uts.iter().all(|ut| info.get(ut).is_some_and(|u| u.homed)) {
            info!("Filter wheels homed");
            return Some(ExposureState::FiltersHomed);
        }
        None
    }

    async fn filters_homed(
        &mut self,
        exposure: &Exposure,
        ctx: &mut TickContext,
    ) -> Option<ExposureState> {
        let info = self.filter_info(false, ctx).await?;
        let uts = filter_uts(exposure, &info);
        if filters_match(exposure, &uts, &info) {
            return Some(ExposureState::FiltersSet);
        }
        let filt = exposure.filt.clone().unwrap_or_default();
        info!(filter = %filt, "Setting filter wheels");
        let targets: BTreeMap<u32, String> = uts.iter().map(|&ut| (ut, filt.clone())).collect();
        if let Err(err) = self.controls.filt.set_filters(&targets).await {
            return waiting(ctx, "exq_filt", err);
        }
        Some(ExposureState::FiltersSetting)
    }

    async fn filters_setting(
        &mut self,
        exposure: &Exposure,
        ctx: &mut TickContext,
    ) -> Option<ExposureState> {
        let info = self.filter_info(true, ctx).await?;
        let uts = filter_uts(exposure, &info);
        if filters_match(exposure, &uts, &info) {
            info!("Filter wheels set");
            return Some(ExposureState::FiltersSet);
        }
        None
    }

    async fn filters_set(&mut self, ctx: &mut TickContext) -> Option<ExposureState> {
        if !self.dithering {
            return Some(ExposureState::MountTracking);
        }
        let Some(mnt) = self.controls.mnt.clone() else {
            return Some(ExposureState::MountTracking);
        };
        let info = match mnt.mount_info(true).await {
            Ok(info) => info,
            Err(err) => return waiting(ctx, "exq_mount", err),
        };
        // A tracking status read before the offset started says nothing about the offset
        let settled = match (info.last_move_time, self.dither_time) {
            (Some(moved), Some(dithered)) => {
                info.status == MountStatus::Tracking
                    && moved > dithered
                    && Utc::now() > moved + self.mount_settle()
            }
            _ => false,
        };
        if settled {
            info!("Mount tracking");
            self.dithering = false;
            return Some(ExposureState::MountTracking);
        }
        None
    }

    async fn mount_tracking(
        &mut self,
        exposure: &Exposure,
        ctx: &mut TickContext,
    ) -> Option<ExposureState> {
        let kind = if exposure.glance { "glance" } else { "exposure" };
        info!(uts = ?exposure.uts, "Starting {:.0}s {}", exposure.exptime, kind);
        if let Err(err) = self.controls.cam.take_exposure(exposure).await {
            return waiting(ctx, "exq_cam", err);
        }
        Some(ExposureState::CamerasExposing)
    }

    async fn cameras_exposing(&mut self, ctx: &mut TickContext) -> Option<ExposureState> {
        match self.controls.cam.is_exposing().await {
            Ok(true) => None,
            Ok(false) => {
                info!("Exposure complete");
                ctx.request_check();
                Some(ExposureState::None)
            }
            Err(err) => waiting(ctx, "exq_cam", err),
        }
    }

    async fn filter_info(
        &self,
        force: bool,
        ctx: &mut TickContext,
    ) -> Option<BTreeMap<u32, FilterUnitInfo>> {
        match self.controls.filt.filter_info(force).await {
            Ok(info) => {
                ctx.clear_failure("exq_filt");
                Some(info)
            }
            Err(err) => {
                ctx.log_failure("exq_filt", &err);
                None
            }
        }
    }

    fn mount_settle(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.mount_settle).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

fn waiting(ctx: &mut TickContext, key: &str, err: ObsError) -> Option<ExposureState> {
    ctx.log_failure(key, &err);
    None
}

/// The exposure's UTs that have a filter wheel.
fn filter_uts(exposure: &Exposure, info: &BTreeMap<u32, FilterUnitInfo>) -> Vec<u32> {
    exposure
        .uts
        .iter()
        .copied()
        .filter(|ut| info.contains_key(ut))
        .collect()
}

fn filters_match(exposure: &Exposure, uts: &[u32], info: &BTreeMap<u32, FilterUnitInfo>) -> bool {
    uts.iter().all(|ut| {
        info.get(ut)
            .is_some_and(|u| u.current_filter.is_some() && u.current_filter == exposure.filt)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use obs_core::control::{FilterStatus, MountInfo, Pingable};
    use obs_core::exposure::FrameType;
    use obs_core::ObsResult;
    use parking_lot::Mutex;

    /// Filter daemon stand-in: homing and filter changes complete on the next read.
    #[derive(Default)]
    struct FakeFilters {
        units: Mutex<BTreeMap<u32, FilterUnitInfo>>,
        homes: Mutex<u32>,
        sets: Mutex<u32>,
    }

    impl FakeFilters {
        fn with_uts(uts: &[u32]) -> Self {
            let units = uts
                .iter()
                .map(|&ut| {
                    (
                        ut,
                        FilterUnitInfo {
                            homed: false,
                            current_filter: None,
                            current_filter_num: None,
                            status: FilterStatus::Ready,
                            last_move_time: None,
                        },
                    )
                })
                .collect();
            Self {
                units: Mutex::new(units),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Pingable for FakeFilters {
        async fn ping(&self) -> ObsResult<String> {
            Ok("ping".to_string())
        }
    }

    #[async_trait]
    impl FilterControl for FakeFilters {
        async fn filter_info(&self, _force: bool) -> ObsResult<BTreeMap<u32, FilterUnitInfo>> {
            Ok(self.units.lock().clone())
        }

        async fn home_filters(&self, uts: &[u32]) -> ObsResult<String> {
            *self.homes.lock() += 1;
            let mut units = self.units.lock();
            for ut in uts {
                if let Some(unit) = units.get_mut(ut) {
                    unit.homed = true;
                    unit.current_filter_num = Some(0);
                    unit.current_filter = Some("L".to_string());
                }
            }
            Ok("homing".to_string())
        }

        async fn set_filters(&self, targets: &BTreeMap<u32, String>) -> ObsResult<String> {
            *self.sets.lock() += 1;
            let mut units = self.units.lock();
            for (ut, filt) in targets {
                if let Some(unit) = units.get_mut(ut) {
                    unit.current_filter = Some(filt.clone());
                }
            }
            Ok("setting".to_string())
        }
    }

    /// Camera stand-in: an exposure is reported as running for `polls` reads.
    #[derive(Default)]
    struct FakeCamera {
        taken: Mutex<Vec<Exposure>>,
        polls: Mutex<u32>,
    }

    #[async_trait]
    impl Pingable for FakeCamera {
        async fn ping(&self) -> ObsResult<String> {
            Ok("ping".to_string())
        }
    }

    #[async_trait]
    impl CameraControl for FakeCamera {
        async fn take_exposure(&self, exposure: &Exposure) -> ObsResult<String> {
            self.taken.lock().push(exposure.clone());
            *self.polls.lock() = 2;
            Ok("exposing".to_string())
        }

        async fn is_exposing(&self) -> ObsResult<bool> {
            let mut polls = self.polls.lock();
            if *polls == 0 {
                return Ok(false);
            }
            *polls -= 1;
            Ok(true)
        }
    }

    /// Mount stand-in: an offset completes at once and stamps the move time.
    struct FakeMount {
        info: Mutex<MountInfo>,
        offsets: Mutex<Vec<(Compass, f64)>>,
    }

    impl FakeMount {
        fn new(status: MountStatus) -> Self {
            Self {
                info: Mutex::new(MountInfo {
                    status,
                    last_move_time: None,
                }),
                offsets: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Pingable for FakeMount {
        async fn ping(&self) -> ObsResult<String> {
            Ok("ping".to_string())
        }
    }

    #[async_trait]
    impl MountControl for FakeMount {
        async fn mount_info(&self, _force: bool) -> ObsResult<MountInfo> {
            Ok(self.info.lock().clone())
        }

        async fn offset(&self, direction: Compass, distance: f64) -> ObsResult<String> {
            self.offsets.lock().push((direction, distance));
            self.info.lock().last_move_time = Some(Utc::now() + chrono::Duration::milliseconds(1));
            Ok("offsetting".to_string())
        }
    }

    fn settings(dither: bool) -> AcquisitionSettings {
        AcquisitionSettings {
            dither_pattern: if dither {
                vec![(Compass::N, 1.0), (Compass::E, 1.32)]
            } else {
                Vec::new()
            },
            stage_timeout: Duration::from_secs(5),
            mount_settle: Duration::ZERO,
        }
    }

    async fn run_to_completion(
        acquisition: &mut Acquisition,
        exposure: &Exposure,
    ) -> Vec<ExposureState> {
        let mut ctx = TickContext::new();
        let mut entered = vec![ExposureState::Init];
        acquisition.start();
        for _ in 0..50 {
            entered.extend(acquisition.step(exposure, &mut ctx).await);
            if acquisition.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        entered
    }

    #[tokio::test]
    async fn test_full_sequence_homes_and_sets_filters() {
        let filt = Arc::new(FakeFilters::with_uts(&[1, 2]));
        let cam = Arc::new(FakeCamera::default());
        let controls = AcquisitionControls {
            filt: filt.clone(),
            cam: cam.clone(),
            mnt: Option::None,
        };
        let mut acquisition = Acquisition::new(controls, settings(false));
        let exposure = Exposure::new(vec![1, 2, 3], 30.0, Some("R".to_string()));

        let entered = run_to_completion(&mut acquisition, &exposure).await;
        use ExposureState::*;
        assert_eq!(
            entered,
            vec![
                Init,
                MountDithering,
                FiltersHoming,
                FiltersHomed,
                FiltersSetting,
                FiltersSet,
                MountTracking,
                CamerasExposing,
                None,
            ]
        );
        assert_eq!(*filt.homes.lock(), 1);
        assert_eq!(*filt.sets.lock(), 1);
        assert_eq!(cam.taken.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_dark_skips_filters_and_dither() {
        let filt = Arc::new(FakeFilters::with_uts(&[1]));
        let cam = Arc::new(FakeCamera::default());
        let mnt = Arc::new(FakeMount::new(MountStatus::Tracking));
        let controls = AcquisitionControls {
            filt: filt.clone(),
            cam: cam.clone(),
            mnt: Some(mnt.clone()),
        };
        let mut acquisition = Acquisition::new(controls, settings(true));
        let mut exposure = Exposure::new(vec![1], 10.0, Option::None);
        exposure.frametype = FrameType::Dark;
        exposure.set_pos = 2;

        let entered = run_to_completion(&mut acquisition, &exposure).await;
        assert_eq!(
            &entered[..3],
            &[
                ExposureState::Init,
                ExposureState::MountDithering,
                ExposureState::FiltersSet
            ]
        );
        assert!(!entered.contains(&ExposureState::FiltersHoming));
        assert!(!entered.contains(&ExposureState::FiltersSetting));
        assert_eq!(*filt.homes.lock(), 0);
        assert!(mnt.offsets.lock().is_empty());
    }

    #[tokio::test]
    async fn test_filters_already_set_are_skipped() {
        let filt = Arc::new(FakeFilters::with_uts(&[1]));
        filt.home_filters(&[1]).await.unwrap();
        let cam = Arc::new(FakeCamera::default());
        let controls = AcquisitionControls {
            filt: filt.clone(),
            cam,
            mnt: None,
        };
        let mut acquisition = Acquisition::new(controls, settings(false));
        let exposure = Exposure::new(vec![1], 5.0, Some("L".to_string()));

        let entered = run_to_completion(&mut acquisition, &exposure).await;
        assert!(!entered.contains(&ExposureState::FiltersHoming));
        assert!(!entered.contains(&ExposureState::FiltersSetting));
        assert_eq!(*filt.sets.lock(), 0);
    }

    #[tokio::test]
    async fn test_dither_uses_pattern_and_waits_for_mount() {
        let filt = Arc::new(FakeFilters::with_uts(&[]));
        let cam = Arc::new(FakeCamera::default());
        let mnt = Arc::new(FakeMount::new(MountStatus::Tracking));
        let controls = AcquisitionControls {
            filt,
            cam: cam.clone(),
            mnt: Some(mnt.clone()),
        };
        let mut acquisition = Acquisition::new(controls, settings(true));

        let mut first = Exposure::new(vec![1], 5.0, Option::None);
        first.set_pos = 1;
        run_to_completion(&mut acquisition, &first).await;
        assert!(mnt.offsets.lock().is_empty(), "first exposure of a set is not dithered");

        let mut third = first.clone();
        third.set_pos = 3;
        let entered = run_to_completion(&mut acquisition, &third).await;
        assert_eq!(mnt.offsets.lock().as_slice(), &[(Compass::E, 1.32)]);
        assert!(entered.contains(&ExposureState::MountTracking));
        assert_eq!(cam.taken.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_parked_mount_skips_dither() {
        let filt = Arc::new(FakeFilters::with_uts(&[]));
        let cam = Arc::new(FakeCamera::default());
        let mnt = Arc::new(FakeMount::new(MountStatus::Parked));
        let controls = AcquisitionControls {
            filt,
            cam,
            mnt: Some(mnt.clone()),
        };
        let mut acquisition = Acquisition::new(controls, settings(true));
        let mut exposure = Exposure::new(vec![1], 5.0, Option::None);
        exposure.set_pos = 2;

        let entered = run_to_completion(&mut acquisition, &exposure).await;
        assert!(mnt.offsets.lock().is_empty());
        assert_eq!(entered.last(), Some(&ExposureState::None));
    }

    #[tokio::test]
    async fn test_stalled_stage_is_abandoned() {
        let filt = Arc::new(FakeFilters::with_uts(&[1]));
        let cam = Arc::new(FakeCamera::default());
        let mnt = Arc::new(FakeMount::new(MountStatus::Tracking));
        let controls = AcquisitionControls {
            filt,
            cam: cam.clone(),
            mnt: Some(mnt.clone()),
        };
        let mut settings = settings(true);
        settings.stage_timeout = Duration::from_millis(20);
        // Never settles, so filters_set waits on the mount until the stage times out
        settings.mount_settle = Duration::from_secs(3600);
        let mut acquisition = Acquisition::new(controls, settings);
        let mut exposure = Exposure::new(vec![1], 5.0, Option::None);
        exposure.set_pos = 2;

        let entered = run_to_completion(&mut acquisition, &exposure).await;
        assert!(acquisition.is_idle());
        assert!(!entered.contains(&ExposureState::CamerasExposing));
        assert!(cam.taken.lock().is_empty());
    }

    #[tokio::test]
    async fn test_restarted_stage_gets_full_timeout() {
        let filt = Arc::new(FakeFilters::with_uts(&[1]));
        let cam = Arc::new(FakeCamera::default());
        let mnt = Arc::new(FakeMount::new(MountStatus::Tracking));
        let controls = AcquisitionControls {
            filt,
            cam,
            mnt: Some(mnt),
        };
        let mut settings = settings(true);
        settings.stage_timeout = Duration::from_millis(50);
        settings.mount_settle = Duration::from_secs(3600);
        let mut acquisition = Acquisition::new(controls, settings);
        let mut exposure = Exposure::new(vec![1], 5.0, Option::None);
        exposure.set_pos = 2;

        let mut ctx = TickContext::new();
        acquisition.start();
        acquisition.step(&exposure, &mut ctx).await;
        assert!(!acquisition.is_idle());

        // Held back for longer than the stage timeout, then released
        tokio::time::sleep(Duration::from_millis(80)).await;
        acquisition.restart_stage();
        acquisition.step(&exposure, &mut ctx).await;
        assert!(!acquisition.is_idle());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let entered = acquisition.step(&exposure, &mut ctx).await;
        assert_eq!(entered.last(), Some(&ExposureState::None));
    }
}
