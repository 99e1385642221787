//! Mount daemon.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use obs_core::adapter::AdapterSlot;
use obs_core::capabilities::{Compass, MountStatus, MountUnit};
use obs_core::control::{MountControl, MountInfo, Pingable};
use obs_core::{DaemonCore, LoopTiming, ObsError, ObsResult, Snapshot, TickContext, Worker};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const MOUNT: &str = "mount";

#[derive(Debug, Clone, Copy, PartialEq)]
enum MountMotion {
    Offset(Compass, f64),
    Track,
    Park,
}

#[derive(Debug, Default)]
struct MntCommands {
    halt: bool,
    motion: Option<MountMotion>,
}

#[derive(Clone)]
pub struct MntDaemon {
    core: Arc<DaemonCore<MountInfo>>,
    mailbox: Arc<Mutex<MntCommands>>,
}

impl MntDaemon {
    pub fn start(mount: Arc<dyn MountUnit>, timing: LoopTiming) -> (Self, JoinHandle<()>) {
        let mailbox = Arc::new(Mutex::new(MntCommands::default()));
        let worker = MntWorker {
            mount: AdapterSlot::fixed(MOUNT, mount),
            mailbox: Arc::clone(&mailbox),
            last_status: None,
            last_move: None,
        };
        let core = DaemonCore::new("mnt", timing);
        let handle = core.spawn(worker);
        (Self { core, mailbox }, handle)
    }

    pub fn core(&self) -> &Arc<DaemonCore<MountInfo>> {
        &self.core
    }

    pub async fn get_info(&self, force_update: bool) -> ObsResult<Arc<Snapshot<MountInfo>>> {
        self.core.get_info(force_update).await
    }

    async fn current_status(&self) -> ObsResult<MountStatus> {
        let snapshot = self.core.get_info(true).await?;
        if snapshot.health.bad_hardware.contains(MOUNT) {
            return Err(ObsError::HardwareStatus("Cannot connect to mount".to_string()));
        }
        Ok(snapshot.info.status)
    }

    fn queue(&self, motion: MountMotion) -> ObsResult<()> {
        let mut mailbox = self.mailbox.lock();
        if mailbox.motion.is_some() {
            return Err(ObsError::HardwareStatus(
                "Mount already has a command pending".to_string(),
            ));
        }
        mailbox.motion = Some(motion);
        Ok(())
    }

    /// Small offset of `distance` arcseconds from the current pointing.
    pub async fn offset(&self, direction: Compass, distance: f64) -> ObsResult<String> {
        if !(distance.is_finite() && distance > 0.0) {
            return Err(ObsError::InvalidArgument(
                "Offset distance must be > 0".to_string(),
            ));
        }
        let status = self.current_status().await?;
        if !status.can_offset() {
            return Err(ObsError::HardwareStatus(format!(
                "Mount cannot offset while {:?}",
                status
            )));
        }
        self.queue(MountMotion::Offset(direction, distance))?;
        Ok(format!("Offsetting {} by {:.2} arcsec", direction, distance))
    }

    pub async fn track(&self) -> ObsResult<String> {
        match self.current_status().await? {
            MountStatus::Tracking => Ok("Mount is already tracking".to_string()),
            MountStatus::MotorsOff => Err(ObsError::HardwareStatus(
                "Mount motors are off".to_string(),
            )),
            _ => {
                self.queue(MountMotion::Track)?;
                Ok("Starting tracking".to_string())
            }
        }
    }

    pub async fn park(&self) -> ObsResult<String> {
        match self.current_status().await? {
            MountStatus::Parked => Ok("Mount is already parked".to_string()),
            _ => {
                self.queue(MountMotion::Park)?;
                Ok("Parking mount".to_string())
            }
        }
    }

    /// Stop all motion. Drops any motion still waiting in the mailbox.
    pub fn halt(&self) -> String {
        let mut mailbox = self.mailbox.lock();
        mailbox.halt = true;
        mailbox.motion = None;
        "Halting mount".to_string()
    }
}

#[async_trait]
impl Pingable for MntDaemon {
    async fn ping(&self) -> ObsResult<String> {
        self.core.ping()
    }
}

#[async_trait]
impl MountControl for MntDaemon {
    async fn mount_info(&self, force_update: bool) -> ObsResult<MountInfo> {
        let snapshot = self.core.get_info(force_update).await?;
        if snapshot.health.bad_hardware.contains(MOUNT) {
            return Err(ObsError::HardwareStatus("Cannot connect to mount".to_string()));
        }
        Ok(snapshot.info.clone())
    }

    async fn offset(&self, direction: Compass, distance: f64) -> ObsResult<String> {
        MntDaemon::offset(self, direction, distance).await
    }
}

struct MntWorker {
    mount: AdapterSlot<dyn MountUnit>,
    mailbox: Arc<Mutex<MntCommands>>,
    last_status: Option<MountStatus>,
    last_move: Option<DateTime<Utc>>,
}

#[async_trait]
impl Worker for MntWorker {
    type Info = MountInfo;

    async fn sync(&mut self, ctx: &mut TickContext) -> MountInfo {
        if let Some(status) = self
            .mount
            .call(ctx, |m| async move { m.status().await }.boxed())
            .await
        {
            // A finished slew counts as the end of the move
            if self.last_status == Some(MountStatus::Slewing) && status != MountStatus::Slewing {
                self.last_move = Some(ctx.now());
            }
            self.last_status = Some(status);
        }
        MountInfo {
            status: self.last_status.unwrap_or(MountStatus::Stopped),
            last_move_time: self.last_move,
        }
    }

    async fn execute(&mut self, ctx: &mut TickContext) {
        let commands = std::mem::take(&mut *self.mailbox.lock());
        if commands.halt {
            if let Some(dropped) = commands.motion {
                warn!(?dropped, "Dropping mount command in favour of halt");
            }
            info!("Halting mount");
            self.mount
                .call(ctx, |m| async move { m.halt().await }.boxed())
                .await;
            self.last_move = Some(ctx.now());
            ctx.request_check();
            return;
        }

        let Some(motion) = commands.motion else {
            return;
        };
        let issued = match motion {
            MountMotion::Offset(direction, distance) => {
                info!(%direction, distance, "Offsetting mount");
                self.mount
                    .call(ctx, move |m| {
                        async move { m.offset(direction, distance).await }.boxed()
                    })
                    .await
            }
            MountMotion::Track => {
                info!("Starting tracking");
                self.mount
                    .call(ctx, |m| async move { m.track().await }.boxed())
                    .await
            }
            MountMotion::Park => {
                info!("Parking mount");
                self.mount
                    .call(ctx, |m| async move { m.park().await }.boxed())
                    .await
            }
        };
        if issued.is_some() {
            self.last_move = Some(ctx.now());
        }
        ctx.request_check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obs_core::retry::retry_until;
    use obs_driver_mock::MockMount;
    use std::time::Duration;

    async fn wait_status(daemon: &MntDaemon, status: MountStatus) {
        retry_until(
            Duration::from_secs(2),
            Duration::from_millis(5),
            "mount status",
            || async { ObsResult::Ok((daemon.mount_info(true).await?.status == status).then_some(())) },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_offset_then_park() {
        let mount = Arc::new(MockMount::new());
        let (daemon, _handle) =
            MntDaemon::start(Arc::clone(&mount) as Arc<dyn MountUnit>, LoopTiming::fast());

        let ack = daemon.offset(Compass::E, 1.32).await.unwrap();
        assert_eq!(ack, "Offsetting E by 1.32 arcsec");
        retry_until(
            Duration::from_secs(2),
            Duration::from_millis(5),
            "offset issued",
            || async { ObsResult::Ok((!mount.offsets().is_empty()).then_some(())) },
        )
        .await
        .unwrap();
        assert_eq!(mount.offsets(), vec![(Compass::E, 1.32)]);
        wait_status(&daemon, MountStatus::Tracking).await;

        assert_eq!(daemon.park().await.unwrap(), "Parking mount");
        wait_status(&daemon, MountStatus::Parked).await;
        assert_eq!(daemon.park().await.unwrap(), "Mount is already parked");

        let err = daemon.offset(Compass::N, 5.0).await.unwrap_err();
        assert!(matches!(err, ObsError::HardwareStatus(_)));
        let info = daemon.mount_info(false).await.unwrap();
        assert!(info.last_move_time.is_some());
        daemon.core().shutdown();
    }

    #[tokio::test]
    async fn test_halt_and_invalid_offset() {
        let mount = Arc::new(MockMount::new());
        let (daemon, _handle) =
            MntDaemon::start(Arc::clone(&mount) as Arc<dyn MountUnit>, LoopTiming::fast());

        let err = daemon.offset(Compass::W, 0.0).await.unwrap_err();
        assert!(matches!(err, ObsError::InvalidArgument(_)));

        assert_eq!(daemon.halt(), "Halting mount");
        wait_status(&daemon, MountStatus::Stopped).await;
        assert_eq!(daemon.track().await.unwrap(), "Starting tracking");
        wait_status(&daemon, MountStatus::Tracking).await;
        daemon.core().shutdown();
    }
}
