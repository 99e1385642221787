//! Filter wheel daemon.
//!
//! One wheel per unit telescope. Wheels must be homed before they can change filter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use obs_core::adapter::AdapterSlot;
use obs_core::capabilities::FilterWheel;
use obs_core::control::{FilterControl, FilterStatus, FilterUnitInfo, Pingable};
use obs_core::{DaemonCore, LoopTiming, ObsError, ObsResult, Snapshot, TickContext, Worker};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Per-UT status published by the filter daemon.
pub type FiltInfo = BTreeMap<u32, FilterUnitInfo>;

/// A wheel and the filters in its slots, in slot order.
pub struct FilterUnit {
    pub ut: u32,
    pub filters: Vec<String>,
    pub wheel: AdapterSlot<dyn FilterWheel>,
}

impl FilterUnit {
    pub fn new(ut: u32, filters: Vec<String>, wheel: Arc<dyn FilterWheel>) -> Self {
        Self {
            ut,
            filters,
            wheel: AdapterSlot::fixed(wheel_name(ut), wheel),
        }
    }
}

fn wheel_name(ut: u32) -> String {
    format!("filt{}", ut)
}

#[derive(Debug, Default)]
struct FiltCommands {
    home: BTreeSet<u32>,
    /// Target slot per UT.
    set: BTreeMap<u32, usize>,
}

impl FiltCommands {
    fn pending(&self, ut: u32) -> bool {
        self.home.contains(&ut) || self.set.contains_key(&ut)
    }
}

#[derive(Clone)]
pub struct FiltDaemon {
    core: Arc<DaemonCore<FiltInfo>>,
    mailbox: Arc<Mutex<FiltCommands>>,
    filters: Arc<BTreeMap<u32, Vec<String>>>,
}

impl FiltDaemon {
    pub fn start(units: Vec<FilterUnit>, timing: LoopTiming) -> (Self, JoinHandle<()>) {
        let filters = units
            .iter()
            .map(|u| (u.ut, u.filters.clone()))
            .collect::<BTreeMap<_, _>>();
        let mailbox = Arc::new(Mutex::new(FiltCommands::default()));
        let worker = FiltWorker {
            units,
            mailbox: Arc::clone(&mailbox),
            last_move: BTreeMap::new(),
        };
        let core = DaemonCore::new("filt", timing);
        let handle = core.spawn(worker);
        (
            Self {
                core,
                mailbox,
                filters: Arc::new(filters),
            },
            handle,
        )
    }

    pub fn core(&self) -> &Arc<DaemonCore<FiltInfo>> {
        &self.core
    }

    pub async fn get_info(&self, force_update: bool) -> ObsResult<Arc<Snapshot<FiltInfo>>> {
        self.core.get_info(force_update).await
    }

    fn check_uts(&self, uts: impl IntoIterator<Item = u32>) -> ObsResult<()> {
        for ut in uts {
            if !self.filters.contains_key(&ut) {
                let known: Vec<u32> = self.filters.keys().copied().collect();
                return Err(ObsError::InvalidArgument(format!(
                    "Unit telescope ID {} not in list {:?}",
                    ut, known
                )));
            }
        }
        Ok(())
    }

    /// Reject UTs whose wheel is unreadable, moving or already has a command pending.
    fn check_ready(&self, snapshot: &Snapshot<FiltInfo>, ut: u32) -> ObsResult<()> {
        if snapshot.health.bad_hardware.contains(&wheel_name(ut)) {
            return Err(ObsError::HardwareStatus(format!(
                "Cannot connect to filter wheel {}",
                ut
            )));
        }
        match snapshot.info.get(&ut) {
            None => Err(ObsError::HardwareStatus(format!(
                "Filter wheel {} status unknown",
                ut
            ))),
            Some(unit) if unit.status == FilterStatus::Moving => Err(ObsError::HardwareStatus(
                format!("Filter wheel {} is moving", ut),
            )),
            Some(_) if self.mailbox.lock().pending(ut) => Err(ObsError::HardwareStatus(format!(
                "Filter wheel {} already has a command pending",
                ut
            ))),
            Some(_) => Ok(()),
        }
    }

    pub async fn home_filters(&self, uts: &[u32]) -> ObsResult<String> {
        if uts.is_empty() {
            return Err(ObsError::InvalidArgument("No unit telescopes given".to_string()));
        }
        self.check_uts(uts.iter().copied())?;
        let snapshot = self.core.get_info(true).await?;
        for &ut in uts {
            self.check_ready(&snapshot, ut)?;
        }

        let mut mailbox = self.mailbox.lock();
        let mut lines = Vec::new();
        for &ut in uts {
            mailbox.home.insert(ut);
            lines.push(format!("Filter wheel {}: Moving to home position", ut));
        }
        Ok(lines.join("\n"))
    }

    pub async fn set_filters(&self, targets: &BTreeMap<u32, String>) -> ObsResult<String> {
        if targets.is_empty() {
            return Err(ObsError::InvalidArgument("No unit telescopes given".to_string()));
        }
        self.check_uts(targets.keys().copied())?;
        let mut slots = BTreeMap::new();
        for (&ut, filt) in targets {
            let filters = self.filters.get(&ut).map(Vec::as_slice).unwrap_or_default();
            let Some(slot) = filters.iter().position(|f| f == filt) else {
                return Err(ObsError::InvalidArgument(format!(
                    "Filter {} not in list {:?} for UT {}",
                    filt, filters, ut
                )));
            };
            slots.insert(ut, slot);
        }

        let snapshot = self.core.get_info(true).await?;
        for &ut in targets.keys() {
            self.check_ready(&snapshot, ut)?;
            if !snapshot.info.get(&ut).is_some_and(|u| u.homed) {
                return Err(ObsError::HardwareStatus(format!(
                    "Filter wheel {} not homed",
                    ut
                )));
            }
        }

        let mut mailbox = self.mailbox.lock();
        let mut lines = Vec::new();
        for (ut, slot) in slots {
            mailbox.set.insert(ut, slot);
            lines.push(format!("Filter wheel {}: Changing filter to {}", ut, targets[&ut]));
        }
        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl Pingable for FiltDaemon {
    async fn ping(&self) -> ObsResult<String> {
        self.core.ping()
    }
}

#[async_trait]
impl FilterControl for FiltDaemon {
    async fn filter_info(&self, force_update: bool) -> ObsResult<BTreeMap<u32, FilterUnitInfo>> {
        let snapshot = self.core.get_info(force_update).await?;
        if let Some(bad) = snapshot.health.bad_hardware.iter().next() {
            return Err(ObsError::HardwareStatus(format!("Cannot connect to {}", bad)));
        }
        Ok(snapshot.info.clone())
    }

    async fn home_filters(&self, uts: &[u32]) -> ObsResult<String> {
        FiltDaemon::home_filters(self, uts).await
    }

    async fn set_filters(&self, targets: &BTreeMap<u32, String>) -> ObsResult<String> {
        FiltDaemon::set_filters(self, targets).await
    }
}

struct FiltWorker {
    units: Vec<FilterUnit>,
    mailbox: Arc<Mutex<FiltCommands>>,
    last_move: BTreeMap<u32, DateTime<Utc>>,
}

#[async_trait]
impl Worker for FiltWorker {
    type Info = FiltInfo;

    async fn sync(&mut self, ctx: &mut TickContext) -> FiltInfo {
        let mut info = FiltInfo::new();
        for unit in &mut self.units {
            let Some(state) = unit
                .wheel
                .call(ctx, |w| async move { w.state().await }.boxed())
                .await
            else {
                continue;
            };
            info.insert(
                unit.ut,
                FilterUnitInfo {
                    homed: state.homed,
                    current_filter: state.position.and_then(|p| unit.filters.get(p).cloned()),
                    current_filter_num: state.position,
                    status: if state.moving {
                        FilterStatus::Moving
                    } else {
                        FilterStatus::Ready
                    },
                    last_move_time: self.last_move.get(&unit.ut).copied(),
                },
            );
        }
        info
    }

    async fn execute(&mut self, ctx: &mut TickContext) {
        let commands = std::mem::take(&mut *self.mailbox.lock());
        for unit in &mut self.units {
            let ut = unit.ut;
            if commands.home.contains(&ut) {
                info!(ut, "Homing filter wheel");
                let homed = unit
                    .wheel
                    .call(ctx, |w| async move { w.home().await }.boxed())
                    .await;
                if homed.is_some() {
                    self.last_move.insert(ut, ctx.now());
                }
                ctx.request_check();
            }
            if let Some(&slot) = commands.set.get(&ut) {
                let filter = unit.filters.get(slot).cloned().unwrap_or_default();
                info!(ut, filter = %filter, "Moving filter wheel");
                let moved = unit
                    .wheel
                    .call(ctx, move |w| async move { w.move_to(slot).await }.boxed())
                    .await;
                if moved.is_some() {
                    self.last_move.insert(ut, ctx.now());
                }
                ctx.request_check();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obs_driver_mock::MockFilterWheel;
    use std::time::Duration;

    fn filters() -> Vec<String> {
        ["L", "R", "G", "B"].iter().map(|s| s.to_string()).collect()
    }

    async fn wait_for(daemon: &FiltDaemon, f: impl Fn(&FiltInfo) -> bool) {
        obs_core::retry::retry_until(
            Duration::from_secs(2),
            Duration::from_millis(5),
            "filter state",
            || async {
                let snapshot = daemon.get_info(true).await?;
                ObsResult::Ok(f(&snapshot.info).then_some(()))
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_home_then_set() {
        let (daemon, _handle) = FiltDaemon::start(
            vec![FilterUnit::new(1, filters(), Arc::new(MockFilterWheel::new(4)))],
            LoopTiming::fast(),
        );

        let targets = BTreeMap::from([(1, "R".to_string())]);
        let err = daemon.set_filters(&targets).await.unwrap_err();
        assert_eq!(err.message(), "Filter wheel 1 not homed");

        let ack = daemon.home_filters(&[1]).await.unwrap();
        assert_eq!(ack, "Filter wheel 1: Moving to home position");
        wait_for(&daemon, |info| info[&1].homed && info[&1].status == FilterStatus::Ready).await;

        let ack = daemon.set_filters(&targets).await.unwrap();
        assert_eq!(ack, "Filter wheel 1: Changing filter to R");
        wait_for(&daemon, |info| info[&1].current_filter.as_deref() == Some("R")).await;

        let info = daemon.filter_info(false).await.unwrap();
        assert_eq!(info[&1].current_filter_num, Some(1));
        assert!(info[&1].last_move_time.is_some());
        daemon.core().shutdown();
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (daemon, _handle) = FiltDaemon::start(
            vec![FilterUnit::new(1, filters(), Arc::new(MockFilterWheel::new(4)))],
            LoopTiming::fast(),
        );
        let err = daemon.home_filters(&[7]).await.unwrap_err();
        assert!(matches!(err, ObsError::InvalidArgument(_)));

        let targets = BTreeMap::from([(1, "Ha".to_string())]);
        let err = daemon.set_filters(&targets).await.unwrap_err();
        assert!(matches!(err, ObsError::InvalidArgument(_)));
        daemon.core().shutdown();
    }
}
