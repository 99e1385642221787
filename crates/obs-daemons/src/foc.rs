//! Focuser daemon. One focuser per unit telescope, positions in motor steps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use obs_core::adapter::AdapterSlot;
use obs_core::capabilities::FocuserUnit;
use obs_core::control::Pingable;
use obs_core::{DaemonCore, LoopTiming, ObsError, ObsResult, Snapshot, TickContext, Worker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocuserStatus {
    Ready,
    Moving,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocuserInfo {
    pub position: i64,
    pub limit: i64,
    pub status: FocuserStatus,
    pub last_move_time: Option<DateTime<Utc>>,
}

pub type FocInfo = BTreeMap<u32, FocuserInfo>;

pub struct FocuserSlot {
    pub ut: u32,
    limit: i64,
    focuser: AdapterSlot<dyn FocuserUnit>,
}

impl FocuserSlot {
    pub fn new(ut: u32, focuser: Arc<dyn FocuserUnit>) -> Self {
        Self {
            ut,
            limit: focuser.limit(),
            focuser: AdapterSlot::fixed(focuser_name(ut), focuser),
        }
    }
}

fn focuser_name(ut: u32) -> String {
    format!("foc{}", ut)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FocTarget {
    Position(i64),
    Home,
}

#[derive(Clone)]
pub struct FocDaemon {
    core: Arc<DaemonCore<FocInfo>>,
    mailbox: Arc<Mutex<BTreeMap<u32, FocTarget>>>,
    limits: Arc<BTreeMap<u32, i64>>,
}

impl FocDaemon {
    pub fn start(focusers: Vec<FocuserSlot>, timing: LoopTiming) -> (Self, JoinHandle<()>) {
        let limits = focusers.iter().map(|f| (f.ut, f.limit)).collect();
        let mailbox = Arc::new(Mutex::new(BTreeMap::new()));
        let worker = FocWorker {
            focusers,
            mailbox: Arc::clone(&mailbox),
            last_move: BTreeMap::new(),
        };
        let core = DaemonCore::new("foc", timing);
        let handle = core.spawn(worker);
        (
            Self {
                core,
                mailbox,
                limits: Arc::new(limits),
            },
            handle,
        )
    }

    pub fn core(&self) -> &Arc<DaemonCore<FocInfo>> {
        &self.core
    }

    pub async fn get_info(&self, force_update: bool) -> ObsResult<Arc<Snapshot<FocInfo>>> {
        self.core.get_info(force_update).await
    }

    fn limit(&self, ut: u32) -> ObsResult<i64> {
        self.limits.get(&ut).copied().ok_or_else(|| {
            let known: Vec<u32> = self.limits.keys().copied().collect();
            ObsError::InvalidArgument(format!(
                "Unit telescope ID {} not in list {:?}",
                ut, known
            ))
        })
    }

    fn check_target(&self, ut: u32, target: i64) -> ObsResult<()> {
        let limit = self.limit(ut)?;
        if !(0..=limit).contains(&target) {
            return Err(ObsError::InvalidArgument(format!(
                "Position {} outside range 0..={} for focuser {}",
                target, limit, ut
            )));
        }
        Ok(())
    }

    /// Current position of each requested focuser, refusing any that cannot take a command.
    async fn ready_positions(&self, uts: &[u32]) -> ObsResult<BTreeMap<u32, i64>> {
        if uts.is_empty() {
            return Err(ObsError::InvalidArgument("No unit telescopes given".to_string()));
        }
        for &ut in uts {
            self.limit(ut)?;
        }
        let snapshot = self.core.get_info(true).await?;
        let mailbox = self.mailbox.lock();
        let mut positions = BTreeMap::new();
        for &ut in uts {
            if snapshot.health.bad_hardware.contains(&focuser_name(ut)) {
                return Err(ObsError::HardwareStatus(format!(
                    "Cannot connect to focuser {}",
                    ut
                )));
            }
            let Some(info) = snapshot.info.get(&ut) else {
                return Err(ObsError::HardwareStatus(format!(
                    "Focuser {} status unknown",
                    ut
                )));
            };
            if info.status == FocuserStatus::Moving || mailbox.contains_key(&ut) {
                return Err(ObsError::HardwareStatus(format!("Focuser {} is moving", ut)));
            }
            positions.insert(ut, info.position);
        }
        Ok(positions)
    }

    fn queue(&self, targets: BTreeMap<u32, FocTarget>) {
        self.mailbox.lock().extend(targets);
        self.core.request_check();
    }

    /// Move each focuser by a relative number of steps.
    pub async fn move_focuser(&self, steps: &BTreeMap<u32, i64>) -> ObsResult<String> {
        let uts: Vec<u32> = steps.keys().copied().collect();
        let positions = self.ready_positions(&uts).await?;
        let mut targets = BTreeMap::new();
        let mut lines = Vec::new();
        for (&ut, &delta) in steps {
            let target = positions[&ut] + delta;
            self.check_target(ut, target)?;
            targets.insert(ut, FocTarget::Position(target));
            lines.push(format!("Focuser {}: Moving {} steps to {}", ut, delta, target));
        }
        self.queue(targets);
        Ok(lines.join("\n"))
    }

    /// Move each focuser to an absolute position.
    pub async fn set_focuser(&self, positions: &BTreeMap<u32, i64>) -> ObsResult<String> {
        for (&ut, &target) in positions {
            self.check_target(ut, target)?;
        }
        let uts: Vec<u32> = positions.keys().copied().collect();
        self.ready_positions(&uts).await?;
        let mut lines = Vec::new();
        let targets = positions
            .iter()
            .map(|(&ut, &target)| {
                lines.push(format!("Focuser {}: Moving to {}", ut, target));
                (ut, FocTarget::Position(target))
            })
            .collect();
        self.queue(targets);
        Ok(lines.join("\n"))
    }

    pub async fn home_focuser(&self, uts: &[u32]) -> ObsResult<String> {
        self.ready_positions(uts).await?;
        self.queue(uts.iter().map(|&ut| (ut, FocTarget::Home)).collect());
        Ok(uts
            .iter()
            .map(|ut| format!("Focuser {}: Moving to home position", ut))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[async_trait]
impl Pingable for FocDaemon {
    async fn ping(&self) -> ObsResult<String> {
        self.core.ping()
    }
}

struct FocWorker {
    focusers: Vec<FocuserSlot>,
    mailbox: Arc<Mutex<BTreeMap<u32, FocTarget>>>,
    last_move: BTreeMap<u32, DateTime<Utc>>,
}

#[async_trait]
impl Worker for FocWorker {
    type Info = FocInfo;

    async fn sync(&mut self, ctx: &mut TickContext) -> FocInfo {
        let mut info = FocInfo::new();
        for slot in &mut self.focusers {
            if let Some(state) = slot
                .focuser
                .call(ctx, |f| async move { f.state().await }.boxed())
                .await
            {
                info.insert(
                    slot.ut,
                    FocuserInfo {
                        position: state.position,
                        limit: slot.limit,
                        status: if state.moving {
                            FocuserStatus::Moving
                        } else {
                            FocuserStatus::Ready
                        },
                        last_move_time: self.last_move.get(&slot.ut).copied(),
                    },
                );
            }
        }
        info
    }

    async fn execute(&mut self, ctx: &mut TickContext) {
        let targets = std::mem::take(&mut *self.mailbox.lock());
        for slot in &mut self.focusers {
            let Some(&target) = targets.get(&slot.ut) else {
                continue;
            };
            let started = match target {
                FocTarget::Position(position) => {
                    info!(ut = slot.ut, position, "Moving focuser");
                    slot.focuser
                        .call(ctx, move |f| async move { f.move_to(position).await }.boxed())
                        .await
                }
                FocTarget::Home => {
                    info!(ut = slot.ut, "Homing focuser");
                    slot.focuser
                        .call(ctx, |f| async move { f.home().await }.boxed())
                        .await
                }
            };
            if started.is_some() {
                self.last_move.insert(slot.ut, ctx.now());
            }
            ctx.request_check();
        }
    }
}
