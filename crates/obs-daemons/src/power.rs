//! Power daemon: named switched outlets.

use async_trait::async_trait;
use futures::FutureExt;
use obs_core::adapter::AdapterSlot;
use obs_core::capabilities::Relay;
use obs_core::control::Pingable;
use obs_core::{DaemonCore, LoopTiming, ObsError, ObsResult, Snapshot, TickContext, Worker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutletState {
    On,
    Off,
}

impl OutletState {
    fn from_bool(on: bool) -> Self {
        if on {
            OutletState::On
        } else {
            OutletState::Off
        }
    }
}

/// Outlet states by name. Outlets that could not be read are absent.
pub type PowerInfo = BTreeMap<String, OutletState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutletCommand {
    Set(bool),
    Reboot,
}

#[derive(Clone)]
pub struct PowerDaemon {
    core: Arc<DaemonCore<PowerInfo>>,
    mailbox: Arc<Mutex<BTreeMap<String, OutletCommand>>>,
    names: Arc<Vec<String>>,
}

impl PowerDaemon {
    pub fn start(
        outlets: Vec<(String, Arc<dyn Relay>)>,
        reboot_delay: Duration,
        timing: LoopTiming,
    ) -> (Self, JoinHandle<()>) {
        let names = outlets.iter().map(|(name, _)| name.clone()).collect();
        let mailbox = Arc::new(Mutex::new(BTreeMap::new()));
        let worker = PowerWorker {
            outlets: outlets
                .into_iter()
                .map(|(name, relay)| AdapterSlot::fixed(name, relay))
                .collect(),
            mailbox: Arc::clone(&mailbox),
            reboot_delay,
            restore: BTreeMap::new(),
        };
        let core = DaemonCore::new("power", timing);
        let handle = core.spawn(worker);
        (
            Self {
                core,
                mailbox,
                names: Arc::new(names),
            },
            handle,
        )
    }

    pub fn core(&self) -> &Arc<DaemonCore<PowerInfo>> {
        &self.core
    }

    pub async fn get_info(&self, force_update: bool) -> ObsResult<Arc<Snapshot<PowerInfo>>> {
        self.core.get_info(force_update).await
    }

    fn command(&self, outlets: &[String], command: OutletCommand) -> ObsResult<String> {
        if outlets.is_empty() {
            return Err(ObsError::InvalidArgument("No outlets given".to_string()));
        }
        if let Some(unknown) = outlets.iter().find(|o| !self.names.contains(o)) {
            return Err(ObsError::InvalidArgument(format!(
                "Unknown outlet '{}', must be from {:?}",
                unknown, self.names
            )));
        }
        let verb = match command {
            OutletCommand::Set(true) => "Turning on",
            OutletCommand::Set(false) => "Turning off",
            OutletCommand::Reboot => "Rebooting",
        };
        let mut mailbox = self.mailbox.lock();
        let lines: Vec<String> = outlets
            .iter()
            .map(|outlet| {
                mailbox.insert(outlet.clone(), command);
                format!("{} outlet {}", verb, outlet)
            })
            .collect();
        self.core.request_check();
        Ok(lines.join("\n"))
    }

    pub fn on(&self, outlets: &[String]) -> ObsResult<String> {
        self.command(outlets, OutletCommand::Set(true))
    }

    pub fn off(&self, outlets: &[String]) -> ObsResult<String> {
        self.command(outlets, OutletCommand::Set(false))
    }

    /// Switch off now and back on after the reboot delay.
    pub fn reboot(&self, outlets: &[String]) -> ObsResult<String> {
        self.command(outlets, OutletCommand::Reboot)
    }
}

#[async_trait]
impl Pingable for PowerDaemon {
    async fn ping(&self) -> ObsResult<String> {
        self.core.ping()
    }
}

struct PowerWorker {
    outlets: Vec<AdapterSlot<dyn Relay>>,
    mailbox: Arc<Mutex<BTreeMap<String, OutletCommand>>>,
    reboot_delay: Duration,
    /// Rebooting outlets and when to switch them back on
    restore: BTreeMap<String, Instant>,
}

#[async_trait]
impl Worker for PowerWorker {
    type Info = PowerInfo;

    async fn sync(&mut self, ctx: &mut TickContext) -> PowerInfo {
        let mut info = PowerInfo::new();
        for outlet in &mut self.outlets {
            if let Some(on) = outlet
                .call(ctx, |r| async move { r.is_on().await }.boxed())
                .await
            {
                info.insert(outlet.name().to_string(), OutletState::from_bool(on));
            }
        }
        info
    }

    async fn execute(&mut self, ctx: &mut TickContext) {
        let commands = std::mem::take(&mut *self.mailbox.lock());
        let now = Instant::now();
        for outlet in &mut self.outlets {
            let name = outlet.name().to_string();
            let target = match commands.get(&name) {
                Some(OutletCommand::Set(on)) => {
                    // An explicit switch cancels a reboot in progress
                    self.restore.remove(&name);
                    Some(*on)
                }
                Some(OutletCommand::Reboot) => {
                    self.restore.insert(name.clone(), now + self.reboot_delay);
                    Some(false)
                }
                None => match self.restore.get(&name) {
                    Some(&due) if due <= now => {
                        self.restore.remove(&name);
                        Some(true)
                    }
                    _ => None,
                },
            };
            let Some(on) = target else {
                continue;
            };
            info!(outlet = %name, on, "Switching outlet");
            outlet
                .call(ctx, move |r| async move { r.set(on).await }.boxed())
                .await;
            ctx.request_check();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obs_core::retry::retry_until;
    use obs_driver_mock::MockRelay;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_on_off_and_reboot() {
        let cams = Arc::new(MockRelay::new(true));
        let heaters = Arc::new(MockRelay::new(false));
        let (daemon, _handle) = PowerDaemon::start(
            vec![
                ("cams".to_string(), Arc::clone(&cams) as Arc<dyn Relay>),
                ("heaters".to_string(), Arc::clone(&heaters) as Arc<dyn Relay>),
            ],
            Duration::from_millis(100),
            LoopTiming::fast(),
        );

        let snapshot = daemon.get_info(true).await.unwrap();
        assert_eq!(snapshot.info["cams"], OutletState::On);
        assert_eq!(snapshot.info["heaters"], OutletState::Off);

        assert_eq!(daemon.on(&names(&["heaters"])).unwrap(), "Turning on outlet heaters");
        retry_until(
            Duration::from_secs(2),
            Duration::from_millis(5),
            "heaters on",
            || async { ObsResult::Ok(heaters.get().then_some(())) },
        )
        .await
        .unwrap();

        assert_eq!(daemon.reboot(&names(&["cams"])).unwrap(), "Rebooting outlet cams");
        retry_until(
            Duration::from_secs(2),
            Duration::from_millis(2),
            "cams off",
            || async { ObsResult::Ok((!cams.get()).then_some(())) },
        )
        .await
        .unwrap();
        retry_until(
            Duration::from_secs(2),
            Duration::from_millis(5),
            "cams back on",
            || async { ObsResult::Ok(cams.get().then_some(())) },
        )
        .await
        .unwrap();
        daemon.core().shutdown();
    }

    #[tokio::test]
    async fn test_unknown_outlet() {
        let (daemon, _handle) = PowerDaemon::start(
            vec![("cams".to_string(), Arc::new(MockRelay::new(true)) as Arc<dyn Relay>)],
            Duration::from_secs(1),
            LoopTiming::fast(),
        );
        let err = daemon.off(&names(&["dome"])).unwrap_err();
        assert!(matches!(err, ObsError::InvalidArgument(_)));
        let err = daemon.on(&[]).unwrap_err();
        assert!(matches!(err, ObsError::InvalidArgument(_)));
        daemon.core().shutdown();
    }
}
