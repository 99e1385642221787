//! Exposure queue control loop.

use async_trait::async_trait;
use obs_core::dependencies::DependencyMonitor;
use obs_core::exposure::{Exposure, ExposureQueue, SetCounter};
use obs_core::{TickContext, Worker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::acquisition::Acquisition;
use super::{ExqInfo, QueueStatus};

pub(super) struct ExqWorker {
    pub(super) queue: Arc<ExposureQueue>,
    pub(super) paused: Arc<AtomicBool>,
    pub(super) sets: Arc<SetCounter>,
    pub(super) deps: DependencyMonitor,
    pub(super) acquisition: Acquisition,
    pub(super) current: Option<Exposure>,
    pub(super) latest_set_number: u64,
    pub(super) last_status: Option<(QueueStatus, usize)>,
    /// Set while a bad dependency holds the machine back.
    pub(super) held: bool,
}

impl ExqWorker {
    fn info(&self, ctx: &TickContext) -> ExqInfo {
        let paused = self.paused.load(Ordering::SeqCst);
        let status = if paused {
            QueueStatus::Paused
        } else if self.current.is_some() {
            QueueStatus::Working
        } else {
            QueueStatus::Ready
        };
        ExqInfo {
            status,
            queue_length: self.queue.len(),
            exposing: self.current.is_some(),
            current_exposure: self.current.clone(),
            exposure_state: self.acquisition.state(),
            latest_set_number: self.latest_set_number,
            dependency_error: !ctx.health.bad_dependencies.is_empty(),
        }
    }

    fn next_exposure(&mut self, ctx: &mut TickContext) {
        if self.current.is_some() || self.paused.load(Ordering::SeqCst) {
            return;
        }
        match self.queue.pop_front() {
            Ok(Some(exposure)) => {
                ctx.clear_failure("queue");
                info!("Starting new exposure");
                debug!(exposure = %exposure.as_line(), "Popped from queue");
                self.current = Some(exposure);
                self.acquisition.start();
                ctx.request_check();
            }
            Ok(None) => {}
            Err(err) => ctx.log_failure("queue", &err),
        }
    }
}

#[async_trait]
impl Worker for ExqWorker {
    type Info = ExqInfo;

    async fn sync(&mut self, ctx: &mut TickContext) -> ExqInfo {
        ctx.health.bad_dependencies = self.deps.check().await;

        match self.sets.latest() {
            Ok(n) => {
                ctx.clear_failure("set_number");
                self.latest_set_number = n;
            }
            Err(err) => ctx.log_failure("set_number", &err),
        }

        let info = self.info(ctx);
        let now = (info.status, info.queue_length);
        if self.last_status != Some(now) {
            debug!("Exposure queue is {:?} ({} in queue)", info.status, info.queue_length);
            self.last_status = Some(now);
        }
        info
    }

    async fn execute(&mut self, ctx: &mut TickContext) {
        // Nothing moves while a dependency is down; the machine resumes where it stopped
        if !ctx.health.bad_dependencies.is_empty() {
            self.held = true;
            return;
        }
        if std::mem::take(&mut self.held) && self.current.is_some() {
            info!(state = %self.acquisition.state(), "Dependencies back, resuming exposure");
            self.acquisition.restart_stage();
        }
        self.next_exposure(ctx);

        if let Some(exposure) = &self.current {
            for state in self.acquisition.step(exposure, ctx).await {
                debug!(%state, "Exposure state");
            }
            if self.acquisition.is_idle() {
                self.current = None;
                ctx.request_check();
            }
        }
    }
}
