//! The daemon control-loop skeleton.
//!
//! Every daemon is a [`DaemonCore`] plus one [`Worker`]. The core owns the shared,
//! RPC-facing side: the running flag, the force-check request, the liveness timestamp and
//! the published [`Snapshot`]. The worker exclusively owns the hardware state and is only
//! ever driven from the single task spawned by [`DaemonCore::spawn`], so no two loop
//! iterations of one daemon can run concurrently.
//!
//! Each tick of the worker task:
//!
//! 1. If the check period has elapsed, or a re-sync was force-requested, call
//!    [`Worker::sync`] and publish the resulting info as a new snapshot. Publication goes
//!    through a `tokio::sync::watch` channel holding an `Arc`, so readers always see a
//!    complete snapshot.
//! 2. Call [`Worker::execute`] to run pending commands.
//!
//! RPC handlers never touch the worker. They read snapshots from the core and write
//! commands into a per-daemon mailbox that the worker drains in `execute`.

use crate::error::{ObsError, ObsResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, Instrument};

/// Scheduling parameters of one worker loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopTiming {
    /// Worker tick.
    pub tick: Duration,
    /// Time between hardware re-syncs.
    pub check_period: Duration,
    /// Bound on `get_info(force_update=true)`.
    pub info_timeout: Duration,
    /// `ping` fails once the last tick is older than this. `None` disables the check.
    pub pinglife: Option<Duration>,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            check_period: Duration::from_secs(3),
            info_timeout: Duration::from_secs(30),
            pinglife: Some(Duration::from_secs(10)),
        }
    }
}

impl LoopTiming {
    /// Millisecond timing for tests and simulations.
    pub fn fast() -> Self {
        Self {
            tick: Duration::from_millis(5),
            check_period: Duration::from_millis(25),
            info_timeout: Duration::from_secs(3),
            pinglife: Some(Duration::from_secs(2)),
        }
    }
}

/// Hardware and dependency health carried in every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub bad_hardware: BTreeSet<String>,
    pub bad_dependencies: BTreeSet<String>,
}

impl Health {
    pub fn is_ok(&self) -> bool {
        self.bad_hardware.is_empty() && self.bad_dependencies.is_empty()
    }
}

/// One published status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<I> {
    pub daemon_id: String,
    /// Worker tick in which this snapshot was collected.
    pub tick: u64,
    pub time: DateTime<Utc>,
    pub uptime_secs: f64,
    pub health: Health,
    pub info: I,
}

/// Coarse daemon status, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DaemonStatus {
    Running,
    DependencyError(Vec<String>),
    HardwareError(Vec<String>),
    PingError(String),
    Stopped,
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonStatus::Running => write!(f, "running"),
            DaemonStatus::DependencyError(ids) => write!(f, "dependency_error: {}", ids.join(", ")),
            DaemonStatus::HardwareError(ids) => write!(f, "hardware_error: {}", ids.join(", ")),
            DaemonStatus::PingError(msg) => write!(f, "ping_error: {}", msg),
            DaemonStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Per-tick state handed to the worker.
///
/// Owns the persistent [`Health`] record and remembers which failures have already been
/// logged, so a stuck adapter produces one `error!` line and then only `debug!` lines.
#[derive(Debug)]
pub struct TickContext {
    tick: u64,
    now: DateTime<Utc>,
    check_requested: bool,
    pub health: Health,
    logged: BTreeMap<String, String>,
}

impl TickContext {
    pub fn new() -> Self {
        Self {
            tick: 0,
            now: Utc::now(),
            check_requested: false,
            health: Health::default(),
            logged: BTreeMap::new(),
        }
    }

    fn begin(&mut self, tick: u64) {
        self.tick = tick;
        self.now = Utc::now();
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Ask for a re-sync on the next tick.
    pub fn request_check(&mut self) {
        self.check_requested = true;
    }

    /// Record a failed adapter call. The adapter is marked bad until [`Self::hardware_ok`].
    pub fn hardware_failed(&mut self, name: &str, err: &anyhow::Error) {
        self.health.bad_hardware.insert(name.to_string());
        self.log_failure(name, err);
    }

    pub fn hardware_ok(&mut self, name: &str) {
        if self.health.bad_hardware.remove(name) {
            info!(adapter = name, "Hardware recovered");
        }
        self.logged.remove(name);
    }

    /// Log a failure once at `error`, repeats of the same message at `debug`.
    pub fn log_failure(&mut self, key: &str, err: impl std::fmt::Display) {
        let msg = err.to_string();
        if self.logged.get(key) == Some(&msg) {
            debug!(key, error = %msg, "Repeated failure");
        } else {
            error!(key, error = %msg, "Operation failed");
            self.logged.insert(key.to_string(), msg);
        }
    }

    /// Forget a logged failure so the next one is reported at `error` again.
    pub fn clear_failure(&mut self, key: &str) {
        self.logged.remove(key);
    }

    fn take_check_request(&mut self) -> bool {
        std::mem::take(&mut self.check_requested)
    }
}

impl Default for TickContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The hardware- or coordination-specific half of a daemon.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Status record published in every snapshot.
    type Info: Clone + Serialize + Send + Sync + 'static;

    /// Re-sync hardware, run supervisory checks and collect a fresh info record.
    ///
    /// Must not fail: adapter errors are recorded in `ctx.health` and degrade the
    /// affected fields.
    async fn sync(&mut self, ctx: &mut TickContext) -> Self::Info;

    /// Execute pending commands. Runs every tick, after `sync` when both are due.
    async fn execute(&mut self, ctx: &mut TickContext);

    /// Called once after the loop exits.
    async fn stop(&mut self) {}
}

/// Shared, RPC-facing side of a daemon.
pub struct DaemonCore<I> {
    id: String,
    timing: LoopTiming,
    started: Instant,
    running: AtomicBool,
    force_check: AtomicBool,
    tick: AtomicU64,
    last_loop: Mutex<Option<Instant>>,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot<I>>>>,
    stopped_tx: watch::Sender<bool>,
}

impl<I> DaemonCore<I>
where
    I: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>, timing: LoopTiming) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(None);
        let (stopped_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            timing,
            started: Instant::now(),
            running: AtomicBool::new(true),
            force_check: AtomicBool::new(false),
            tick: AtomicU64::new(0),
            last_loop: Mutex::new(None),
            snapshot_tx,
            stopped_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timing(&self) -> LoopTiming {
        self.timing
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of the tick currently (or most recently) executing.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Ask the worker to re-sync on its next tick.
    pub fn request_check(&self) {
        self.force_check.store(true, Ordering::SeqCst);
    }

    /// The most recent snapshot, if one has been published.
    pub fn latest(&self) -> Option<Arc<Snapshot<I>>> {
        self.snapshot_tx.borrow().clone()
    }

    /// Spawn the worker task. Must be called once.
    pub fn spawn<W>(self: &Arc<Self>, worker: W) -> JoinHandle<()>
    where
        W: Worker<Info = I>,
    {
        let core = Arc::clone(self);
        let span = info_span!("daemon", daemon = %core.id);
        tokio::spawn(run_loop(core, worker).instrument(span))
    }

    /// Return the cached snapshot, or a fresh one when `force_update` is set.
    ///
    /// A forced read is satisfied only by a snapshot collected in a tick that started
    /// after this call. Both forms wait at most `info_timeout`.
    pub async fn get_info(&self, force_update: bool) -> ObsResult<Arc<Snapshot<I>>> {
        if force_update {
            let after = self.current_tick();
            self.request_check();
            self.wait_for_snapshot(Some(after)).await
        } else {
            match self.latest() {
                Some(snapshot) => Ok(snapshot),
                None => self.wait_for_snapshot(None).await,
            }
        }
    }

    async fn wait_for_snapshot(&self, after: Option<u64>) -> ObsResult<Arc<Snapshot<I>>> {
        if !self.is_running() {
            return Err(ObsError::HardwareStatus(format!(
                "Daemon {} is shutting down",
                self.id
            )));
        }
        let mut rx = self.snapshot_tx.subscribe();
        let wait = rx.wait_for(|snapshot| match (snapshot, after) {
            (Some(s), Some(after)) => s.tick > after,
            (Some(_), None) => true,
            (None, _) => false,
        });
        let result = match tokio::time::timeout(self.timing.info_timeout, wait).await {
            Ok(Ok(snapshot)) => snapshot
                .clone()
                .ok_or_else(|| ObsError::Timeout("No snapshot published".into())),
            Ok(Err(_)) => Err(ObsError::HardwareStatus(format!(
                "Daemon {} has stopped",
                self.id
            ))),
            Err(_) => Err(ObsError::Timeout(format!(
                "{} info not updated within {:.1}s",
                self.id,
                self.timing.info_timeout.as_secs_f64()
            ))),
        };
        result
    }

    /// Liveness probe: fails with [`ObsError::StaleLoop`] if the worker has not ticked
    /// within `pinglife`.
    pub fn ping(&self) -> ObsResult<String> {
        if !self.is_running() {
            return Err(ObsError::HardwareStatus(format!(
                "Daemon {} is shutting down",
                self.id
            )));
        }
        if let Some(pinglife) = self.timing.pinglife {
            let last = (*self.last_loop.lock()).unwrap_or(self.started);
            let elapsed = last.elapsed();
            if elapsed > pinglife {
                return Err(ObsError::StaleLoop {
                    elapsed_secs: elapsed.as_secs_f64(),
                });
            }
        }
        Ok("ping".to_string())
    }

    pub fn status(&self) -> DaemonStatus {
        if *self.stopped_tx.borrow() || !self.is_running() {
            return DaemonStatus::Stopped;
        }
        if let Err(err) = self.ping() {
            return DaemonStatus::PingError(err.message());
        }
        match self.latest() {
            Some(snapshot) if !snapshot.health.bad_dependencies.is_empty() => {
                DaemonStatus::DependencyError(
                    snapshot.health.bad_dependencies.iter().cloned().collect(),
                )
            }
            Some(snapshot) if !snapshot.health.bad_hardware.is_empty() => {
                DaemonStatus::HardwareError(snapshot.health.bad_hardware.iter().cloned().collect())
            }
            _ => DaemonStatus::Running,
        }
    }

    /// Request orderly termination. The worker finishes its current tick and exits.
    pub fn shutdown(&self) -> String {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(daemon = %self.id, "Shutdown requested");
        }
        "Shutting down".to_string()
    }

    /// Resolve once the worker has left its loop.
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn has_stopped(&self) -> bool {
        *self.stopped_tx.borrow()
    }
}

async fn run_loop<W: Worker>(core: Arc<DaemonCore<W::Info>>, mut worker: W) {
    info!("Daemon started");
    let mut interval = tokio::time::interval(core.timing.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ctx = TickContext::new();
    let mut last_check: Option<Instant> = None;

    while core.is_running() {
        interval.tick().await;
        if !core.is_running() {
            break;
        }

        let tick = core.tick.fetch_add(1, Ordering::SeqCst) + 1;
        *core.last_loop.lock() = Some(Instant::now());
        ctx.begin(tick);

        let requested = ctx.take_check_request();
        let forced = core.force_check.swap(false, Ordering::SeqCst) || requested;
        let due = last_check.map_or(true, |t| t.elapsed() >= core.timing.check_period);
        if forced || due {
            let info = worker.sync(&mut ctx).await;
            last_check = Some(Instant::now());
            let snapshot = Snapshot {
                daemon_id: core.id.clone(),
                tick,
                time: Utc::now(),
                uptime_secs: core.started.elapsed().as_secs_f64(),
                health: ctx.health.clone(),
                info,
            };
            core.snapshot_tx.send_replace(Some(Arc::new(snapshot)));
        }

        worker.execute(&mut ctx).await;
        if ctx.take_check_request() {
            core.request_check();
        }
    }

    worker.stop().await;
    core.stopped_tx.send_replace(true);
    info!("Daemon stopped");
}
