//! Daemon-level control interfaces used by the exposure queue.
//!
//! The exposure queue never touches hardware. It drives the filter, mount and camera
//! daemons through these traits, which are implemented in-process by the daemon handles
//! and remotely by the RPC proxies in `obs-server`. Both sides return the same
//! [`ObsError`](crate::error::ObsError) taxonomy.

use crate::capabilities::{Compass, MountStatus};
use crate::error::ObsResult;
use crate::exposure::Exposure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Anything that answers the liveness probe.
#[async_trait]
pub trait Pingable: Send + Sync {
    async fn ping(&self) -> ObsResult<String>;
}

/// Lets a shared control handle be registered as a plain dependency.
#[async_trait]
impl<T: Pingable + ?Sized> Pingable for Arc<T> {
    async fn ping(&self) -> ObsResult<String> {
        (**self).ping().await
    }
}

/// Motion state of one filter wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterStatus {
    Ready,
    Moving,
}

/// Per-UT filter wheel status, as published by the filter daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterUnitInfo {
    pub homed: bool,
    pub current_filter: Option<String>,
    pub current_filter_num: Option<usize>,
    pub status: FilterStatus,
    pub last_move_time: Option<DateTime<Utc>>,
}

/// Mount status, as published by the mount daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    pub status: MountStatus,
    pub last_move_time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait FilterControl: Pingable {
    /// Per-UT status. UTs without a filter wheel are absent.
    async fn filter_info(&self, force_update: bool) -> ObsResult<BTreeMap<u32, FilterUnitInfo>>;

    async fn home_filters(&self, uts: &[u32]) -> ObsResult<String>;

    async fn set_filters(&self, targets: &BTreeMap<u32, String>) -> ObsResult<String>;
}

#[async_trait]
pub trait MountControl: Pingable {
    async fn mount_info(&self, force_update: bool) -> ObsResult<MountInfo>;

    async fn offset(&self, direction: Compass, distance: f64) -> ObsResult<String>;
}

#[async_trait]
pub trait CameraControl: Pingable {
    async fn take_exposure(&self, exposure: &Exposure) -> ObsResult<String>;

    /// True while any camera still has an exposure pending, running or reading out.
    async fn is_exposing(&self) -> ObsResult<bool>;
}
