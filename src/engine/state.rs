//! Shared run state
//!
//! One struct shared by every worker of a run: the cancellation token, the
//! global request rate limiter, the live counters, and the per-worker status
//! map. All mutation goes through this module's methods; the status map is
//! best-effort for polling and never authoritative (the checkpoint store is).

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::RwLock;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::domain::entities::SkippedItem;

/// Live best-effort status of one worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: u32,
    pub phase: WorkerPhase,
    pub current_village: Option<String>,
    pub current_survey: u32,
    pub villages_done: u32,
    pub records_found: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    #[default]
    Starting,
    Scanning,
    RestartingDriver,
    Finished,
    Failed,
}

/// Aggregate counters for a run, updated by all workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveStats {
    pub records_found: u64,
    pub matches_found: u64,
    pub villages_completed: u32,
    pub villages_failed: u32,
    pub session_recoveries: u32,
    pub driver_restarts: u32,
    pub skipped: Vec<SkippedItem>,
}

pub struct SharedState {
    cancel: CancellationToken,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    stats: RwLock<LiveStats>,
    workers: RwLock<HashMap<u32, WorkerStatus>>,
}

impl SharedState {
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            cancel: CancellationToken::new(),
            limiter: RateLimiter::direct(Quota::per_second(rps)),
            stats: RwLock::new(LiveStats::default()),
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the shared portal request budget. Called before every
    /// portal interaction, across all workers.
    pub async fn throttle(&self) {
        self.limiter.until_ready().await;
    }

    pub fn record_saved(&self, is_match: bool) {
        if let Ok(mut stats) = self.stats.write() {
            stats.records_found += 1;
            if is_match {
                stats.matches_found += 1;
            }
        }
    }

    pub fn record_village_completed(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.villages_completed += 1;
        }
    }

    pub fn record_village_failed(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.villages_failed += 1;
        }
    }

    pub fn record_session_recovery(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.session_recoveries += 1;
        }
    }

    pub fn record_driver_restart(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.driver_restarts += 1;
        }
    }

    pub fn record_skipped(&self, item: SkippedItem) {
        if let Ok(mut stats) = self.stats.write() {
            stats.skipped.push(item);
        }
    }

    pub fn publish_worker(&self, status: WorkerStatus) {
        if let Ok(mut workers) = self.workers.write() {
            workers.insert(status.worker_id, status);
        }
    }

    pub fn stats_snapshot(&self) -> LiveStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn worker_snapshot(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .workers
            .read()
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default();
        statuses.sort_by_key(|s| s.worker_id);
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let state = SharedState::new(10);
        state.record_saved(true);
        state.record_saved(false);
        state.record_village_completed();
        state.record_session_recovery();
        state.record_session_recovery();

        let stats = state.stats_snapshot();
        assert_eq!(stats.records_found, 2);
        assert_eq!(stats.matches_found, 1);
        assert_eq!(stats.villages_completed, 1);
        assert_eq!(stats.session_recoveries, 2);
    }

    #[test]
    fn worker_snapshot_is_ordered() {
        let state = SharedState::new(10);
        for id in [3u32, 1, 2] {
            state.publish_worker(WorkerStatus {
                worker_id: id,
                ..Default::default()
            });
        }
        let ids: Vec<u32> = state.worker_snapshot().iter().map(|w| w.worker_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn cancellation_is_sticky() {
        let state = SharedState::new(10);
        assert!(!state.is_cancelled());
        state.cancel();
        assert!(state.is_cancelled());
        assert!(state.is_cancelled());
    }
}
