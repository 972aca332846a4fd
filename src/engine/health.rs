//! Session health monitor
//!
//! Classifies every portal failure into the closed retry-class set and
//! performs in-place recovery: session refresh for an expired portal session,
//! full driver recreation when the driver itself is dead, bounded plain
//! retries for everything else. A `Retry` verdict always means "re-attempt the
//! same task"; the survey cursor never advances through this module. Only an
//! unusable driver abandons a village; an exhausted transient error skips the
//! single task it hit.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::domain::ports::{PortalAdapter, PortalError};
use crate::engine::config::EngineConfig;
use crate::engine::state::SharedState;

/// Recovery verdict for one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Recovered in place; retry the same task.
    Retry,
    /// Transient retries exhausted; put this task aside and move on. The
    /// village itself keeps scanning.
    SkipTask(String),
    /// Driver recovery exhausted; abort the current village with this reason.
    Abandon(String),
}

/// Per-worker recovery state. Counters track consecutive failures and reset
/// on the next successful portal call, so the bounds apply per task, not per
/// village.
pub struct SessionHealthMonitor {
    worker_id: u32,
    max_session_retries: u32,
    max_driver_restarts: u32,
    max_transient_retries: u32,
    state: Arc<SharedState>,
    session_refreshes: u32,
    driver_restarts: u32,
    transient_retries: u32,
}

impl SessionHealthMonitor {
    pub fn new(worker_id: u32, config: &EngineConfig, state: Arc<SharedState>) -> Self {
        Self {
            worker_id,
            max_session_retries: config.max_session_retries,
            max_driver_restarts: config.max_driver_restarts,
            max_transient_retries: config.max_subtask_retries,
            state,
            session_refreshes: 0,
            driver_restarts: 0,
            transient_retries: 0,
        }
    }

    /// Recovery attempts spent since the last successful call.
    pub fn attempts(&self) -> u32 {
        self.session_refreshes + self.driver_restarts + self.transient_retries
    }

    /// Clear the consecutive-failure counters after a successful call.
    pub fn reset_on_success(&mut self) {
        self.session_refreshes = 0;
        self.driver_restarts = 0;
        self.transient_retries = 0;
    }

    /// Attempt one recovery for a classified failure.
    pub async fn recover(
        &mut self,
        adapter: &mut Box<dyn PortalAdapter>,
        err: &PortalError,
    ) -> Recovery {
        match err {
            PortalError::SessionInvalid(msg) => self.recover_session(adapter, msg).await,
            PortalError::DriverDead(msg) => self.recover_driver(adapter, msg).await,
            PortalError::Other(msg) => {
                self.transient_retries += 1;
                if self.transient_retries > self.max_transient_retries {
                    // the portal itself is fine, so only this task is given
                    // up, not the village
                    self.transient_retries = 0;
                    Recovery::SkipTask(format!(
                        "transient error persisted after {} retries: {msg}",
                        self.max_transient_retries
                    ))
                } else {
                    warn!(
                        worker_id = self.worker_id,
                        attempt = self.transient_retries,
                        "transient portal error, retrying: {msg}"
                    );
                    Recovery::Retry
                }
            }
        }
    }

    async fn recover_session(
        &mut self,
        adapter: &mut Box<dyn PortalAdapter>,
        msg: &str,
    ) -> Recovery {
        while self.session_refreshes < self.max_session_retries {
            self.session_refreshes += 1;
            info!(
                worker_id = self.worker_id,
                attempt = self.session_refreshes,
                "portal session expired ({msg}), refreshing in place"
            );
            match adapter.refresh_session().await {
                Ok(()) => {
                    self.state.record_session_recovery();
                    return Recovery::Retry;
                }
                Err(refresh_err) => {
                    warn!(
                        worker_id = self.worker_id,
                        "session refresh failed: {refresh_err}"
                    );
                }
            }
        }
        // refreshing is no longer enough, escalate to a driver restart
        self.recover_driver(adapter, msg).await
    }

    async fn recover_driver(&mut self, adapter: &mut Box<dyn PortalAdapter>, msg: &str) -> Recovery {
        while self.driver_restarts < self.max_driver_restarts {
            self.driver_restarts += 1;
            warn!(
                worker_id = self.worker_id,
                attempt = self.driver_restarts,
                "recreating driver ({msg})"
            );
            let restarted = match adapter.restart().await {
                Ok(()) => adapter.open().await,
                Err(e) => Err(e),
            };
            match restarted {
                Ok(()) => {
                    self.state.record_driver_restart();
                    return Recovery::Retry;
                }
                Err(restart_err) => {
                    error!(
                        worker_id = self.worker_id,
                        "driver restart failed: {restart_err}"
                    );
                }
            }
        }
        Recovery::Abandon(format!(
            "driver unusable after {} restarts: {msg}",
            self.max_driver_restarts
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockAdapterFactory;
    use crate::domain::ports::PortalAdapterFactory;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_in_place() {
        let factory = MockAdapterFactory::new();
        let mut adapter = factory.create(0).await.unwrap();
        let state = Arc::new(SharedState::new(100));
        let mut monitor = SessionHealthMonitor::new(0, &config(), state.clone());

        let verdict = monitor
            .recover(&mut adapter, &PortalError::SessionInvalid("expired".into()))
            .await;
        assert_eq!(verdict, Recovery::Retry);
        assert_eq!(state.stats_snapshot().session_recoveries, 1);
        assert_eq!(factory.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_escalates_to_driver_restart() {
        let factory = MockAdapterFactory::new();
        factory.fail_refreshes();
        let mut adapter = factory.create(0).await.unwrap();
        let state = Arc::new(SharedState::new(100));
        let mut monitor = SessionHealthMonitor::new(0, &config(), state.clone());

        let verdict = monitor
            .recover(&mut adapter, &PortalError::SessionInvalid("expired".into()))
            .await;
        assert_eq!(verdict, Recovery::Retry);
        // all refresh attempts burned, then one successful restart
        assert_eq!(factory.refresh_calls(), 3);
        assert_eq!(factory.restart_calls(), 1);
        assert_eq!(state.stats_snapshot().driver_restarts, 1);
    }

    #[tokio::test]
    async fn exhausted_restarts_abandon_the_village() {
        let factory = MockAdapterFactory::new();
        factory.fail_restarts();
        let mut adapter = factory.create(0).await.unwrap();
        let state = Arc::new(SharedState::new(100));
        let mut monitor = SessionHealthMonitor::new(0, &config(), state.clone());

        let verdict = monitor
            .recover(&mut adapter, &PortalError::DriverDead("chrome gone".into()))
            .await;
        match verdict {
            Recovery::Abandon(reason) => assert!(reason.contains("after 3 restarts")),
            other => panic!("expected abandonment, got {other:?}"),
        }
        assert_eq!(factory.restart_calls(), 3);
    }

    #[tokio::test]
    async fn transient_errors_get_bounded_retries() {
        let factory = MockAdapterFactory::new();
        let mut adapter = factory.create(0).await.unwrap();
        let state = Arc::new(SharedState::new(100));
        let mut monitor = SessionHealthMonitor::new(0, &config(), state);

        let err = PortalError::Other("dropdown not populated".into());
        assert_eq!(monitor.recover(&mut adapter, &err).await, Recovery::Retry);
        assert_eq!(monitor.recover(&mut adapter, &err).await, Recovery::Retry);
        match monitor.recover(&mut adapter, &err).await {
            Recovery::SkipTask(reason) => assert!(reason.contains("after 2 retries")),
            other => panic!("expected a task skip after the bound, got {other:?}"),
        }
        // the skip spends this task's budget only; the next task starts fresh
        assert_eq!(monitor.recover(&mut adapter, &err).await, Recovery::Retry);
    }

    #[tokio::test]
    async fn counters_reset_after_success() {
        let factory = MockAdapterFactory::new();
        let mut adapter = factory.create(0).await.unwrap();
        let state = Arc::new(SharedState::new(100));
        let mut monitor = SessionHealthMonitor::new(0, &config(), state);

        let err = PortalError::Other("flaky".into());
        assert_eq!(monitor.recover(&mut adapter, &err).await, Recovery::Retry);
        assert_eq!(monitor.recover(&mut adapter, &err).await, Recovery::Retry);
        monitor.reset_on_success();
        // bound applies per task, so a fresh task gets its full budget
        assert_eq!(monitor.recover(&mut adapter, &err).await, Recovery::Retry);
    }
}
