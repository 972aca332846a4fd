//! Run coordinator
//!
//! Resolves the village list for the requested scope, registers every village
//! before any work starts (so resume and audit always see the full expected
//! set), partitions the pending villages round-robin across the worker pool,
//! monitors the run, and finalizes the session with an audit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::domain::entities::{SessionStatus, VillageTask};
use crate::domain::ports::{CatalogError, LocationCatalog, LocationScope, PortalAdapterFactory, VillageRef};
use crate::engine::audit::run_audit;
use crate::engine::config::EngineConfig;
use crate::engine::state::SharedState;
use crate::engine::worker::Worker;
use crate::engine::EngineError;
use crate::infrastructure::checkpoint_store::{CheckpointStore, StoreError};

pub struct Coordinator {
    store: CheckpointStore,
    catalog: Arc<dyn LocationCatalog>,
    factory: Arc<dyn PortalAdapterFactory>,
    config: Arc<EngineConfig>,
    state: Arc<SharedState>,
}

impl Coordinator {
    pub fn new(
        store: CheckpointStore,
        catalog: Arc<dyn LocationCatalog>,
        factory: Arc<dyn PortalAdapterFactory>,
        config: Arc<EngineConfig>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            store,
            catalog,
            factory,
            config,
            state,
        }
    }

    /// Drive one session to a terminal state. Works the same for a fresh
    /// session and a resumed one: registration is idempotent and only
    /// pending or in-progress villages are handed out.
    pub async fn run(&self, session_id: &str) -> Result<SessionStatus, EngineError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        self.store
            .set_session_status(session_id, SessionStatus::Running)
            .await?;

        let villages = self.resolve_villages(&session.scope).await?;
        self.store
            .register_villages(session_id, &villages, session.max_survey)
            .await?;
        self.store
            .set_total_villages(session_id, villages.len() as u32)
            .await?;

        let pending = self.store.pending_villages(session_id).await?;
        info!(
            session_id,
            owner = %session.owner_name,
            total = villages.len(),
            pending = pending.len(),
            workers = self.config.worker_count,
            "search run starting"
        );

        if !pending.is_empty() {
            let buckets = partition(pending, self.config.worker_count);
            let session = Arc::new(session);
            let handles: Vec<_> = buckets
                .into_iter()
                .enumerate()
                .map(|(worker_id, assigned)| {
                    let worker = Worker::new(
                        worker_id as u32,
                        self.store.clone(),
                        self.state.clone(),
                        self.config.clone(),
                        session.clone(),
                        self.factory.clone(),
                        assigned,
                    );
                    tokio::spawn(worker.run())
                })
                .collect();
            self.monitor(session_id, handles).await?;
        }

        self.finalize(session_id).await
    }

    /// Expand the scope to concrete villages via the location catalog.
    /// Catalog failures are fatal: without a village list there is no task
    /// space to cover.
    async fn resolve_villages(
        &self,
        scope: &LocationScope,
    ) -> Result<Vec<VillageRef>, EngineError> {
        let mut hoblis = self.catalog.list_hoblis(scope).await?;
        if let Some(code) = &scope.hobli_code {
            hoblis.retain(|(c, _)| c == code);
        }
        if hoblis.is_empty() {
            return Err(EngineError::CatalogUnavailable(CatalogError(format!(
                "no hoblis found for taluk {}",
                scope.taluk_name
            ))));
        }

        let mut villages = Vec::new();
        for (hobli_code, hobli_name) in &hoblis {
            let listed = self.catalog.list_villages(scope, hobli_code).await?;
            for (village_code, village_name) in listed {
                if let Some(wanted) = &scope.village_code {
                    if &village_code != wanted {
                        continue;
                    }
                }
                villages.push(VillageRef {
                    village_code,
                    village_name,
                    hobli_code: hobli_code.clone(),
                    hobli_name: hobli_name.clone(),
                });
            }
        }
        if villages.is_empty() {
            return Err(EngineError::CatalogUnavailable(CatalogError(format!(
                "no villages found for scope {}/{}",
                scope.district_name, scope.taluk_name
            ))));
        }
        Ok(villages)
    }

    /// Wait for every worker while keeping the session's cached totals
    /// refreshed for status polling.
    async fn monitor(
        &self,
        session_id: &str,
        handles: Vec<tokio::task::JoinHandle<Result<(), StoreError>>>,
    ) -> Result<(), EngineError> {
        let join = futures::future::join_all(handles);
        tokio::pin!(join);
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.monitor_poll_interval_ms));
        loop {
            tokio::select! {
                results = &mut join => {
                    for result in results {
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(store_err)) => {
                                // the completeness guarantee is at risk here,
                                // surface it loudly for manual reconciliation
                                error!(session_id, "worker aborted on store failure: {store_err}");
                            }
                            Err(join_err) => {
                                error!(session_id, "worker task panicked: {join_err}");
                            }
                        }
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let stats = self.store.session_stats(session_id).await?;
                    self.store
                        .update_session_totals(
                            session_id,
                            stats.villages_completed,
                            stats.total_records,
                            stats.total_matches,
                        )
                        .await?;
                }
            }
        }
    }

    async fn finalize(&self, session_id: &str) -> Result<SessionStatus, EngineError> {
        let stats = self.store.session_stats(session_id).await?;
        self.store
            .update_session_totals(
                session_id,
                stats.villages_completed,
                stats.total_records,
                stats.total_matches,
            )
            .await?;

        let status = if self.state.is_cancelled() {
            SessionStatus::Stopped
        } else if stats.villages_failed == 0
            && stats.villages_completed == stats.total_villages
        {
            SessionStatus::Completed
        } else {
            SessionStatus::Incomplete
        };
        self.store.set_session_status(session_id, status).await?;

        if status != SessionStatus::Stopped {
            let session = self
                .store
                .get_session(session_id)
                .await?
                .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
            let report = run_audit(&self.store, &session, self.config.suspicious_fraction).await?;
            info!(
                session_id,
                status = %status.as_str(),
                records = stats.total_records,
                matches = stats.total_matches,
                coverage = report.coverage_score,
                "search run finished"
            );
        } else {
            info!(session_id, "search run stopped, state checkpointed for resume");
        }
        Ok(status)
    }
}

/// Round-robin distribution of pending villages across the worker pool.
/// Workers beyond the village count get no bucket at all.
fn partition(pending: Vec<VillageTask>, worker_count: u32) -> Vec<Vec<VillageTask>> {
    let worker_count = (worker_count.max(1) as usize).min(pending.len().max(1));
    let mut buckets: Vec<Vec<VillageTask>> = vec![Vec::new(); worker_count];
    for (i, village) in pending.into_iter().enumerate() {
        buckets[i % worker_count].push(village);
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::VillageStatus;

    fn task(code: &str) -> VillageTask {
        VillageTask {
            session_id: "s".into(),
            village_code: code.into(),
            village_name: code.to_uppercase(),
            hobli_code: "3".into(),
            hobli_name: "Yelahanka".into(),
            status: VillageStatus::Pending,
            last_survey_no: 0,
            max_survey_no: 200,
            records_found: 0,
            matches_found: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    #[test]
    fn round_robin_spreads_evenly() {
        let pending: Vec<VillageTask> = (0..7).map(|i| task(&i.to_string())).collect();
        let buckets = partition(pending, 3);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].len(), 3);
        assert_eq!(buckets[1].len(), 2);
        assert_eq!(buckets[2].len(), 2);
        assert_eq!(buckets[0][0].village_code, "0");
        assert_eq!(buckets[1][0].village_code, "1");
        assert_eq!(buckets[2][1].village_code, "5");
    }

    #[test]
    fn more_workers_than_villages_shrinks_the_pool() {
        let pending: Vec<VillageTask> = (0..2).map(|i| task(&i.to_string())).collect();
        let buckets = partition(pending, 4);
        assert_eq!(buckets.len(), 2);
        assert!(buckets.iter().all(|b| b.len() == 1));
    }
}
