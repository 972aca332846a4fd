//! Worker
//!
//! Owns one portal adapter (driver) and a fixed list of assigned villages,
//! processed strictly sequentially. The driver is never shared; the only
//! cross-worker surfaces are the checkpoint store and the live status map.
//! Store failures abort the current village but never abort silently.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::domain::entities::{SearchSession, VillageTask};
use crate::domain::ports::{PortalAdapter, PortalAdapterFactory, PortalError};
use crate::engine::config::EngineConfig;
use crate::engine::health::SessionHealthMonitor;
use crate::engine::scanner::{ScanResult, VillageScanner};
use crate::engine::state::{SharedState, WorkerPhase, WorkerStatus};
use crate::infrastructure::checkpoint_store::{CheckpointStore, StoreError};

pub struct Worker {
    worker_id: u32,
    store: CheckpointStore,
    state: Arc<SharedState>,
    config: Arc<EngineConfig>,
    session: Arc<SearchSession>,
    factory: Arc<dyn PortalAdapterFactory>,
    villages: Vec<VillageTask>,
}

impl Worker {
    pub fn new(
        worker_id: u32,
        store: CheckpointStore,
        state: Arc<SharedState>,
        config: Arc<EngineConfig>,
        session: Arc<SearchSession>,
        factory: Arc<dyn PortalAdapterFactory>,
        villages: Vec<VillageTask>,
    ) -> Self {
        Self {
            worker_id,
            store,
            state,
            config,
            session,
            factory,
            villages,
        }
    }

    pub async fn run(mut self) -> Result<(), StoreError> {
        // staggered startup so drivers are not all created at once
        let delay = self.config.worker_startup_delay_ms * u64::from(self.worker_id);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut status = WorkerStatus {
            worker_id: self.worker_id,
            phase: WorkerPhase::Starting,
            ..Default::default()
        };
        self.state.publish_worker(status.clone());

        let mut adapter = match self.create_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!(worker_id = self.worker_id, "could not start driver: {e}");
                self.fail_assigned_villages(&format!("driver startup failed: {e}"))
                    .await?;
                status.phase = WorkerPhase::Failed;
                self.state.publish_worker(status);
                return Ok(());
            }
        };

        let mut monitor =
            SessionHealthMonitor::new(self.worker_id, &self.config, self.state.clone());
        let villages = std::mem::take(&mut self.villages);
        let mut villages_since_restart = 0u32;

        info!(
            worker_id = self.worker_id,
            assigned = villages.len(),
            "worker started"
        );

        for village in &villages {
            if self.state.is_cancelled() {
                info!(worker_id = self.worker_id, "worker stopping on cancellation");
                break;
            }

            if villages_since_restart >= self.config.villages_per_driver_restart {
                status.phase = WorkerPhase::RestartingDriver;
                self.state.publish_worker(status.clone());
                info!(
                    worker_id = self.worker_id,
                    villages_since_restart, "preventive driver restart"
                );
                if let Err(e) = self.restart_adapter(&mut adapter).await {
                    warn!(
                        worker_id = self.worker_id,
                        "preventive restart failed, keeping current driver: {e}"
                    );
                }
                villages_since_restart = 0;
            }

            let village_ref = village.village_ref();
            status.phase = WorkerPhase::Scanning;
            status.current_village = Some(village_ref.village_name.clone());
            status.current_survey = 0;
            self.state.publish_worker(status.clone());

            self.store
                .mark_village_started(&self.session.session_id, &village_ref.village_code)
                .await?;

            let scanner = VillageScanner::new(
                &self.store,
                &self.state,
                &self.config,
                &self.session,
                self.worker_id,
            );
            let result = scanner
                .scan(&mut adapter, &mut monitor, &village_ref, &mut status)
                .await?;

            match result {
                ScanResult::Completed { last_survey_no } => {
                    self.store
                        .complete_village(
                            &self.session.session_id,
                            &village_ref.village_code,
                            last_survey_no,
                        )
                        .await?;
                    self.state.record_village_completed();
                    status.villages_done += 1;
                    info!(
                        worker_id = self.worker_id,
                        village = %village_ref.village_name,
                        last_survey_no,
                        "village completed"
                    );
                }
                ScanResult::Failed {
                    last_survey_no,
                    error,
                } => {
                    self.store
                        .fail_village(&self.session.session_id, &village_ref.village_code, &error)
                        .await?;
                    self.state.record_village_failed();
                    status.villages_done += 1;
                    error!(
                        worker_id = self.worker_id,
                        village = %village_ref.village_name,
                        last_survey_no,
                        "village failed: {error}"
                    );
                }
                ScanResult::Cancelled { last_survey_no } => {
                    // village stays in progress with its cursor persisted
                    info!(
                        worker_id = self.worker_id,
                        village = %village_ref.village_name,
                        last_survey_no,
                        "village paused by cancellation"
                    );
                    break;
                }
            }
            villages_since_restart += 1;
        }

        status.phase = WorkerPhase::Finished;
        status.current_village = None;
        self.state.publish_worker(status);
        info!(worker_id = self.worker_id, "worker finished");
        Ok(())
    }

    async fn create_adapter(&self) -> Result<Box<dyn PortalAdapter>, PortalError> {
        let mut adapter = self.factory.create(self.worker_id).await?;
        adapter.open().await?;
        Ok(adapter)
    }

    async fn restart_adapter(
        &self,
        adapter: &mut Box<dyn PortalAdapter>,
    ) -> Result<(), PortalError> {
        adapter.restart().await?;
        adapter.open().await?;
        Ok(())
    }

    /// The driver never came up, so none of the assigned villages can be
    /// scanned. They are recorded as failed rather than left dangling.
    async fn fail_assigned_villages(&self, reason: &str) -> Result<(), StoreError> {
        for village in &self.villages {
            self.store
                .fail_village(&self.session.session_id, &village.village_code, reason)
                .await?;
            self.state.record_village_failed();
        }
        Ok(())
    }
}
