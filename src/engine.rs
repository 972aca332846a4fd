//! Scrape engine
//!
//! The coordinator/worker/scanner stack plus the [`SearchEngine`] facade the
//! embedding layer talks to. One engine instance runs at most one session at
//! a time; the checkpoint store keeps every session's history so a stopped or
//! crashed run can be resumed by id.

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod health;
pub mod scanner;
pub mod state;
#[doc(hidden)]
pub mod testing;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::error;

use crate::domain::entities::{LandRecord, SearchParams, SessionStatus, VillageStatus};
use crate::domain::ports::{CatalogError, LocationCatalog, PortalAdapterFactory};
use crate::infrastructure::checkpoint_store::{CheckpointStore, SessionStats, StoreError};

pub use config::{EngineConfig, StoppingMode, StoppingPolicyConfig};
pub use state::{LiveStats, SharedState, WorkerPhase, WorkerStatus};

use coordinator::Coordinator;

/// Engine-level failure taxonomy. Recoverable portal failures never reach
/// this type; they are absorbed inside the workers.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("checkpoint store failure: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    CatalogUnavailable(#[from] CatalogError),

    #[error("a search is already running on this engine")]
    AlreadyRunning,

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// Aggregate snapshot for status polling: authoritative store-derived
/// statistics plus the best-effort live view.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub stats: SessionStats,
    pub live: LiveStats,
    pub workers: Vec<WorkerStatus>,
}

/// Cursor of one village still in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VillageCursor {
    pub village_code: String,
    pub village_name: String,
    pub last_survey_no: u32,
}

/// What a resumed run would pick up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub completed_villages: Vec<String>,
    pub in_progress: Vec<VillageCursor>,
    pub pending_villages: Vec<String>,
}

struct ActiveRun {
    session_id: String,
    state: Arc<SharedState>,
    handle: JoinHandle<()>,
}

/// Control surface of the engine. Constructed once over the store and the
/// two external collaborators; the dashboard layer calls into this and
/// nothing deeper.
pub struct SearchEngine {
    store: CheckpointStore,
    catalog: Arc<dyn LocationCatalog>,
    factory: Arc<dyn PortalAdapterFactory>,
    config: Arc<EngineConfig>,
    active: tokio::sync::Mutex<Option<ActiveRun>>,
}

impl SearchEngine {
    pub fn new(
        store: CheckpointStore,
        catalog: Arc<dyn LocationCatalog>,
        factory: Arc<dyn PortalAdapterFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            factory,
            config: Arc::new(config),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a new session and launch its run. Returns the session id
    /// immediately; the run proceeds in the background.
    pub async fn start(&self, params: SearchParams) -> Result<String, EngineError> {
        let mut active = self.active.lock().await;
        if let Some(run) = active.as_ref() {
            if !run.handle.is_finished() {
                return Err(EngineError::AlreadyRunning);
            }
        }
        let session_id = self
            .store
            .create_session(&params, &params.owner_variants())
            .await?;
        *active = Some(self.launch(session_id.clone()));
        Ok(session_id)
    }

    /// Re-launch an existing session: already-completed villages are skipped,
    /// in-progress villages continue from their checkpointed cursor.
    pub async fn resume(&self, session_id: &str) -> Result<(), EngineError> {
        let mut active = self.active.lock().await;
        if let Some(run) = active.as_ref() {
            if !run.handle.is_finished() {
                return Err(EngineError::AlreadyRunning);
            }
        }
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        *active = Some(self.launch(session_id.to_string()));
        Ok(())
    }

    fn launch(&self, session_id: String) -> ActiveRun {
        let state = Arc::new(SharedState::new(self.config.requests_per_second));
        let coordinator = Coordinator::new(
            self.store.clone(),
            self.catalog.clone(),
            self.factory.clone(),
            self.config.clone(),
            state.clone(),
        );
        let store = self.store.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = coordinator.run(&id).await {
                error!(session_id = %id, "search run aborted: {e}");
                if let Err(store_err) = store.set_session_status(&id, SessionStatus::Crashed).await
                {
                    error!(session_id = %id, "could not record crashed status: {store_err}");
                }
            }
        });
        ActiveRun {
            session_id,
            state,
            handle,
        }
    }

    /// Request a cooperative stop. Workers observe the cancellation between
    /// surveys and villages and persist their cursors before exiting.
    pub async fn stop(&self, session_id: &str) -> Result<(), EngineError> {
        let active = self.active.lock().await;
        if let Some(run) = active.as_ref() {
            if run.session_id == session_id {
                run.state.cancel();
                return Ok(());
            }
        }
        // nothing running for this id; still validate it exists
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Result<StatusSnapshot, EngineError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let stats = self.store.session_stats(session_id).await?;

        let active = self.active.lock().await;
        let (live, workers) = match active.as_ref() {
            Some(run) if run.session_id == session_id => {
                (run.state.stats_snapshot(), run.state.worker_snapshot())
            }
            _ => (LiveStats::default(), Vec::new()),
        };
        Ok(StatusSnapshot {
            session_id: session.session_id,
            status: session.status,
            stats,
            live,
            workers,
        })
    }

    pub async fn resume_state(&self, session_id: &str) -> Result<ResumeState, EngineError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let villages = self.store.village_tasks(session_id).await?;

        let mut resume = ResumeState {
            completed_villages: Vec::new(),
            in_progress: Vec::new(),
            pending_villages: Vec::new(),
        };
        for village in villages {
            match village.status {
                VillageStatus::Completed => resume.completed_villages.push(village.village_name),
                VillageStatus::InProgress => resume.in_progress.push(VillageCursor {
                    village_code: village.village_code,
                    village_name: village.village_name,
                    last_survey_no: village.last_survey_no,
                }),
                VillageStatus::Pending => resume.pending_villages.push(village.village_name),
                VillageStatus::Failed => {}
            }
        }
        Ok(resume)
    }

    /// Deduplicated result rows, ordered by (village, survey, surnoc, hissa).
    pub async fn export(
        &self,
        session_id: &str,
        matches_only: bool,
    ) -> Result<Vec<LandRecord>, EngineError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        Ok(self.store.export_records(session_id, matches_only).await?)
    }

    /// Poll the store until the session reaches a terminal status. Intended
    /// for embedders that want to block on a run; the caller bounds the wait.
    pub async fn wait_for_completion(&self, session_id: &str) -> Result<SessionStatus, EngineError> {
        loop {
            let session = self
                .store
                .get_session(session_id)
                .await?
                .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
            let idle = {
                let active = self.active.lock().await;
                match active.as_ref() {
                    Some(run) if run.session_id == session_id => run.handle.is_finished(),
                    _ => true,
                }
            };
            if session.status.is_terminal() && idle {
                return Ok(session.status);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
