//! Durable checkpoint store
//!
//! Crash-safe record of sessions, per-village progress, discovered land
//! records and sub-survey checkpoints. Safe under one concurrent writer per
//! worker: SQLite WAL plus the pool's serialization cover every mutation, and
//! a write that cannot be committed surfaces as [`StoreError`] instead of
//! reporting success. This store is the authoritative state; the live status
//! map is best-effort only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::domain::entities::{
    generate_session_id, AuditReport, LandRecord, SearchParams, SearchSession, SessionStatus,
    SkippedItem, TaskCheckpoint, VillageTask,
};
use crate::domain::ports::{LocationScope, VillageRef};

/// A store failure. Mutating callers must propagate or log this with full
/// context; swallowing it would break the completeness guarantee.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Aggregate session statistics derived from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_records: u64,
    pub total_matches: u64,
    pub villages_completed: u32,
    pub villages_failed: u32,
    pub total_villages: u32,
    pub completion_percentage: f64,
}

/// Repository over the checkpoint schema. Cheap to clone; all clones share
/// one pool.
#[derive(Clone)]
pub struct CheckpointStore {
    pool: Arc<SqlitePool>,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    // ===============================
    // SESSION OPERATIONS
    // ===============================

    /// Create a new search session and return its generated id.
    pub async fn create_session(
        &self,
        params: &SearchParams,
        owner_variants: &[String],
    ) -> Result<String, StoreError> {
        let session_id = generate_session_id();
        sqlx::query(
            r#"
            INSERT INTO search_sessions
            (session_id, owner_name, owner_variants, district_code, district_name,
             taluk_code, taluk_name, hobli_code, village_code, max_survey, status, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session_id)
        .bind(&params.owner_name)
        .bind(serde_json::to_string(owner_variants)?)
        .bind(&params.scope.district_code)
        .bind(&params.scope.district_name)
        .bind(&params.scope.taluk_code)
        .bind(&params.scope.taluk_name)
        .bind(&params.scope.hobli_code)
        .bind(&params.scope.village_code)
        .bind(params.max_survey)
        .bind(SessionStatus::Running)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(session_id)
    }

    /// Transition the session status; terminal states stamp `completed_at`.
    pub async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(Utc::now);
        sqlx::query(
            "UPDATE search_sessions SET status = ?, completed_at = COALESCE(?, completed_at) \
             WHERE session_id = ?",
        )
        .bind(status)
        .bind(completed_at)
        .bind(session_id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_total_villages(&self, session_id: &str, total: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE search_sessions SET total_villages = ? WHERE session_id = ?")
            .bind(total)
            .bind(session_id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Refresh the cached totals on the session row. The values are
    /// derivable; this cache must reconcile at audit time.
    pub async fn update_session_totals(
        &self,
        session_id: &str,
        villages_completed: u32,
        total_records: u64,
        total_matches: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE search_sessions SET villages_completed = ?, total_records = ?, \
             total_matches = ? WHERE session_id = ?",
        )
        .bind(villages_completed)
        .bind(total_records as i64)
        .bind(total_matches as i64)
        .bind(session_id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SearchSession>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, owner_name, owner_variants, district_code, district_name,
                   taluk_code, taluk_name, hobli_code, village_code, max_survey, status,
                   started_at, completed_at, total_villages, villages_completed,
                   total_records, total_matches, notes
            FROM search_sessions WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            Some(row) => {
                let variants_json: Option<String> = row.get("owner_variants");
                let owner_variants = match variants_json {
                    Some(json) => serde_json::from_str(&json)?,
                    None => Vec::new(),
                };
                Ok(Some(SearchSession {
                    session_id: row.get("session_id"),
                    owner_name: row.get("owner_name"),
                    owner_variants,
                    scope: LocationScope {
                        district_code: row.get("district_code"),
                        district_name: row.get("district_name"),
                        taluk_code: row.get("taluk_code"),
                        taluk_name: row.get("taluk_name"),
                        hobli_code: row.get("hobli_code"),
                        village_code: row.get("village_code"),
                    },
                    max_survey: row.get("max_survey"),
                    status: row.get("status"),
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                    total_villages: row.get("total_villages"),
                    villages_completed: row.get("villages_completed"),
                    total_records: row.get::<i64, _>("total_records") as u64,
                    total_matches: row.get::<i64, _>("total_matches") as u64,
                    notes: row.get("notes"),
                }))
            }
            None => Ok(None),
        }
    }

    // ===============================
    // VILLAGE OPERATIONS
    // ===============================

    /// Register villages for tracking. Insert-if-absent, so re-registration
    /// after a resume is a no-op and never resets progress.
    pub async fn register_villages(
        &self,
        session_id: &str,
        villages: &[VillageRef],
        max_survey: u32,
    ) -> Result<(), StoreError> {
        for village in villages {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO village_progress
                (session_id, village_code, village_name, hobli_code, hobli_name, status, max_survey_no)
                VALUES (?, ?, ?, ?, ?, 'pending', ?)
                "#,
            )
            .bind(session_id)
            .bind(&village.village_code)
            .bind(&village.village_name)
            .bind(&village.hobli_code)
            .bind(&village.hobli_name)
            .bind(max_survey)
            .execute(&*self.pool)
            .await?;
        }
        Ok(())
    }

    /// Villages still needing work (pending or in-progress), for resume.
    pub async fn pending_villages(&self, session_id: &str) -> Result<Vec<VillageTask>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM village_progress \
             WHERE session_id = ? AND status IN ('pending', 'in_progress') \
             ORDER BY village_name",
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows.iter().map(Self::map_village_row).collect())
    }

    /// Every registered village for the session.
    pub async fn village_tasks(&self, session_id: &str) -> Result<Vec<VillageTask>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM village_progress WHERE session_id = ? ORDER BY village_name")
                .bind(session_id)
                .fetch_all(&*self.pool)
                .await?;
        Ok(rows.iter().map(Self::map_village_row).collect())
    }

    pub async fn mark_village_started(
        &self,
        session_id: &str,
        village_code: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE village_progress SET status = 'in_progress', \
             started_at = COALESCE(started_at, ?) \
             WHERE session_id = ? AND village_code = ?",
        )
        .bind(Utc::now())
        .bind(session_id)
        .bind(village_code)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Atomic progress update: advance the cursor and add to the counters.
    pub async fn update_village_progress(
        &self,
        session_id: &str,
        village_code: &str,
        last_survey_no: u32,
        records_delta: u32,
        matches_delta: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE village_progress SET last_survey_no = ?, \
             records_found = records_found + ?, matches_found = matches_found + ? \
             WHERE session_id = ? AND village_code = ?",
        )
        .bind(last_survey_no)
        .bind(records_delta)
        .bind(matches_delta)
        .bind(session_id)
        .bind(village_code)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition to `completed` with the final cursor.
    pub async fn complete_village(
        &self,
        session_id: &str,
        village_code: &str,
        last_survey_no: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE village_progress SET status = 'completed', last_survey_no = ?, \
             completed_at = ? WHERE session_id = ? AND village_code = ?",
        )
        .bind(last_survey_no)
        .bind(Utc::now())
        .bind(session_id)
        .bind(village_code)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition to `failed` with the error text. The village is
    /// recorded, never silently dropped from the task space.
    pub async fn fail_village(
        &self,
        session_id: &str,
        village_code: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE village_progress SET status = 'failed', error_message = ?, \
             completed_at = ? WHERE session_id = ? AND village_code = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(session_id)
        .bind(village_code)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    // ===============================
    // LAND RECORDS
    // ===============================

    /// Append a discovered record. Returns `false` when the natural key
    /// already exists (idempotent re-processing after resume).
    pub async fn save_record(
        &self,
        session_id: &str,
        record: &LandRecord,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO land_records
            (session_id, district, taluk, hobli, village_code, village, survey_no, surnoc,
             hissa, period, owner_name, extent, khatah, is_match, worker_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(&record.district)
        .bind(&record.taluk)
        .bind(&record.hobli)
        .bind(&record.village_code)
        .bind(&record.village)
        .bind(record.survey_no)
        .bind(&record.surnoc)
        .bind(&record.hissa)
        .bind(&record.period)
        .bind(&record.owner_name)
        .bind(&record.extent)
        .bind(&record.khatah)
        .bind(record.is_match)
        .bind(record.worker_id)
        .bind(record.created_at)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deduplicated rows for a session, ordered for export.
    pub async fn export_records(
        &self,
        session_id: &str,
        matches_only: bool,
    ) -> Result<Vec<LandRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT district, taluk, hobli, village_code, village, survey_no, surnoc, hissa, \
             period, owner_name, extent, khatah, is_match, worker_id, created_at \
             FROM land_records WHERE session_id = ?",
        );
        if matches_only {
            sql.push_str(" AND is_match = 1");
        }
        sql.push_str(" ORDER BY village, survey_no, surnoc, hissa");

        let rows = sqlx::query(&sql)
            .bind(session_id)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| LandRecord {
                district: row.get("district"),
                taluk: row.get("taluk"),
                hobli: row.get("hobli"),
                village_code: row.get("village_code"),
                village: row.get("village"),
                survey_no: row.get("survey_no"),
                surnoc: row.get("surnoc"),
                hissa: row.get("hissa"),
                period: row.get("period"),
                owner_name: row.get("owner_name"),
                extent: row.get("extent"),
                khatah: row.get("khatah"),
                is_match: row.get("is_match"),
                worker_id: row.get("worker_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ===============================
    // TASK CHECKPOINTS
    // ===============================

    pub async fn mark_task_started(
        &self,
        session_id: &str,
        village_code: &str,
        survey_no: u32,
        worker_id: u32,
        retry_count: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO task_checkpoints
            (session_id, task_id, village_code, survey_no, status, started_at, worker_id, retry_count)
            VALUES (?, ?, ?, ?, 'processing', ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(TaskCheckpoint::task_id_for(village_code, survey_no))
        .bind(village_code)
        .bind(survey_no)
        .bind(Utc::now())
        .bind(worker_id)
        .bind(retry_count)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_task_completed(
        &self,
        session_id: &str,
        village_code: &str,
        survey_no: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE task_checkpoints SET status = 'completed', completed_at = ? \
             WHERE session_id = ? AND task_id = ?",
        )
        .bind(Utc::now())
        .bind(session_id)
        .bind(TaskCheckpoint::task_id_for(village_code, survey_no))
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_task_failed(
        &self,
        session_id: &str,
        village_code: &str,
        survey_no: u32,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE task_checkpoints SET status = 'failed', completed_at = ?, error_message = ? \
             WHERE session_id = ? AND task_id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(session_id)
        .bind(TaskCheckpoint::task_id_for(village_code, survey_no))
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Record how many recovery attempts a task needed.
    pub async fn record_task_retries(
        &self,
        session_id: &str,
        village_code: &str,
        survey_no: u32,
        retry_count: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE task_checkpoints SET retry_count = ? \
             WHERE session_id = ? AND task_id = ?",
        )
        .bind(retry_count)
        .bind(session_id)
        .bind(TaskCheckpoint::task_id_for(village_code, survey_no))
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Highest survey number marked completed for a village, the sub-village
    /// resume cursor.
    pub async fn last_completed_survey(
        &self,
        session_id: &str,
        village_code: &str,
    ) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query(
            "SELECT MAX(survey_no) AS last FROM task_checkpoints \
             WHERE session_id = ? AND village_code = ? AND status = 'completed'",
        )
        .bind(session_id)
        .bind(village_code)
        .fetch_one(&*self.pool)
        .await?;
        let last: Option<i64> = row.get("last");
        Ok(last.map(|v| v as u32))
    }

    /// Every checkpoint row for a village in survey order, for coverage
    /// replay.
    pub async fn checkpoints_for_village(
        &self,
        session_id: &str,
        village_code: &str,
    ) -> Result<Vec<TaskCheckpoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM task_checkpoints \
             WHERE session_id = ? AND village_code = ? ORDER BY survey_no",
        )
        .bind(session_id)
        .bind(village_code)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TaskCheckpoint {
                session_id: row.get("session_id"),
                task_id: row.get("task_id"),
                village_code: row.get("village_code"),
                survey_no: row.get("survey_no"),
                status: row.get("status"),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                worker_id: row.get::<Option<u32>, _>("worker_id").unwrap_or(0),
                retry_count: row.get("retry_count"),
                error_message: row.get("error_message"),
            })
            .collect())
    }

    // ===============================
    // STATISTICS & AUDIT
    // ===============================

    /// Aggregate statistics derived from the store (not the cached totals).
    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats, StoreError> {
        let records_row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(is_match), 0) AS matches \
             FROM land_records WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&*self.pool)
        .await?;

        let villages_row = sqlx::query(
            "SELECT COUNT(*) AS total, \
             SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed, \
             SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed \
             FROM village_progress WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&*self.pool)
        .await?;

        let total_villages: i64 = villages_row.get("total");
        let completed: Option<i64> = villages_row.get("completed");
        let failed: Option<i64> = villages_row.get("failed");
        let completed = completed.unwrap_or(0);

        Ok(SessionStats {
            total_records: records_row.get::<i64, _>("total") as u64,
            total_matches: records_row.get::<i64, _>("matches") as u64,
            villages_completed: completed as u32,
            villages_failed: failed.unwrap_or(0) as u32,
            total_villages: total_villages as u32,
            completion_percentage: (completed as f64 / (total_villages.max(1)) as f64) * 100.0,
        })
    }

    /// Record counts per village derived from the land-record rows, keyed by
    /// village code (display names may collide across hoblis).
    pub async fn records_by_village(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, u64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT village_code, COUNT(*) AS n FROM land_records \
             WHERE session_id = ? GROUP BY village_code",
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("village_code"), row.get::<i64, _>("n") as u64))
            .collect())
    }

    /// Persist a survey (or sub-parcel) a worker gave up on so the session
    /// report can list it for a follow-up run.
    pub async fn save_skipped(
        &self,
        session_id: &str,
        item: &SkippedItem,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO skipped_items \
             (session_id, village_code, village_name, survey_no, surnoc, hissa, period, \
              error_message, worker_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&item.village_code)
        .bind(&item.village_name)
        .bind(item.survey_no)
        .bind(&item.surnoc)
        .bind(&item.hissa)
        .bind(&item.period)
        .bind(&item.error)
        .bind(item.worker_id)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn skipped_items(&self, session_id: &str) -> Result<Vec<SkippedItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT village_code, village_name, survey_no, surnoc, hissa, period, \
                    error_message, worker_id \
             FROM skipped_items WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&*self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| SkippedItem {
                village_code: row.get("village_code"),
                village_name: row.get("village_name"),
                survey_no: row.get::<i64, _>("survey_no") as u32,
                surnoc: row.get("surnoc"),
                hissa: row.get("hissa"),
                period: row.get("period"),
                error: row
                    .get::<Option<String>, _>("error_message")
                    .unwrap_or_default(),
                worker_id: row.get::<i64, _>("worker_id") as u32,
            })
            .collect())
    }

    /// Persist the audit result alongside the session. Re-running the audit
    /// replaces the previous report.
    pub async fn save_audit(&self, report: &AuditReport) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO audit_reports (session_id, coverage_score, report, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&report.session_id)
        .bind(report.coverage_score)
        .bind(serde_json::to_string(report)?)
        .bind(report.created_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_audit(&self, session_id: &str) -> Result<Option<AuditReport>, StoreError> {
        let row = sqlx::query("SELECT report FROM audit_reports WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&*self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.get("report");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    fn map_village_row(row: &sqlx::sqlite::SqliteRow) -> VillageTask {
        VillageTask {
            session_id: row.get("session_id"),
            village_code: row.get("village_code"),
            village_name: row.get("village_name"),
            hobli_code: row.get::<Option<String>, _>("hobli_code").unwrap_or_default(),
            hobli_name: row.get::<Option<String>, _>("hobli_name").unwrap_or_default(),
            status: row.get("status"),
            last_survey_no: row.get("last_survey_no"),
            max_survey_no: row.get("max_survey_no"),
            records_found: row.get("records_found"),
            matches_found: row.get("matches_found"),
            started_at: row.get::<Option<DateTime<Utc>>, _>("started_at"),
            completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
            error_message: row.get("error_message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use tempfile::TempDir;

    async fn store() -> (TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConnection::new(dir.path().join("store.db"))
            .await
            .unwrap();
        db.migrate().await.unwrap();
        (dir, CheckpointStore::new(db.pool().clone()))
    }

    fn params() -> SearchParams {
        SearchParams::new(
            "Ramappa",
            LocationScope {
                district_code: "2".into(),
                district_name: "Bangalore Urban".into(),
                taluk_code: "5".into(),
                taluk_name: "Bangalore North".into(),
                hobli_code: None,
                village_code: None,
            },
            200,
        )
    }

    fn village(code: &str, name: &str) -> VillageRef {
        VillageRef {
            village_code: code.into(),
            village_name: name.into(),
            hobli_code: "3".into(),
            hobli_name: "Yelahanka".into(),
        }
    }

    fn record(code: &str, village: &str, survey_no: u32, owner: &str) -> LandRecord {
        LandRecord {
            district: "Bangalore Urban".into(),
            taluk: "Bangalore North".into(),
            hobli: "Yelahanka".into(),
            village_code: code.into(),
            village: village.into(),
            survey_no,
            surnoc: "*".into(),
            hissa: "1".into(),
            period: "2023-24".into(),
            owner_name: owner.into(),
            extent: "1.20".into(),
            khatah: "10".into(),
            is_match: false,
            worker_id: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let (_dir, store) = store().await;
        let p = params();
        let id = store.create_session(&p, &p.owner_variants()).await.unwrap();

        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.owner_name, "Ramappa");
        assert!(session.completed_at.is_none());

        store
            .set_session_status(&id, SessionStatus::Completed)
            .await
            .unwrap();
        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.completed_at.is_some());
    }

    #[tokio::test]
    async fn village_registration_is_idempotent() {
        let (_dir, store) = store().await;
        let p = params();
        let id = store.create_session(&p, &[]).await.unwrap();

        let villages = vec![village("17", "Hesaraghatta"), village("18", "Chikkajala")];
        store.register_villages(&id, &villages, 200).await.unwrap();

        // progress must survive re-registration on resume
        store
            .update_village_progress(&id, "17", 42, 5, 1)
            .await
            .unwrap();
        store.register_villages(&id, &villages, 200).await.unwrap();

        let tasks = store.village_tasks(&id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        let first = tasks.iter().find(|t| t.village_code == "17").unwrap();
        assert_eq!(first.last_survey_no, 42);
        assert_eq!(first.records_found, 5);
    }

    #[tokio::test]
    async fn record_dedup_on_natural_key() {
        let (_dir, store) = store().await;
        let p = params();
        let id = store.create_session(&p, &[]).await.unwrap();

        let r = record("17", "Hesaraghatta", 12, "Ramappa");
        assert!(store.save_record(&id, &r).await.unwrap());
        assert!(!store.save_record(&id, &r).await.unwrap());

        let different_owner = record("17", "Hesaraghatta", 12, "Honnappa");
        assert!(store.save_record(&id, &different_owner).await.unwrap());

        // same display name under another hobli is a distinct village
        let other_village = record("42", "Hesaraghatta", 12, "Ramappa");
        assert!(store.save_record(&id, &other_village).await.unwrap());

        let all = store.export_records(&id, false).await.unwrap();
        assert_eq!(all.len(), 3);

        let mut counts = store.records_by_village(&id).await.unwrap();
        counts.sort();
        assert_eq!(counts, vec![("17".to_string(), 2), ("42".to_string(), 1)]);
    }

    #[tokio::test]
    async fn pending_villages_reflect_terminal_transitions() {
        let (_dir, store) = store().await;
        let p = params();
        let id = store.create_session(&p, &[]).await.unwrap();
        store
            .register_villages(
                &id,
                &[village("1", "A"), village("2", "B"), village("3", "C")],
                200,
            )
            .await
            .unwrap();

        store.mark_village_started(&id, "1").await.unwrap();
        store.complete_village(&id, "1", 150).await.unwrap();
        store.fail_village(&id, "2", "driver dead").await.unwrap();

        let pending = store.pending_villages(&id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].village_code, "3");

        let stats = store.session_stats(&id).await.unwrap();
        assert_eq!(stats.villages_completed, 1);
        assert_eq!(stats.villages_failed, 1);
        assert_eq!(stats.total_villages, 3);
    }

    #[tokio::test]
    async fn checkpoint_cursor_tracks_completed_surveys() {
        let (_dir, store) = store().await;
        let p = params();
        let id = store.create_session(&p, &[]).await.unwrap();
        store
            .register_villages(&id, &[village("17", "Hesaraghatta")], 200)
            .await
            .unwrap();

        for survey in 1..=5 {
            store
                .mark_task_started(&id, "17", survey, 0, 0)
                .await
                .unwrap();
            store.mark_task_completed(&id, "17", survey).await.unwrap();
        }
        store.mark_task_started(&id, "17", 6, 0, 0).await.unwrap();

        assert_eq!(
            store.last_completed_survey(&id, "17").await.unwrap(),
            Some(5)
        );

        // replay shows every survey 1..=5 attempted, no gaps
        let checkpoints = store.checkpoints_for_village(&id, "17").await.unwrap();
        let surveys: Vec<u32> = checkpoints.iter().map(|c| c.survey_no).collect();
        assert_eq!(surveys, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn skipped_items_survive_restart() {
        let (_dir, store) = store().await;
        let p = params();
        let id = store.create_session(&p, &[]).await.unwrap();

        let item = SkippedItem {
            village_code: "17".into(),
            village_name: "Hesaraghatta".into(),
            survey_no: 9,
            surnoc: String::new(),
            hissa: String::new(),
            period: String::new(),
            error: "listing timed out".into(),
            worker_id: 2,
        };
        store.save_skipped(&id, &item).await.unwrap();

        let loaded = store.skipped_items(&id).await.unwrap();
        assert_eq!(loaded, vec![item]);
        assert!(store.skipped_items("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_retry_count_is_updatable() {
        let (_dir, store) = store().await;
        let p = params();
        let id = store.create_session(&p, &[]).await.unwrap();

        store.mark_task_started(&id, "17", 4, 1, 0).await.unwrap();
        store.record_task_retries(&id, "17", 4, 3).await.unwrap();
        store.mark_task_completed(&id, "17", 4).await.unwrap();

        let checkpoints = store.checkpoints_for_village(&id, "17").await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].retry_count, 3);
    }

    #[tokio::test]
    async fn audit_report_round_trip() {
        let (_dir, store) = store().await;
        let p = params();
        let id = store.create_session(&p, &[]).await.unwrap();

        let report = AuditReport {
            session_id: id.clone(),
            expected_villages: 3,
            completed_villages: 2,
            failed_villages: vec!["B".into()],
            missing_villages: vec![],
            suspicious: vec![],
            coverage_score: 66.6,
            totals_reconciled: true,
            created_at: Utc::now(),
        };
        store.save_audit(&report).await.unwrap();

        let loaded = store.get_audit(&id).await.unwrap().unwrap();
        assert_eq!(loaded.expected_villages, 3);
        assert_eq!(loaded.failed_villages, vec!["B".to_string()]);
    }
}
