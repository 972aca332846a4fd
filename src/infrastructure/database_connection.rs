// Database connection and pool management
// SQLite via sqlx, WAL journal mode for concurrent worker writes

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Schema version stamped into `db_meta` on migration.
pub const DB_VERSION: u32 = 5;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Open (creating if necessary) the database at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .with_context(|| format!("Invalid database path {}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to open SQLite pool")?;

        Ok(Self { pool })
    }

    /// Default on-disk location under the user's data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bhoomi-engine")
            .join("bhoomi_data.db")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_sessions_sql = r#"
            CREATE TABLE IF NOT EXISTS search_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT UNIQUE NOT NULL,
                owner_name TEXT NOT NULL,
                owner_variants TEXT,
                district_code TEXT,
                district_name TEXT,
                taluk_code TEXT,
                taluk_name TEXT,
                hobli_code TEXT,
                village_code TEXT,
                max_survey INTEGER NOT NULL DEFAULT 200,
                status TEXT NOT NULL DEFAULT 'running',
                started_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                completed_at DATETIME,
                total_villages INTEGER NOT NULL DEFAULT 0,
                villages_completed INTEGER NOT NULL DEFAULT 0,
                total_records INTEGER NOT NULL DEFAULT 0,
                total_matches INTEGER NOT NULL DEFAULT 0,
                notes TEXT
            )
        "#;

        let create_records_sql = r#"
            CREATE TABLE IF NOT EXISTS land_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                district TEXT,
                taluk TEXT,
                hobli TEXT,
                village_code TEXT NOT NULL,
                village TEXT,
                survey_no INTEGER,
                surnoc TEXT,
                hissa TEXT,
                period TEXT,
                owner_name TEXT,
                extent TEXT,
                khatah TEXT,
                is_match INTEGER NOT NULL DEFAULT 0,
                worker_id INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (session_id) REFERENCES search_sessions(session_id),
                UNIQUE(session_id, village_code, survey_no, surnoc, hissa, period, owner_name)
            )
        "#;

        let create_progress_sql = r#"
            CREATE TABLE IF NOT EXISTS village_progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                village_code TEXT NOT NULL,
                village_name TEXT NOT NULL,
                hobli_code TEXT,
                hobli_name TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                last_survey_no INTEGER NOT NULL DEFAULT 0,
                max_survey_no INTEGER NOT NULL DEFAULT 200,
                records_found INTEGER NOT NULL DEFAULT 0,
                matches_found INTEGER NOT NULL DEFAULT 0,
                started_at DATETIME,
                completed_at DATETIME,
                error_message TEXT,
                FOREIGN KEY (session_id) REFERENCES search_sessions(session_id),
                UNIQUE(session_id, village_code)
            )
        "#;

        let create_checkpoints_sql = r#"
            CREATE TABLE IF NOT EXISTS task_checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                village_code TEXT NOT NULL,
                survey_no INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at DATETIME,
                completed_at DATETIME,
                worker_id INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                FOREIGN KEY (session_id) REFERENCES search_sessions(session_id),
                UNIQUE(session_id, task_id)
            )
        "#;

        let create_audits_sql = r#"
            CREATE TABLE IF NOT EXISTS audit_reports (
                session_id TEXT PRIMARY KEY,
                coverage_score REAL NOT NULL,
                report TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (session_id) REFERENCES search_sessions(session_id)
            )
        "#;

        let create_skipped_sql = r#"
            CREATE TABLE IF NOT EXISTS skipped_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                village_code TEXT NOT NULL,
                village_name TEXT NOT NULL,
                survey_no INTEGER NOT NULL,
                surnoc TEXT NOT NULL DEFAULT '',
                hissa TEXT NOT NULL DEFAULT '',
                period TEXT NOT NULL DEFAULT '',
                error_message TEXT,
                worker_id INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (session_id) REFERENCES search_sessions(session_id)
            )
        "#;

        let create_meta_sql = r#"
            CREATE TABLE IF NOT EXISTS db_meta (
                key TEXT PRIMARY KEY,
                value TEXT
            )
        "#;

        sqlx::query(create_sessions_sql).execute(&self.pool).await?;
        sqlx::query(create_records_sql).execute(&self.pool).await?;
        sqlx::query(create_progress_sql).execute(&self.pool).await?;
        sqlx::query(create_checkpoints_sql).execute(&self.pool).await?;
        sqlx::query(create_audits_sql).execute(&self.pool).await?;
        sqlx::query(create_skipped_sql).execute(&self.pool).await?;
        sqlx::query(create_meta_sql).execute(&self.pool).await?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_records_session ON land_records(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_records_village ON land_records(village_code)",
            "CREATE INDEX IF NOT EXISTS idx_skipped_session ON skipped_items(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_records_match ON land_records(is_match)",
            "CREATE INDEX IF NOT EXISTS idx_progress_session ON village_progress(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON task_checkpoints(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON task_checkpoints(status)",
        ] {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        sqlx::query("INSERT OR REPLACE INTO db_meta (key, value) VALUES ('version', ?)")
            .bind(DB_VERSION.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn database_connection_creates_file() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("test.db");

        let db = DatabaseConnection::new(&db_path).await?;
        assert!(!db.pool().is_closed());
        assert!(db_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn migration_creates_all_tables() -> Result<()> {
        let temp_dir = tempdir()?;
        let db = DatabaseConnection::new(temp_dir.path().join("migrate.db")).await?;
        db.migrate().await?;

        for table in [
            "search_sessions",
            "land_records",
            "village_progress",
            "task_checkpoints",
            "audit_reports",
            "skipped_items",
        ] {
            let row =
                sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
                    .bind(table)
                    .fetch_optional(db.pool())
                    .await?;
            assert!(row.is_some(), "missing table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn migration_is_idempotent() -> Result<()> {
        let temp_dir = tempdir()?;
        let db = DatabaseConnection::new(temp_dir.path().join("twice.db")).await?;
        db.migrate().await?;
        db.migrate().await?;
        Ok(())
    }
}
