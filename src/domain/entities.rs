//! Core entities of an owner search
//!
//! These structs mirror the persisted schema one-to-one. Status enums carry
//! manual sqlx codecs so they read/write as plain text columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};
use uuid::Uuid;

use crate::domain::ports::{LocationScope, RawOwnerRow, RecordSelector, VillageRef};

/// Terminal and live states of one owner-search run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Stopped,
    Crashed,
    /// Run finished but some villages are missing or failed.
    Incomplete,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "stopped" => Ok(SessionStatus::Stopped),
            "crashed" => Ok(SessionStatus::Crashed),
            "incomplete" => Ok(SessionStatus::Incomplete),
            other => Err(format!("Invalid SessionStatus: {other}")),
        }
    }

    /// True when the session can no longer make progress.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl Type<Sqlite> for SessionStatus {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'q> Encode<'q, Sqlite> for SessionStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, BoxDynError> {
        <String as Encode<Sqlite>>::encode(self.as_str().to_string(), buf)
    }
}

impl<'r> Decode<'r, Sqlite> for SessionStatus {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as Decode<Sqlite>>::decode(value)?;
        SessionStatus::parse(&s).map_err(Into::into)
    }
}

/// Per-village progress states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VillageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl VillageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VillageStatus::Pending => "pending",
            VillageStatus::InProgress => "in_progress",
            VillageStatus::Completed => "completed",
            VillageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(VillageStatus::Pending),
            "in_progress" => Ok(VillageStatus::InProgress),
            "completed" => Ok(VillageStatus::Completed),
            "failed" => Ok(VillageStatus::Failed),
            other => Err(format!("Invalid VillageStatus: {other}")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VillageStatus::Completed | VillageStatus::Failed)
    }
}

impl Type<Sqlite> for VillageStatus {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'q> Encode<'q, Sqlite> for VillageStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, BoxDynError> {
        <String as Encode<Sqlite>>::encode(self.as_str().to_string(), buf)
    }
}

impl<'r> Decode<'r, Sqlite> for VillageStatus {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as Decode<Sqlite>>::decode(value)?;
        VillageStatus::parse(&s).map_err(Into::into)
    }
}

/// Input parameters for one owner search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub owner_name: String,
    pub scope: LocationScope,
    /// Upper bound of the survey-number iteration per village.
    pub max_survey: u32,
}

impl SearchParams {
    pub fn new(owner_name: impl Into<String>, scope: LocationScope, max_survey: u32) -> Self {
        Self {
            owner_name: owner_name.into(),
            scope,
            max_survey,
        }
    }

    /// Normalized match variants of the owner name. Matching is
    /// case-insensitive substring containment over this list.
    pub fn owner_variants(&self) -> Vec<String> {
        let name = self.owner_name.trim();
        let mut variants = vec![name.to_string(), name.to_uppercase(), name.to_lowercase()];
        variants.dedup();
        variants.retain(|v| !v.is_empty());
        variants
    }
}

/// Generate a session id: timestamp plus a short random suffix.
pub fn generate_session_id() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let uuid = Uuid::new_v4().simple().to_string();
    format!("search_{stamp}_{}", &uuid[..8])
}

/// One owner-search run. Append-only history across runs; totals are a cache
/// of the derivable sums and must reconcile at audit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSession {
    pub session_id: String,
    pub owner_name: String,
    pub owner_variants: Vec<String>,
    pub scope: LocationScope,
    pub max_survey: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_villages: u32,
    pub villages_completed: u32,
    pub total_records: u64,
    pub total_matches: u64,
    pub notes: Option<String>,
}

/// One village within a session. Unique per (session, village).
/// `last_survey_no` is the resume cursor; it only ever advances one unit at a
/// time and never past an unattempted survey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VillageTask {
    pub session_id: String,
    pub village_code: String,
    pub village_name: String,
    pub hobli_code: String,
    pub hobli_name: String,
    pub status: VillageStatus,
    pub last_survey_no: u32,
    pub max_survey_no: u32,
    pub records_found: u32,
    pub matches_found: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl VillageTask {
    pub fn village_ref(&self) -> VillageRef {
        VillageRef {
            village_code: self.village_code.clone(),
            village_name: self.village_name.clone(),
            hobli_code: self.hobli_code.clone(),
            hobli_name: self.hobli_name.clone(),
        }
    }
}

/// One discovered ownership row. Immutable once written; deduplicated by the
/// natural key (session, village code, survey, surnoc, hissa, period, owner
/// name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandRecord {
    pub district: String,
    pub taluk: String,
    pub hobli: String,
    pub village_code: String,
    pub village: String,
    pub survey_no: u32,
    pub surnoc: String,
    pub hissa: String,
    pub period: String,
    pub owner_name: String,
    pub extent: String,
    pub khatah: String,
    pub is_match: bool,
    pub worker_id: u32,
    pub created_at: DateTime<Utc>,
}

impl LandRecord {
    /// Convert a raw portal row into a typed record at the ingestion
    /// boundary, evaluating the owner-name match against the variants.
    pub fn from_raw(
        scope: &LocationScope,
        village: &VillageRef,
        selector: &RecordSelector,
        raw: &RawOwnerRow,
        variants: &[String],
        worker_id: u32,
    ) -> Self {
        let owner_lower = raw.owner_name.to_lowercase();
        let is_match = variants
            .iter()
            .filter(|v| !v.is_empty())
            .any(|v| owner_lower.contains(&v.to_lowercase()));
        Self {
            district: scope.district_name.clone(),
            taluk: scope.taluk_name.clone(),
            hobli: village.hobli_name.clone(),
            village_code: village.village_code.clone(),
            village: village.village_name.clone(),
            survey_no: selector.survey_no,
            surnoc: selector.surnoc.clone(),
            hissa: selector.hissa.clone(),
            period: selector.period.clone(),
            owner_name: raw.owner_name.clone(),
            extent: raw.extent.clone(),
            khatah: raw.khatah.clone(),
            is_match,
            worker_id,
            created_at: Utc::now(),
        }
    }
}

/// Sub-survey-level resume marker, finer-grained than the village cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub session_id: String,
    pub task_id: String,
    pub village_code: String,
    pub survey_no: u32,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: u32,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl TaskCheckpoint {
    pub fn task_id_for(village_code: &str, survey_no: u32) -> String {
        format!("{village_code}:{survey_no}")
    }
}

/// A task that could not be processed after bounded transient retries: either
/// one surnoc/hissa/period combination, or a whole survey whose form
/// submission kept failing (selector fields empty then). Recorded for later
/// retry, never conflated with "no data at this survey".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub village_code: String,
    pub village_name: String,
    pub survey_no: u32,
    pub surnoc: String,
    pub hissa: String,
    pub period: String,
    pub error: String,
    pub worker_id: u32,
}

/// A village whose record count sits far below the session mean. Advisory
/// signal for manual review, not a failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VillageAnomaly {
    pub village_code: String,
    pub village_name: String,
    pub records_found: u64,
    pub session_mean: f64,
}

/// Post-run coverage report. Never mutates village state; it only reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub session_id: String,
    pub expected_villages: u32,
    pub completed_villages: u32,
    pub failed_villages: Vec<String>,
    pub missing_villages: Vec<String>,
    pub suspicious: Vec<VillageAnomaly>,
    /// `(processed - failed) / expected * 100`
    pub coverage_score: f64,
    /// Whether the cached session totals matched the derived sums.
    pub totals_reconciled: bool,
    pub created_at: DateTime<Utc>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.missing_villages.is_empty() && self.failed_villages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> LocationScope {
        LocationScope {
            district_code: "2".into(),
            district_name: "Bangalore Urban".into(),
            taluk_code: "5".into(),
            taluk_name: "Bangalore North".into(),
            hobli_code: None,
            village_code: None,
        }
    }

    #[test]
    fn owner_variants_cover_case_forms() {
        let params = SearchParams::new("Ramappa", scope(), 200);
        let variants = params.owner_variants();
        assert!(variants.contains(&"Ramappa".to_string()));
        assert!(variants.contains(&"RAMAPPA".to_string()));
        assert!(variants.contains(&"ramappa".to_string()));
    }

    #[test]
    fn record_match_is_case_insensitive_substring() {
        let village = VillageRef {
            village_code: "17".into(),
            village_name: "Hesaraghatta".into(),
            hobli_code: "3".into(),
            hobli_name: "Yelahanka".into(),
        };
        let selector = RecordSelector {
            survey_no: 12,
            surnoc: "*".into(),
            hissa: "1".into(),
            period: "2023-24".into(),
        };
        let raw = RawOwnerRow {
            owner_name: "Sri RAMAPPA s/o Honnappa".into(),
            extent: "2.10".into(),
            khatah: "45".into(),
        };
        let record =
            LandRecord::from_raw(&scope(), &village, &selector, &raw, &["ramappa".into()], 1);
        assert!(record.is_match);
        assert_eq!(record.village_code, "17");
        assert_eq!(record.village, "Hesaraghatta");
        assert_eq!(record.survey_no, 12);
    }

    #[test]
    fn session_status_round_trip() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Stopped,
            SessionStatus::Crashed,
            SessionStatus::Incomplete,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SessionStatus::parse("paused").is_err());
    }

    #[test]
    fn village_status_terminality() {
        assert!(VillageStatus::Completed.is_terminal());
        assert!(VillageStatus::Failed.is_terminal());
        assert!(!VillageStatus::Pending.is_terminal());
        assert!(!VillageStatus::InProgress.is_terminal());
    }

    #[test]
    fn session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert!(a.starts_with("search_"));
        assert_ne!(a, b);
    }

    #[test]
    fn checkpoint_task_id_format() {
        assert_eq!(TaskCheckpoint::task_id_for("17", 42), "17:42");
    }
}
