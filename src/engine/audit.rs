//! Post-run coverage audit
//!
//! Compares the declared village set against what the store actually marked
//! terminal, flags statistically thin villages as suspicious, and computes a
//! coverage score. Strictly advisory: the audit reads, persists a report, and
//! never mutates village or session state.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::domain::entities::{
    AuditReport, SearchSession, VillageAnomaly, VillageStatus, VillageTask,
};
use crate::infrastructure::checkpoint_store::{CheckpointStore, StoreError};

/// Run the audit for a session and persist the report.
pub async fn run_audit(
    store: &CheckpointStore,
    session: &SearchSession,
    suspicious_fraction: f64,
) -> Result<AuditReport, StoreError> {
    let villages = store.village_tasks(&session.session_id).await?;
    let counts = store.records_by_village(&session.session_id).await?;
    let stats = store.session_stats(&session.session_id).await?;

    let totals_reconciled =
        session.total_records == stats.total_records && session.total_matches == stats.total_matches;

    let report = build_report(
        session,
        &villages,
        &counts,
        suspicious_fraction,
        totals_reconciled,
    );
    store.save_audit(&report).await?;

    if report.is_clean() {
        info!(
            session_id = %session.session_id,
            coverage = report.coverage_score,
            "audit clean: every declared village accounted for"
        );
    } else {
        warn!(
            session_id = %session.session_id,
            missing = report.missing_villages.len(),
            failed = report.failed_villages.len(),
            coverage = report.coverage_score,
            "audit found coverage gaps"
        );
    }
    Ok(report)
}

/// Pure report construction over a snapshot of village rows and derived
/// per-village record counts (keyed by village code; display names can
/// repeat across hoblis).
pub fn build_report(
    session: &SearchSession,
    villages: &[VillageTask],
    counts: &[(String, u64)],
    suspicious_fraction: f64,
    totals_reconciled: bool,
) -> AuditReport {
    let expected = villages.len() as u32;
    let completed: Vec<&VillageTask> = villages
        .iter()
        .filter(|v| v.status == VillageStatus::Completed)
        .collect();
    let failed_villages: Vec<String> = villages
        .iter()
        .filter(|v| v.status == VillageStatus::Failed)
        .map(|v| v.village_name.clone())
        .collect();
    let missing_villages: Vec<String> = villages
        .iter()
        .filter(|v| !v.status.is_terminal())
        .map(|v| v.village_name.clone())
        .collect();

    let count_by_code: HashMap<&str, u64> = counts
        .iter()
        .map(|(code, n)| (code.as_str(), *n))
        .collect();

    // mean over villages that actually found records; a scope where most
    // villages are legitimately empty must not drag every village under it
    let nonzero: Vec<u64> = completed
        .iter()
        .filter_map(|v| count_by_code.get(v.village_code.as_str()).copied())
        .filter(|n| *n > 0)
        .collect();
    let mean = if nonzero.is_empty() {
        0.0
    } else {
        nonzero.iter().sum::<u64>() as f64 / nonzero.len() as f64
    };

    let suspicious: Vec<VillageAnomaly> = if mean > 0.0 {
        completed
            .iter()
            .filter_map(|v| {
                let found = count_by_code
                    .get(v.village_code.as_str())
                    .copied()
                    .unwrap_or(0);
                ((found as f64) < suspicious_fraction * mean).then(|| VillageAnomaly {
                    village_code: v.village_code.clone(),
                    village_name: v.village_name.clone(),
                    records_found: found,
                    session_mean: mean,
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    let processed = (completed.len() + failed_villages.len()) as u32;
    let coverage_score = if expected == 0 {
        100.0
    } else {
        f64::from(processed - failed_villages.len() as u32) / f64::from(expected) * 100.0
    };

    AuditReport {
        session_id: session.session_id.clone(),
        expected_villages: expected,
        completed_villages: completed.len() as u32,
        failed_villages,
        missing_villages,
        suspicious,
        coverage_score,
        totals_reconciled,
        created_at: Utc::now(),
    }
}
