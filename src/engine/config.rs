//! Engine configuration
//!
//! Serde-defaulted structs persisted as JSON. Every retry bound and stopping
//! constant lives here; the heuristics (overshoot factor, adaptive fraction)
//! are tunable policy parameters, not derived values.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How the scanner decides a village's survey range is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingMode {
    /// Stop only after `empty_survey_threshold` consecutive empty surveys.
    Fixed,
    /// Once data has been seen, stop early on overshoot or a shorter
    /// empty run proportional to how many surveys held data.
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingPolicyConfig {
    pub mode: StoppingMode,
    /// Consecutive-empty bound; also the hard cap for the adaptive bound.
    pub empty_survey_threshold: u32,
    /// Stop when the cursor exceeds this multiple of the highest survey
    /// that held data.
    pub overshoot_factor: f64,
    /// Adaptive empty-run bound is `adaptive_fraction * surveys_with_data`.
    pub adaptive_fraction: f64,
    /// Lower bound of the adaptive empty-run bound.
    pub adaptive_floor: u32,
}

impl Default for StoppingPolicyConfig {
    fn default() -> Self {
        Self {
            mode: StoppingMode::Adaptive,
            empty_survey_threshold: 100,
            overshoot_factor: 1.5,
            adaptive_fraction: 0.3,
            adaptive_floor: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parallelism bound, one driver per worker. Sized for the portal's
    /// informal rate tolerance, not for available cores.
    pub worker_count: u32,
    pub max_session_retries: u32,
    pub max_driver_restarts: u32,
    /// Bounded retries for transient sub-task errors before recording the
    /// combination as skipped.
    pub max_subtask_retries: u32,
    /// Preventive driver restart cadence, in villages processed.
    pub villages_per_driver_restart: u32,
    /// Cursor checkpoint cadence, in surveys.
    pub checkpoint_interval: u32,
    /// Stagger between worker launches to avoid a thundering herd of
    /// driver creations.
    pub worker_startup_delay_ms: u64,
    /// Shared portal request budget across all workers.
    pub requests_per_second: u32,
    pub monitor_poll_interval_ms: u64,
    /// A completed village counting fewer records than this fraction of the
    /// session mean is flagged suspicious by the audit.
    pub suspicious_fraction: f64,
    pub stopping: StoppingPolicyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_session_retries: 3,
            max_driver_restarts: 3,
            max_subtask_retries: 2,
            villages_per_driver_restart: 200,
            checkpoint_interval: 10,
            worker_startup_delay_ms: 700,
            requests_per_second: 2,
            monitor_poll_interval_ms: 500,
            suspicious_fraction: 0.25,
            stopping: StoppingPolicyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.worker_count >= 1, "worker_count must be at least 1");
        anyhow::ensure!(
            self.checkpoint_interval >= 1,
            "checkpoint_interval must be at least 1"
        );
        anyhow::ensure!(
            self.stopping.overshoot_factor >= 1.0,
            "overshoot_factor below 1.0 would stop before the last survey with data"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.stopping.adaptive_fraction),
            "adaptive_fraction must be within 0.0..=1.0"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_session_retries, 3);
        assert_eq!(config.stopping.empty_survey_threshold, 100);
        assert_eq!(config.stopping.mode, StoppingMode::Adaptive);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"worker_count": 8, "stopping": {"mode": "fixed"}}"#).unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.stopping.mode, StoppingMode::Fixed);
        assert_eq!(config.stopping.empty_survey_threshold, 100);
        assert_eq!(config.checkpoint_interval, 10);
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = EngineConfig::default();
        config.worker_count = 6;
        config.stopping.overshoot_factor = 2.0;
        config.save(&path).await.unwrap();

        let loaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(loaded.worker_count, 6);
        assert!((loaded.stopping.overshoot_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_bounds_rejected() {
        let mut config = EngineConfig::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.stopping.overshoot_factor = 0.5;
        assert!(config.validate().is_err());
    }
}
