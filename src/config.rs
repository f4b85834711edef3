//! TOML configuration for the UEBA engine.
//!
//! Layered model: `$UEBA_CONFIG` env override, then the standard system
//! location, then compiled-in defaults. Every threshold the detectors,
//! scorer, and sweeps consume is a named tunable here rather than a magic
//! number in the code.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Root configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UebaConfig {
    pub baseline: BaselineConfig,
    pub detection: DetectionConfig,
    pub scoring: ScoringConfig,
    pub alerting: AlertingConfig,
    pub mitigation: MitigationConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

impl UebaConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded UEBA configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `UEBA_CONFIG` environment variable.
    /// 2. `/etc/autosentry/ueba.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("UEBA_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "UEBA_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/autosentry/ueba.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

/// Per-entity baseline bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Ring buffer capacity per tracked metric (samples).
    pub history_capacity: usize,
    /// Minimum samples before a metric baseline is statistically mature.
    pub min_samples: usize,
    /// Drop profiles idle longer than this (hours).
    pub prune_after_hours: i64,
    /// How often profiles are checkpointed to the database (seconds).
    pub checkpoint_interval_secs: u64,
    /// Number of lock shards for the profile map.
    pub shard_count: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            history_capacity: 200,
            min_samples: 10,
            prune_after_hours: 72,
            checkpoint_interval_secs: 60,
            shard_count: 16,
        }
    }
}

/// Detector thresholds. Sigma values apply to every z-score check; the
/// absolute ceilings are safety floors that fire regardless of baseline
/// maturity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub warning_sigma: f64,
    pub critical_sigma: f64,
    /// Chat sessions shorter than this never count as duration anomalies (seconds).
    pub session_duration_floor_secs: f64,
    /// Chat sessions longer than this are anomalous even with a degenerate baseline (seconds).
    pub session_duration_ceiling_secs: f64,
    /// Error ratio above which an agent run is critical regardless of baseline.
    pub error_ratio_ceiling: f64,
    /// Historical percentile execution time is regressed against.
    pub exec_time_percentile: f64,
    /// Consecutive rising memory samples treated as a leak signal.
    pub leak_run_len: usize,
    /// Minimum relative growth across the run for a leak candidate.
    pub leak_growth_ratio: f64,
    /// Sliding window for session-creation frequency checks (seconds).
    pub session_burst_window_secs: i64,
    /// Sessions within the window above which creation frequency is anomalous.
    pub session_burst_ceiling: usize,
    /// A session-type transition seen less often than this fraction of all
    /// transitions is unusual.
    pub rare_transition_ratio: f64,
    /// Absolute safety ceilings for system metrics.
    pub cpu_ceiling_pct: f64,
    pub memory_ceiling_pct: f64,
    pub queue_depth_ceiling: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            warning_sigma: 2.0,
            critical_sigma: 4.0,
            session_duration_floor_secs: 30.0,
            session_duration_ceiling_secs: 3600.0,
            error_ratio_ceiling: 0.5,
            exec_time_percentile: 0.95,
            leak_run_len: 8,
            leak_growth_ratio: 0.2,
            session_burst_window_secs: 300,
            session_burst_ceiling: 10,
            rare_transition_ratio: 0.02,
            cpu_ceiling_pct: 95.0,
            memory_ceiling_pct: 90.0,
            queue_depth_ceiling: 1000.0,
        }
    }
}

/// Scoring weights, breakpoints, and the repeat-offender boost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Severity breakpoints on the final [0,1] score.
    pub low_breakpoint: f64,
    pub medium_breakpoint: f64,
    pub high_breakpoint: f64,
    /// Prior same-type alerts in the lookback needed to trigger the boost.
    pub repeat_offender_threshold: u32,
    /// Score multiplier cap for repeat offenders.
    pub repeat_offender_multiplier: f64,
    /// Lookback horizon for counting prior alerts (hours).
    pub repeat_lookback_hours: i64,
    /// Confidence discount applied when any contributing baseline is immature.
    pub immature_confidence_discount: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            low_breakpoint: 0.3,
            medium_breakpoint: 0.6,
            high_breakpoint: 0.85,
            repeat_offender_threshold: 3,
            repeat_offender_multiplier: 1.5,
            repeat_lookback_hours: 24,
            immature_confidence_discount: 0.5,
        }
    }
}

/// Alert correlation and escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Same-type anomalies within this window merge into one open alert (minutes).
    pub correlation_window_mins: i64,
    /// Unacknowledged high/critical alerts escalate after this (minutes).
    pub escalation_timeout_mins: i64,
    /// Escalation sweep cadence (seconds).
    pub escalation_sweep_secs: u64,
    /// Bound on contributing candidates kept in alert context.
    pub context_candidate_cap: usize,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            correlation_window_mins: 15,
            escalation_timeout_mins: 10,
            escalation_sweep_secs: 30,
            context_candidate_cap: 8,
        }
    }
}

/// Mitigation TTLs and enactment retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MitigationConfig {
    pub ttl_critical_mins: i64,
    pub ttl_high_mins: i64,
    pub ttl_medium_mins: i64,
    /// Expiry sweep cadence (seconds).
    pub expiry_sweep_secs: u64,
    /// Enactment attempts before the mitigation is flagged failed.
    pub enact_max_attempts: u32,
    /// Base delay for exponential enactment backoff (milliseconds).
    pub enact_backoff_base_ms: u64,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            ttl_critical_mins: 60,
            ttl_high_mins: 30,
            ttl_medium_mins: 15,
            expiry_sweep_secs: 30,
            enact_max_attempts: 4,
            enact_backoff_base_ms: 500,
        }
    }
}

/// Notification routing and retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Minimum severity routed to the pager channel.
    pub pager_min_severity: String,
    /// Minimum severity routed to the operator dashboard channel.
    pub dashboard_min_severity: String,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pager_min_severity: "high".to_string(),
            dashboard_min_severity: "low".to_string(),
            retry_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = UebaConfig::default();

        assert_eq!(cfg.baseline.history_capacity, 200);
        assert_eq!(cfg.baseline.min_samples, 10);
        assert_eq!(cfg.baseline.shard_count, 16);

        assert_eq!(cfg.detection.warning_sigma, 2.0);
        assert_eq!(cfg.detection.critical_sigma, 4.0);
        assert_eq!(cfg.detection.error_ratio_ceiling, 0.5);

        assert!(cfg.scoring.low_breakpoint < cfg.scoring.medium_breakpoint);
        assert!(cfg.scoring.medium_breakpoint < cfg.scoring.high_breakpoint);
        assert_eq!(cfg.scoring.repeat_offender_multiplier, 1.5);

        assert_eq!(cfg.alerting.correlation_window_mins, 15);
        assert_eq!(cfg.alerting.escalation_timeout_mins, 10);

        assert!(cfg.mitigation.ttl_critical_mins > cfg.mitigation.ttl_high_mins);
        assert!(cfg.mitigation.ttl_high_mins > cfg.mitigation.ttl_medium_mins);

        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[detection]
warning_sigma = 2.5
"#;

        let cfg: UebaConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.detection.warning_sigma, 2.5);
        // Everything else should be defaults.
        assert_eq!(cfg.detection.critical_sigma, 4.0);
        assert_eq!(cfg.baseline.min_samples, 10);
        assert_eq!(cfg.alerting.correlation_window_mins, 15);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: UebaConfig = toml::from_str("").unwrap();
        let defaults = UebaConfig::default();

        assert_eq!(cfg.baseline.history_capacity, defaults.baseline.history_capacity);
        assert_eq!(cfg.scoring.repeat_lookback_hours, defaults.scoring.repeat_lookback_hours);
        assert_eq!(cfg.mitigation.enact_max_attempts, defaults.mitigation.enact_max_attempts);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ueba.toml");
        std::fs::write(
            &path,
            r#"
[alerting]
correlation_window_mins = 5
"#,
        )
        .unwrap();

        let cfg = UebaConfig::load(&path).unwrap();
        assert_eq!(cfg.alerting.correlation_window_mins, 5);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = UebaConfig::load(Path::new("/nonexistent/path/ueba.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = UebaConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: UebaConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.detection.critical_sigma, roundtripped.detection.critical_sigma);
        assert_eq!(
            cfg.mitigation.ttl_critical_mins,
            roundtripped.mitigation.ttl_critical_mins
        );
    }
}
