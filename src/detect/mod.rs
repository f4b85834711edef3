//! Anomaly detection -- candidate types, detector families, scoring.

pub mod agent;
pub mod chat;
pub mod score;
pub mod system;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::EntityType;

/// Severity levels for scored anomalies and alerts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Behavioral alert categories. One open alert per (entity, type) at a time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SessionDurationAnomaly,
    MessageBurst,
    SessionFrequencyAnomaly,
    SessionTypeAnomaly,
    ErrorRateSpike,
    ExecutionTimeRegression,
    MemoryLeak,
    LogVolumeAnomaly,
    ResourceExhaustion,
    MitigationFailed,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertType::SessionDurationAnomaly => "session_duration_anomaly",
            AlertType::MessageBurst => "message_burst",
            AlertType::SessionFrequencyAnomaly => "session_frequency_anomaly",
            AlertType::SessionTypeAnomaly => "session_type_anomaly",
            AlertType::ErrorRateSpike => "error_rate_spike",
            AlertType::ExecutionTimeRegression => "execution_time_regression",
            AlertType::MemoryLeak => "memory_leak",
            AlertType::LogVolumeAnomaly => "log_volume_anomaly",
            AlertType::ResourceExhaustion => "resource_exhaustion",
            AlertType::MitigationFailed => "mitigation_failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_duration_anomaly" => Ok(AlertType::SessionDurationAnomaly),
            "message_burst" => Ok(AlertType::MessageBurst),
            "session_frequency_anomaly" => Ok(AlertType::SessionFrequencyAnomaly),
            "session_type_anomaly" => Ok(AlertType::SessionTypeAnomaly),
            "error_rate_spike" => Ok(AlertType::ErrorRateSpike),
            "execution_time_regression" => Ok(AlertType::ExecutionTimeRegression),
            "memory_leak" => Ok(AlertType::MemoryLeak),
            "log_volume_anomaly" => Ok(AlertType::LogVolumeAnomaly),
            "resource_exhaustion" => Ok(AlertType::ResourceExhaustion),
            "mitigation_failed" => Ok(AlertType::MitigationFailed),
            other => Err(format!("unknown alert type: {other}")),
        }
    }
}

/// Which detector family produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorSource {
    Chat,
    Agent,
    System,
}

/// A single flagged deviation, produced by a detector and consumed
/// immediately by the scorer. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyCandidate {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub alert_type: AlertType,
    pub metric: String,
    pub observed_value: f64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    /// Deviation in the detector's own units: sigma multiples for statistical
    /// checks, ratio-over-ceiling for absolute safety checks.
    pub deviation: f64,
    pub local_confidence: f64,
    pub detector_source: DetectorSource,
    pub immature_baseline: bool,
    /// Absolute-ceiling candidates are critical regardless of score math.
    pub hard_critical: bool,
    pub timestamp: DateTime<Utc>,
}
