//! Agent behavior detector -- error-rate spikes, execution-time
//! regression, memory leak signals, log-volume anomalies.

use crate::config::DetectionConfig;
use crate::pipeline::AgentExecution;
use crate::profile::baseline::BaselineSnapshot;

use super::{AlertType, AnomalyCandidate, DetectorSource};

pub struct AgentSnapshots {
    pub error_ratio: BaselineSnapshot,
    pub exec_time: BaselineSnapshot,
    pub memory: BaselineSnapshot,
    pub log_lines: BaselineSnapshot,
}

pub fn detect(
    event: &AgentExecution,
    snaps: &AgentSnapshots,
    cfg: &DetectionConfig,
    min_samples: usize,
) -> Vec<AnomalyCandidate> {
    let mut out = Vec::new();

    let base = |alert_type: AlertType, metric: &str, snap: &BaselineSnapshot, value: f64, dev: f64| {
        AnomalyCandidate {
            entity_id: event.entity_id.clone(),
            entity_type: crate::profile::EntityType::Agent,
            alert_type,
            metric: metric.to_string(),
            observed_value: value,
            baseline_mean: snap.mean,
            baseline_stddev: snap.std_dev,
            deviation: dev,
            local_confidence: snap.confidence(min_samples),
            detector_source: DetectorSource::Agent,
            immature_baseline: snap.immature,
            hard_critical: false,
            timestamp: event.timestamp,
        }
    };

    // Error rate. The hard ceiling is a safety floor: above it the agent
    // is misbehaving no matter what its history says, so the maturity
    // guard does not apply.
    if event.error_ratio >= cfg.error_ratio_ceiling {
        let dev = (event.error_ratio / cfg.error_ratio_ceiling) * cfg.critical_sigma;
        let mut c = base(
            AlertType::ErrorRateSpike,
            "error_ratio",
            &snaps.error_ratio,
            event.error_ratio,
            dev,
        );
        c.hard_critical = true;
        c.local_confidence = c.local_confidence.max(0.9);
        c.immature_baseline = false;
        out.push(c);
    } else if !snaps.error_ratio.immature {
        let z = snaps.error_ratio.z_score(event.error_ratio);
        if z >= cfg.warning_sigma {
            let dev = if z.is_finite() { z } else { cfg.critical_sigma * 2.0 };
            out.push(base(
                AlertType::ErrorRateSpike,
                "error_ratio",
                &snaps.error_ratio,
                event.error_ratio,
                dev,
            ));
        }
    }

    // Execution-time regression against the historical percentile.
    if !snaps.exec_time.immature {
        if let Some(pct) = snaps.exec_time.percentile(cfg.exec_time_percentile) {
            let z = snaps.exec_time.z_score(event.duration_ms);
            if event.duration_ms > pct && z >= cfg.warning_sigma {
                let dev = if z.is_finite() { z } else { cfg.critical_sigma * 2.0 };
                out.push(base(
                    AlertType::ExecutionTimeRegression,
                    "exec_time_ms",
                    &snaps.exec_time,
                    event.duration_ms,
                    dev,
                ));
            }
        }
    }

    // Memory: monotonic growth across the recent run is a leak signal
    // even when no single sample is an outlier.
    if !snaps.memory.immature && snaps.memory.history.len() >= cfg.leak_run_len {
        let tail: Vec<f64> = snaps
            .memory
            .history
            .iter()
            .rev()
            .take(cfg.leak_run_len)
            .rev()
            .map(|(v, _)| *v)
            .collect();
        let tail_with_current: Vec<f64> =
            tail.iter().copied().chain(std::iter::once(event.memory_mb)).collect();
        if is_monotonic_growth(&tail_with_current, cfg.leak_growth_ratio) {
            let first = tail_with_current[0].max(f64::EPSILON);
            let growth = (event.memory_mb - tail_with_current[0]) / first;
            let dev = cfg.warning_sigma + growth * cfg.critical_sigma;
            out.push(base(
                AlertType::MemoryLeak,
                "memory_mb",
                &snaps.memory,
                event.memory_mb,
                dev,
            ));
        } else {
            let z = snaps.memory.z_score(event.memory_mb);
            if z >= cfg.warning_sigma {
                let dev = if z.is_finite() { z } else { cfg.critical_sigma * 2.0 };
                out.push(base(
                    AlertType::MemoryLeak,
                    "memory_mb",
                    &snaps.memory,
                    event.memory_mb,
                    dev,
                ));
            }
        }
    }

    // Abnormal log volume.
    if !snaps.log_lines.immature {
        let z = snaps.log_lines.z_score(event.log_lines);
        if z >= cfg.warning_sigma {
            let dev = if z.is_finite() { z } else { cfg.critical_sigma * 2.0 };
            out.push(base(
                AlertType::LogVolumeAnomaly,
                "log_lines",
                &snaps.log_lines,
                event.log_lines,
                dev,
            ));
        }
    }

    out
}

/// True when the series never decreases, rises strictly at least once, and
/// grows by at least `min_ratio` end to end.
fn is_monotonic_growth(values: &[f64], min_ratio: f64) -> bool {
    if values.len() < 2 {
        return false;
    }
    let mut any_rise = false;
    for pair in values.windows(2) {
        if pair[1] < pair[0] {
            return false;
        }
        if pair[1] > pair[0] {
            any_rise = true;
        }
    }
    let first = values[0].max(f64::EPSILON);
    any_rise && (values[values.len() - 1] - values[0]) / first >= min_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaselineConfig;
    use crate::profile::{EntityType, ProfileStore};
    use chrono::Utc;

    fn event(error_ratio: f64, duration_ms: f64, memory_mb: f64, log_lines: f64) -> AgentExecution {
        AgentExecution {
            entity_id: "agent_42".to_string(),
            duration_ms,
            error_ratio,
            memory_mb,
            log_lines,
            timestamp: Utc::now(),
        }
    }

    fn observe(store: &ProfileStore, e: &AgentExecution) -> AgentSnapshots {
        let ts = e.timestamp;
        AgentSnapshots {
            error_ratio: store.observe(&e.entity_id, EntityType::Agent, "error_ratio", e.error_ratio, ts),
            exec_time: store.observe(&e.entity_id, EntityType::Agent, "exec_time_ms", e.duration_ms, ts),
            memory: store.observe(&e.entity_id, EntityType::Agent, "memory_mb", e.memory_mb, ts),
            log_lines: store.observe(&e.entity_id, EntityType::Agent, "log_lines", e.log_lines, ts),
        }
    }

    #[test]
    fn test_error_ceiling_fires_regardless_of_maturity() {
        let store = ProfileStore::new(BaselineConfig::default());
        let cfg = DetectionConfig::default();

        // First ever observation, wildly over the ceiling.
        let e = event(0.55, 100.0, 50.0, 20.0);
        let s = observe(&store, &e);
        let candidates = detect(&e, &s, &cfg, 10);

        let c = candidates
            .iter()
            .find(|c| c.alert_type == AlertType::ErrorRateSpike)
            .expect("ceiling breach must produce a candidate");
        assert!(c.hard_critical);
    }

    #[test]
    fn test_error_burst_after_stable_baseline() {
        let store = ProfileStore::new(BaselineConfig::default());
        let cfg = DetectionConfig::default();

        for _ in 0..20 {
            let e = event(0.05, 100.0, 50.0, 20.0);
            let s = observe(&store, &e);
            let found = detect(&e, &s, &cfg, 10);
            assert!(found.iter().all(|c| c.alert_type != AlertType::ErrorRateSpike));
        }

        let e = event(0.55, 100.0, 50.0, 20.0);
        let s = observe(&store, &e);
        let candidates = detect(&e, &s, &cfg, 10);
        let c = candidates
            .iter()
            .find(|c| c.alert_type == AlertType::ErrorRateSpike)
            .unwrap();
        assert!(c.hard_critical);
        assert!(c.deviation >= cfg.critical_sigma);
    }

    #[test]
    fn test_monotonic_memory_growth_flagged() {
        let store = ProfileStore::new(BaselineConfig::default());
        let cfg = DetectionConfig::default();

        let mut last = Vec::new();
        for i in 0..15 {
            // Memory creeps up ~5% per run.
            let e = event(0.05, 100.0, 100.0 * 1.05_f64.powi(i), 20.0);
            let s = observe(&store, &e);
            last = detect(&e, &s, &cfg, 10);
        }
        assert!(last.iter().any(|c| c.alert_type == AlertType::MemoryLeak));
    }

    #[test]
    fn test_flat_memory_not_flagged() {
        let store = ProfileStore::new(BaselineConfig::default());
        let cfg = DetectionConfig::default();

        let mut all = Vec::new();
        for _ in 0..15 {
            let e = event(0.05, 100.0, 100.0, 20.0);
            let s = observe(&store, &e);
            all.extend(detect(&e, &s, &cfg, 10));
        }
        assert!(all.iter().all(|c| c.alert_type != AlertType::MemoryLeak));
    }

    #[test]
    fn test_monotonic_growth_helper() {
        assert!(is_monotonic_growth(&[1.0, 1.1, 1.2, 1.3], 0.2));
        assert!(!is_monotonic_growth(&[1.0, 1.1, 1.0, 1.3], 0.2));
        assert!(!is_monotonic_growth(&[1.0, 1.0, 1.0], 0.2));
        assert!(!is_monotonic_growth(&[1.0, 1.05], 0.2)); // growth too small
    }

    #[test]
    fn test_exec_time_regression() {
        let store = ProfileStore::new(BaselineConfig::default());
        let cfg = DetectionConfig::default();

        for i in 0..30 {
            let e = event(0.05, 100.0 + (i % 7) as f64, 50.0, 20.0);
            let s = observe(&store, &e);
            detect(&e, &s, &cfg, 10);
        }

        let e = event(0.05, 400.0, 50.0, 20.0);
        let s = observe(&store, &e);
        let candidates = detect(&e, &s, &cfg, 10);
        assert!(candidates
            .iter()
            .any(|c| c.alert_type == AlertType::ExecutionTimeRegression));
    }
}
