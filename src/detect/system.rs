//! System behavior detector -- resource-metric deviation against
//! historical trend, with absolute safety ceilings.

use crate::config::DetectionConfig;
use crate::pipeline::{SystemMetricKind, SystemSample};
use crate::profile::baseline::BaselineSnapshot;

use super::{AlertType, AnomalyCandidate, DetectorSource};

pub fn detect(
    event: &SystemSample,
    snap: &BaselineSnapshot,
    cfg: &DetectionConfig,
    min_samples: usize,
) -> Vec<AnomalyCandidate> {
    let mut out = Vec::new();

    let ceiling = match event.metric {
        SystemMetricKind::CpuPct => cfg.cpu_ceiling_pct,
        SystemMetricKind::MemoryPct => cfg.memory_ceiling_pct,
        SystemMetricKind::QueueDepth => cfg.queue_depth_ceiling,
    };

    let candidate = |dev: f64, hard: bool, confidence: f64| AnomalyCandidate {
        entity_id: event.entity_id.clone(),
        entity_type: crate::profile::EntityType::System,
        alert_type: AlertType::ResourceExhaustion,
        metric: event.metric.to_string(),
        observed_value: event.value,
        baseline_mean: snap.mean,
        baseline_stddev: snap.std_dev,
        deviation: dev,
        local_confidence: confidence,
        detector_source: DetectorSource::System,
        immature_baseline: if hard { false } else { snap.immature },
        hard_critical: hard,
        timestamp: event.timestamp,
    };

    // Safety ceiling first: resource saturation is actionable with zero
    // history.
    if event.value >= ceiling {
        let dev = (event.value / ceiling) * cfg.critical_sigma;
        out.push(candidate(dev, true, snap.confidence(min_samples).max(0.9)));
        return out;
    }

    // Relative trend break.
    if !snap.immature {
        let z = snap.z_score(event.value);
        if z >= cfg.warning_sigma {
            let dev = if z.is_finite() { z } else { cfg.critical_sigma * 2.0 };
            out.push(candidate(dev, false, snap.confidence(min_samples)));
        }
    }

    out
}
