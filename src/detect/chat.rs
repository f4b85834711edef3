//! Chat behavior detector -- session duration, message bursts, session
//! creation frequency, session-type transitions.

use chrono::Duration;

use crate::config::DetectionConfig;
use crate::pipeline::ChatSessionClosed;
use crate::profile::baseline::BaselineSnapshot;
use crate::profile::TransitionSnapshot;

use super::{AlertType, AnomalyCandidate, DetectorSource};

/// Baseline snapshots the chat detector consumes for one event.
pub struct ChatSnapshots {
    pub duration: BaselineSnapshot,
    pub messages: BaselineSnapshot,
    /// Inter-arrival gap between session starts (seconds). History
    /// timestamps double as the session-start times for window counting.
    pub gap: BaselineSnapshot,
    pub transition: TransitionSnapshot,
}

pub fn detect(
    event: &ChatSessionClosed,
    snaps: &ChatSnapshots,
    cfg: &DetectionConfig,
    min_samples: usize,
) -> Vec<AnomalyCandidate> {
    let mut out = Vec::new();

    let base = |alert_type: AlertType, metric: &str, snap: &BaselineSnapshot, value: f64, dev: f64| {
        AnomalyCandidate {
            entity_id: event.entity_id.clone(),
            entity_type: crate::profile::EntityType::User,
            alert_type,
            metric: metric.to_string(),
            observed_value: value,
            baseline_mean: snap.mean,
            baseline_stddev: snap.std_dev,
            deviation: dev,
            local_confidence: snap.confidence(min_samples),
            detector_source: DetectorSource::Chat,
            immature_baseline: snap.immature,
            hard_critical: false,
            timestamp: event.timestamp,
        }
    };

    // Session duration. The absolute floor suppresses noise from short
    // sessions; the absolute ceiling catches runaway sessions even when
    // the baseline is degenerate or still warming up.
    let duration = event.duration_secs;
    if duration >= cfg.session_duration_floor_secs {
        if duration > cfg.session_duration_ceiling_secs {
            let dev = (duration / cfg.session_duration_ceiling_secs) * cfg.critical_sigma;
            let mut c = base(
                AlertType::SessionDurationAnomaly,
                "session_duration_secs",
                &snaps.duration,
                duration,
                dev,
            );
            c.local_confidence = c.local_confidence.max(0.8);
            out.push(c);
        } else if !snaps.duration.immature {
            let z = snaps.duration.z_score(duration);
            if z >= cfg.warning_sigma {
                let dev = if z.is_finite() { z } else { cfg.critical_sigma * 2.0 };
                out.push(base(
                    AlertType::SessionDurationAnomaly,
                    "session_duration_secs",
                    &snaps.duration,
                    duration,
                    dev,
                ));
            }
        }
    }

    // Message-count burst, a possible automation/abuse signal.
    if !snaps.messages.immature {
        let z = snaps.messages.z_score(event.message_count);
        if z >= cfg.warning_sigma {
            let dev = if z.is_finite() { z } else { cfg.critical_sigma * 2.0 };
            out.push(base(
                AlertType::MessageBurst,
                "message_count",
                &snaps.messages,
                event.message_count,
                dev,
            ));
        }
    }

    // Rapid repeated session creation: a sliding-window count over recorded
    // session starts, plus an inter-arrival z-score once the gap baseline
    // is mature.
    let window_start = event.timestamp - Duration::seconds(cfg.session_burst_window_secs);
    let in_window = snaps.gap.history.iter().filter(|(_, ts)| *ts >= window_start).count();
    if in_window >= cfg.session_burst_ceiling {
        let dev = (in_window as f64 / cfg.session_burst_ceiling as f64) * cfg.critical_sigma;
        let mut c = base(
            AlertType::SessionFrequencyAnomaly,
            "session_gap_secs",
            &snaps.gap,
            in_window as f64,
            dev,
        );
        c.local_confidence = c.local_confidence.max(0.8);
        out.push(c);
    } else if !snaps.gap.immature {
        if let Some(gap) = event.gap_secs {
            // Unusually small gaps deviate on the negative side.
            let z = snaps.gap.z_score(gap);
            if z <= -cfg.warning_sigma {
                let dev = if z.is_finite() { -z } else { cfg.critical_sigma * 2.0 };
                out.push(base(
                    AlertType::SessionFrequencyAnomaly,
                    "session_gap_secs",
                    &snaps.gap,
                    gap,
                    dev,
                ));
            }
        }
    }

    // Unusual session-type transition, once enough transitions exist to
    // call any of them usual.
    let t = &snaps.transition;
    if t.from.is_some() && t.total as usize >= min_samples {
        let ratio = t.seen as f64 / t.total as f64;
        if ratio < cfg.rare_transition_ratio {
            let rarity = 1.0 - (ratio / cfg.rare_transition_ratio);
            let dev = cfg.warning_sigma + (cfg.critical_sigma - cfg.warning_sigma) * rarity;
            let maturity = (t.total as f64 / (3.0 * min_samples as f64)).min(1.0);
            out.push(AnomalyCandidate {
                entity_id: event.entity_id.clone(),
                entity_type: crate::profile::EntityType::User,
                alert_type: AlertType::SessionTypeAnomaly,
                metric: "session_type_transition".to_string(),
                observed_value: ratio,
                baseline_mean: cfg.rare_transition_ratio,
                baseline_stddev: 0.0,
                deviation: dev,
                local_confidence: maturity,
                detector_source: DetectorSource::Chat,
                immature_baseline: false,
                hard_critical: false,
                timestamp: event.timestamp,
            });
        }
    }

    out
}
