//! Anomaly scorer -- collapses same-type candidates into one weighted,
//! confidence-adjusted severity verdict.

use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;
use crate::profile::EntityType;

use super::{AlertType, AnomalyCandidate, Severity};

/// Recent same-type alert history for the entity, queried from the alert
/// store by the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepeatOffenseContext {
    pub prior_same_type: u32,
}

/// One scored anomaly, ready for the alert manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredAnomaly {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub score: f64,
    pub confidence: f64,
    pub contributors: Vec<AnomalyCandidate>,
}

/// Relative weight of each alert category. Safety-critical signals
/// outweigh soft usage signals.
fn type_weight(alert_type: AlertType) -> f64 {
    match alert_type {
        AlertType::ErrorRateSpike => 1.0,
        AlertType::ResourceExhaustion => 1.0,
        AlertType::MitigationFailed => 1.0,
        AlertType::MemoryLeak => 0.9,
        AlertType::SessionFrequencyAnomaly => 0.8,
        AlertType::MessageBurst => 0.7,
        AlertType::ExecutionTimeRegression => 0.7,
        AlertType::SessionDurationAnomaly => 0.6,
        AlertType::SessionTypeAnomaly => 0.6,
        AlertType::LogVolumeAnomaly => 0.5,
    }
}

fn severity_for(score: f64, cfg: &ScoringConfig) -> Severity {
    if score < cfg.low_breakpoint {
        Severity::Low
    } else if score < cfg.medium_breakpoint {
        Severity::Medium
    } else if score < cfg.high_breakpoint {
        Severity::High
    } else {
        Severity::Critical
    }
}

/// Score one group of candidates sharing an alert type. Returns `None`
/// for an empty group.
pub fn score(
    candidates: &[AnomalyCandidate],
    repeat: RepeatOffenseContext,
    cfg: &ScoringConfig,
    critical_sigma: f64,
) -> Option<ScoredAnomaly> {
    let first = candidates.first()?;
    let alert_type = first.alert_type;
    let weight = type_weight(alert_type);

    // Saturating normalization of each deviation, then a weighted mean.
    // All candidates in a group carry the same type weight, so the group
    // weight scales the aggregate against other alert types.
    let mut norm_sum = 0.0;
    for c in candidates {
        let norm = (c.deviation / critical_sigma).clamp(0.0, 1.0);
        norm_sum += norm;
    }
    let mut final_score = weight * (norm_sum / candidates.len() as f64);

    if repeat.prior_same_type >= cfg.repeat_offender_threshold {
        final_score *= cfg.repeat_offender_multiplier;
    }
    final_score = final_score.clamp(0.0, 1.0);

    let any_hard = candidates.iter().any(|c| c.hard_critical);
    let mut severity = severity_for(final_score, cfg);
    if any_hard {
        severity = Severity::Critical;
        final_score = final_score.max(cfg.high_breakpoint);
    }

    let mut confidence =
        candidates.iter().map(|c| c.local_confidence).sum::<f64>() / candidates.len() as f64;
    if candidates.iter().any(|c| c.immature_baseline) {
        confidence *= cfg.immature_confidence_discount;
    }

    Some(ScoredAnomaly {
        entity_id: first.entity_id.clone(),
        entity_type: first.entity_type,
        alert_type,
        severity,
        score: final_score,
        confidence: confidence.clamp(0.0, 1.0),
        contributors: candidates.to_vec(),
    })
}

/// Group candidates by alert type and score each group.
pub fn score_all(
    candidates: Vec<AnomalyCandidate>,
    repeat_for: impl Fn(AlertType) -> RepeatOffenseContext,
    cfg: &ScoringConfig,
    critical_sigma: f64,
) -> Vec<ScoredAnomaly> {
    use std::collections::BTreeMap;
    let mut groups: BTreeMap<AlertType, Vec<AnomalyCandidate>> = BTreeMap::new();
    for c in candidates {
        groups.entry(c.alert_type).or_default().push(c);
    }
    groups
        .into_iter()
        .filter_map(|(alert_type, group)| score(&group, repeat_for(alert_type), cfg, critical_sigma))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectorSource;
    use chrono::Utc;

    fn candidate(alert_type: AlertType, deviation: f64) -> AnomalyCandidate {
        AnomalyCandidate {
            entity_id: "agent_42".to_string(),
            entity_type: EntityType::Agent,
            alert_type,
            metric: "m".to_string(),
            observed_value: 1.0,
            baseline_mean: 0.0,
            baseline_stddev: 1.0,
            deviation,
            local_confidence: 0.8,
            detector_source: DetectorSource::Agent,
            immature_baseline: false,
            hard_critical: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_group_scores_nothing() {
        assert!(score(&[], RepeatOffenseContext::default(), &ScoringConfig::default(), 4.0).is_none());
    }

    #[test]
    fn test_saturated_error_spike_is_critical() {
        let cfg = ScoringConfig::default();
        let c = candidate(AlertType::ErrorRateSpike, 8.0); // 2x critical sigma
        let s = score(&[c], RepeatOffenseContext::default(), &cfg, 4.0).unwrap();
        assert_eq!(s.severity, Severity::Critical);
        assert_eq!(s.score, 1.0);
    }

    #[test]
    fn test_hard_critical_overrides_breakpoints() {
        let cfg = ScoringConfig::default();
        let mut c = candidate(AlertType::ErrorRateSpike, 1.0); // weak deviation
        c.hard_critical = true;
        let s = score(&[c], RepeatOffenseContext::default(), &cfg, 4.0).unwrap();
        assert_eq!(s.severity, Severity::Critical);
        assert!(s.score >= cfg.high_breakpoint);
    }

    #[test]
    fn test_soft_metric_weighted_down() {
        let cfg = ScoringConfig::default();
        let hard = score(
            &[candidate(AlertType::ErrorRateSpike, 3.0)],
            RepeatOffenseContext::default(),
            &cfg,
            4.0,
        )
        .unwrap();
        let soft = score(
            &[candidate(AlertType::LogVolumeAnomaly, 3.0)],
            RepeatOffenseContext::default(),
            &cfg,
            4.0,
        )
        .unwrap();
        assert!(hard.score > soft.score);
    }

    #[test]
    fn test_repeat_offender_multiplier_bounded() {
        let cfg = ScoringConfig::default();
        let c = candidate(AlertType::SessionDurationAnomaly, 2.4);
        let base = score(&[c.clone()], RepeatOffenseContext::default(), &cfg, 4.0).unwrap();
        let boosted = score(
            &[c],
            RepeatOffenseContext { prior_same_type: 5 },
            &cfg,
            4.0,
        )
        .unwrap();
        let ratio = boosted.score / base.score;
        assert!((ratio - cfg.repeat_offender_multiplier).abs() < 1e-9);
        assert!(boosted.score <= 1.0);
    }

    #[test]
    fn test_immature_contributor_discounts_confidence() {
        let cfg = ScoringConfig::default();
        let mut c = candidate(AlertType::MessageBurst, 3.0);
        c.immature_baseline = true;
        let s = score(&[c], RepeatOffenseContext::default(), &cfg, 4.0).unwrap();
        assert!((s.confidence - 0.8 * cfg.immature_confidence_discount).abs() < 1e-9);
    }

    #[test]
    fn test_score_all_groups_by_type() {
        let cfg = ScoringConfig::default();
        let candidates = vec![
            candidate(AlertType::ErrorRateSpike, 4.0),
            candidate(AlertType::ErrorRateSpike, 3.0),
            candidate(AlertType::LogVolumeAnomaly, 2.5),
        ];
        let scored = score_all(candidates, |_| RepeatOffenseContext::default(), &cfg, 4.0);
        assert_eq!(scored.len(), 2);
        assert!(scored.iter().any(|s| s.alert_type == AlertType::ErrorRateSpike));
        assert!(scored.iter().any(|s| s.alert_type == AlertType::LogVolumeAnomaly));
        let err = scored.iter().find(|s| s.alert_type == AlertType::ErrorRateSpike).unwrap();
        assert_eq!(err.contributors.len(), 2);
    }
}
