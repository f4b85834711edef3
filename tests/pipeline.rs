//! End-to-end pipeline tests: events in, alerts and mitigations out.

use std::sync::Arc;

use chrono::{Duration, Utc};

use autosentry::alert::AlertStatus;
use autosentry::config::UebaConfig;
use autosentry::detect::{AlertType, Severity};
use autosentry::mitigate::{ActionType, Collaborators, MitigationError, MitigationStatus};
use autosentry::pipeline::{
    AgentExecution, BehaviorEvent, ChatSessionClosed, SystemMetricKind, SystemSample, Ueba,
};

fn engine() -> (Arc<Ueba>, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = autosentry::storage::open_pool_in(dir.path()).unwrap();
    let engine =
        autosentry::build_engine(pool, UebaConfig::default(), Collaborators::log_only()).unwrap();
    (engine, dir)
}

fn chat_event(duration: f64, messages: f64, offset_hours: i64) -> BehaviorEvent {
    BehaviorEvent::ChatSessionClosed(ChatSessionClosed {
        entity_id: "user_7".to_string(),
        session_type: "navigation".to_string(),
        duration_secs: duration,
        message_count: messages,
        gap_secs: Some(3600.0),
        timestamp: Utc::now() + Duration::hours(offset_hours),
    })
}

fn agent_event(error_ratio: f64) -> BehaviorEvent {
    BehaviorEvent::AgentExecution(AgentExecution {
        entity_id: "agent_42".to_string(),
        duration_ms: 100.0,
        error_ratio,
        memory_mb: 50.0,
        log_lines: 20.0,
        timestamp: Utc::now(),
    })
}

#[tokio::test]
async fn test_long_session_raises_duration_alert_and_mitigation() {
    let (engine, _dir) = engine();

    // Three weeks of ordinary sessions, roughly five minutes each, one
    // per hour, message counts wobbling around ten.
    for i in 0..20i64 {
        let duration = 300.0 + ((i % 5) as f64 - 2.0) * 30.0;
        let messages = 8.0 + (i % 5) as f64;
        engine.process_event(chat_event(duration, messages, i)).await;
    }
    assert!(engine
        .alerts
        .list(Some("user_7"), None, 10)
        .unwrap()
        .is_empty());

    // A forty-minute session.
    engine.process_event(chat_event(2400.0, 10.0, 21)).await;

    let alerts = engine.alerts.list(Some("user_7"), None, 10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::SessionDurationAnomaly);
    assert_eq!(alerts[0].severity, Severity::High);
    assert!(alerts[0].score >= 0.6);

    let mitigations = engine.mitigations.list(Some("user_7"), None, 10).unwrap();
    assert!(mitigations
        .iter()
        .any(|m| m.action_type == ActionType::IncreaseMonitoring
            && m.status == MitigationStatus::Active));
}

#[tokio::test]
async fn test_agent_error_burst_isolates_agent() {
    let (engine, _dir) = engine();

    for _ in 0..20 {
        engine.process_event(agent_event(0.05)).await;
    }
    engine.process_event(agent_event(0.55)).await;

    let alerts = engine.alerts.list(Some("agent_42"), None, 10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::ErrorRateSpike);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].status, AlertStatus::New);

    let mitigations = engine.mitigations.list(Some("agent_42"), None, 10).unwrap();
    let actions: Vec<ActionType> = mitigations.iter().map(|m| m.action_type).collect();
    assert!(actions.contains(&ActionType::IsolateAgent));
    assert!(actions.contains(&ActionType::RequireMfa));
}

#[tokio::test]
async fn test_sustained_burst_correlates_into_one_alert() {
    let (engine, _dir) = engine();

    for _ in 0..20 {
        engine.process_event(agent_event(0.05)).await;
    }
    engine.process_event(agent_event(0.55)).await;
    engine.process_event(agent_event(0.60)).await;
    engine.process_event(agent_event(0.58)).await;

    let alerts = engine.alerts.list(Some("agent_42"), None, 10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].occurrence_count, 3);

    // A mitigation of each proposed type stays singular too.
    let mitigations = engine.mitigations.list(Some("agent_42"), None, 10).unwrap();
    let isolations = mitigations
        .iter()
        .filter(|m| m.action_type == ActionType::IsolateAgent)
        .count();
    assert_eq!(isolations, 1);
}

#[tokio::test]
async fn test_mitigation_expires_after_ttl() {
    let (engine, _dir) = engine();

    for _ in 0..20 {
        engine.process_event(agent_event(0.05)).await;
    }
    engine.process_event(agent_event(0.55)).await;

    let mitigations = engine.mitigations.list(Some("agent_42"), None, 10).unwrap();
    assert!(!mitigations.is_empty());

    // Inside the critical TTL nothing expires.
    let expired = engine
        .mitigations
        .expire_sweep(Utc::now() + Duration::minutes(11))
        .unwrap();
    assert_eq!(expired, 0);

    let expired = engine
        .mitigations
        .expire_sweep(Utc::now() + Duration::minutes(61))
        .unwrap();
    assert_eq!(expired, mitigations.len());

    let after = engine.mitigations.list(Some("agent_42"), None, 10).unwrap();
    assert!(after.iter().all(|m| m.status == MitigationStatus::Expired));

    // Expired mitigations cannot be revoked.
    let err = engine.mitigations.revoke(after[0].mitigation_id, "op");
    assert!(matches!(err, Err(MitigationError::AlreadyFinished(_))));
}

#[tokio::test]
async fn test_unacknowledged_critical_alert_escalates_once() {
    let (engine, _dir) = engine();

    for _ in 0..20 {
        engine.process_event(agent_event(0.05)).await;
    }
    engine.process_event(agent_event(0.55)).await;

    let later = Utc::now() + Duration::minutes(20);
    let escalated = engine.alerts.escalate_overdue(later).unwrap();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].status, AlertStatus::Escalated);

    // A second sweep finds nothing left to escalate.
    assert!(engine
        .alerts
        .escalate_overdue(later + Duration::minutes(1))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_queue_saturation_scales_resources() {
    let (engine, _dir) = engine();

    for i in 0..20 {
        engine
            .process_event(BehaviorEvent::SystemSample(SystemSample {
                entity_id: "inference_queue".to_string(),
                metric: SystemMetricKind::QueueDepth,
                value: 40.0 + (i % 5) as f64,
                timestamp: Utc::now(),
            }))
            .await;
    }
    engine
        .process_event(BehaviorEvent::SystemSample(SystemSample {
            entity_id: "inference_queue".to_string(),
            metric: SystemMetricKind::QueueDepth,
            value: 1500.0,
            timestamp: Utc::now(),
        }))
        .await;

    let alerts = engine.alerts.list(Some("inference_queue"), None, 10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::ResourceExhaustion);
    assert_eq!(alerts[0].severity, Severity::Critical);

    let mitigations = engine
        .mitigations
        .list(Some("inference_queue"), None, 10)
        .unwrap();
    assert!(mitigations
        .iter()
        .any(|m| m.action_type == ActionType::ScaleResources));
}

#[tokio::test]
async fn test_profiles_survive_checkpoint_reload() {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = autosentry::storage::open_pool_in(dir.path()).unwrap();
    let engine =
        autosentry::build_engine(pool.clone(), UebaConfig::default(), Collaborators::log_only())
            .unwrap();

    for _ in 0..20 {
        engine.process_event(agent_event(0.05)).await;
    }
    let written = engine.store.checkpoint(&pool).unwrap();
    assert!(written >= 1);

    // A fresh engine over the same database picks the baselines back up:
    // the first burst after reload still compares against a mature profile.
    let engine2 =
        autosentry::build_engine(pool.clone(), UebaConfig::default(), Collaborators::log_only())
            .unwrap();
    assert_eq!(engine2.store.load(&pool).unwrap(), 1);

    engine2.process_event(agent_event(0.55)).await;
    let alerts = engine2.alerts.list(Some("agent_42"), None, 10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
}
