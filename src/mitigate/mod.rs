//! Mitigation Engine -- maps alerts to automated, time-bounded response
//! actions and owns the Mitigation lifecycle.
//!
//! Status only moves forward (active -> expired | revoked). Enactment of
//! external actions runs asynchronously with bounded backoff; exhausted
//! retries raise a critical mitigation-failed alert instead of failing
//! silently.

pub mod enact;

pub use enact::Collaborators;

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::{AlertManager, SecurityAlert};
use crate::config::MitigationConfig;
use crate::detect::score::ScoredAnomaly;
use crate::detect::{AlertType, Severity};
use crate::dispatch::{DispatchEvent, EscalationDispatcher};
use crate::storage::Pool;

#[derive(Debug, Error)]
pub enum MitigationError {
    #[error("mitigation not found: {0}")]
    NotFound(Uuid),
    #[error("mitigation already finished: {0}")]
    AlreadyFinished(Uuid),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Automated response action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RateLimit,
    RequireMfa,
    IsolateAgent,
    BlockEntity,
    IncreaseMonitoring,
    ScaleResources,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::RateLimit => "rate_limit",
            ActionType::RequireMfa => "require_mfa",
            ActionType::IsolateAgent => "isolate_agent",
            ActionType::BlockEntity => "block_entity",
            ActionType::IncreaseMonitoring => "increase_monitoring",
            ActionType::ScaleResources => "scale_resources",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limit" => Ok(ActionType::RateLimit),
            "require_mfa" => Ok(ActionType::RequireMfa),
            "isolate_agent" => Ok(ActionType::IsolateAgent),
            "block_entity" => Ok(ActionType::BlockEntity),
            "increase_monitoring" => Ok(ActionType::IncreaseMonitoring),
            "scale_resources" => Ok(ActionType::ScaleResources),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationStatus {
    Active,
    Expired,
    Revoked,
}

impl std::fmt::Display for MitigationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MitigationStatus::Active => write!(f, "active"),
            MitigationStatus::Expired => write!(f, "expired"),
            MitigationStatus::Revoked => write!(f, "revoked"),
        }
    }
}

impl std::str::FromStr for MitigationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MitigationStatus::Active),
            "expired" => Ok(MitigationStatus::Expired),
            "revoked" => Ok(MitigationStatus::Revoked),
            other => Err(format!("unknown mitigation status: {other}")),
        }
    }
}

/// Whether the external action behind a mitigation has been carried out.
/// Orthogonal to `status`; a failed enactment leaves the record active
/// and flagged for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnactState {
    Pending,
    Enacted,
    Failed,
}

impl std::fmt::Display for EnactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnactState::Pending => write!(f, "pending"),
            EnactState::Enacted => write!(f, "enacted"),
            EnactState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for EnactState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnactState::Pending),
            "enacted" => Ok(EnactState::Enacted),
            "failed" => Ok(EnactState::Failed),
            other => Err(format!("unknown enact state: {other}")),
        }
    }
}

/// An automated, time-bounded corrective action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mitigation {
    pub mitigation_id: Uuid,
    pub entity_id: String,
    pub action_type: ActionType,
    pub triggering_alert_id: Uuid,
    pub status: MitigationStatus,
    pub enact_state: EnactState,
    pub applied_at: DateTime<Utc>,
    pub ttl_secs: i64,
    pub expires_at: DateTime<Utc>,
    pub revoked_by: Option<String>,
}

/// Static playbook: which actions a given (alert type, severity) pair
/// proposes. Compiled-in so the mapping is exhaustively checkable.
pub fn actions_for(alert_type: AlertType, severity: Severity) -> &'static [ActionType] {
    use ActionType::*;
    use Severity::*;
    match (alert_type, severity) {
        (AlertType::ErrorRateSpike, Critical) => &[IsolateAgent, RequireMfa],
        (AlertType::ErrorRateSpike, High) => &[IncreaseMonitoring],
        (AlertType::ExecutionTimeRegression, Critical) => &[IncreaseMonitoring],
        (AlertType::MemoryLeak, Critical) => &[IsolateAgent, IncreaseMonitoring],
        (AlertType::MemoryLeak, High) => &[IncreaseMonitoring],
        (AlertType::LogVolumeAnomaly, Critical) => &[IncreaseMonitoring],
        (AlertType::MessageBurst, Critical) => &[RateLimit, IncreaseMonitoring],
        (AlertType::MessageBurst, High) => &[RateLimit],
        (AlertType::SessionFrequencyAnomaly, Critical) => &[RateLimit, BlockEntity],
        (AlertType::SessionFrequencyAnomaly, High) => &[RateLimit],
        (AlertType::SessionDurationAnomaly, Critical) => &[RequireMfa, IncreaseMonitoring],
        (AlertType::SessionDurationAnomaly, High) => &[IncreaseMonitoring],
        (AlertType::SessionTypeAnomaly, Critical) => &[RequireMfa],
        (AlertType::ResourceExhaustion, Critical) => &[ScaleResources, IncreaseMonitoring],
        (AlertType::ResourceExhaustion, High) => &[ScaleResources],
        // Mitigation-failed alerts are for the operator, never auto-acted.
        (AlertType::MitigationFailed, _) => &[],
        _ => &[],
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct MitigationEngine {
    pool: Pool,
    config: MitigationConfig,
    collaborators: Collaborators,
    alerts: AlertManager,
    dispatcher: EscalationDispatcher,
}

impl MitigationEngine {
    pub fn new(
        pool: Pool,
        config: MitigationConfig,
        collaborators: Collaborators,
        alerts: AlertManager,
        dispatcher: EscalationDispatcher,
    ) -> Self {
        Self {
            pool,
            config,
            collaborators,
            alerts,
            dispatcher,
        }
    }

    fn ttl_for(&self, severity: Severity) -> Duration {
        let mins = match severity {
            Severity::Critical => self.config.ttl_critical_mins,
            Severity::High => self.config.ttl_high_mins,
            _ => self.config.ttl_medium_mins,
        };
        Duration::minutes(mins)
    }

    /// Propose and record mitigations for an alert, then enact them in the
    /// background. An action type already active for the entity is skipped.
    pub async fn apply(&self, alert: &SecurityAlert, now: DateTime<Utc>) -> Result<Vec<Mitigation>> {
        let actions = actions_for(alert.alert_type, alert.severity);
        let mut applied = Vec::new();

        for &action in actions {
            if self.active_exists(&alert.entity_id, action)? {
                info!(
                    entity = %alert.entity_id,
                    action = %action,
                    "mitigation of this type already active, skipping"
                );
                continue;
            }

            let ttl = self.ttl_for(alert.severity);
            let mitigation = Mitigation {
                mitigation_id: Uuid::new_v4(),
                entity_id: alert.entity_id.clone(),
                action_type: action,
                triggering_alert_id: alert.alert_id,
                status: MitigationStatus::Active,
                enact_state: EnactState::Pending,
                applied_at: now,
                ttl_secs: ttl.num_seconds(),
                expires_at: now + ttl,
                revoked_by: None,
            };

            let conn = self.pool.get()?;
            conn.execute(
                "INSERT INTO mitigations (id, entity_id, action_type, triggering_alert_id,
                        status, enact_state, applied_at, ttl_secs, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    mitigation.mitigation_id.to_string(),
                    mitigation.entity_id,
                    mitigation.action_type.to_string(),
                    mitigation.triggering_alert_id.to_string(),
                    mitigation.status.to_string(),
                    mitigation.enact_state.to_string(),
                    fmt_ts(mitigation.applied_at),
                    mitigation.ttl_secs,
                    fmt_ts(mitigation.expires_at),
                ],
            )?;

            warn!(
                mitigation = %mitigation.mitigation_id,
                entity = %mitigation.entity_id,
                action = %action,
                ttl_secs = mitigation.ttl_secs,
                alert = %alert.alert_id,
                "mitigation applied"
            );
            self.dispatcher
                .notify(DispatchEvent::MitigationApplied(mitigation.clone()));

            let engine = self.clone();
            let task = mitigation.clone();
            tokio::spawn(async move {
                engine.enact_with_retry(task).await;
            });

            applied.push(mitigation);
        }

        Ok(applied)
    }

    /// Enact an external action with bounded exponential backoff. A retry
    /// in backoff is cancelled if the mitigation was revoked or its TTL
    /// passed; exhausted retries flag the record and raise a critical
    /// mitigation-failed alert.
    pub async fn enact_with_retry(&self, mitigation: Mitigation) {
        let max_attempts = self.config.enact_max_attempts.max(1);
        let base = self.config.enact_backoff_base_ms;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let shift = (attempt - 2).min(16);
                let backoff = base.saturating_mul(1u64 << shift);
                let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
                tokio::time::sleep(StdDuration::from_millis(backoff.saturating_add(jitter))).await;
            }

            match self.current_state(mitigation.mitigation_id) {
                Ok(Some(current))
                    if current.status == MitigationStatus::Active
                        && current.expires_at > Utc::now() => {}
                Ok(_) => {
                    info!(
                        mitigation = %mitigation.mitigation_id,
                        "enactment cancelled: mitigation no longer active"
                    );
                    return;
                }
                Err(e) => {
                    warn!(mitigation = %mitigation.mitigation_id, error = %e, "state check failed");
                    continue;
                }
            }

            match self
                .collaborators
                .enact(mitigation.action_type, &mitigation.entity_id)
                .await
            {
                Ok(()) => {
                    if let Err(e) =
                        self.set_enact_state(mitigation.mitigation_id, EnactState::Enacted)
                    {
                        warn!(mitigation = %mitigation.mitigation_id, error = %e, "failed to record enactment");
                    }
                    info!(
                        mitigation = %mitigation.mitigation_id,
                        action = %mitigation.action_type,
                        attempt,
                        "mitigation enacted"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        mitigation = %mitigation.mitigation_id,
                        action = %mitigation.action_type,
                        attempt,
                        error = %e,
                        "mitigation enactment failed"
                    );
                }
            }
        }

        self.handle_enact_exhausted(&mitigation).await;
    }

    async fn handle_enact_exhausted(&self, mitigation: &Mitigation) {
        if let Err(e) = self.set_enact_state(mitigation.mitigation_id, EnactState::Failed) {
            warn!(mitigation = %mitigation.mitigation_id, error = %e, "failed to flag mitigation");
        }

        // Never silent: the failure becomes a critical alert of its own.
        let scored = ScoredAnomaly {
            entity_id: mitigation.entity_id.clone(),
            entity_type: crate::profile::EntityType::System,
            alert_type: AlertType::MitigationFailed,
            severity: Severity::Critical,
            score: 1.0,
            confidence: 1.0,
            contributors: vec![],
        };
        match self.alerts.create_or_correlate(&scored, Utc::now()).await {
            Ok(outcome) => {
                self.dispatcher
                    .notify(DispatchEvent::AlertCreated(outcome.alert().clone()));
            }
            Err(e) => {
                warn!(
                    mitigation = %mitigation.mitigation_id,
                    error = %e,
                    "failed to raise mitigation-failed alert"
                );
            }
        }
        let mut failed = mitigation.clone();
        failed.enact_state = EnactState::Failed;
        self.dispatcher.notify(DispatchEvent::MitigationFailed(failed));
    }

    fn set_enact_state(&self, id: Uuid, state: EnactState) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE mitigations SET enact_state = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), state.to_string()],
        )?;
        Ok(())
    }

    fn active_exists(&self, entity_id: &str, action: ActionType) -> Result<bool> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mitigations
             WHERE entity_id = ?1 AND action_type = ?2 AND status = 'active'",
            rusqlite::params![entity_id, action.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Transition past-due active mitigations to expired. Each row is its
    /// own guarded transition; a concurrent revoke wins cleanly.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE mitigations SET status = 'expired'
             WHERE status = 'active' AND expires_at <= ?1",
            rusqlite::params![fmt_ts(now)],
        )?;
        if changed > 0 {
            info!(expired = changed, "mitigation expiry sweep");
        }
        Ok(changed)
    }

    /// Early manual termination. Mutually exclusive with expiry: whichever
    /// transition lands first wins, the other is a no-op.
    pub fn revoke(&self, id: Uuid, actor: &str) -> Result<Mitigation, MitigationError> {
        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let changed = conn
            .execute(
                "UPDATE mitigations SET status = 'revoked', revoked_by = ?2
                 WHERE id = ?1 AND status = 'active'",
                rusqlite::params![id.to_string(), actor],
            )
            .map_err(|e| MitigationError::Storage(e.into()))?;

        let current = self
            .current_state(id)
            .map_err(MitigationError::Storage)?
            .ok_or(MitigationError::NotFound(id))?;

        if changed == 0 {
            return Err(MitigationError::AlreadyFinished(id));
        }
        info!(mitigation = %id, actor, "mitigation revoked");
        Ok(current)
    }

    pub fn current_state(&self, id: Uuid) -> Result<Option<Mitigation>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT id, entity_id, action_type, triggering_alert_id, status, enact_state,
                    applied_at, ttl_secs, expires_at, revoked_by
             FROM mitigations WHERE id = ?1",
            [id.to_string()],
            row_to_mitigation,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other.into()),
        })
    }

    pub fn list(
        &self,
        entity_id: Option<&str>,
        status: Option<MitigationStatus>,
        limit: usize,
    ) -> Result<Vec<Mitigation>> {
        let conn = self.pool.get()?;
        const COLS: &str = "SELECT id, entity_id, action_type, triggering_alert_id, status,
                    enact_state, applied_at, ttl_secs, expires_at, revoked_by
             FROM mitigations";
        let status = status.map(|s| s.to_string());
        let limit = limit as i64;

        let mut out = Vec::new();
        match (entity_id, status) {
            (Some(entity), Some(status)) => {
                let sql = format!(
                    "{COLS} WHERE entity_id = ?1 AND status = ?2
                     ORDER BY applied_at DESC LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows =
                    stmt.query_map(rusqlite::params![entity, status, limit], row_to_mitigation)?;
                for r in rows {
                    out.push(r?);
                }
            }
            (Some(entity), None) => {
                let sql = format!("{COLS} WHERE entity_id = ?1 ORDER BY applied_at DESC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![entity, limit], row_to_mitigation)?;
                for r in rows {
                    out.push(r?);
                }
            }
            (None, Some(status)) => {
                let sql = format!("{COLS} WHERE status = ?1 ORDER BY applied_at DESC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![status, limit], row_to_mitigation)?;
                for r in rows {
                    out.push(r?);
                }
            }
            (None, None) => {
                let sql = format!("{COLS} ORDER BY applied_at DESC LIMIT ?1");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![limit], row_to_mitigation)?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }
}

fn row_to_mitigation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mitigation> {
    use crate::alert::decode_err;

    let id_str: String = row.get(0)?;
    let action_str: String = row.get(2)?;
    let alert_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let enact_str: String = row.get(5)?;
    let applied_at: String = row.get(6)?;
    let expires_at: String = row.get(8)?;

    Ok(Mitigation {
        mitigation_id: Uuid::parse_str(&id_str).map_err(|e| decode_err(0, e))?,
        entity_id: row.get(1)?,
        action_type: action_str.parse().map_err(|e: String| decode_err(2, e))?,
        triggering_alert_id: Uuid::parse_str(&alert_str).map_err(|e| decode_err(3, e))?,
        status: status_str.parse().map_err(|e: String| decode_err(4, e))?,
        enact_state: enact_str.parse().map_err(|e: String| decode_err(5, e))?,
        applied_at: parse_ts(&applied_at),
        ttl_secs: row.get(7)?,
        expires_at: parse_ts(&expires_at),
        revoked_by: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertStatus;
    use crate::config::{AlertingConfig, DispatchConfig};
    use crate::profile::EntityType;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FailingLifecycle;

    #[async_trait]
    impl enact::AgentLifecycle for FailingLifecycle {
        async fn isolate(&self, _agent_id: &str) -> Result<()> {
            anyhow::bail!("isolation endpoint unreachable")
        }
        async fn restart(&self, _agent_id: &str) -> Result<()> {
            anyhow::bail!("restart endpoint unreachable")
        }
    }

    fn engine_with(
        collaborators: Collaborators,
        config: MitigationConfig,
    ) -> (MitigationEngine, AlertManager, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::storage::open_pool_in(dir.path()).unwrap();
        let alerts = AlertManager::new(pool.clone(), AlertingConfig::default());
        let dispatcher = EscalationDispatcher::start(vec![], DispatchConfig::default());
        let engine = MitigationEngine::new(pool, config, collaborators, alerts.clone(), dispatcher);
        (engine, alerts, dir)
    }

    fn alert(entity: &str, alert_type: AlertType, severity: Severity) -> SecurityAlert {
        SecurityAlert {
            alert_id: Uuid::new_v4(),
            entity_id: entity.to_string(),
            entity_type: EntityType::Agent,
            alert_type,
            severity,
            score: 0.9,
            confidence: 0.9,
            occurrence_count: 1,
            context: serde_json::json!({}),
            status: AlertStatus::New,
            created_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            escalated_at: None,
            closed_at: None,
        }
    }

    #[test]
    fn test_playbook_mappings() {
        assert_eq!(
            actions_for(AlertType::ErrorRateSpike, Severity::Critical),
            &[ActionType::IsolateAgent, ActionType::RequireMfa]
        );
        assert_eq!(
            actions_for(AlertType::ResourceExhaustion, Severity::Critical),
            &[ActionType::ScaleResources, ActionType::IncreaseMonitoring]
        );
        assert!(actions_for(AlertType::MitigationFailed, Severity::Critical).is_empty());
        assert!(actions_for(AlertType::MessageBurst, Severity::Low).is_empty());
    }

    #[tokio::test]
    async fn test_apply_critical_error_spike() {
        let (engine, _alerts, _dir) =
            engine_with(Collaborators::log_only(), MitigationConfig::default());
        let a = alert("agent_42", AlertType::ErrorRateSpike, Severity::Critical);

        let applied = engine.apply(&a, Utc::now()).await.unwrap();
        assert_eq!(applied.len(), 2);
        assert!(applied.iter().any(|m| m.action_type == ActionType::IsolateAgent));
        assert!(applied.iter().any(|m| m.action_type == ActionType::RequireMfa));
        for m in &applied {
            assert_eq!(m.status, MitigationStatus::Active);
            assert_eq!(m.expires_at, m.applied_at + Duration::seconds(m.ttl_secs));
        }
    }

    #[tokio::test]
    async fn test_duplicate_action_type_skipped() {
        let (engine, _alerts, _dir) =
            engine_with(Collaborators::log_only(), MitigationConfig::default());
        let a = alert("agent_42", AlertType::ErrorRateSpike, Severity::Critical);

        let first = engine.apply(&a, Utc::now()).await.unwrap();
        assert_eq!(first.len(), 2);

        let second = engine.apply(&a, Utc::now()).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry_sweep() {
        let (engine, _alerts, _dir) =
            engine_with(Collaborators::log_only(), MitigationConfig::default());
        let a = alert("u", AlertType::MessageBurst, Severity::High);

        let t0 = Utc::now();
        let applied = engine.apply(&a, t0).await.unwrap();
        assert_eq!(applied.len(), 1);
        let id = applied[0].mitigation_id;

        // Not yet due.
        assert_eq!(engine.expire_sweep(t0 + Duration::minutes(5)).unwrap(), 0);

        // Past the high-severity TTL.
        let expired = engine
            .expire_sweep(t0 + Duration::minutes(engine.config.ttl_high_mins + 1))
            .unwrap();
        assert_eq!(expired, 1);

        let m = engine.current_state(id).unwrap().unwrap();
        assert_eq!(m.status, MitigationStatus::Expired);
    }

    #[tokio::test]
    async fn test_corrupt_stored_mitigation_surfaces_decode_error() {
        let (engine, _alerts, _dir) =
            engine_with(Collaborators::log_only(), MitigationConfig::default());
        let a = alert("u", AlertType::MessageBurst, Severity::High);

        let applied = engine.apply(&a, Utc::now()).await.unwrap();
        let id = applied[0].mitigation_id;

        let conn = engine.pool.get().unwrap();
        conn.execute(
            "UPDATE mitigations SET action_type = 'self_destruct' WHERE id = ?1",
            [id.to_string()],
        )
        .unwrap();

        assert!(engine.current_state(id).is_err());
    }

    #[tokio::test]
    async fn test_revoke_then_expiry_is_noop() {
        let (engine, _alerts, _dir) =
            engine_with(Collaborators::log_only(), MitigationConfig::default());
        let a = alert("u", AlertType::SessionFrequencyAnomaly, Severity::High);

        let t0 = Utc::now();
        let applied = engine.apply(&a, t0).await.unwrap();
        let id = applied[0].mitigation_id;

        let revoked = engine.revoke(id, "operator_1").unwrap();
        assert_eq!(revoked.status, MitigationStatus::Revoked);
        assert_eq!(revoked.revoked_by.as_deref(), Some("operator_1"));

        // The expiry sweep must not overwrite the revocation.
        engine.expire_sweep(t0 + Duration::hours(5)).unwrap();
        let m = engine.current_state(id).unwrap().unwrap();
        assert_eq!(m.status, MitigationStatus::Revoked);

        // Second revoke is a no-op error.
        assert!(matches!(
            engine.revoke(id, "operator_2"),
            Err(MitigationError::AlreadyFinished(_))
        ));
        assert!(matches!(
            engine.revoke(Uuid::new_v4(), "operator_1"),
            Err(MitigationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exhausted_enactment_raises_critical_alert() {
        let collaborators = Collaborators {
            identity: Arc::new(enact::LogIdentityService),
            agents: Arc::new(FailingLifecycle),
            resources: Arc::new(enact::LogResourceOrchestrator),
        };
        let config = MitigationConfig {
            enact_max_attempts: 2,
            enact_backoff_base_ms: 1,
            ..Default::default()
        };
        let (engine, alerts, _dir) = engine_with(collaborators, config);
        let a = alert("agent_42", AlertType::MemoryLeak, Severity::Critical);

        let applied = engine.apply(&a, Utc::now()).await.unwrap();
        let isolation = applied
            .iter()
            .find(|m| m.action_type == ActionType::IsolateAgent)
            .unwrap()
            .clone();

        // Run enactment to completion deterministically.
        engine.enact_with_retry(isolation.clone()).await;

        let m = engine.current_state(isolation.mitigation_id).unwrap().unwrap();
        assert_eq!(m.enact_state, EnactState::Failed);
        // The record stays active for operator intervention.
        assert_eq!(m.status, MitigationStatus::Active);

        let raised = alerts.list(Some("agent_42"), None, 10).unwrap();
        assert!(raised
            .iter()
            .any(|al| al.alert_type == AlertType::MitigationFailed
                && al.severity == Severity::Critical));
    }

    #[tokio::test]
    async fn test_enactment_cancelled_after_revoke() {
        let collaborators = Collaborators {
            identity: Arc::new(enact::LogIdentityService),
            agents: Arc::new(FailingLifecycle),
            resources: Arc::new(enact::LogResourceOrchestrator),
        };
        // High attempt budget so the background task cannot exhaust before
        // the revoke lands; cancellation is what ends it.
        let config = MitigationConfig {
            enact_max_attempts: 10,
            enact_backoff_base_ms: 20,
            ..Default::default()
        };
        let (engine, alerts, _dir) = engine_with(collaborators, config);
        let a = alert("agent_9", AlertType::MemoryLeak, Severity::Critical);

        let applied = engine.apply(&a, Utc::now()).await.unwrap();
        let isolation = applied
            .iter()
            .find(|m| m.action_type == ActionType::IsolateAgent)
            .unwrap()
            .clone();

        engine.revoke(isolation.mitigation_id, "op").unwrap();
        engine.enact_with_retry(isolation.clone()).await;

        // Cancelled, not failed: no mitigation-failed alert raised.
        let m = engine.current_state(isolation.mitigation_id).unwrap().unwrap();
        assert_ne!(m.enact_state, EnactState::Failed);
        let raised = alerts.list(Some("agent_9"), None, 10).unwrap();
        assert!(raised
            .iter()
            .all(|al| al.alert_type != AlertType::MitigationFailed));
    }
}
