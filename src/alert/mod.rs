//! Alert Manager -- owns the SecurityAlert lifecycle.
//!
//! State machine per (entity_id, alert_type): New -> {Acknowledged,
//! Escalated} -> Closed. Correlation check-and-create is atomic per key via
//! a lock registry, so two concurrent anomalies for the same key cannot
//! race into duplicate open alerts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AlertingConfig;
use crate::detect::score::ScoredAnomaly;
use crate::detect::{AlertType, Severity};
use crate::profile::EntityType;
use crate::storage::Pool;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert not found: {0}")]
    NotFound(Uuid),
    #[error("alert already closed: {0}")]
    AlreadyClosed(Uuid),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Escalated,
    Closed,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::New => write!(f, "new"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Escalated => write!(f, "escalated"),
            AlertStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(AlertStatus::New),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "escalated" => Ok(AlertStatus::Escalated),
            "closed" => Ok(AlertStatus::Closed),
            other => Err(format!("unknown alert status: {other}")),
        }
    }
}

/// A scored, deduplicated, lifecycle-tracked security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub alert_id: Uuid,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub score: f64,
    pub confidence: f64,
    pub occurrence_count: u32,
    pub context: serde_json::Value,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Result of pushing one scored anomaly through correlation.
#[derive(Debug, Clone)]
pub enum CorrelationOutcome {
    Created(SecurityAlert),
    Correlated(SecurityAlert),
}

impl CorrelationOutcome {
    pub fn alert(&self) -> &SecurityAlert {
        match self {
            CorrelationOutcome::Created(a) | CorrelationOutcome::Correlated(a) => a,
        }
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
pub struct AlertManager {
    pool: Pool,
    config: AlertingConfig,
    // Per (entity, alert_type) correlation locks.
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AlertManager {
    pub fn new(pool: Pool, config: AlertingConfig) -> Self {
        Self {
            pool,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop correlation locks no task currently holds, so the registry
    /// stays bounded by concurrent activity rather than by every key ever
    /// seen. Runs on the escalation sweep cadence. A strong count above
    /// one means some task still holds a clone from `key_lock`.
    pub fn prune_idle_locks(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    /// Merge a scored anomaly into an open alert inside the correlation
    /// window, or create a new alert.
    pub async fn create_or_correlate(
        &self,
        scored: &ScoredAnomaly,
        now: DateTime<Utc>,
    ) -> Result<CorrelationOutcome> {
        let key = format!("{}:{}", scored.entity_id, scored.alert_type);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let window_start = now - Duration::minutes(self.config.correlation_window_mins);
        let conn = self.pool.get()?;

        let existing: Option<SecurityAlert> = conn
            .query_row(
                "SELECT id, entity_id, entity_type, alert_type, severity, score, confidence,
                        occurrence_count, context_json, status, created_at, acknowledged_at,
                        acknowledged_by, escalated_at, closed_at
                 FROM alerts
                 WHERE entity_id = ?1 AND alert_type = ?2
                   AND status != 'closed' AND created_at >= ?3
                 ORDER BY created_at DESC LIMIT 1",
                rusqlite::params![
                    scored.entity_id,
                    scored.alert_type.to_string(),
                    fmt_ts(window_start)
                ],
                row_to_alert,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let context = self.context_json(scored);

        if let Some(mut alert) = existing {
            alert.occurrence_count += 1;
            alert.severity = alert.severity.max(scored.severity);
            alert.score = alert.score.max(scored.score);
            alert.confidence = alert.confidence.max(scored.confidence);
            alert.context = context;

            conn.execute(
                "UPDATE alerts SET occurrence_count = ?2, severity = ?3, score = ?4,
                        confidence = ?5, context_json = ?6
                 WHERE id = ?1",
                rusqlite::params![
                    alert.alert_id.to_string(),
                    alert.occurrence_count,
                    alert.severity.to_string(),
                    alert.score,
                    alert.confidence,
                    alert.context.to_string(),
                ],
            )?;

            info!(
                alert = %alert.alert_id,
                entity = %alert.entity_id,
                alert_type = %alert.alert_type,
                occurrences = alert.occurrence_count,
                "correlated anomaly into open alert"
            );
            return Ok(CorrelationOutcome::Correlated(alert));
        }

        let alert = SecurityAlert {
            alert_id: Uuid::new_v4(),
            entity_id: scored.entity_id.clone(),
            entity_type: scored.entity_type,
            alert_type: scored.alert_type,
            severity: scored.severity,
            score: scored.score,
            confidence: scored.confidence,
            occurrence_count: 1,
            context,
            status: AlertStatus::New,
            created_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            escalated_at: None,
            closed_at: None,
        };

        conn.execute(
            "INSERT INTO alerts (id, entity_id, entity_type, alert_type, severity, score,
                    confidence, occurrence_count, context_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                alert.alert_id.to_string(),
                alert.entity_id,
                alert.entity_type.to_string(),
                alert.alert_type.to_string(),
                alert.severity.to_string(),
                alert.score,
                alert.confidence,
                alert.occurrence_count,
                alert.context.to_string(),
                alert.status.to_string(),
                fmt_ts(alert.created_at),
            ],
        )?;

        warn!(
            alert = %alert.alert_id,
            entity = %alert.entity_id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            score = alert.score,
            "security alert raised"
        );
        Ok(CorrelationOutcome::Created(alert))
    }

    /// Bounded snapshot of contributing candidates for the alert context.
    fn context_json(&self, scored: &ScoredAnomaly) -> serde_json::Value {
        let cap = self.config.context_candidate_cap;
        let contributors: Vec<serde_json::Value> = scored
            .contributors
            .iter()
            .take(cap)
            .map(|c| {
                serde_json::json!({
                    "metric": c.metric,
                    "observed": c.observed_value,
                    "baseline_mean": c.baseline_mean,
                    "baseline_stddev": c.baseline_stddev,
                    "deviation": c.deviation,
                    "detector": c.detector_source,
                    "confidence": c.local_confidence,
                })
            })
            .collect();
        serde_json::json!({ "contributors": contributors })
    }

    pub fn acknowledge(&self, id: Uuid, actor: &str) -> Result<SecurityAlert, AlertError> {
        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let alert = self.get_on(&conn, id)?.ok_or(AlertError::NotFound(id))?;
        if alert.status == AlertStatus::Closed {
            return Err(AlertError::AlreadyClosed(id));
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE alerts SET
                acknowledged_at = COALESCE(acknowledged_at, ?2),
                acknowledged_by = COALESCE(acknowledged_by, ?3),
                status = CASE WHEN status = 'new' THEN 'acknowledged' ELSE status END
             WHERE id = ?1",
            rusqlite::params![id.to_string(), fmt_ts(now), actor],
        )
        .map_err(|e| AlertError::Storage(e.into()))?;

        info!(alert = %id, actor, "alert acknowledged");
        self.get(id)?.ok_or(AlertError::NotFound(id))
    }

    /// Close is terminal. Closed alerts stay queryable for the
    /// repeat-offender lookback but never correlate again.
    pub fn close(&self, id: Uuid) -> Result<(), AlertError> {
        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let alert = self.get_on(&conn, id)?.ok_or(AlertError::NotFound(id))?;
        if alert.status == AlertStatus::Closed {
            return Err(AlertError::AlreadyClosed(id));
        }
        conn.execute(
            "UPDATE alerts SET status = 'closed', closed_at = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), fmt_ts(Utc::now())],
        )
        .map_err(|e| AlertError::Storage(e.into()))?;
        info!(alert = %id, "alert closed");
        Ok(())
    }

    /// Escalate unacknowledged high/critical alerts older than the
    /// configured timeout. Idempotent: the guarded UPDATE only ever sets
    /// `escalated_at` once per alert. Returns the alerts escalated by this
    /// sweep.
    pub fn escalate_overdue(&self, now: DateTime<Utc>) -> Result<Vec<SecurityAlert>> {
        let deadline = now - Duration::minutes(self.config.escalation_timeout_mins);
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT id FROM alerts
             WHERE severity IN ('high', 'critical')
               AND status = 'new'
               AND acknowledged_at IS NULL
               AND escalated_at IS NULL
               AND created_at <= ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map([fmt_ts(deadline)], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut escalated = Vec::new();
        for id_str in ids {
            // Per-row guarded transition; a concurrent ack or sweep loses
            // cleanly.
            let changed = conn.execute(
                "UPDATE alerts SET status = 'escalated', escalated_at = ?2
                 WHERE id = ?1 AND escalated_at IS NULL AND status = 'new'",
                rusqlite::params![id_str, fmt_ts(now)],
            )?;
            if changed == 1 {
                if let Ok(id) = Uuid::parse_str(&id_str) {
                    if let Some(alert) = self.get_on(&conn, id)? {
                        warn!(
                            alert = %alert.alert_id,
                            entity = %alert.entity_id,
                            severity = %alert.severity,
                            "alert escalated: unacknowledged past timeout"
                        );
                        escalated.push(alert);
                    }
                }
            }
        }
        Ok(escalated)
    }

    /// Alerts of the same type for the entity created since `since`,
    /// closed or not. Feeds the repeat-offender multiplier.
    pub fn recent_alert_count(
        &self,
        entity_id: &str,
        alert_type: AlertType,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.pool.get()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM alerts
             WHERE entity_id = ?1 AND alert_type = ?2 AND created_at >= ?3",
            rusqlite::params![entity_id, alert_type.to_string(), fmt_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<SecurityAlert>, AlertError> {
        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        self.get_on(&conn, id)
    }

    fn get_on(
        &self,
        conn: &rusqlite::Connection,
        id: Uuid,
    ) -> Result<Option<SecurityAlert>, AlertError> {
        conn.query_row(
            "SELECT id, entity_id, entity_type, alert_type, severity, score, confidence,
                    occurrence_count, context_json, status, created_at, acknowledged_at,
                    acknowledged_by, escalated_at, closed_at
             FROM alerts WHERE id = ?1",
            [id.to_string()],
            row_to_alert,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(AlertError::Storage(other.into())),
        })
    }

    pub fn list(
        &self,
        entity_id: Option<&str>,
        status: Option<AlertStatus>,
        limit: usize,
    ) -> Result<Vec<SecurityAlert>> {
        let conn = self.pool.get()?;
        const COLS: &str = "SELECT id, entity_id, entity_type, alert_type, severity, score,
                    confidence, occurrence_count, context_json, status, created_at,
                    acknowledged_at, acknowledged_by, escalated_at, closed_at
             FROM alerts";
        let status = status.map(|s| s.to_string());
        let limit = limit as i64;

        let mut alerts = Vec::new();
        match (entity_id, status) {
            (Some(entity), Some(status)) => {
                let sql = format!(
                    "{COLS} WHERE entity_id = ?1 AND status = ?2
                     ORDER BY created_at DESC LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows =
                    stmt.query_map(rusqlite::params![entity, status, limit], row_to_alert)?;
                for r in rows {
                    alerts.push(r?);
                }
            }
            (Some(entity), None) => {
                let sql = format!("{COLS} WHERE entity_id = ?1 ORDER BY created_at DESC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![entity, limit], row_to_alert)?;
                for r in rows {
                    alerts.push(r?);
                }
            }
            (None, Some(status)) => {
                let sql = format!("{COLS} WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![status, limit], row_to_alert)?;
                for r in rows {
                    alerts.push(r?);
                }
            }
            (None, None) => {
                let sql = format!("{COLS} ORDER BY created_at DESC LIMIT ?1");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![limit], row_to_alert)?;
                for r in rows {
                    alerts.push(r?);
                }
            }
        }
        Ok(alerts)
    }
}

/// Map a stored-value decode failure onto the column it came from, so a
/// corrupt row reads as an error instead of masquerading as a valid alert.
pub(crate) fn decode_err(
    column: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, e.into())
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<SecurityAlert> {
    let id_str: String = row.get(0)?;
    let entity_type_str: String = row.get(2)?;
    let alert_type_str: String = row.get(3)?;
    let severity_str: String = row.get(4)?;
    let context_str: String = row.get(8)?;
    let status_str: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let acknowledged_at: Option<String> = row.get(11)?;
    let escalated_at: Option<String> = row.get(13)?;
    let closed_at: Option<String> = row.get(14)?;

    Ok(SecurityAlert {
        alert_id: Uuid::parse_str(&id_str).map_err(|e| decode_err(0, e))?,
        entity_id: row.get(1)?,
        entity_type: entity_type_str.parse().map_err(|e: String| decode_err(2, e))?,
        alert_type: alert_type_str.parse().map_err(|e: String| decode_err(3, e))?,
        severity: severity_str.parse().map_err(|e: String| decode_err(4, e))?,
        score: row.get(5)?,
        confidence: row.get(6)?,
        occurrence_count: row.get(7)?,
        context: serde_json::from_str(&context_str).map_err(|e| decode_err(8, e))?,
        status: status_str.parse().map_err(|e: String| decode_err(9, e))?,
        created_at: parse_ts(&created_at),
        acknowledged_at: acknowledged_at.as_deref().map(parse_ts),
        acknowledged_by: row.get(12)?,
        escalated_at: escalated_at.as_deref().map(parse_ts),
        closed_at: closed_at.as_deref().map(parse_ts),
    })
}
