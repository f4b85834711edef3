//! Event ingestion pipeline -- drains behavioral event streams and runs
//! each event end-to-end: profile update, detection, scoring, alerting,
//! mitigation, dispatch.
//!
//! Workers share one queue; per-entity consistency comes from the profile
//! store's sharded locks and the alert manager's per-key correlation
//! locks, so unrelated events never block each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::alert::{AlertManager, CorrelationOutcome};
use crate::config::UebaConfig;
use crate::detect::score::{score_all, RepeatOffenseContext};
use crate::detect::{agent, chat, system, AnomalyCandidate};
use crate::dispatch::{DispatchEvent, EscalationDispatcher};
use crate::mitigate::MitigationEngine;
use crate::profile::baseline::BaselineSnapshot;
use crate::profile::{EntityType, ProfileStore};

/// A chat session ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSessionClosed {
    pub entity_id: String,
    pub session_type: String,
    pub duration_secs: f64,
    pub message_count: f64,
    /// Seconds since the previous session started, when the source knows it.
    /// Derived from the profile otherwise.
    #[serde(default)]
    pub gap_secs: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// An AI-agent execution completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub entity_id: String,
    pub duration_ms: f64,
    pub error_ratio: f64,
    pub memory_mb: f64,
    pub log_lines: f64,
    pub timestamp: DateTime<Utc>,
}

/// System resource metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMetricKind {
    CpuPct,
    MemoryPct,
    QueueDepth,
}

impl std::fmt::Display for SystemMetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemMetricKind::CpuPct => write!(f, "cpu_pct"),
            SystemMetricKind::MemoryPct => write!(f, "memory_pct"),
            SystemMetricKind::QueueDepth => write!(f, "queue_depth"),
        }
    }
}

/// A system resource metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSample {
    pub entity_id: String,
    pub metric: SystemMetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// One behavioral event from any ingestion stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BehaviorEvent {
    ChatSessionClosed(ChatSessionClosed),
    AgentExecution(AgentExecution),
    SystemSample(SystemSample),
}

/// Pipeline counters, exposed over the API.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub events_in: AtomicU64,
    pub events_dropped: AtomicU64,
    pub candidates: AtomicU64,
    pub alerts_created: AtomicU64,
    pub alerts_correlated: AtomicU64,
    pub mitigations_applied: AtomicU64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "events_in": self.events_in.load(Ordering::Relaxed),
            "events_dropped": self.events_dropped.load(Ordering::Relaxed),
            "candidates": self.candidates.load(Ordering::Relaxed),
            "alerts_created": self.alerts_created.load(Ordering::Relaxed),
            "alerts_correlated": self.alerts_correlated.load(Ordering::Relaxed),
            "mitigations_applied": self.mitigations_applied.load(Ordering::Relaxed),
        })
    }
}

/// The assembled UEBA engine: every stage of the pipeline plus the shared
/// configuration.
pub struct Ueba {
    pub store: Arc<ProfileStore>,
    pub alerts: AlertManager,
    pub mitigations: MitigationEngine,
    pub dispatcher: EscalationDispatcher,
    pub config: Arc<UebaConfig>,
    pub metrics: Arc<PipelineMetrics>,
}

impl Ueba {
    /// Process one event end-to-end. Never returns an error: malformed
    /// input is dropped and counted, downstream failures are logged.
    pub async fn process_event(&self, event: BehaviorEvent) {
        self.metrics.events_in.fetch_add(1, Ordering::Relaxed);

        if let Err(reason) = validate(&event) {
            self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(reason, "dropping malformed event");
            return;
        }

        let candidates = match &event {
            BehaviorEvent::ChatSessionClosed(e) => self.detect_chat(e),
            BehaviorEvent::AgentExecution(e) => self.detect_agent(e),
            BehaviorEvent::SystemSample(e) => self.detect_system(e),
        };
        if candidates.is_empty() {
            return;
        }
        self.metrics
            .candidates
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);

        let now = Utc::now();
        let lookback = now - Duration::hours(self.config.scoring.repeat_lookback_hours);
        let entity_id = candidates[0].entity_id.clone();
        let alerts = self.alerts.clone();
        let repeat_for = |alert_type| {
            match alerts.recent_alert_count(&entity_id, alert_type, lookback) {
                Ok(prior_same_type) => RepeatOffenseContext { prior_same_type },
                Err(e) => {
                    warn!(error = %e, "repeat-offender lookup failed, scoring without boost");
                    RepeatOffenseContext::default()
                }
            }
        };

        let scored = score_all(
            candidates,
            repeat_for,
            &self.config.scoring,
            self.config.detection.critical_sigma,
        );

        for s in scored {
            debug!(
                entity = %s.entity_id,
                alert_type = %s.alert_type,
                severity = %s.severity,
                score = s.score,
                "scored anomaly"
            );
            if let Err(e) = self.raise_and_mitigate(&s, now).await {
                error!(
                    entity = %s.entity_id,
                    alert_type = %s.alert_type,
                    error = %e,
                    "alerting failed for scored anomaly"
                );
            }
        }
    }

    async fn raise_and_mitigate(
        &self,
        scored: &crate::detect::score::ScoredAnomaly,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let outcome = self.alerts.create_or_correlate(scored, now).await?;
        match &outcome {
            CorrelationOutcome::Created(alert) => {
                self.metrics.alerts_created.fetch_add(1, Ordering::Relaxed);
                self.dispatcher
                    .notify(DispatchEvent::AlertCreated(alert.clone()));
            }
            CorrelationOutcome::Correlated(_) => {
                self.metrics.alerts_correlated.fetch_add(1, Ordering::Relaxed);
            }
        }

        let applied = self.mitigations.apply(outcome.alert(), now).await?;
        self.metrics
            .mitigations_applied
            .fetch_add(applied.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn detect_chat(&self, e: &ChatSessionClosed) -> Vec<AnomalyCandidate> {
        let cfg = &self.config.detection;
        let min_samples = self.config.baseline.min_samples;
        let ts = e.timestamp;

        // Gap since the previous session, derived from the profile when the
        // event source did not provide it. Read before the duration metric
        // is updated below.
        let gap_secs = e.gap_secs.or_else(|| {
            self.store
                .last_metric_ts(&e.entity_id, "session_duration_secs")
                .map(|prev| (ts - prev).num_milliseconds() as f64 / 1000.0)
        });

        let duration = self.store.observe(
            &e.entity_id,
            EntityType::User,
            "session_duration_secs",
            e.duration_secs,
            ts,
        );
        let messages = self.store.observe(
            &e.entity_id,
            EntityType::User,
            "message_count",
            e.message_count,
            ts,
        );
        let gap = match gap_secs {
            Some(g) => self
                .store
                .observe(&e.entity_id, EntityType::User, "session_gap_secs", g.max(0.0), ts),
            None => BaselineSnapshot::empty("session_gap_secs"),
        };
        let transition =
            self.store
                .observe_transition(&e.entity_id, EntityType::User, &e.session_type, ts);

        let mut event = e.clone();
        event.gap_secs = gap_secs;
        let snaps = chat::ChatSnapshots {
            duration,
            messages,
            gap,
            transition,
        };
        chat::detect(&event, &snaps, cfg, min_samples)
    }

    fn detect_agent(&self, e: &AgentExecution) -> Vec<AnomalyCandidate> {
        let cfg = &self.config.detection;
        let min_samples = self.config.baseline.min_samples;
        let ts = e.timestamp;

        let snaps = agent::AgentSnapshots {
            error_ratio: self.store.observe(
                &e.entity_id,
                EntityType::Agent,
                "error_ratio",
                e.error_ratio,
                ts,
            ),
            exec_time: self.store.observe(
                &e.entity_id,
                EntityType::Agent,
                "exec_time_ms",
                e.duration_ms,
                ts,
            ),
            memory: self.store.observe(
                &e.entity_id,
                EntityType::Agent,
                "memory_mb",
                e.memory_mb,
                ts,
            ),
            log_lines: self.store.observe(
                &e.entity_id,
                EntityType::Agent,
                "log_lines",
                e.log_lines,
                ts,
            ),
        };
        agent::detect(e, &snaps, cfg, min_samples)
    }

    fn detect_system(&self, e: &SystemSample) -> Vec<AnomalyCandidate> {
        let cfg = &self.config.detection;
        let min_samples = self.config.baseline.min_samples;
        let snap = self.store.observe(
            &e.entity_id,
            EntityType::System,
            &e.metric.to_string(),
            e.value,
            e.timestamp,
        );
        system::detect(e, &snap, cfg, min_samples)
    }
}

fn validate(event: &BehaviorEvent) -> Result<(), &'static str> {
    let finite = |v: f64| v.is_finite();
    match event {
        BehaviorEvent::ChatSessionClosed(e) => {
            if e.entity_id.is_empty() {
                return Err("chat event missing entity id");
            }
            if !finite(e.duration_secs) || e.duration_secs < 0.0 {
                return Err("chat event has invalid duration");
            }
            if !finite(e.message_count) || e.message_count < 0.0 {
                return Err("chat event has invalid message count");
            }
        }
        BehaviorEvent::AgentExecution(e) => {
            if e.entity_id.is_empty() {
                return Err("agent event missing entity id");
            }
            if !finite(e.error_ratio) || !(0.0..=1.0).contains(&e.error_ratio) {
                return Err("agent event has invalid error ratio");
            }
            if !finite(e.duration_ms) || e.duration_ms < 0.0 {
                return Err("agent event has invalid duration");
            }
            if !finite(e.memory_mb) || e.memory_mb < 0.0 {
                return Err("agent event has invalid memory reading");
            }
            if !finite(e.log_lines) || e.log_lines < 0.0 {
                return Err("agent event has invalid log volume");
            }
        }
        BehaviorEvent::SystemSample(e) => {
            if e.entity_id.is_empty() {
                return Err("system sample missing entity id");
            }
            if !finite(e.value) || e.value < 0.0 {
                return Err("system sample has invalid value");
            }
        }
    }
    Ok(())
}

/// Spawn `worker_count` tasks draining the shared event queue.
pub fn spawn_workers(
    engine: Arc<Ueba>,
    rx: mpsc::Receiver<BehaviorEvent>,
    worker_count: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..worker_count.max(1))
        .map(|worker| {
            let engine = Arc::clone(&engine);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                debug!(worker, "ingestion worker started");
                loop {
                    let event = { rx.lock().await.recv().await };
                    match event {
                        Some(event) => engine.process_event(event).await,
                        None => break,
                    }
                }
                debug!(worker, "ingestion worker stopped");
            })
        })
        .collect()
}
