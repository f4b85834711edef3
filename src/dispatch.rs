//! Escalation Dispatcher -- routes alert and mitigation events to external
//! notification channels.
//!
//! `notify` is a non-blocking enqueue; a background worker owns delivery
//! with its own retry/backoff. Channel failures are logged and never
//! propagate back into the alerting pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alert::SecurityAlert;
use crate::config::DispatchConfig;
use crate::detect::Severity;
use crate::mitigate::Mitigation;

/// Events fanned out to notification channels.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    AlertCreated(SecurityAlert),
    AlertEscalated(SecurityAlert),
    MitigationApplied(Mitigation),
    MitigationFailed(Mitigation),
}

impl DispatchEvent {
    /// Severity used for channel routing.
    pub fn severity(&self) -> Severity {
        match self {
            DispatchEvent::AlertCreated(a) | DispatchEvent::AlertEscalated(a) => a.severity,
            DispatchEvent::MitigationApplied(_) => Severity::Medium,
            DispatchEvent::MitigationFailed(_) => Severity::Critical,
        }
    }
}

/// External notification channel (push, SMS, email, operator dashboard).
/// Best-effort by contract.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, payload: &serde_json::Value) -> anyhow::Result<()>;
}

/// Channel plus the minimum severity it receives.
pub struct ChannelRoute {
    pub channel: Arc<dyn NotificationChannel>,
    pub min_severity: Severity,
}

/// Fallback channel: structured log lines for the operator console.
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "operator-log"
    }

    async fn send(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        info!(notification = %payload, "operator notification");
        Ok(())
    }
}

#[derive(Clone)]
pub struct EscalationDispatcher {
    tx: mpsc::UnboundedSender<DispatchEvent>,
}

impl EscalationDispatcher {
    /// Build the dispatcher and spawn its delivery worker.
    pub fn start(routes: Vec<ChannelRoute>, config: DispatchConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_delivery_worker(rx, routes, config));
        Self { tx }
    }

    /// Fire-and-forget. A full or closed queue is logged, never an error
    /// for the caller.
    pub fn notify(&self, event: DispatchEvent) {
        if self.tx.send(event).is_err() {
            warn!("dispatch worker gone, dropping notification");
        }
    }
}

async fn run_delivery_worker(
    mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
    routes: Vec<ChannelRoute>,
    config: DispatchConfig,
) {
    debug!(channels = routes.len(), "escalation dispatcher started");
    while let Some(event) = rx.recv().await {
        let severity = event.severity();
        let payload = match serde_json::to_value(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize dispatch event");
                continue;
            }
        };

        for route in &routes {
            if severity < route.min_severity {
                continue;
            }
            deliver_with_retry(route, &payload, &config).await;
        }
    }
}

async fn deliver_with_retry(route: &ChannelRoute, payload: &serde_json::Value, config: &DispatchConfig) {
    let mut delay = Duration::from_millis(config.retry_backoff_ms);
    for attempt in 1..=config.retry_attempts.max(1) {
        match route.channel.send(payload).await {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    channel = route.channel.name(),
                    attempt,
                    error = %e,
                    "notification delivery failed"
                );
            }
        }
        if attempt < config.retry_attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}

/// Parse a routing severity from config, falling back to `low`.
pub fn route_severity(s: &str) -> Severity {
    s.parse().unwrap_or(Severity::Low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingChannel {
        delivered: Arc<AtomicU32>,
        fail_first: Arc<AtomicU32>,
    }

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(&self, _payload: &serde_json::Value) -> anyhow::Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient failure");
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn mitigation() -> Mitigation {
        use crate::mitigate::{ActionType, EnactState, MitigationStatus};
        Mitigation {
            mitigation_id: uuid::Uuid::new_v4(),
            entity_id: "agent_42".to_string(),
            action_type: ActionType::IsolateAgent,
            triggering_alert_id: uuid::Uuid::new_v4(),
            status: MitigationStatus::Active,
            enact_state: EnactState::Pending,
            applied_at: chrono::Utc::now(),
            ttl_secs: 600,
            expires_at: chrono::Utc::now(),
            revoked_by: None,
        }
    }

    #[tokio::test]
    async fn test_retry_until_delivered() {
        let delivered = Arc::new(AtomicU32::new(0));
        let fail_first = Arc::new(AtomicU32::new(2));
        let routes = vec![ChannelRoute {
            channel: Arc::new(CountingChannel {
                delivered: delivered.clone(),
                fail_first,
            }),
            min_severity: Severity::Low,
        }];
        let cfg = DispatchConfig {
            retry_attempts: 3,
            retry_backoff_ms: 1,
            ..Default::default()
        };

        let dispatcher = EscalationDispatcher::start(routes, cfg);
        dispatcher.notify(DispatchEvent::MitigationFailed(mitigation()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_severity_routing_filters_low_events() {
        let delivered = Arc::new(AtomicU32::new(0));
        let routes = vec![ChannelRoute {
            channel: Arc::new(CountingChannel {
                delivered: delivered.clone(),
                fail_first: Arc::new(AtomicU32::new(0)),
            }),
            min_severity: Severity::Critical,
        }];
        let dispatcher = EscalationDispatcher::start(routes, DispatchConfig::default());

        // Medium-severity event must not reach a critical-only channel.
        dispatcher.notify(DispatchEvent::MitigationApplied(mitigation()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);

        dispatcher.notify(DispatchEvent::MitigationFailed(mitigation()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
