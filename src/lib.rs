//! AutoSentry -- behavioral anomaly detection and automated response for
//! the in-vehicle assistant platform.
//!
//! This crate provides the core library for per-entity behavioral
//! baselines, anomaly detection across chat sessions, AI-agent executions
//! and system metrics, weighted anomaly scoring, alert lifecycle
//! management, automated time-bounded mitigations, and notification
//! dispatch.

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod mitigate;
pub mod pipeline;
pub mod profile;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alert::AlertManager;
use crate::config::UebaConfig;
use crate::dispatch::{
    route_severity, ChannelRoute, DispatchEvent, EscalationDispatcher, LogChannel,
};
use crate::mitigate::{Collaborators, MitigationEngine};
use crate::pipeline::{PipelineMetrics, Ueba};
use crate::profile::ProfileStore;

const EVENT_QUEUE_CAPACITY: usize = 4096;
const INGEST_WORKERS: usize = 4;

/// Assemble the engine from a config and an open pool. Spawns the
/// dispatcher worker; sweeps are started separately by `serve`.
pub fn build_engine(
    pool: storage::Pool,
    config: UebaConfig,
    collaborators: Collaborators,
) -> Result<Arc<Ueba>> {
    let config = Arc::new(config);

    let routes = vec![ChannelRoute {
        channel: Arc::new(LogChannel),
        min_severity: route_severity(&config.dispatch.dashboard_min_severity),
    }];
    let dispatcher = EscalationDispatcher::start(routes, config.dispatch.clone());

    let alerts = AlertManager::new(pool.clone(), config.alerting.clone());
    let mitigations = MitigationEngine::new(
        pool,
        config.mitigation.clone(),
        collaborators,
        alerts.clone(),
        dispatcher.clone(),
    );

    let store = Arc::new(ProfileStore::new(config.baseline.clone()));

    Ok(Arc::new(Ueba {
        store,
        alerts,
        mitigations,
        dispatcher,
        config,
        metrics: Arc::new(PipelineMetrics::default()),
    }))
}

/// Start the AutoSentry daemon: ingestion workers, background sweeps, and
/// the API server.
pub async fn serve(bind: &str, db_path: &str, config: UebaConfig) -> Result<()> {
    info!(%db_path, "initializing database");
    let pool = storage::open_pool(db_path)?;

    let engine = build_engine(pool.clone(), config, Collaborators::log_only())?;

    let loaded = engine.store.load(&pool)?;
    info!(profiles = loaded, "entity profiles restored");

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    pipeline::spawn_workers(Arc::clone(&engine), events_rx, INGEST_WORKERS);

    tokio::spawn(run_escalation_loop(Arc::clone(&engine)));
    tokio::spawn(run_expiry_loop(Arc::clone(&engine)));
    tokio::spawn(run_checkpoint_loop(Arc::clone(&engine), pool));

    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState {
        engine,
        events_tx,
    });

    info!(%addr, "autosentry listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Escalate unacknowledged high/critical alerts past the timeout, then
/// notify for each one escalated this sweep.
async fn run_escalation_loop(engine: Arc<Ueba>) {
    info!("escalation sweep started");
    let mut interval =
        tokio::time::interval(Duration::from_secs(engine.config.alerting.escalation_sweep_secs));
    loop {
        interval.tick().await;
        match engine.alerts.escalate_overdue(chrono::Utc::now()) {
            Ok(escalated) => {
                for alert in escalated {
                    engine.dispatcher.notify(DispatchEvent::AlertEscalated(alert));
                }
            }
            Err(e) => error!(error = %e, "escalation sweep failed"),
        }
        engine.alerts.prune_idle_locks();
    }
}

/// Expire mitigations whose TTL has passed.
async fn run_expiry_loop(engine: Arc<Ueba>) {
    info!("mitigation expiry sweep started");
    let mut interval =
        tokio::time::interval(Duration::from_secs(engine.config.mitigation.expiry_sweep_secs));
    loop {
        interval.tick().await;
        match engine.mitigations.expire_sweep(chrono::Utc::now()) {
            Ok(expired) if expired > 0 => info!(expired, "mitigations expired"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "expiry sweep failed"),
        }
    }
}

/// Periodically checkpoint in-memory profiles to the database and prune
/// idle ones.
async fn run_checkpoint_loop(engine: Arc<Ueba>, pool: storage::Pool) {
    info!("profile checkpoint loop started");
    let mut interval = tokio::time::interval(Duration::from_secs(
        engine.config.baseline.checkpoint_interval_secs,
    ));
    loop {
        interval.tick().await;
        match engine.store.checkpoint(&pool) {
            Ok(written) => {
                let pruned = engine.store.prune(chrono::Utc::now());
                if pruned > 0 {
                    info!(written, pruned, "profiles checkpointed and pruned");
                }
            }
            Err(e) => warn!(error = %e, "profile checkpoint failed"),
        }
    }
}
