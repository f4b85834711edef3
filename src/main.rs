use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use autosentry::alert::{AlertManager, AlertStatus};
use autosentry::config::UebaConfig;
use autosentry::dispatch::{ChannelRoute, EscalationDispatcher};
use autosentry::mitigate::{Collaborators, MitigationEngine, MitigationStatus};

#[derive(Parser)]
#[command(
    name = "autosentry",
    about = "Behavioral anomaly detection and automated response for the vehicle assistant platform",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file (falls back to UEBA_CONFIG, then the
    /// system location, then defaults)
    #[arg(long, global = true)]
    config: Option<String>,

    /// SQLite database path
    #[arg(long, global = true, default_value = "data/autosentry.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (ingestion pipeline + sweeps + API server)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Inspect and manage security alerts
    Alerts {
        #[command(subcommand)]
        action: AlertAction,
    },

    /// Inspect and manage active mitigations
    Mitigations {
        #[command(subcommand)]
        action: MitigationAction,
    },
}

#[derive(Subcommand)]
enum AlertAction {
    /// List alerts, newest first
    List {
        /// Filter by entity
        #[arg(long)]
        entity: Option<String>,

        /// Filter by status (new, acknowledged, escalated, closed)
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Acknowledge an alert
    Ack {
        /// Alert id
        id: Uuid,

        /// Operator name recorded on the alert
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Close an alert (terminal)
    Close {
        /// Alert id
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum MitigationAction {
    /// List mitigations, newest first
    List {
        /// Filter by entity
        #[arg(long)]
        entity: Option<String>,

        /// Filter by status (active, expired, revoked)
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Revoke an active mitigation
    Revoke {
        /// Mitigation id
        id: Uuid,

        /// Operator name recorded on the mitigation
        #[arg(long, default_value = "cli")]
        actor: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => UebaConfig::load(std::path::Path::new(path))?,
        None => UebaConfig::load_or_default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "starting autosentry daemon");
            autosentry::serve(&bind, &cli.db, config).await?;
        }
        Commands::Alerts { action } => {
            let pool = autosentry::storage::open_pool(&cli.db)?;
            let alerts = AlertManager::new(pool, config.alerting.clone());

            match action {
                AlertAction::List {
                    entity,
                    status,
                    limit,
                } => {
                    let status = parse_status::<AlertStatus>(status.as_deref())?;
                    let rows = alerts.list(entity.as_deref(), status, limit)?;
                    if rows.is_empty() {
                        println!("No alerts found.");
                    } else {
                        println!(
                            "{:<36} | {:<16} | {:<24} | {:<8} | {:<5} | {:<12} | Created",
                            "Id", "Entity", "Type", "Severity", "Count", "Status"
                        );
                        println!(
                            "{:-<36}-|-{:-<16}-|-{:-<24}-|-{:-<8}-|-{:-<5}-|-{:-<12}-|-{:-<20}",
                            "", "", "", "", "", "", ""
                        );
                        for a in rows {
                            println!(
                                "{:<36} | {:<16} | {:<24} | {:<8} | {:<5} | {:<12} | {}",
                                a.alert_id,
                                a.entity_id,
                                a.alert_type.to_string(),
                                a.severity.to_string(),
                                a.occurrence_count,
                                a.status.to_string(),
                                a.created_at.to_rfc3339()
                            );
                        }
                    }
                }
                AlertAction::Ack { id, actor } => {
                    let alert = alerts.acknowledge(id, &actor)?;
                    println!("Alert {} acknowledged by {}.", alert.alert_id, actor);
                }
                AlertAction::Close { id } => {
                    alerts.close(id)?;
                    println!("Alert {} closed.", id);
                }
            }
        }
        Commands::Mitigations { action } => {
            let pool = autosentry::storage::open_pool(&cli.db)?;
            let alerts = AlertManager::new(pool.clone(), config.alerting.clone());
            let dispatcher = EscalationDispatcher::start(
                Vec::<ChannelRoute>::new(),
                config.dispatch.clone(),
            );
            let mitigations = MitigationEngine::new(
                pool,
                config.mitigation.clone(),
                Collaborators::log_only(),
                alerts,
                dispatcher,
            );

            match action {
                MitigationAction::List {
                    entity,
                    status,
                    limit,
                } => {
                    let status = parse_status::<MitigationStatus>(status.as_deref())?;
                    let rows = mitigations.list(entity.as_deref(), status, limit)?;
                    if rows.is_empty() {
                        println!("No mitigations found.");
                    } else {
                        println!(
                            "{:<36} | {:<16} | {:<20} | {:<8} | {:<8} | Expires",
                            "Id", "Entity", "Action", "Status", "Enacted"
                        );
                        println!(
                            "{:-<36}-|-{:-<16}-|-{:-<20}-|-{:-<8}-|-{:-<8}-|-{:-<20}",
                            "", "", "", "", "", ""
                        );
                        for m in rows {
                            println!(
                                "{:<36} | {:<16} | {:<20} | {:<8} | {:<8} | {}",
                                m.mitigation_id,
                                m.entity_id,
                                m.action_type.to_string(),
                                m.status.to_string(),
                                m.enact_state.to_string(),
                                m.expires_at.to_rfc3339()
                            );
                        }
                    }
                }
                MitigationAction::Revoke { id, actor } => {
                    let m = mitigations.revoke(id, &actor)?;
                    println!(
                        "Mitigation {} ({}) revoked by {}.",
                        m.mitigation_id, m.action_type, actor
                    );
                }
            }
        }
    }

    Ok(())
}

fn parse_status<T: std::str::FromStr<Err = String>>(s: Option<&str>) -> Result<Option<T>> {
    match s {
        Some(s) => s
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!(e)),
        None => Ok(None),
    }
}
