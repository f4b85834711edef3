//! Entity Profile Store -- adaptive per-entity behavioral baselines.
//!
//! The store is the only writer of profile state. Profiles live in a
//! sharded map so observations for unrelated entities never contend on the
//! same lock, while observations for one entity serialize through its
//! shard.

pub mod baseline;
pub mod ring;

pub use baseline::{BaselineSnapshot, MetricBaseline};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BaselineConfig;
use crate::storage::Pool;

/// What kind of entity a profile tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Agent,
    System,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::User => write!(f, "user"),
            EntityType::Agent => write!(f, "agent"),
            EntityType::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(EntityType::User),
            "agent" => Ok(EntityType::Agent),
            "system" => Ok(EntityType::System),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Rolling behavioral baseline for one monitored entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityProfile {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub metrics: HashMap<String, MetricBaseline>,
    /// Previous chat session type, for transition tracking.
    pub last_session_type: Option<String>,
    /// Counts per "from->to" transition pair.
    pub transition_counts: HashMap<String, u64>,
    pub transition_total: u64,
    pub last_updated: DateTime<Utc>,
}

impl EntityProfile {
    fn new(entity_id: &str, entity_type: EntityType, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            entity_type,
            metrics: HashMap::new(),
            last_session_type: None,
            transition_counts: HashMap::new(),
            transition_total: 0,
            last_updated: now,
        }
    }
}

/// Pre-update view of a session-type transition.
#[derive(Debug, Clone)]
pub struct TransitionSnapshot {
    pub from: Option<String>,
    pub to: String,
    /// Times this exact transition was seen before.
    pub seen: u64,
    /// Total transitions observed for the entity before this one.
    pub total: u64,
}

pub struct ProfileStore {
    shards: Vec<Mutex<HashMap<String, EntityProfile>>>,
    config: BaselineConfig,
}

impl ProfileStore {
    pub fn new(config: BaselineConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards, config }
    }

    fn shard_for(&self, entity_id: &str) -> &Mutex<HashMap<String, EntityProfile>> {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Record one observation. Returns the baseline as it stood *before*
    /// this sample was folded in, so detectors compare against a view the
    /// new sample has not contaminated.
    pub fn observe(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        metric: &str,
        value: f64,
        ts: DateTime<Utc>,
    ) -> BaselineSnapshot {
        let mut shard = self.shard_for(entity_id).lock().unwrap_or_else(|e| e.into_inner());
        let profile = shard
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityProfile::new(entity_id, entity_type, ts));
        check_entity_type(profile, entity_type);

        let baseline = profile
            .metrics
            .entry(metric.to_string())
            .or_insert_with(|| MetricBaseline::new(self.config.history_capacity, ts));

        let snapshot = BaselineSnapshot {
            metric: metric.to_string(),
            sample_count: baseline.count(),
            mean: baseline.mean(),
            std_dev: baseline.std_dev(),
            stability: baseline.stability(),
            immature: (baseline.count() as usize) < self.config.min_samples,
            history: baseline.history().ordered(),
        };

        baseline.update(value, ts);
        profile.last_updated = ts;

        snapshot
    }

    /// Record a chat session-type transition, returning the pre-update
    /// counts for the (previous -> new) pair.
    pub fn observe_transition(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        session_type: &str,
        ts: DateTime<Utc>,
    ) -> TransitionSnapshot {
        let mut shard = self.shard_for(entity_id).lock().unwrap_or_else(|e| e.into_inner());
        let profile = shard
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityProfile::new(entity_id, entity_type, ts));
        check_entity_type(profile, entity_type);

        let from = profile.last_session_type.clone();
        let snapshot = match &from {
            Some(prev) => {
                let key = format!("{prev}->{session_type}");
                TransitionSnapshot {
                    from: from.clone(),
                    to: session_type.to_string(),
                    seen: profile.transition_counts.get(&key).copied().unwrap_or(0),
                    total: profile.transition_total,
                }
            }
            None => TransitionSnapshot {
                from: None,
                to: session_type.to_string(),
                seen: 0,
                total: 0,
            },
        };

        if let Some(prev) = &from {
            let key = format!("{prev}->{session_type}");
            *profile.transition_counts.entry(key).or_insert(0) += 1;
            profile.transition_total += 1;
        }
        profile.last_session_type = Some(session_type.to_string());
        profile.last_updated = ts;

        snapshot
    }

    /// Timestamp of the most recent sample for a metric, if any.
    pub fn last_metric_ts(&self, entity_id: &str, metric: &str) -> Option<DateTime<Utc>> {
        let shard = self.shard_for(entity_id).lock().unwrap_or_else(|e| e.into_inner());
        let baseline = shard.get(entity_id)?.metrics.get(metric)?;
        if baseline.count() == 0 {
            return None;
        }
        Some(baseline.last_updated)
    }

    /// Drop profiles idle past the configured horizon. Returns how many
    /// were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - Duration::hours(self.config.prune_after_hours);
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock().unwrap_or_else(|e| e.into_inner());
            let before = map.len();
            map.retain(|_, p| p.last_updated >= horizon);
            removed += before - map.len();
        }
        if removed > 0 {
            debug!(removed, "pruned inactive entity profiles");
        }
        removed
    }

    pub fn profile_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    /// Persist all profiles as JSON rows. Runs on a periodic sweep so a
    /// restart resumes with warm baselines instead of re-learning.
    pub fn checkpoint(&self, pool: &Pool) -> Result<usize> {
        let conn = pool.get()?;
        let mut written = 0;
        for shard in &self.shards {
            let snapshot: Vec<EntityProfile> = {
                let map = shard.lock().unwrap_or_else(|e| e.into_inner());
                map.values().cloned().collect()
            };
            for profile in snapshot {
                let json = serde_json::to_string(&profile)?;
                conn.execute(
                    "INSERT INTO entity_profiles (entity_id, entity_type, profile_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(entity_id) DO UPDATE SET
                         entity_type = excluded.entity_type,
                         profile_json = excluded.profile_json,
                         updated_at = excluded.updated_at",
                    rusqlite::params![
                        profile.entity_id,
                        profile.entity_type.to_string(),
                        json,
                        profile.last_updated.to_rfc3339(),
                    ],
                )?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Load checkpointed profiles. Rows that fail to decode are skipped.
    pub fn load(&self, pool: &Pool) -> Result<usize> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT profile_json FROM entity_profiles")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut loaded = 0;
        for row in rows {
            let json = row?;
            match serde_json::from_str::<EntityProfile>(&json) {
                Ok(profile) => {
                    let mut shard = self
                        .shard_for(&profile.entity_id)
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    shard.insert(profile.entity_id.clone(), profile);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable profile row");
                }
            }
        }
        if loaded > 0 {
            info!(loaded, "restored entity profiles from checkpoint");
        }
        Ok(loaded)
    }
}

/// The type recorded on first observation is canonical; a differing type
/// on a later observation is a caller bug worth surfacing, not a state
/// change.
fn check_entity_type(profile: &EntityProfile, observed: EntityType) {
    if profile.entity_type != observed {
        warn!(
            entity = %profile.entity_id,
            stored = %profile.entity_type,
            observed = %observed,
            "entity type mismatch, keeping stored type"
        );
    }
}
