//! Agent check-in scheduling with deterministic splay.
//!
//! ```text
//! splay            = fnv1a_32(lowercase(agent_id)) mod (max_splay + 1)
//! next_checkin_at  = now + interval + splay
//! ```
//!
//! The same agent always lands on the same offset, so a fleet spreads its
//! check-ins without any coordination.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::fnv1a_32;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::expiry::bounded_seconds;
use crate::ids::prefix;
use crate::impl_entity;
use crate::store::EntityStore;
use crate::text::normalize_key;

/// Default check-in interval.
pub const DEFAULT_INTERVAL_SECONDS: i64 = 300;
/// Minimum check-in interval.
pub const MIN_INTERVAL_SECONDS: i64 = 30;
/// Maximum check-in interval.
pub const MAX_INTERVAL_SECONDS: i64 = 86_400;
/// Maximum splay window.
pub const MAX_SPLAY_SECONDS: i64 = 3_600;

/// Deterministic splay for `agent_id` within `[0, max_splay]`.
pub fn splay_seconds(agent_id: &str, max_splay: i64) -> i64 {
    if max_splay <= 0 {
        return 0;
    }
    let hash = fnv1a_32(agent_id.trim().to_lowercase().as_bytes());
    i64::from(hash) % (max_splay + 1)
}

/// Latest check-in state of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCheckin {
    /// Store-assigned id.
    pub id: String,
    /// Lowercased agent id; the natural key.
    pub agent_id: String,
    /// Interval in effect.
    pub interval_seconds: i64,
    /// Splay window in effect.
    pub max_splay_seconds: i64,
    /// Splay applied to the last schedule.
    pub applied_splay_sec: i64,
    /// Free-form labels from the last check-in.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Number of check-ins recorded.
    pub checkin_count: u64,
    /// Last check-in time.
    pub last_checkin_at: DateTime<Utc>,
    /// When the agent is next expected.
    pub next_checkin_at: DateTime<Utc>,
    /// First check-in time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl_entity!(AgentCheckin, prefix::AGENT_CHECKIN);

/// Check-in request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckinInput {
    /// Agent identity (case-insensitive).
    pub agent_id: String,
    /// 0 means 300.
    #[serde(default)]
    pub interval_seconds: i64,
    /// 0 disables splay.
    #[serde(default)]
    pub max_splay_seconds: i64,
    /// Labels to record.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Check-in registry.
#[derive(Debug)]
pub struct AgentCheckinStore {
    agents: EntityStore<AgentCheckin>,
    clock: Arc<dyn Clock>,
}

impl AgentCheckinStore {
    /// Create an empty registry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: EntityStore::new(),
            clock,
        }
    }

    /// Record a check-in and schedule the next one.
    pub fn checkin(&self, input: CheckinInput) -> Result<AgentCheckin> {
        let agent_id = normalize_key(&input.agent_id);
        if agent_id.is_empty() {
            return Err(Error::validation("agent_id is required"));
        }
        let interval_seconds = bounded_seconds(
            input.interval_seconds,
            DEFAULT_INTERVAL_SECONDS,
            MIN_INTERVAL_SECONDS,
            MAX_INTERVAL_SECONDS,
            "interval_seconds",
        )?;
        let max_splay_seconds = input.max_splay_seconds;
        if !(0..=MAX_SPLAY_SECONDS).contains(&max_splay_seconds) {
            return Err(Error::validation(format!(
                "max_splay_seconds must be between 0 and {MAX_SPLAY_SECONDS}"
            )));
        }

        let splay = splay_seconds(&agent_id, max_splay_seconds);
        let now = self.clock.now();
        let next = now + Duration::seconds(interval_seconds + splay);

        self.agents.write(|table| {
            if let Some(existing) = table.values_mut().find(|a| a.agent_id == agent_id) {
                existing.interval_seconds = interval_seconds;
                existing.max_splay_seconds = max_splay_seconds;
                existing.applied_splay_sec = splay;
                existing.labels = input.labels;
                existing.checkin_count += 1;
                existing.last_checkin_at = now;
                existing.next_checkin_at = next;
                existing.updated_at = now;
                tracing::debug!(agent_id = %existing.agent_id, splay, "agent checked in");
                return Ok(existing.clone());
            }
            let created = table.insert_new(AgentCheckin {
                id: String::new(),
                agent_id,
                interval_seconds,
                max_splay_seconds,
                applied_splay_sec: splay,
                labels: input.labels,
                checkin_count: 1,
                last_checkin_at: now,
                next_checkin_at: next,
                created_at: now,
                updated_at: now,
            });
            tracing::info!(agent_id = %created.agent_id, splay, "agent registered");
            Ok(created)
        })
    }

    /// Look up by agent id (case-insensitive).
    pub fn get(&self, agent_id: &str) -> Option<AgentCheckin> {
        let key = normalize_key(agent_id);
        self.agents.read(|table| table.find(|a| a.agent_id == key).cloned())
    }

    /// All agents sorted by agent id.
    pub fn list(&self) -> Vec<AgentCheckin> {
        self.agents.list_sorted_by(|a, b| a.agent_id.cmp(&b.agent_id))
    }

    /// Agents whose next check-in is in the past.
    pub fn overdue(&self) -> Vec<AgentCheckin> {
        let now = self.clock.now();
        let mut items = self.list();
        items.retain(|a| a.next_checkin_at < now);
        items
    }
}
