//! Command ingest with idempotency and a dead-letter queue.
//!
//! ```text
//! submit ──validate──┬── invalid ──▶ dead letter (bounded) + Validation error
//!                    │
//!                    └── valid ──▶ fingerprint = sha256(action|config_path|priority|key)
//!                                      │
//!                     key seen? ───────┼── yes ──▶ recorded envelope, duplicate=true
//!                                      └── new ──▶ accepted envelope (cmd-N)
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::canonical::prefixed_sha256;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::ids::{prefix, IdAllocator};
use crate::impl_entity;
use crate::ring::BoundedRing;
use crate::store::EntityStore;
use crate::text::normalize;

/// Default dead-letter capacity.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1_000;

/// What the executor should do with a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    /// Converge.
    Apply,
    /// Dry run.
    Plan,
    /// Revert to the previous revision.
    Rollback,
    /// Validate only.
    Check,
}

impl CommandAction {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Plan => "plan",
            Self::Rollback => "rollback",
            Self::Check => "check",
        }
    }
}

impl FromStr for CommandAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "apply" => Ok(Self::Apply),
            "plan" => Ok(Self::Plan),
            "rollback" => Ok(Self::Rollback),
            "check" => Ok(Self::Check),
            "" => Err(Error::validation("action is required")),
            other => Err(Error::validation(format!(
                "unsupported action \"{other}\": must be apply, plan, rollback, or check"
            ))),
        }
    }
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    /// Background.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
}

impl CommandPriority {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "high" => Ok(Self::High),
            other => Err(Error::validation(format!(
                "unsupported priority \"{other}\": must be low, normal, or high"
            ))),
        }
    }
}

/// Raw submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInput {
    /// `apply`, `plan`, `rollback`, or `check`.
    pub action: String,
    /// Configuration to act on.
    pub config_path: String,
    /// `low`, `normal`, or `high`; blank means normal.
    #[serde(default)]
    pub priority: String,
    /// Caller key for idempotent retries; blank uses the fingerprint.
    #[serde(default)]
    pub idempotency_key: String,
}

/// An accepted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Store-assigned id.
    pub id: String,
    /// Action.
    pub action: CommandAction,
    /// Configuration path.
    pub config_path: String,
    /// Priority.
    pub priority: CommandPriority,
    /// Idempotency key.
    pub idempotency_key: String,
    /// `sha256:` over `action|config_path|priority|idempotency_key`.
    pub fingerprint: String,
    /// Set on the copy returned for a re-submission. Never stored as `true`.
    #[serde(default)]
    pub duplicate: bool,
    /// Acceptance time.
    pub created_at: DateTime<Utc>,
}

impl_entity!(CommandEnvelope, prefix::COMMAND);

/// A rejected submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// `dlq-N`.
    pub id: String,
    /// Submission as received.
    pub input: CommandInput,
    /// Validation message.
    pub reason: String,
    /// Rejection time.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DeadLetterQueue {
    ids: IdAllocator,
    items: BoundedRing<DeadLetter>,
}

/// Compute the idempotency fingerprint.
pub fn command_fingerprint(
    action: CommandAction,
    config_path: &str,
    priority: CommandPriority,
    idempotency_key: &str,
) -> String {
    let material = format!("{}|{config_path}|{priority}|{idempotency_key}", action.as_str());
    prefixed_sha256(material.as_bytes())
}

/// Command ingest front door.
#[derive(Debug)]
pub struct CommandIngest {
    commands: EntityStore<CommandEnvelope>,
    dead_letters: RwLock<DeadLetterQueue>,
    clock: Arc<dyn Clock>,
}

impl CommandIngest {
    /// Ingest with the default dead-letter capacity.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_dead_letter_capacity(DEFAULT_DEAD_LETTER_CAPACITY, clock)
    }

    /// Ingest keeping at most `capacity` dead letters.
    pub fn with_dead_letter_capacity(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            commands: EntityStore::new(),
            dead_letters: RwLock::new(DeadLetterQueue {
                ids: IdAllocator::new(prefix::DEAD_LETTER),
                items: BoundedRing::new(capacity),
            }),
            clock,
        }
    }

    fn parse(input: &CommandInput) -> Result<(CommandAction, String, CommandPriority)> {
        let action: CommandAction = input.action.parse()?;
        let config_path = normalize(&input.config_path);
        if config_path.is_empty() {
            return Err(Error::validation("config_path is required"));
        }
        let priority: CommandPriority = input.priority.parse()?;
        Ok((action, config_path, priority))
    }

    fn dead_letter(&self, input: CommandInput, reason: String) {
        let now = self.clock.now();
        let mut queue = self.dead_letters.write();
        let id = queue.ids.next_id();
        tracing::debug!(dead_letter_id = %id, reason = %reason, "command dead-lettered");
        queue.items.push(DeadLetter {
            id,
            input,
            reason,
            created_at: now,
        });
    }

    /// Validate and accept a command.
    pub fn submit(&self, input: CommandInput) -> Result<CommandEnvelope> {
        let (action, config_path, priority) = match Self::parse(&input) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.dead_letter(input, err.to_string());
                return Err(err);
            }
        };

        let key = normalize(&input.idempotency_key);
        let fingerprint = command_fingerprint(action, &config_path, priority, &key);
        let key = if key.is_empty() { fingerprint.clone() } else { key };
        let now = self.clock.now();

        self.commands.write(|table| {
            if let Some(existing) = table.find(|c| c.idempotency_key == key) {
                let mut replay = existing.clone();
                replay.duplicate = true;
                tracing::debug!(
                    command_id = %replay.id,
                    same_command = replay.fingerprint == fingerprint,
                    "duplicate command submission"
                );
                return Ok(replay);
            }
            let envelope = table.insert_new(CommandEnvelope {
                id: String::new(),
                action,
                config_path,
                priority,
                idempotency_key: key,
                fingerprint,
                duplicate: false,
                created_at: now,
            });
            tracing::info!(
                command_id = %envelope.id,
                action = envelope.action.as_str(),
                priority = %envelope.priority,
                "command accepted"
            );
            Ok(envelope)
        })
    }

    /// Look up an accepted command.
    pub fn get(&self, id: &str) -> Option<CommandEnvelope> {
        self.commands.get(id)
    }

    /// Accepted commands, newest first.
    pub fn list(&self) -> Vec<CommandEnvelope> {
        self.commands.list()
    }

    /// Dead letters, newest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.read().items.iter().rev().cloned().collect()
    }
}
