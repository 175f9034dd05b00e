//! Composition root.
//!
//! A host builds one [`ControlPlane`] at startup and hands clones to its HTTP
//! handlers, CLI, or executor. Every store is an independently owned object
//! behind an `Arc`, each with its own lock, all reading the same [`Clock`].
//!
//! ```text
//!                     ControlPlane (Clone)
//!   ┌────────────┬──────────┬─────────────┬───────────────┐
//!   ▼            ▼          ▼             ▼               ▼
//! events ──subscribe──▶ webhooks     approvals …     sources ──▶ merge
//!   (hash chain)        notifications (HTTP seam)    encrypted_variables
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::access::{DelegationStore, JitAccessStore, LeaseStore};
use crate::agents::AgentCheckinStore;
use crate::approvals::ApprovalStore;
use crate::clock::{Clock, SystemClock};
use crate::commands::CommandIngest;
use crate::compliance::ComplianceStore;
use crate::config::ControlPlaneConfig;
use crate::dispatch::{NotificationRouter, WebhookDispatcher};
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::http::{HttpClient, ReqwestClient};
use crate::packages::PackageRegistry;
use crate::syndic::SyndicStore;
use crate::tenant_keys::TenantKeyStore;
use crate::variables::{EncryptedVariableStore, SourceResolver};

/// Every control-plane store, wired to one clock.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    /// Configuration the plane was built from.
    pub config: Arc<ControlPlaneConfig>,
    /// Shared time source.
    pub clock: Arc<dyn Clock>,
    /// Hash-chained audit log.
    pub events: Arc<EventLog>,
    /// Break-glass policies and requests.
    pub approvals: Arc<ApprovalStore>,
    /// Master/syndic/minion topology.
    pub syndic: Arc<SyndicStore>,
    /// Compliance profiles, scans, and exceptions.
    pub compliance: Arc<ComplianceStore>,
    /// Agent check-in schedule.
    pub agents: Arc<AgentCheckinStore>,
    /// Tenant key records.
    pub tenant_keys: Arc<TenantKeyStore>,
    /// Command ingest and dead letters.
    pub commands: Arc<CommandIngest>,
    /// Delegation tokens.
    pub delegations: Arc<DelegationStore>,
    /// JIT access grants.
    pub jit: Arc<JitAccessStore>,
    /// Run leases.
    pub leases: Arc<LeaseStore>,
    /// Package registry.
    pub packages: Arc<PackageRegistry>,
    /// Outbound webhooks.
    pub webhooks: Arc<WebhookDispatcher>,
    /// Alert routing.
    pub notifications: Arc<NotificationRouter>,
    /// Variable source resolver.
    pub sources: SourceResolver,
    /// Encrypted variables, when configured.
    pub encrypted_variables: Option<Arc<EncryptedVariableStore>>,
}

impl ControlPlane {
    /// Build a plane on the system clock with `reqwest` clients.
    pub fn new(config: ControlPlaneConfig) -> Result<Self> {
        config.validate()?;
        let delivery_client: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(config.webhook_timeout())?);
        let source_client: Arc<dyn HttpClient> =
            Arc::new(ReqwestClient::new(config.variable_source_timeout())?);
        Self::with_parts(config, Arc::new(SystemClock), delivery_client, source_client)
    }

    /// Build a plane from [`ControlPlaneConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        Self::new(ControlPlaneConfig::from_env())
    }

    /// Build a plane from explicit collaborators.
    ///
    /// `delivery_client` carries webhook and notification POSTs;
    /// `source_client` carries HTTP variable-source GETs.
    pub fn with_parts(
        config: ControlPlaneConfig,
        clock: Arc<dyn Clock>,
        delivery_client: Arc<dyn HttpClient>,
        source_client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        config.validate()?;

        let encrypted_variables = match (&config.encrypted_variables_dir, &config.encrypted_variables_passphrase) {
            (Some(dir), Some(passphrase)) => Some(Arc::new(EncryptedVariableStore::open(
                dir.clone(),
                passphrase,
                clock.clone(),
            )?)),
            (Some(_), None) => {
                return Err(Error::validation(
                    "encrypted_variables_passphrase is required when encrypted_variables_dir is set",
                ))
            }
            _ => None,
        };

        let plane = Self {
            events: Arc::new(EventLog::with_capacity(
                config.event_log_capacity,
                config.event_subscriber_buffer,
                clock.clone(),
            )),
            approvals: Arc::new(ApprovalStore::new(clock.clone())),
            syndic: Arc::new(SyndicStore::new(clock.clone())),
            compliance: Arc::new(ComplianceStore::new(clock.clone())),
            agents: Arc::new(AgentCheckinStore::new(clock.clone())),
            tenant_keys: Arc::new(TenantKeyStore::new(clock.clone())),
            commands: Arc::new(CommandIngest::with_dead_letter_capacity(
                config.dead_letter_capacity,
                clock.clone(),
            )),
            delegations: Arc::new(DelegationStore::new(clock.clone())),
            jit: Arc::new(JitAccessStore::new(clock.clone())),
            leases: Arc::new(LeaseStore::new(clock.clone())),
            packages: Arc::new(PackageRegistry::new(clock.clone())),
            webhooks: Arc::new(WebhookDispatcher::with_history(
                config.delivery_history_capacity,
                delivery_client.clone(),
                clock.clone(),
            )),
            notifications: Arc::new(NotificationRouter::with_history(
                config.delivery_history_capacity,
                delivery_client,
                clock.clone(),
            )),
            sources: SourceResolver::new(source_client),
            encrypted_variables,
            config: Arc::new(config),
            clock,
        };
        tracing::info!(
            event_log_capacity = plane.config.event_log_capacity,
            delivery_history_capacity = plane.config.delivery_history_capacity,
            encrypted_variables = plane.encrypted_variables.is_some(),
            "control plane initialized"
        );
        Ok(plane)
    }

    /// Subscribe the webhook dispatcher to the event log on the current
    /// tokio runtime. The task ends when the subscription is removed.
    ///
    /// Returns the subscription id and the task handle, which yields the
    /// number of events forwarded.
    pub fn spawn_webhook_forwarding(&self) -> (u64, JoinHandle<usize>) {
        let subscription = self.events.subscribe();
        let id = subscription.id;
        let webhooks = Arc::clone(&self.webhooks);
        let handle = tokio::spawn(async move { webhooks.forward_events(subscription).await });
        tracing::info!(subscriber_id = id, "webhook forwarding started");
        (id, handle)
    }
}
