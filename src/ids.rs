//! Monotonic per-store identifiers.

/// Allocates `"<prefix>-<N>"` identifiers with a strictly increasing `N`.
///
/// An allocator lives inside the state guarded by its store's lock, so no
/// atomics are needed. Identifiers are never reused, even after deletes.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    prefix: &'static str,
    next: i64,
}

impl IdAllocator {
    /// Create an allocator whose first id is `<prefix>-1`.
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix, next: 0 }
    }

    /// Allocate the next identifier.
    pub fn next_id(&mut self) -> String {
        self.next += 1;
        format_id(self.prefix, self.next)
    }

    /// The last number handed out (0 if none).
    pub fn last(&self) -> i64 {
        self.next
    }

    /// The prefix this allocator formats with.
    pub fn prefix(&self) -> &'static str {
        self.prefix
    }
}

/// Format an identifier.
pub fn format_id(prefix: &str, n: i64) -> String {
    format!("{prefix}-{n}")
}

/// Identifier prefixes, one per store.
pub mod prefix {
    /// Approval policies.
    pub const APPROVAL_POLICY: &str = "approval-policy";
    /// Agent check-in records.
    pub const AGENT_CHECKIN: &str = "agent-checkin";
    /// Break-glass requests.
    pub const BREAKGLASS: &str = "breakglass";
    /// Compliance profiles.
    pub const COMPLIANCE_PROFILE: &str = "compliance-profile";
    /// Compliance scans.
    pub const COMPLIANCE_SCAN: &str = "compliance-scan";
    /// Compliance exceptions.
    pub const COMPLIANCE_EXCEPTION: &str = "compliance-exception";
    /// Continuous compliance configs.
    pub const COMPLIANCE_CONTINUOUS: &str = "compliance-continuous";
    /// Ingested commands.
    pub const COMMAND: &str = "cmd";
    /// Dead-lettered commands.
    pub const DEAD_LETTER: &str = "dlq";
    /// Delegation tokens.
    pub const DELEGATION: &str = "delegation";
    /// JIT access grants.
    pub const JIT_GRANT: &str = "jit-grant";
    /// Run leases.
    pub const LEASE: &str = "lease";
    /// Notification targets.
    pub const NOTIFY_TARGET: &str = "notify";
    /// Notification deliveries.
    pub const NOTIFY_DELIVERY: &str = "notify-del";
    /// Package artifacts.
    pub const PACKAGE_ARTIFACT: &str = "pkg-artifact";
    /// Syndic topology nodes.
    pub const SYNDIC_NODE: &str = "syndic-node";
    /// Tenant keys.
    pub const TENANT_KEY: &str = "tenant-key";
    /// Webhook subscriptions.
    pub const WEBHOOK: &str = "wh";
    /// Webhook deliveries.
    pub const WEBHOOK_DELIVERY: &str = "whdel";
}
