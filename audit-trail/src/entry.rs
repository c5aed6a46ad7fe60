use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Event types recorded by the trail. The wire codes are the
/// `subject.verb` strings used across the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    RoleAssigned,
    RoleRevoked,
    RoleExpired,
    AclGranted,
    AclRevoked,
    AclExtended,
    AclExpired,
    AccessDecided,
}

impl AuditEvent {
    pub fn code(&self) -> &'static str {
        match self {
            AuditEvent::RoleAssigned => "role.assigned",
            AuditEvent::RoleRevoked => "role.revoked",
            AuditEvent::RoleExpired => "role.expired",
            AuditEvent::AclGranted => "acl.granted",
            AuditEvent::AclRevoked => "acl.revoked",
            AuditEvent::AclExtended => "acl.extended",
            AuditEvent::AclExpired => "acl.expired",
            AuditEvent::AccessDecided => "access.decided",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Outcome attached to `access.decided` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub allowed: bool,
    /// Internal justification. Never surfaced to the caller that was denied.
    pub reason: String,
}

/// One immutable trail record. There is no update or delete for these,
/// in the model or in any sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    /// The principal that caused the event. The sweeper and other system
    /// processes record the nil UUID.
    pub actor: Uuid,
    /// Human-readable description of what was acted on,
    /// e.g. `principal:<id> role:reviewer` or `pack:pack-42`.
    pub target: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub decision: Option<DecisionRecord>,
}

impl AuditEntry {
    pub fn new(event: AuditEvent, actor: Uuid, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
            actor,
            target: target.into(),
            before: None,
            after: None,
            decision: None,
        }
    }

    pub fn with_before(mut self, before: serde_json::Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: serde_json::Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_decision(mut self, allowed: bool, reason: impl Into<String>) -> Self {
        self.decision = Some(DecisionRecord {
            allowed,
            reason: reason.into(),
        });
        self
    }
}
