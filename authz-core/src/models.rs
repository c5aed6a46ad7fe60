use crate::catalog::CapabilityCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a protected resource. The engine never depends on the
/// concrete shape of a resource, only on this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
}

impl ResourceRef {
    pub fn new(resource_type: &str, resource_id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_id)
    }
}

/// Binds a principal to a role, optionally time-limited. Activity is
/// computed from `expires_at` at read time, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub role_id: Uuid,
    pub granted_by: Uuid,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// Computed lifecycle state of a grant. Revoked, expired and superseded are
/// all terminal; re-granting always creates a fresh row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Expired,
    Revoked,
    /// Replaced by a fresh grant of the same tuple after expiring. Kept so
    /// the store-level uniqueness constraint can be partial over open rows.
    Superseded,
}

/// A resource-scoped permission override for one principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub resource: ResourceRef,
    pub capability: CapabilityCode,
    pub granted_by: Uuid,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<Uuid>,
    pub revoke_reason: Option<String>,
    pub superseded_at: Option<DateTime<Utc>>,
    /// Opaque attribute bag, stored and returned untouched.
    pub metadata: serde_json::Value,
}

impl Grant {
    pub fn new(
        principal_id: Uuid,
        resource: ResourceRef,
        capability: CapabilityCode,
        granted_by: Uuid,
        expires_at: Option<DateTime<Utc>>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal_id,
            resource,
            capability,
            granted_by,
            granted_at: Utc::now(),
            expires_at,
            revoked_at: None,
            revoked_by: None,
            revoke_reason: None,
            superseded_at: None,
            metadata,
        }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> GrantStatus {
        if self.revoked_at.is_some() {
            GrantStatus::Revoked
        } else if self.superseded_at.is_some() {
            GrantStatus::Superseded
        } else if self.expires_at.map_or(false, |expiry| expiry <= now) {
            GrantStatus::Expired
        } else {
            GrantStatus::Active
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == GrantStatus::Active
    }
}

/// The boolean output of the engine. Deny carries no detail; the
/// justification stays in logs and the optional decision audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Internal justification for a decision. Logged and (optionally) audited,
/// never returned to the caller that was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecisionBasis {
    WildcardRole,
    RoleCapability,
    ResourceGrant,
    UnknownPrincipal,
    PrincipalInactive,
    BoundaryInactive,
    UnknownCapability,
    NoMatch,
}

impl DecisionBasis {
    pub(crate) fn allows(&self) -> bool {
        matches!(
            self,
            DecisionBasis::WildcardRole | DecisionBasis::RoleCapability | DecisionBasis::ResourceGrant
        )
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            DecisionBasis::WildcardRole => "wildcard_role",
            DecisionBasis::RoleCapability => "role_capability",
            DecisionBasis::ResourceGrant => "resource_grant",
            DecisionBasis::UnknownPrincipal => "unknown_principal",
            DecisionBasis::PrincipalInactive => "principal_inactive",
            DecisionBasis::BoundaryInactive => "boundary_inactive",
            DecisionBasis::UnknownCapability => "unknown_capability",
            DecisionBasis::NoMatch => "no_match",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_assignment_activity_is_computed() {
        let mut assignment = Assignment {
            id: Uuid::new_v4(),
            principal_id: Uuid::new_v4(),
            role_id: Uuid::new_v4(),
            granted_by: Uuid::new_v4(),
            granted_at: Utc::now(),
            expires_at: None,
        };
        let now = Utc::now();
        assert!(assignment.is_active_at(now));

        assignment.expires_at = Some(now - Duration::seconds(1));
        assert!(!assignment.is_active_at(now));

        assignment.expires_at = Some(now + Duration::hours(1));
        assert!(assignment.is_active_at(now));
    }

    #[test]
    fn test_grant_status_precedence() {
        let now = Utc::now();
        let mut grant = Grant::new(
            Uuid::new_v4(),
            ResourceRef::new("pack", "pack-42"),
            CapabilityCode::new("pack.view").unwrap(),
            Uuid::new_v4(),
            Some(now - Duration::seconds(1)),
            serde_json::json!({}),
        );
        assert_eq!(grant.status_at(now), GrantStatus::Expired);

        // Revocation outranks expiry in reporting
        grant.revoked_at = Some(now);
        assert_eq!(grant.status_at(now), GrantStatus::Revoked);

        grant.revoked_at = None;
        grant.superseded_at = Some(now);
        assert_eq!(grant.status_at(now), GrantStatus::Superseded);
    }
}
