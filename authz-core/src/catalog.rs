use crate::error::{AuthzError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An atomic `{resource_type}.{action}` permission code, e.g. `pack.signoff`.
///
/// The reserved wildcard (`*`) denotes "all capabilities" and is only ever
/// carried by roles; it is never a valid code to check or grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityCode(String);

const WILDCARD: &str = "*";

impl CapabilityCode {
    /// Parse and validate a code. Accepts `resource.action` with lowercase
    /// alphanumeric/underscore segments, or the wildcard.
    pub fn new(code: &str) -> Result<Self> {
        if code == WILDCARD {
            return Ok(Self(WILDCARD.to_string()));
        }
        let mut parts = code.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(resource), Some(action), None)
                if is_valid_segment(resource) && is_valid_segment(action) =>
            {
                Ok(Self(code.to_string()))
            }
            _ => Err(AuthzError::InvalidCapability(code.to_string())),
        }
    }

    pub fn wildcard() -> Self {
        Self(WILDCARD.to_string())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Capability gating assignment and revocation of roles.
    pub fn role_manage() -> Self {
        Self("role.manage".to_string())
    }

    /// Capability gating creation and extension of resource grants.
    pub fn acl_grant() -> Self {
        Self("acl.grant".to_string())
    }

    /// Capability gating revocation of resource grants.
    pub fn acl_revoke() -> Self {
        Self("acl.revoke".to_string())
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl fmt::Display for CapabilityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A recognised capability: its code plus an operator-facing description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub code: CapabilityCode,
    pub description: String,
}

/// The set of recognised capability codes. Codes are immutable once
/// registered; checking an unregistered code is a configuration error and
/// always decides deny.
pub struct Catalog {
    capabilities: DashMap<CapabilityCode, Capability>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            capabilities: DashMap::new(),
        }
    }

    /// A catalog pre-seeded with the administrative capabilities the engine
    /// itself gates on. Deployment seeds the rest.
    pub fn with_management_capabilities() -> Result<Self> {
        let catalog = Self::new();
        catalog.register(
            CapabilityCode::role_manage(),
            "Assign and revoke role assignments",
        )?;
        catalog.register(
            CapabilityCode::acl_grant(),
            "Create and extend resource-level grants",
        )?;
        catalog.register(CapabilityCode::acl_revoke(), "Revoke resource-level grants")?;
        Ok(catalog)
    }

    /// Register a new capability. The wildcard is not registrable; a
    /// duplicate code is a conflict, never a silent overwrite.
    pub fn register(
        &self,
        code: CapabilityCode,
        description: impl Into<String>,
    ) -> Result<Capability> {
        if code.is_wildcard() {
            return Err(AuthzError::InvalidCapability(code.to_string()));
        }
        if self.capabilities.contains_key(&code) {
            return Err(AuthzError::Conflict(format!(
                "capability {} already registered",
                code
            )));
        }
        let capability = Capability {
            code: code.clone(),
            description: description.into(),
        };
        self.capabilities.insert(code, capability.clone());
        Ok(capability)
    }

    /// Whether the code is recognised. The wildcard is never "in" the
    /// catalog; it is a role-level marker, not a checkable capability.
    pub fn contains(&self, code: &CapabilityCode) -> bool {
        !code.is_wildcard() && self.capabilities.contains_key(code)
    }

    pub fn get(&self, code: &CapabilityCode) -> Option<Capability> {
        self.capabilities.get(code).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<Capability> {
        self.capabilities.iter().map(|c| c.clone()).collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
