use crate::{
    catalog::{Capability, CapabilityCode, Catalog},
    error::{AuthzError, Result},
    repository::RoleStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// The capabilities a role carries. Wildcard is a distinct variant so the
/// "all capabilities" short-circuit is a type-level branch, not a string
/// comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySet {
    Wildcard,
    Explicit(HashSet<CapabilityCode>),
}

impl CapabilitySet {
    pub fn empty() -> Self {
        CapabilitySet::Explicit(HashSet::new())
    }

    pub fn from_codes(codes: impl IntoIterator<Item = CapabilityCode>) -> Self {
        CapabilitySet::Explicit(codes.into_iter().collect())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, CapabilitySet::Wildcard)
    }

    pub fn contains(&self, code: &CapabilityCode) -> bool {
        match self {
            CapabilitySet::Wildcard => true,
            CapabilitySet::Explicit(codes) => codes.contains(code),
        }
    }

    pub fn union_with(&mut self, other: &CapabilitySet) {
        match (&mut *self, other) {
            (CapabilitySet::Wildcard, _) => {}
            (_, CapabilitySet::Wildcard) => *self = CapabilitySet::Wildcard,
            (CapabilitySet::Explicit(mine), CapabilitySet::Explicit(theirs)) => {
                mine.extend(theirs.iter().cloned());
            }
        }
    }

    /// Whether this set includes everything `other` grants. Used for
    /// root-enforced delegation: an actor may only hand out what it holds.
    pub fn covers(&self, other: &CapabilitySet) -> bool {
        match (self, other) {
            (CapabilitySet::Wildcard, _) => true,
            (CapabilitySet::Explicit(_), CapabilitySet::Wildcard) => false,
            (CapabilitySet::Explicit(mine), CapabilitySet::Explicit(theirs)) => {
                theirs.is_subset(mine)
            }
        }
    }
}

/// A named, reusable bundle of capabilities. System roles are immutable and
/// non-deletable; inactive roles contribute nothing to decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    /// Unique name, e.g. `solicitor`.
    pub code: String,
    pub description: String,
    pub is_system: bool,
    pub is_active: bool,
    pub capabilities: CapabilitySet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Administrative surface for roles: defines bundles, keeps them aligned
/// with the catalog, and protects system roles from mutation.
#[derive(Clone)]
pub struct RoleRegistry {
    store: Arc<dyn RoleStore>,
    catalog: Arc<Catalog>,
}

impl RoleRegistry {
    pub fn new(store: Arc<dyn RoleStore>, catalog: Arc<Catalog>) -> Self {
        Self { store, catalog }
    }

    /// Define a role over catalogued capabilities.
    pub async fn define(
        &self,
        code: &str,
        description: &str,
        capabilities: impl IntoIterator<Item = CapabilityCode>,
    ) -> Result<Role> {
        let mut codes = HashSet::new();
        for capability in capabilities {
            if !self.catalog.contains(&capability) {
                return Err(AuthzError::InvalidCapability(capability.to_string()));
            }
            codes.insert(capability);
        }
        self.create(code, description, CapabilitySet::Explicit(codes), false)
            .await
    }

    /// Define the reserved unrestricted bundle. Wildcard roles are system
    /// roles: immutable once created.
    pub async fn define_wildcard(&self, code: &str, description: &str) -> Result<Role> {
        self.create(code, description, CapabilitySet::Wildcard, true)
            .await
    }

    /// Define an immutable system role over catalogued capabilities.
    pub async fn define_system(
        &self,
        code: &str,
        description: &str,
        capabilities: impl IntoIterator<Item = CapabilityCode>,
    ) -> Result<Role> {
        let mut codes = HashSet::new();
        for capability in capabilities {
            if !self.catalog.contains(&capability) {
                return Err(AuthzError::InvalidCapability(capability.to_string()));
            }
            codes.insert(capability);
        }
        self.create(code, description, CapabilitySet::Explicit(codes), true)
            .await
    }

    async fn create(
        &self,
        code: &str,
        description: &str,
        capabilities: CapabilitySet,
        is_system: bool,
    ) -> Result<Role> {
        if self.store.find_role_by_code(code).await?.is_some() {
            return Err(AuthzError::Conflict(format!("role {} already exists", code)));
        }
        let now = Utc::now();
        let role = Role {
            id: Uuid::new_v4(),
            code: code.to_string(),
            description: description.to_string(),
            is_system,
            is_active: true,
            capabilities,
            created_at: now,
            updated_at: now,
        };
        info!(role = %role.code, system = is_system, "defining role");
        self.store.create_role(&role).await
    }

    /// Add a catalogued capability to a non-system role.
    pub async fn add_capability(&self, role_id: Uuid, capability: CapabilityCode) -> Result<Role> {
        if !self.catalog.contains(&capability) {
            return Err(AuthzError::InvalidCapability(capability.to_string()));
        }
        let mut role = self.require_mutable(role_id).await?;
        if let CapabilitySet::Explicit(ref mut codes) = role.capabilities {
            codes.insert(capability);
        }
        role.updated_at = Utc::now();
        self.store.update_role(&role).await
    }

    pub async fn remove_capability(
        &self,
        role_id: Uuid,
        capability: &CapabilityCode,
    ) -> Result<Role> {
        let mut role = self.require_mutable(role_id).await?;
        if let CapabilitySet::Explicit(ref mut codes) = role.capabilities {
            codes.remove(capability);
        }
        role.updated_at = Utc::now();
        self.store.update_role(&role).await
    }

    /// Deactivate a non-system role. Assignments remain on record but stop
    /// contributing capabilities.
    pub async fn deactivate(&self, role_id: Uuid) -> Result<Role> {
        let mut role = self.require_mutable(role_id).await?;
        role.is_active = false;
        role.updated_at = Utc::now();
        self.store.update_role(&role).await
    }

    pub async fn get(&self, role_id: Uuid) -> Result<Option<Role>> {
        self.store.find_role(role_id).await
    }

    pub async fn get_by_code(&self, code: &str) -> Result<Option<Role>> {
        self.store.find_role_by_code(code).await
    }

    pub async fn list(&self) -> Result<Vec<Role>> {
        self.store.list_roles().await
    }

    pub fn catalog_entry(&self, code: &CapabilityCode) -> Option<Capability> {
        self.catalog.get(code)
    }

    async fn require_mutable(&self, role_id: Uuid) -> Result<Role> {
        let role = self
            .store
            .find_role(role_id)
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("role {}", role_id)))?;
        if role.is_system {
            return Err(AuthzError::Forbidden(format!(
                "role {} is a system role and cannot be modified",
                role.code
            )));
        }
        Ok(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRoleStore;

    fn registry() -> RoleRegistry {
        let catalog = Catalog::new();
        catalog
            .register(CapabilityCode::new("pack.view").unwrap(), "View")
            .unwrap();
        catalog
            .register(CapabilityCode::new("pack.signoff").unwrap(), "Sign off")
            .unwrap();
        RoleRegistry::new(Arc::new(InMemoryRoleStore::new()), Arc::new(catalog))
    }

    #[test]
    fn test_capability_set_union() {
        let mut set = CapabilitySet::from_codes([CapabilityCode::new("pack.view").unwrap()]);
        set.union_with(&CapabilitySet::from_codes([CapabilityCode::new(
            "pack.signoff",
        )
        .unwrap()]));

        assert!(set.contains(&CapabilityCode::new("pack.view").unwrap()));
        assert!(set.contains(&CapabilityCode::new("pack.signoff").unwrap()));

        set.union_with(&CapabilitySet::Wildcard);
        assert!(set.is_wildcard());
        assert!(set.contains(&CapabilityCode::new("anything.at_all").unwrap()));
    }

    #[test]
    fn test_capability_set_covers() {
        let wide = CapabilitySet::from_codes([
            CapabilityCode::new("pack.view").unwrap(),
            CapabilityCode::new("pack.signoff").unwrap(),
        ]);
        let narrow = CapabilitySet::from_codes([CapabilityCode::new("pack.view").unwrap()]);

        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
        assert!(CapabilitySet::Wildcard.covers(&wide));
        assert!(!wide.covers(&CapabilitySet::Wildcard));
    }

    #[tokio::test]
    async fn test_define_rejects_uncatalogued_capability() {
        let registry = registry();
        let err = registry
            .define(
                "reviewer",
                "Reviews packs",
                [CapabilityCode::new("pack.delete").unwrap()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidCapability(_)));
    }

    #[tokio::test]
    async fn test_system_role_is_immutable() {
        let registry = registry();
        let root = registry.define_wildcard("root", "Unrestricted").await.unwrap();

        let err = registry
            .add_capability(root.id, CapabilityCode::new("pack.view").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Forbidden(_)));

        let err = registry.deactivate(root.id).await.unwrap_err();
        assert!(matches!(err, AuthzError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_duplicate_role_code_conflicts() {
        let registry = registry();
        registry
            .define("reviewer", "Reviews packs", std::iter::empty())
            .await
            .unwrap();
        let err = registry
            .define("reviewer", "Another", std::iter::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Conflict(_)));
    }
}
