use crate::{
    catalog::CapabilityCode,
    error::{AuthzError, Result},
    models::{Assignment, Grant, ResourceRef},
    role::Role,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use uuid::Uuid;

pub mod postgres;

/// Storage for role definitions.
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn create_role(&self, role: &Role) -> Result<Role>;
    async fn update_role(&self, role: &Role) -> Result<Role>;
    async fn find_role(&self, id: Uuid) -> Result<Option<Role>>;
    async fn find_role_by_code(&self, code: &str) -> Result<Option<Role>>;
    async fn list_roles(&self) -> Result<Vec<Role>>;
}

/// Storage for principal-to-role bindings. Rows are never deleted; revoking
/// sets `expires_at` to now.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn create(&self, assignment: &Assignment) -> Result<Assignment>;
    async fn update(&self, assignment: &Assignment) -> Result<Assignment>;
    async fn find(&self, id: Uuid) -> Result<Option<Assignment>>;
    async fn find_active(
        &self,
        principal_id: Uuid,
        role_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>>;
    async fn active_for_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Assignment>>;

    /// Undo a `create` whose audit entry failed to persist. Only valid for a
    /// row that was never observable as committed.
    async fn remove_uncommitted(&self, id: Uuid) -> Result<()>;

    /// Expired rows the sweeper has not announced yet.
    async fn expired_unannounced(&self, now: DateTime<Utc>) -> Result<Vec<Assignment>>;
    async fn mark_expiry_announced(&self, ids: &[Uuid]) -> Result<()>;
}

/// Result of [`GrantStore::insert`]: the stored grant plus the expired open
/// row it superseded, if any. A caller undoing an unaudited insert hands
/// `superseded` back to [`GrantStore::remove_uncommitted`] so the supersede
/// is undone with it.
#[derive(Debug, Clone)]
pub struct GrantInsert {
    pub grant: Grant,
    pub superseded: Option<Uuid>,
}

/// Storage for resource-scoped grants.
///
/// The store, not the caller, serializes concurrent grants of an identical
/// tuple: `insert` resolves to exactly one open row per
/// (principal, resource_type, resource_id, capability), superseding an
/// expired open row or conflicting on an active one.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn insert(&self, grant: &Grant) -> Result<GrantInsert>;
    async fn update(&self, grant: &Grant) -> Result<Grant>;
    async fn find(&self, id: Uuid) -> Result<Option<Grant>>;
    async fn active_for_tuple(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
        capability: &CapabilityCode,
        now: DateTime<Utc>,
    ) -> Result<Option<Grant>>;
    async fn active_for_principal_resource(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>>;
    async fn active_for_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>>;
    async fn active_for_resource(
        &self,
        resource: &ResourceRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>>;

    /// Undo an `insert` whose audit entry failed to persist, including the
    /// supersede it performed: the row named by `superseded` becomes the
    /// open one for its tuple again.
    async fn remove_uncommitted(&self, id: Uuid, superseded: Option<Uuid>) -> Result<()>;

    /// Expired rows the sweeper has not announced yet.
    async fn expired_unannounced(&self, now: DateTime<Utc>) -> Result<Vec<Grant>>;
    async fn mark_expiry_announced(&self, ids: &[Uuid]) -> Result<()>;
}

// =============================================================================
// In-memory implementations (tests and single-process deployments)
// =============================================================================

pub struct InMemoryRoleStore {
    roles: DashMap<Uuid, Role>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self {
            roles: DashMap::new(),
        }
    }
}

impl Default for InMemoryRoleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn create_role(&self, role: &Role) -> Result<Role> {
        self.roles.insert(role.id, role.clone());
        Ok(role.clone())
    }

    async fn update_role(&self, role: &Role) -> Result<Role> {
        if !self.roles.contains_key(&role.id) {
            return Err(AuthzError::NotFound(format!("role {}", role.id)));
        }
        self.roles.insert(role.id, role.clone());
        Ok(role.clone())
    }

    async fn find_role(&self, id: Uuid) -> Result<Option<Role>> {
        Ok(self.roles.get(&id).map(|r| r.clone()))
    }

    async fn find_role_by_code(&self, code: &str) -> Result<Option<Role>> {
        Ok(self
            .roles
            .iter()
            .find(|entry| entry.value().code == code)
            .map(|entry| entry.value().clone()))
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        Ok(self.roles.iter().map(|r| r.clone()).collect())
    }
}

pub struct InMemoryAssignmentStore {
    assignments: DashMap<Uuid, Assignment>,
    announced: DashSet<Uuid>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self {
            assignments: DashMap::new(),
            announced: DashSet::new(),
        }
    }
}

impl Default for InMemoryAssignmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn create(&self, assignment: &Assignment) -> Result<Assignment> {
        self.assignments.insert(assignment.id, assignment.clone());
        Ok(assignment.clone())
    }

    async fn update(&self, assignment: &Assignment) -> Result<Assignment> {
        if !self.assignments.contains_key(&assignment.id) {
            return Err(AuthzError::NotFound(format!("assignment {}", assignment.id)));
        }
        self.assignments.insert(assignment.id, assignment.clone());
        Ok(assignment.clone())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Assignment>> {
        Ok(self.assignments.get(&id).map(|a| a.clone()))
    }

    async fn find_active(
        &self,
        principal_id: Uuid,
        role_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .find(|entry| {
                let a = entry.value();
                a.principal_id == principal_id && a.role_id == role_id && a.is_active_at(now)
            })
            .map(|entry| entry.value().clone()))
    }

    async fn active_for_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .filter(|entry| {
                let a = entry.value();
                a.principal_id == principal_id && a.is_active_at(now)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn remove_uncommitted(&self, id: Uuid) -> Result<()> {
        self.assignments.remove(&id);
        Ok(())
    }

    async fn expired_unannounced(&self, now: DateTime<Utc>) -> Result<Vec<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .filter(|entry| {
                let a = entry.value();
                !a.is_active_at(now) && !self.announced.contains(&a.id)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn mark_expiry_announced(&self, ids: &[Uuid]) -> Result<()> {
        for id in ids {
            self.announced.insert(*id);
        }
        Ok(())
    }
}

type TupleKey = (Uuid, ResourceRef, CapabilityCode);

pub struct InMemoryGrantStore {
    grants: DashMap<Uuid, Grant>,
    /// Open (non-revoked, non-superseded) row per tuple. The entry lock on
    /// this map is what serializes concurrent grants of the same tuple.
    open_tuples: DashMap<TupleKey, Uuid>,
    announced: DashSet<Uuid>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self {
            grants: DashMap::new(),
            open_tuples: DashMap::new(),
            announced: DashSet::new(),
        }
    }

    fn tuple_key(grant: &Grant) -> TupleKey {
        (
            grant.principal_id,
            grant.resource.clone(),
            grant.capability.clone(),
        )
    }
}

impl Default for InMemoryGrantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn insert(&self, grant: &Grant) -> Result<GrantInsert> {
        let key = Self::tuple_key(grant);
        let now = Utc::now();
        let mut superseded = None;
        match self.open_tuples.entry(key) {
            Entry::Occupied(mut entry) => {
                let existing_id = *entry.get();
                let existing = self.grants.get(&existing_id).map(|g| g.clone());
                match existing {
                    Some(existing) if existing.is_active_at(now) => {
                        return Err(AuthzError::Conflict(format!(
                            "an active grant already covers {} {} for principal {}",
                            grant.resource, grant.capability, grant.principal_id
                        )));
                    }
                    Some(mut expired) => {
                        // Expired but still open: supersede it so the fresh
                        // row becomes the single open one for the tuple.
                        expired.superseded_at = Some(now);
                        superseded = Some(expired.id);
                        self.grants.insert(expired.id, expired);
                        entry.insert(grant.id);
                    }
                    None => {
                        entry.insert(grant.id);
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(grant.id);
            }
        }
        self.grants.insert(grant.id, grant.clone());
        Ok(GrantInsert {
            grant: grant.clone(),
            superseded,
        })
    }

    async fn update(&self, grant: &Grant) -> Result<Grant> {
        if !self.grants.contains_key(&grant.id) {
            return Err(AuthzError::NotFound(format!("grant {}", grant.id)));
        }
        self.grants.insert(grant.id, grant.clone());
        let key = Self::tuple_key(grant);
        if grant.revoked_at.is_some() || grant.superseded_at.is_some() {
            self.open_tuples.remove_if(&key, |_, id| *id == grant.id);
        } else {
            // Still open (includes a compensating restore after a failed
            // audit write): this row is the open one for its tuple again.
            self.open_tuples.insert(key, grant.id);
        }
        Ok(grant.clone())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Grant>> {
        Ok(self.grants.get(&id).map(|g| g.clone()))
    }

    async fn active_for_tuple(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
        capability: &CapabilityCode,
        now: DateTime<Utc>,
    ) -> Result<Option<Grant>> {
        Ok(self
            .grants
            .iter()
            .find(|entry| {
                let g = entry.value();
                g.principal_id == principal_id
                    && g.resource == *resource
                    && g.capability == *capability
                    && g.is_active_at(now)
            })
            .map(|entry| entry.value().clone()))
    }

    async fn active_for_principal_resource(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        Ok(self
            .grants
            .iter()
            .filter(|entry| {
                let g = entry.value();
                g.principal_id == principal_id && g.resource == *resource && g.is_active_at(now)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn active_for_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        Ok(self
            .grants
            .iter()
            .filter(|entry| {
                let g = entry.value();
                g.principal_id == principal_id && g.is_active_at(now)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn active_for_resource(
        &self,
        resource: &ResourceRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        Ok(self
            .grants
            .iter()
            .filter(|entry| {
                let g = entry.value();
                g.resource == *resource && g.is_active_at(now)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn remove_uncommitted(&self, id: Uuid, superseded: Option<Uuid>) -> Result<()> {
        if let Some((_, grant)) = self.grants.remove(&id) {
            let key = Self::tuple_key(&grant);
            self.open_tuples.remove_if(&key, |_, open| *open == id);
        }
        // Undo the supersede performed by the rolled-back insert: the old
        // row returns to Expired and reclaims its open slot.
        if let Some(old_id) = superseded {
            if let Some(mut old) = self.grants.get_mut(&old_id) {
                old.superseded_at = None;
                let key = Self::tuple_key(&old);
                drop(old);
                self.open_tuples.insert(key, old_id);
            }
        }
        Ok(())
    }

    async fn expired_unannounced(&self, now: DateTime<Utc>) -> Result<Vec<Grant>> {
        Ok(self
            .grants
            .iter()
            .filter(|entry| {
                let g = entry.value();
                g.status_at(now) == crate::models::GrantStatus::Expired
                    && !self.announced.contains(&g.id)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn mark_expiry_announced(&self, ids: &[Uuid]) -> Result<()> {
        for id in ids {
            self.announced.insert(*id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(principal: Uuid, expires_at: Option<DateTime<Utc>>) -> Grant {
        Grant::new(
            principal,
            ResourceRef::new("pack", "pack-42"),
            CapabilityCode::new("pack.view").unwrap(),
            Uuid::new_v4(),
            expires_at,
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn test_duplicate_active_grant_conflicts() {
        let store = InMemoryGrantStore::new();
        let principal = Uuid::new_v4();

        store.insert(&grant(principal, None)).await.unwrap();
        let err = store.insert(&grant(principal, None)).await.unwrap_err();
        assert!(matches!(err, AuthzError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_expired_open_row_is_superseded() {
        let store = InMemoryGrantStore::new();
        let principal = Uuid::new_v4();

        let old = grant(principal, Some(Utc::now() - Duration::seconds(1)));
        store.insert(&old).await.unwrap();

        // Fresh grant of the same tuple replaces the expired open row
        let fresh = grant(principal, None);
        store.insert(&fresh).await.unwrap();

        let stored_old = store.find(old.id).await.unwrap().unwrap();
        assert!(stored_old.superseded_at.is_some());

        let active = store
            .active_for_tuple(
                principal,
                &ResourceRef::new("pack", "pack-42"),
                &CapabilityCode::new("pack.view").unwrap(),
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, fresh.id);
    }

    #[tokio::test]
    async fn test_revoked_tuple_can_be_regranted() {
        let store = InMemoryGrantStore::new();
        let principal = Uuid::new_v4();

        let mut first = grant(principal, None);
        store.insert(&first).await.unwrap();

        first.revoked_at = Some(Utc::now());
        first.revoked_by = Some(Uuid::new_v4());
        store.update(&first).await.unwrap();

        // Revocation freed the tuple; a fresh grant is a new row
        let second = grant(principal, None);
        store.insert(&second).await.unwrap();

        let active = store
            .active_for_principal(principal, Utc::now())
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[tokio::test]
    async fn test_similar_tuples_do_not_collide() {
        let store = InMemoryGrantStore::new();
        let principal = Uuid::new_v4();

        // Distinct (resource, capability) pairs whose flattened forms agree
        let first = Grant::new(
            principal,
            ResourceRef::new("pack", "a_x"),
            CapabilityCode::new("y_z.view").unwrap(),
            Uuid::new_v4(),
            None,
            serde_json::json!({}),
        );
        let second = Grant::new(
            principal,
            ResourceRef::new("pack", "a"),
            CapabilityCode::new("x_y_z.view").unwrap(),
            Uuid::new_v4(),
            None,
            serde_json::json!({}),
        );

        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();

        let active = store
            .active_for_principal(principal, Utc::now())
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_uncommitted_restores_superseded_row() {
        let store = InMemoryGrantStore::new();
        let principal = Uuid::new_v4();

        let old = grant(principal, Some(Utc::now() - Duration::seconds(1)));
        store.insert(&old).await.unwrap();

        let fresh = grant(principal, None);
        let inserted = store.insert(&fresh).await.unwrap();
        assert_eq!(inserted.superseded, Some(old.id));

        store
            .remove_uncommitted(fresh.id, inserted.superseded)
            .await
            .unwrap();

        // The old row is expired again, not superseded, and still holds the
        // open slot so a later grant of the tuple supersedes it normally
        let restored = store.find(old.id).await.unwrap().unwrap();
        assert!(restored.superseded_at.is_none());
        assert_eq!(restored.status_at(Utc::now()), crate::models::GrantStatus::Expired);
        assert!(store.find(fresh.id).await.unwrap().is_none());

        let retry = grant(principal, None);
        let inserted = store.insert(&retry).await.unwrap();
        assert_eq!(inserted.superseded, Some(old.id));
    }

    #[tokio::test]
    async fn test_expired_unannounced_reported_once() {
        let store = InMemoryGrantStore::new();
        let principal = Uuid::new_v4();

        let expired = grant(principal, Some(Utc::now() - Duration::seconds(1)));
        store.insert(&expired).await.unwrap();

        let pending = store.expired_unannounced(Utc::now()).await.unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_expiry_announced(&[expired.id]).await.unwrap();
        let pending = store.expired_unannounced(Utc::now()).await.unwrap();
        assert!(pending.is_empty());
    }
}
