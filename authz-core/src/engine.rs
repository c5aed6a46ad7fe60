use crate::{
    cache::DecisionCache,
    catalog::{CapabilityCode, Catalog},
    config::{DecisionAuditMode, EngineConfig},
    error::{AuthzError, Result},
    models::{Assignment, Decision, DecisionBasis, Grant, ResourceRef},
    repository::{AssignmentStore, GrantStore, RoleStore},
    role::CapabilitySet,
};
use audit_trail::{AuditEntry, AuditEvent, AuditPage, AuditQuery, AuditSink};
use auth_identity::{BoundaryDirectory, PrincipalDirectory, PrincipalView};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// In-process system principal used by deployment seeding and the expiry
/// sweeper. Holds the wildcard implicitly for administrative gating; it is
/// not a real principal, so `decide` on it always denies.
pub const SYSTEM_ACTOR: Uuid = Uuid::nil();

/// Composes the catalog, role assignments and resource grants into the
/// single decision function the rest of the platform gates on, and owns the
/// caching and invalidation discipline around it.
pub struct AuthorizationEngine {
    principals: Arc<dyn PrincipalDirectory>,
    boundaries: Arc<dyn BoundaryDirectory>,
    catalog: Arc<Catalog>,
    roles: Arc<dyn RoleStore>,
    assignments: Arc<dyn AssignmentStore>,
    grants: Arc<dyn GrantStore>,
    audit: Arc<dyn AuditSink>,
    cache: DecisionCache,
    config: EngineConfig,
}

impl AuthorizationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        principals: Arc<dyn PrincipalDirectory>,
        boundaries: Arc<dyn BoundaryDirectory>,
        catalog: Arc<Catalog>,
        roles: Arc<dyn RoleStore>,
        assignments: Arc<dyn AssignmentStore>,
        grants: Arc<dyn GrantStore>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        let cache = DecisionCache::new(config.cache_ttl());
        Self {
            principals,
            boundaries,
            catalog,
            roles,
            assignments,
            grants,
            audit,
            cache,
            config,
        }
    }

    // =========================================================================
    // Decision
    // =========================================================================

    /// May `principal_id` perform `capability` (optionally on `resource`)?
    ///
    /// Unresolvable inputs (unknown principal, deactivated principal,
    /// unknown capability code) decide deny with an internally logged
    /// reason; callers always receive a definitive answer. Errors are
    /// store-level only and safe to retry.
    pub async fn decide(
        &self,
        principal_id: Uuid,
        capability: &CapabilityCode,
        resource: Option<&ResourceRef>,
    ) -> Result<Decision> {
        let basis = self.evaluate(principal_id, capability, resource).await?;
        let decision = if basis.allows() {
            Decision::Allow
        } else {
            Decision::Deny
        };

        if self.config.decision_audit == DecisionAuditMode::Always {
            let target = match resource {
                Some(resource) => format!("capability:{} {}", capability, resource),
                None => format!("capability:{}", capability),
            };
            let entry = AuditEntry::new(AuditEvent::AccessDecided, principal_id, target)
                .with_decision(decision.is_allowed(), basis.as_str());
            // Decision auditing is forensic, not a durability barrier; a
            // decide is a pure read and must not fail on sink trouble.
            if let Err(err) = self.record_bounded(entry).await {
                warn!(%err, "failed to record access decision");
            }
        }

        Ok(decision)
    }

    async fn evaluate(
        &self,
        principal_id: Uuid,
        capability: &CapabilityCode,
        resource: Option<&ResourceRef>,
    ) -> Result<DecisionBasis> {
        if !self.catalog.contains(capability) {
            // Unknown codes are a configuration error, not a normal denial
            warn!(%capability, "decision requested for uncatalogued capability");
            return Ok(DecisionBasis::UnknownCapability);
        }

        let principal = match self
            .bounded("principal lookup", async {
                Ok(self.principals.get_principal(principal_id).await?)
            })
            .await?
        {
            Some(principal) => principal,
            None => {
                debug!(principal = %principal_id, "decision for unknown principal");
                return Ok(DecisionBasis::UnknownPrincipal);
            }
        };
        if !principal.active {
            debug!(principal = %principal_id, "decision for deactivated principal");
            return Ok(DecisionBasis::PrincipalInactive);
        }
        if let Some(boundary_id) = principal.boundary_id {
            let active = self
                .bounded("boundary lookup", async {
                    Ok(self.boundaries.get_boundary(boundary_id).await?)
                })
                .await?
                .map_or(false, |b| b.active);
            if !active {
                debug!(principal = %principal_id, boundary = %boundary_id, "boundary inactive");
                return Ok(DecisionBasis::BoundaryInactive);
            }
        }

        // The predicate is a pure disjunction of the role union and the
        // grant lookup; roles first is an optimization, not a semantic
        // ordering.
        let capabilities = self.effective_capabilities(principal_id).await?;
        if capabilities.is_wildcard() {
            return Ok(DecisionBasis::WildcardRole);
        }
        if capabilities.contains(capability) {
            return Ok(DecisionBasis::RoleCapability);
        }

        if let Some(resource) = resource {
            let granted = self.grant_capabilities(principal_id, resource).await?;
            if granted.contains(capability) {
                return Ok(DecisionBasis::ResourceGrant);
            }
        }

        Ok(DecisionBasis::NoMatch)
    }

    /// Union of the capability sets of all roles the principal holds through
    /// active assignments. Cached per principal.
    async fn effective_capabilities(&self, principal_id: Uuid) -> Result<CapabilitySet> {
        if let Some(cached) = self.cache.role_capabilities(principal_id) {
            return Ok(cached);
        }

        let now = Utc::now();
        let assignments = self
            .bounded(
                "assignment lookup",
                self.assignments.active_for_principal(principal_id, now),
            )
            .await?;
        let mut capabilities = CapabilitySet::empty();
        for assignment in &assignments {
            if let Some(role) = self
                .bounded("role lookup", self.roles.find_role(assignment.role_id))
                .await?
            {
                if role.is_active {
                    capabilities.union_with(&role.capabilities);
                    if capabilities.is_wildcard() {
                        break;
                    }
                }
            }
        }

        self.cache
            .store_role_capabilities(principal_id, capabilities.clone());
        Ok(capabilities)
    }

    /// Capability codes actively granted to the principal on one resource.
    /// Cached per (principal, resource).
    async fn grant_capabilities(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
    ) -> Result<HashSet<CapabilityCode>> {
        if let Some(cached) = self.cache.grant_capabilities(principal_id, resource) {
            return Ok(cached);
        }

        let now = Utc::now();
        let grants = self
            .bounded(
                "grant lookup",
                self.grants
                    .active_for_principal_resource(principal_id, resource, now),
            )
            .await?;
        let codes: HashSet<CapabilityCode> =
            grants.into_iter().map(|grant| grant.capability).collect();

        self.cache
            .store_grant_capabilities(principal_id, resource, codes.clone());
        Ok(codes)
    }

    // =========================================================================
    // Assignment lifecycle
    // =========================================================================

    /// Assign a role to a principal. Idempotent on already-active
    /// (principal, role) pairs: re-assigning resets the expiry instead of
    /// duplicating the binding.
    pub async fn assign_role(
        &self,
        principal_id: Uuid,
        role_id: Uuid,
        actor: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Assignment> {
        let principal = self.require_principal(principal_id).await?;
        let role = self
            .bounded("role lookup", self.roles.find_role(role_id))
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("role {}", role_id)))?;

        self.require_actor_capability(actor, &CapabilityCode::role_manage(), None)
            .await?;
        // Delegation is root-enforced: the actor may only hand out what it
        // already holds, wildcard holders excepted.
        if actor != SYSTEM_ACTOR {
            let actor_capabilities = self.effective_capabilities(actor).await?;
            if !actor_capabilities.covers(&role.capabilities) {
                return Err(AuthzError::Forbidden(format!(
                    "actor {} does not hold every capability of role {}",
                    actor, role.code
                )));
            }
        }
        self.require_boundary_compatible(actor, &principal).await?;

        let now = Utc::now();
        let target = format!("principal:{} role:{}", principal_id, role.code);

        if let Some(existing) = self
            .bounded(
                "assignment lookup",
                self.assignments.find_active(principal_id, role_id, now),
            )
            .await?
        {
            let mut updated = existing.clone();
            updated.expires_at = expires_at;
            updated.granted_by = actor;
            let saved = self
                .bounded("assignment update", self.assignments.update(&updated))
                .await?;

            let entry = AuditEntry::new(AuditEvent::RoleAssigned, actor, target)
                .with_before(serde_json::to_value(&existing).map_err(anyhow::Error::from)?)
                .with_after(serde_json::to_value(&saved).map_err(anyhow::Error::from)?);
            if let Err(err) = self.record_bounded(entry).await {
                self.compensate_assignment(&existing).await;
                return Err(err);
            }

            self.cache.invalidate_principal(principal_id);
            info!(principal = %principal_id, role = %role.code, "role re-assigned, expiry reset");
            return Ok(saved);
        }

        let assignment = Assignment {
            id: Uuid::new_v4(),
            principal_id,
            role_id,
            granted_by: actor,
            granted_at: now,
            expires_at,
        };
        let saved = self
            .bounded("assignment create", self.assignments.create(&assignment))
            .await?;

        let entry = AuditEntry::new(AuditEvent::RoleAssigned, actor, target)
            .with_after(serde_json::to_value(&saved).map_err(anyhow::Error::from)?);
        if let Err(err) = self.record_bounded(entry).await {
            if let Err(undo) = self
                .bounded(
                    "assignment rollback",
                    self.assignments.remove_uncommitted(saved.id),
                )
                .await
            {
                error!(%undo, assignment = %saved.id, "failed to roll back unaudited assignment");
            }
            return Err(err);
        }

        self.cache.invalidate_principal(principal_id);
        info!(principal = %principal_id, role = %role.code, "role assigned");
        Ok(saved)
    }

    /// Revoke an active role assignment by setting its expiry to now. The
    /// row is never deleted.
    pub async fn revoke_role(&self, principal_id: Uuid, role_id: Uuid, actor: Uuid) -> Result<()> {
        self.require_actor_capability(actor, &CapabilityCode::role_manage(), None)
            .await?;
        let principal = self.require_principal(principal_id).await?;
        self.require_boundary_compatible(actor, &principal).await?;

        let now = Utc::now();
        let existing = self
            .bounded(
                "assignment lookup",
                self.assignments.find_active(principal_id, role_id, now),
            )
            .await?
            .ok_or_else(|| {
                AuthzError::NotFound(format!(
                    "no active assignment of role {} for principal {}",
                    role_id, principal_id
                ))
            })?;

        let mut revoked = existing.clone();
        revoked.expires_at = Some(now);
        self.bounded("assignment update", self.assignments.update(&revoked))
            .await?;

        let target = format!("principal:{} role:{}", principal_id, role_id);
        let entry = AuditEntry::new(AuditEvent::RoleRevoked, actor, target)
            .with_before(serde_json::to_value(&existing).map_err(anyhow::Error::from)?)
            .with_after(serde_json::to_value(&revoked).map_err(anyhow::Error::from)?);
        if let Err(err) = self.record_bounded(entry).await {
            self.compensate_assignment(&existing).await;
            return Err(err);
        }

        // Synchronous: a revoke that completes before a decide must be
        // reflected in that decide.
        self.cache.invalidate_principal(principal_id);
        info!(principal = %principal_id, role = %role_id, "role revoked");
        Ok(())
    }

    // =========================================================================
    // Grant (ACL) lifecycle
    // =========================================================================

    /// Create a resource-scoped grant. Resource existence is the caller's
    /// precondition; the identifier is opaque here.
    pub async fn grant(
        &self,
        principal_id: Uuid,
        resource: ResourceRef,
        capability: CapabilityCode,
        actor: Uuid,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Grant> {
        if !self.catalog.contains(&capability) {
            return Err(AuthzError::InvalidCapability(capability.to_string()));
        }
        self.require_actor_capability(actor, &CapabilityCode::acl_grant(), Some(&resource))
            .await?;
        let principal = self.require_principal(principal_id).await?;
        self.require_boundary_compatible(actor, &principal).await?;

        let grant = Grant::new(
            principal_id,
            resource,
            capability,
            actor,
            expires_at,
            metadata.unwrap_or_else(|| serde_json::json!({})),
        );
        let inserted = self.bounded("grant insert", self.grants.insert(&grant)).await?;
        let saved = inserted.grant;

        let target = format!(
            "principal:{} {} capability:{}",
            principal_id, saved.resource, saved.capability
        );
        let entry = AuditEntry::new(AuditEvent::AclGranted, actor, target)
            .with_after(serde_json::to_value(&saved).map_err(anyhow::Error::from)?);
        if let Err(err) = self.record_bounded(entry).await {
            // The rollback also undoes the supersede the insert may have
            // performed, so the tuple's prior row keeps its history intact.
            if let Err(undo) = self
                .bounded(
                    "grant rollback",
                    self.grants.remove_uncommitted(saved.id, inserted.superseded),
                )
                .await
            {
                error!(%undo, grant = %saved.id, "failed to roll back unaudited grant");
            }
            return Err(err);
        }

        self.cache.invalidate_principal(principal_id);
        info!(principal = %principal_id, resource = %saved.resource, capability = %saved.capability, "grant created");
        Ok(saved)
    }

    /// Revoke an active grant. Revoking an already-inactive grant is a
    /// reported no-op error so audit can distinguish "nothing to do" from
    /// "state changed".
    pub async fn revoke_grant(
        &self,
        grant_id: Uuid,
        actor: Uuid,
        reason: Option<String>,
    ) -> Result<()> {
        let existing = self
            .bounded("grant lookup", self.grants.find(grant_id))
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("grant {}", grant_id)))?;
        self.require_actor_capability(actor, &CapabilityCode::acl_revoke(), Some(&existing.resource))
            .await?;

        let now = Utc::now();
        if !existing.is_active_at(now) {
            return Err(AuthzError::Conflict(format!(
                "grant {} is already {:?}",
                grant_id,
                existing.status_at(now)
            )));
        }

        let mut revoked = existing.clone();
        revoked.revoked_at = Some(now);
        revoked.revoked_by = Some(actor);
        revoked.revoke_reason = reason;
        self.bounded("grant update", self.grants.update(&revoked))
            .await?;

        let target = format!(
            "principal:{} {} capability:{}",
            revoked.principal_id, revoked.resource, revoked.capability
        );
        let entry = AuditEntry::new(AuditEvent::AclRevoked, actor, target)
            .with_before(serde_json::to_value(&existing).map_err(anyhow::Error::from)?)
            .with_after(serde_json::to_value(&revoked).map_err(anyhow::Error::from)?);
        if let Err(err) = self.record_bounded(entry).await {
            self.compensate_grant(&existing).await;
            return Err(err);
        }

        self.cache.invalidate_principal(existing.principal_id);
        info!(grant = %grant_id, "grant revoked");
        Ok(())
    }

    /// Move the expiry of a currently-active grant. Expired and revoked
    /// grants stay terminal; reactivation requires a fresh [`grant`] call.
    ///
    /// [`grant`]: AuthorizationEngine::grant
    pub async fn extend_grant(
        &self,
        grant_id: Uuid,
        new_expires_at: DateTime<Utc>,
        actor: Uuid,
    ) -> Result<Grant> {
        let existing = self
            .bounded("grant lookup", self.grants.find(grant_id))
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("grant {}", grant_id)))?;
        self.require_actor_capability(actor, &CapabilityCode::acl_grant(), Some(&existing.resource))
            .await?;

        let now = Utc::now();
        if !existing.is_active_at(now) {
            return Err(AuthzError::Conflict(format!(
                "grant {} is {:?} and cannot be extended",
                grant_id,
                existing.status_at(now)
            )));
        }

        let mut extended = existing.clone();
        extended.expires_at = Some(new_expires_at);
        let saved = self
            .bounded("grant update", self.grants.update(&extended))
            .await?;

        let target = format!(
            "principal:{} {} capability:{}",
            saved.principal_id, saved.resource, saved.capability
        );
        let entry = AuditEntry::new(AuditEvent::AclExtended, actor, target)
            .with_before(serde_json::to_value(&existing).map_err(anyhow::Error::from)?)
            .with_after(serde_json::to_value(&saved).map_err(anyhow::Error::from)?);
        if let Err(err) = self.record_bounded(entry).await {
            self.compensate_grant(&existing).await;
            return Err(err);
        }

        self.cache.invalidate_principal(saved.principal_id);
        info!(grant = %grant_id, "grant extended");
        Ok(saved)
    }

    // =========================================================================
    // Query surfaces
    // =========================================================================

    pub async fn assignments_for(&self, principal_id: Uuid) -> Result<Vec<Assignment>> {
        self.bounded(
            "assignment lookup",
            self.assignments.active_for_principal(principal_id, Utc::now()),
        )
        .await
    }

    pub async fn grants_for_principal(&self, principal_id: Uuid) -> Result<Vec<Grant>> {
        self.bounded(
            "grant lookup",
            self.grants.active_for_principal(principal_id, Utc::now()),
        )
        .await
    }

    pub async fn grants_for_resource(&self, resource: &ResourceRef) -> Result<Vec<Grant>> {
        self.bounded(
            "grant lookup",
            self.grants.active_for_resource(resource, Utc::now()),
        )
        .await
    }

    pub async fn audit_log(&self, query: AuditQuery) -> Result<AuditPage> {
        self.bounded("audit search", async {
            Ok(self.audit.search(query).await?)
        })
        .await
    }

    /// Drop cached grant sets for a resource, e.g. after its owner deletes
    /// it. Exposed for resource-owning collaborators.
    pub fn invalidate_resource(&self, resource: &ResourceRef) {
        self.cache.invalidate_resource(resource);
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.clone()
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    /// Bound an external call. Nothing the engine awaits may stall past the
    /// configured deadline; a timed out write has the same abort semantics
    /// as a failed one.
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.op_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(AuthzError::StoreError(format!(
                "{} did not complete within {}s",
                what, self.config.op_timeout_secs
            ))),
        }
    }

    /// Bound an audit write. A timed out entry is indistinguishable from an
    /// unavailable sink; the caller rolls the mutation back either way.
    async fn record_bounded(&self, entry: AuditEntry) -> Result<()> {
        match tokio::time::timeout(self.config.op_timeout(), self.audit.record(entry)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AuthzError::AuditUnavailable(format!(
                "audit write did not complete within {}s",
                self.config.op_timeout_secs
            ))),
        }
    }

    async fn require_principal(&self, principal_id: Uuid) -> Result<PrincipalView> {
        self.bounded("principal lookup", async {
            Ok(self.principals.get_principal(principal_id).await?)
        })
        .await?
        .ok_or_else(|| AuthzError::NotFound(format!("principal {}", principal_id)))
    }

    /// Gate an administrative mutation on the actor's own capability,
    /// checked through the decision path. The system actor is the only
    /// bypass, for deployment seeding and the sweeper.
    async fn require_actor_capability(
        &self,
        actor: Uuid,
        capability: &CapabilityCode,
        resource: Option<&ResourceRef>,
    ) -> Result<()> {
        if actor == SYSTEM_ACTOR {
            return Ok(());
        }
        let basis = self.evaluate(actor, capability, resource).await?;
        if basis.allows() {
            Ok(())
        } else {
            Err(AuthzError::Forbidden(format!(
                "actor {} lacks {}",
                actor, capability
            )))
        }
    }

    /// Administering a principal in another boundary requires the wildcard.
    async fn require_boundary_compatible(
        &self,
        actor: Uuid,
        target: &PrincipalView,
    ) -> Result<()> {
        if actor == SYSTEM_ACTOR {
            return Ok(());
        }
        let actor_view = self
            .bounded("principal lookup", async {
                Ok(self.principals.get_principal(actor).await?)
            })
            .await?
            .ok_or_else(|| AuthzError::Forbidden(format!("actor {} is not a known principal", actor)))?;
        if actor_view.boundary_id == target.boundary_id {
            return Ok(());
        }
        let capabilities = self.effective_capabilities(actor).await?;
        if capabilities.is_wildcard() {
            Ok(())
        } else {
            Err(AuthzError::Forbidden(
                "cross-boundary administration requires an unrestricted role".to_string(),
            ))
        }
    }

    async fn compensate_assignment(&self, original: &Assignment) {
        if let Err(err) = self
            .bounded("assignment restore", self.assignments.update(original))
            .await
        {
            error!(%err, assignment = %original.id, "failed to restore assignment after audit failure");
        }
    }

    async fn compensate_grant(&self, original: &Grant) {
        if let Err(err) = self
            .bounded("grant restore", self.grants.update(original))
            .await
        {
            error!(%err, grant = %original.id, "failed to restore grant after audit failure");
        }
    }
}
