//! Integration tests for the decision function and the grant/assignment
//! lifecycle, end to end over the in-memory stores.

use audit_trail::InMemoryAuditSink;
use auth_identity::{BoundaryKind, DirectoryService, InMemoryDirectory, Principal};
use authz_core::*;
use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

struct TestWorld {
    directory: DirectoryService,
    registry: RoleRegistry,
    engine: AuthorizationEngine,
    catalog: Arc<Catalog>,
}

fn cap(code: &str) -> CapabilityCode {
    CapabilityCode::new(code).unwrap()
}

/// Engine over in-memory stores. Cache TTL is zero so tests observe expiry
/// transitions without waiting out a TTL window; the cache discipline itself
/// is covered by `test_revoke_visible_despite_warm_cache`.
fn world() -> TestWorld {
    world_with_config(EngineConfig {
        cache_ttl_secs: 0,
        ..EngineConfig::default()
    })
}

fn world_with_config(config: EngineConfig) -> TestWorld {
    let directory = DirectoryService::new(Arc::new(InMemoryDirectory::new()));
    let catalog = Arc::new(Catalog::with_management_capabilities().unwrap());
    catalog.register(cap("pack.view"), "View a pack").unwrap();
    catalog.register(cap("pack.signoff"), "Sign off a pack").unwrap();
    catalog.register(cap("pack.delete"), "Delete a pack").unwrap();

    let roles = Arc::new(InMemoryRoleStore::new());
    let registry = RoleRegistry::new(roles.clone(), catalog.clone());
    let engine = AuthorizationEngine::new(
        Arc::new(directory.clone()),
        Arc::new(directory.clone()),
        catalog.clone(),
        roles,
        Arc::new(InMemoryAssignmentStore::new()),
        Arc::new(InMemoryGrantStore::new()),
        Arc::new(InMemoryAuditSink::new()),
        config,
    );

    TestWorld {
        directory,
        registry,
        engine,
        catalog,
    }
}

impl TestWorld {
    async fn active_principal(&self, email: &str) -> Principal {
        let principal = self.directory.register(email, "opaque", None).await.unwrap();
        self.directory.verify(principal.id).await.unwrap()
    }

    async fn allowed(&self, principal: Uuid, code: &str, resource: Option<&ResourceRef>) -> bool {
        self.engine
            .decide(principal, &cap(code), resource)
            .await
            .unwrap()
            .is_allowed()
    }
}

#[tokio::test]
async fn test_union_of_role_capabilities() {
    let world = world();
    let alice = world.active_principal("alice@example.test").await;

    let viewer = world
        .registry
        .define("viewer", "Views packs", [cap("pack.view")])
        .await
        .unwrap();
    let signer = world
        .registry
        .define("signer", "Signs packs", [cap("pack.signoff")])
        .await
        .unwrap();

    world
        .engine
        .assign_role(alice.id, viewer.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();
    world
        .engine
        .assign_role(alice.id, signer.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();

    // Effective capabilities are the union across all active assignments
    assert!(world.allowed(alice.id, "pack.view", None).await);
    assert!(world.allowed(alice.id, "pack.signoff", None).await);
    // Catalogued but in neither role, nor granted
    assert!(!world.allowed(alice.id, "pack.delete", None).await);
}

#[tokio::test]
async fn test_wildcard_short_circuit_covers_later_capabilities() {
    let world = world();
    let root = world.active_principal("root@example.test").await;

    let unrestricted = world
        .registry
        .define_wildcard("root", "Unrestricted")
        .await
        .unwrap();
    world
        .engine
        .assign_role(root.id, unrestricted.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();

    assert!(world.allowed(root.id, "pack.view", None).await);
    assert!(world.allowed(root.id, "pack.delete", None).await);

    // A capability registered after the assignment is still covered
    world
        .catalog
        .register(cap("survey.order"), "Order a survey")
        .unwrap();
    assert!(world.allowed(root.id, "survey.order", None).await);
}

#[tokio::test]
async fn test_expired_assignment_contributes_nothing() {
    let world = world();
    let p2 = world.active_principal("p2@example.test").await;

    let solicitor = world
        .registry
        .define("solicitor", "Conveyancing solicitor", [cap("pack.signoff")])
        .await
        .unwrap();
    world
        .engine
        .assign_role(
            p2.id,
            solicitor.id,
            SYSTEM_ACTOR,
            Some(Utc::now() - Duration::seconds(1)),
        )
        .await
        .unwrap();

    // The assignment row exists but is already expired
    assert!(!world.allowed(p2.id, "pack.signoff", None).await);
    assert!(world.engine.assignments_for(p2.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_grant_lifecycle_on_one_resource() {
    let world = world();
    let p1 = world.active_principal("p1@example.test").await;
    let pack = ResourceRef::new("pack", "pack-42");

    // No roles at all: role-based decision denies
    assert!(!world.allowed(p1.id, "pack.view", None).await);

    world
        .engine
        .grant(
            p1.id,
            pack.clone(),
            cap("pack.view"),
            SYSTEM_ACTOR,
            Some(Utc::now() + Duration::milliseconds(80)),
            None,
        )
        .await
        .unwrap();

    // Grant applies only with the resource in the question
    assert!(world.allowed(p1.id, "pack.view", Some(&pack)).await);
    assert!(!world.allowed(p1.id, "pack.view", None).await);
    // A different resource is not covered
    let other = ResourceRef::new("pack", "pack-43");
    assert!(!world.allowed(p1.id, "pack.view", Some(&other)).await);

    // After expiry the same question denies, with no revoke action taken
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    assert!(!world.allowed(p1.id, "pack.view", Some(&pack)).await);

    // A fresh grant with no expiry re-allows; the expired row stays terminal
    let fresh = world
        .engine
        .grant(p1.id, pack.clone(), cap("pack.view"), SYSTEM_ACTOR, None, None)
        .await
        .unwrap();
    assert!(world.allowed(p1.id, "pack.view", Some(&pack)).await);

    world
        .engine
        .revoke_grant(fresh.id, SYSTEM_ACTOR, Some("access review".to_string()))
        .await
        .unwrap();
    assert!(!world.allowed(p1.id, "pack.view", Some(&pack)).await);

    // Revoking again is a reported no-op error, not a silent success
    let err = world
        .engine
        .revoke_grant(fresh.id, SYSTEM_ACTOR, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::Conflict(_)));
}

#[tokio::test]
async fn test_duplicate_active_grant_is_a_conflict() {
    let world = world();
    let p1 = world.active_principal("p1@example.test").await;
    let pack = ResourceRef::new("pack", "pack-42");

    world
        .engine
        .grant(p1.id, pack.clone(), cap("pack.view"), SYSTEM_ACTOR, None, None)
        .await
        .unwrap();
    let err = world
        .engine
        .grant(p1.id, pack.clone(), cap("pack.view"), SYSTEM_ACTOR, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::Conflict(_)));
}

#[tokio::test]
async fn test_extend_applies_to_active_grants_only() {
    let world = world();
    let p1 = world.active_principal("p1@example.test").await;
    let pack = ResourceRef::new("pack", "pack-42");

    let short = world
        .engine
        .grant(
            p1.id,
            pack.clone(),
            cap("pack.view"),
            SYSTEM_ACTOR,
            Some(Utc::now() + Duration::milliseconds(60)),
            None,
        )
        .await
        .unwrap();

    // Extending while active moves the expiry
    let extended = world
        .engine
        .extend_grant(short.id, Utc::now() + Duration::hours(1), SYSTEM_ACTOR)
        .await
        .unwrap();
    assert!(extended.expires_at.unwrap() > Utc::now() + Duration::minutes(59));
    assert!(world.allowed(p1.id, "pack.view", Some(&pack)).await);

    // Once expired, extension is refused; reactivation needs a fresh grant
    let expiring = world
        .engine
        .grant(
            p1.id,
            pack.clone(),
            cap("pack.signoff"),
            SYSTEM_ACTOR,
            Some(Utc::now() + Duration::milliseconds(40)),
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let err = world
        .engine
        .extend_grant(expiring.id, Utc::now() + Duration::hours(1), SYSTEM_ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::Conflict(_)));
}

#[tokio::test]
async fn test_reassign_resets_expiry_without_duplicating() {
    let world = world();
    let alice = world.active_principal("alice@example.test").await;
    let viewer = world
        .registry
        .define("viewer", "Views packs", [cap("pack.view")])
        .await
        .unwrap();

    world
        .engine
        .assign_role(
            alice.id,
            viewer.id,
            SYSTEM_ACTOR,
            Some(Utc::now() + Duration::hours(1)),
        )
        .await
        .unwrap();
    world
        .engine
        .assign_role(alice.id, viewer.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();

    let assignments = world.engine.assignments_for(alice.id).await.unwrap();
    assert_eq!(assignments.len(), 1);
    assert!(assignments[0].expires_at.is_none());
}

#[tokio::test]
async fn test_revoke_role_requires_active_assignment() {
    let world = world();
    let alice = world.active_principal("alice@example.test").await;
    let viewer = world
        .registry
        .define("viewer", "Views packs", [cap("pack.view")])
        .await
        .unwrap();

    let err = world
        .engine
        .revoke_role(alice.id, viewer.id, SYSTEM_ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::NotFound(_)));

    world
        .engine
        .assign_role(alice.id, viewer.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();
    world
        .engine
        .revoke_role(alice.id, viewer.id, SYSTEM_ACTOR)
        .await
        .unwrap();
    assert!(!world.allowed(alice.id, "pack.view", None).await);
}

#[tokio::test]
async fn test_revoke_visible_despite_warm_cache() {
    // Long TTL: only the synchronous invalidation can make the revoke visible
    let world = world_with_config(EngineConfig {
        cache_ttl_secs: 300,
        ..EngineConfig::default()
    });
    let alice = world.active_principal("alice@example.test").await;
    let viewer = world
        .registry
        .define("viewer", "Views packs", [cap("pack.view")])
        .await
        .unwrap();

    world
        .engine
        .assign_role(alice.id, viewer.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();
    // Warm the cache
    assert!(world.allowed(alice.id, "pack.view", None).await);

    world
        .engine
        .revoke_role(alice.id, viewer.id, SYSTEM_ACTOR)
        .await
        .unwrap();
    assert!(!world.allowed(alice.id, "pack.view", None).await);
}

#[tokio::test]
async fn test_unknown_and_invalid_inputs_decide_deny() {
    let world = world();
    let alice = world.active_principal("alice@example.test").await;

    // Uncatalogued code: configuration error, still a definitive deny
    let decision = world
        .engine
        .decide(alice.id, &cap("pack.nonexistent"), None)
        .await
        .unwrap();
    assert!(!decision.is_allowed());

    // Unknown principal
    let decision = world
        .engine
        .decide(Uuid::new_v4(), &cap("pack.view"), None)
        .await
        .unwrap();
    assert!(!decision.is_allowed());

    // Granting an uncatalogued capability is an explicit error, not a deny
    let err = world
        .engine
        .grant(
            alice.id,
            ResourceRef::new("pack", "pack-42"),
            cap("pack.nonexistent"),
            SYSTEM_ACTOR,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::InvalidCapability(_)));
}

#[tokio::test]
async fn test_deactivated_principal_always_denies() {
    let world = world();
    let alice = world.active_principal("alice@example.test").await;
    let unrestricted = world
        .registry
        .define_wildcard("root", "Unrestricted")
        .await
        .unwrap();
    world
        .engine
        .assign_role(alice.id, unrestricted.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();
    assert!(world.allowed(alice.id, "pack.view", None).await);

    world.directory.deactivate(alice.id).await.unwrap();
    assert!(!world.allowed(alice.id, "pack.view", None).await);
}

#[tokio::test]
async fn test_inactive_boundary_denies_its_principals() {
    let world = world();
    let boundary = world
        .directory
        .create_boundary("ABC Estates", BoundaryKind::Agency)
        .await
        .unwrap();
    let alice = world
        .directory
        .register("alice@abc.test", "opaque", Some(boundary.id))
        .await
        .unwrap();
    world.directory.verify(alice.id).await.unwrap();

    let viewer = world
        .registry
        .define("viewer", "Views packs", [cap("pack.view")])
        .await
        .unwrap();
    world
        .engine
        .assign_role(alice.id, viewer.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();
    assert!(world.allowed(alice.id, "pack.view", None).await);

    world
        .directory
        .deactivate_boundary(boundary.id)
        .await
        .unwrap();
    assert!(!world.allowed(alice.id, "pack.view", None).await);
}

#[tokio::test]
async fn test_actor_gating_and_delegation() {
    let world = world();
    let admin = world.active_principal("admin@example.test").await;
    let bystander = world.active_principal("bystander@example.test").await;
    let target = world.active_principal("target@example.test").await;

    let role_admin = world
        .registry
        .define(
            "role_admin",
            "Manages viewer assignments",
            [cap("role.manage"), cap("pack.view")],
        )
        .await
        .unwrap();
    let viewer = world
        .registry
        .define("viewer", "Views packs", [cap("pack.view")])
        .await
        .unwrap();
    let signer = world
        .registry
        .define("signer", "Signs packs", [cap("pack.signoff")])
        .await
        .unwrap();

    world
        .engine
        .assign_role(admin.id, role_admin.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();

    // No role.manage at all
    let err = world
        .engine
        .assign_role(target.id, viewer.id, bystander.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::Forbidden(_)));

    // Delegation is root-enforced: the admin holds pack.view, so handing out
    // the viewer role is fine...
    world
        .engine
        .assign_role(target.id, viewer.id, admin.id, None)
        .await
        .unwrap();

    // ...but not a role carrying capabilities the admin does not hold
    let err = world
        .engine
        .assign_role(target.id, signer.id, admin.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::Forbidden(_)));
}

#[tokio::test]
async fn test_cross_boundary_administration_requires_wildcard() {
    let world = world();
    let boundary_a = world
        .directory
        .create_boundary("Agency A", BoundaryKind::Agency)
        .await
        .unwrap();
    let boundary_b = world
        .directory
        .create_boundary("Agency B", BoundaryKind::Agency)
        .await
        .unwrap();

    let admin = world
        .directory
        .register("admin@a.test", "opaque", Some(boundary_a.id))
        .await
        .unwrap();
    world.directory.verify(admin.id).await.unwrap();
    let target = world
        .directory
        .register("target@b.test", "opaque", Some(boundary_b.id))
        .await
        .unwrap();
    world.directory.verify(target.id).await.unwrap();

    let acl_admin = world
        .registry
        .define("acl_admin", "Grants pack access", [cap("acl.grant")])
        .await
        .unwrap();
    world
        .engine
        .assign_role(admin.id, acl_admin.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();

    // Same capability, different boundary: refused
    let err = world
        .engine
        .grant(
            target.id,
            ResourceRef::new("pack", "pack-42"),
            cap("pack.view"),
            admin.id,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::Forbidden(_)));

    // A wildcard holder may administer across boundaries
    let unrestricted = world
        .registry
        .define_wildcard("root", "Unrestricted")
        .await
        .unwrap();
    world
        .engine
        .assign_role(admin.id, unrestricted.id, SYSTEM_ACTOR, None)
        .await
        .unwrap();
    world
        .engine
        .grant(
            target.id,
            ResourceRef::new("pack", "pack-42"),
            cap("pack.view"),
            admin.id,
            None,
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_grant_metadata_is_passed_through_untouched() {
    let world = world();
    let p1 = world.active_principal("p1@example.test").await;
    let pack = ResourceRef::new("pack", "pack-42");

    let metadata = serde_json::json!({
        "ticket": "SUP-1184",
        "note": {"requested_by": "seller"}
    });
    let grant = world
        .engine
        .grant(
            p1.id,
            pack.clone(),
            cap("pack.view"),
            SYSTEM_ACTOR,
            None,
            Some(metadata.clone()),
        )
        .await
        .unwrap();
    assert_eq!(grant.metadata, metadata);

    let listed = world.engine.grants_for_resource(&pack).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].metadata, metadata);
}
