//! Role- and grant-based authorization engine for Deedgate
//!
//! This crate answers one question for the rest of the platform: may
//! principal P perform action A, optionally on resource R? The answer
//! combines:
//!
//! - **Catalog**: the recognised `resource.action` capability codes
//! - **Roles**: named capability bundles, bound to principals via
//!   time-limited assignments
//! - **Grants**: resource-scoped overrides with expiration and revocation
//!
//! Every mutation of that state is written to the audit trail before the
//! call is considered complete; a mutation whose audit entry cannot be
//! persisted is rolled back. Decisions are cache-backed, with synchronous
//! invalidation on every mutation so a revoked privilege never survives the
//! revoking call.
//!
//! # Example
//!
//! ```rust
//! use authz_core::{
//!     AuthorizationEngine, Catalog, CapabilityCode, EngineConfig, ResourceRef, RoleRegistry,
//!     InMemoryAssignmentStore, InMemoryGrantStore, InMemoryRoleStore, SYSTEM_ACTOR,
//! };
//! use audit_trail::InMemoryAuditSink;
//! use auth_identity::{DirectoryService, InMemoryDirectory};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let directory = DirectoryService::new(Arc::new(InMemoryDirectory::new()));
//! let catalog = Arc::new(Catalog::with_management_capabilities()?);
//! catalog.register(CapabilityCode::new("pack.view")?, "View a property pack")?;
//!
//! let roles = Arc::new(InMemoryRoleStore::new());
//! let engine = AuthorizationEngine::new(
//!     Arc::new(directory.clone()),
//!     Arc::new(directory.clone()),
//!     catalog.clone(),
//!     roles.clone(),
//!     Arc::new(InMemoryAssignmentStore::new()),
//!     Arc::new(InMemoryGrantStore::new()),
//!     Arc::new(InMemoryAuditSink::new()),
//!     EngineConfig::default(),
//! );
//!
//! let registry = RoleRegistry::new(roles, catalog);
//! let viewer = registry
//!     .define("viewer", "Views packs", [CapabilityCode::new("pack.view")?])
//!     .await?;
//!
//! let alice = directory.register("alice@example.test", "opaque", None).await?;
//! directory.verify(alice.id).await?;
//! engine.assign_role(alice.id, viewer.id, SYSTEM_ACTOR, None).await?;
//!
//! let decision = engine
//!     .decide(alice.id, &CapabilityCode::new("pack.view")?, None)
//!     .await?;
//! assert!(decision.is_allowed());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod repository;
pub mod role;
pub mod sweep;

pub use cache::*;
pub use catalog::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use models::*;
pub use repository::*;
pub use role::*;
pub use sweep::*;
