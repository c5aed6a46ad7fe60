//! Principal and boundary directory for the Deedgate authorization core
//!
//! This crate owns the two identity-shaped records the authorization engine
//! depends on:
//!
//! - **Principal**: an authenticatable identity (person or service account)
//! - **Boundary**: the tenancy scope a principal belongs to
//!
//! The engine consumes them through the read-only [`PrincipalDirectory`] and
//! [`BoundaryDirectory`] traits and treats the answers as ground truth for
//! the duration of a single request. Credential material is carried opaquely;
//! token issuance and password handling live elsewhere.
//!
//! # Example
//!
//! ```rust
//! use auth_identity::{DirectoryService, InMemoryDirectory, BoundaryKind};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryDirectory::new());
//! let service = DirectoryService::new(store);
//!
//! let boundary = service.create_boundary("ABC Estates", BoundaryKind::Agency).await?;
//! let principal = service.register("alice@abcestates.example", "opaque", Some(boundary.id)).await?;
//!
//! // New principals start inactive until verified
//! assert!(!principal.is_active);
//! service.verify(principal.id).await?;
//! # Ok(())
//! # }
//! ```

pub mod directory;
pub mod error;
pub mod models;
pub mod service;

pub use directory::*;
pub use error::*;
pub use models::*;
pub use service::*;
