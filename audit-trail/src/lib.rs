//! Append-only audit trail for the Deedgate authorization core
//!
//! Every authorization-relevant mutation (role assigned or revoked, grant
//! created, revoked, extended or expired) is recorded here before the
//! mutating call is considered complete. Decisions can optionally be
//! recorded too, for forensic replay.
//!
//! The model is deliberately narrow:
//!
//! - **AuditEntry**: immutable record of actor, event, target and the
//!   before/after values where they apply
//! - **AuditSink**: `record` and `search` only; no update or delete exists
//!   anywhere in the interface
//!
//! A sink that cannot persist an entry fails the operation that produced it.
//! That contract is enforced by the caller (the authorization engine), which
//! rolls the mutation back when `record` errors.
//!
//! # Example
//!
//! ```rust
//! use audit_trail::{AuditEntry, AuditEvent, AuditQuery, AuditSink, InMemoryAuditSink};
//! use uuid::Uuid;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = InMemoryAuditSink::new();
//! let actor = Uuid::new_v4();
//!
//! sink.record(AuditEntry::new(AuditEvent::AclGranted, actor, "pack:pack-42")).await?;
//!
//! let page = sink.search(AuditQuery::default().actor(actor)).await?;
//! assert_eq!(page.entries.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod error;
pub mod query;
pub mod sink;

pub use entry::*;
pub use error::*;
pub use query::*;
pub use sink::*;
