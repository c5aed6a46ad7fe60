use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An authenticatable identity. Credential material is opaque to the
/// authorization core; this crate only stores and returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    /// Unique login key.
    pub email: String,
    /// Opaque credential reference (hash, key id, ...). Never interpreted here.
    pub credential: String,
    pub is_active: bool,
    pub is_verified: bool,
    /// The boundary this principal belongs to, if any. At most one.
    pub boundary_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Classification of a boundary (tenancy scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    Organisation,
    Agency,
    Individual,
}

/// An isolation scope principals belong to. Soft-deactivated, never deleted,
/// so audit references stay resolvable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Boundary {
    pub id: Uuid,
    pub name: String,
    pub kind: BoundaryKind,
    pub is_active: bool,
    /// Structured configuration blob, passed through untouched.
    pub settings: serde_json::Value,
    /// Free-form attribute bag, passed through untouched.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Boundary {
    pub fn is_organisation(&self) -> bool {
        self.kind != BoundaryKind::Individual
    }

    /// Organisation details carried in the metadata bag (address, phone, ...).
    /// Empty object for individuals.
    pub fn organisation_info(&self) -> serde_json::Value {
        self.metadata
            .get("organisation")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

/// Minimal read model the authorization engine consumes per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalView {
    pub id: Uuid,
    pub active: bool,
    pub boundary_id: Option<Uuid>,
}

impl From<&Principal> for PrincipalView {
    fn from(p: &Principal) -> Self {
        Self {
            id: p.id,
            active: p.is_active,
            boundary_id: p.boundary_id,
        }
    }
}

/// Minimal boundary read model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryView {
    pub id: Uuid,
    pub active: bool,
}

impl From<&Boundary> for BoundaryView {
    fn from(b: &Boundary) -> Self {
        Self {
            id: b.id,
            active: b.is_active,
        }
    }
}
