use crate::{error::*, models::*};
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Read-only principal lookup consumed by the authorization engine.
/// Answers are ground truth for the duration of one request and are not
/// cached by the caller beyond it.
#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    async fn get_principal(&self, id: Uuid) -> Result<Option<PrincipalView>>;
}

/// Read-only boundary lookup consumed by the authorization engine.
#[async_trait]
pub trait BoundaryDirectory: Send + Sync {
    async fn get_boundary(&self, id: Uuid) -> Result<Option<BoundaryView>>;
}

/// Storage interface for full principal and boundary records.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn create_principal(&self, principal: &Principal) -> Result<Principal>;
    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>>;
    async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>>;
    async fn update_principal(&self, principal: &Principal) -> Result<Principal>;

    async fn create_boundary(&self, boundary: &Boundary) -> Result<Boundary>;
    async fn find_boundary(&self, id: Uuid) -> Result<Option<Boundary>>;
    async fn find_boundary_by_name(&self, name: &str) -> Result<Option<Boundary>>;
    async fn update_boundary(&self, boundary: &Boundary) -> Result<Boundary>;
}

/// In-memory directory for tests and single-process deployments.
pub struct InMemoryDirectory {
    principals: DashMap<Uuid, Principal>,
    boundaries: DashMap<Uuid, Boundary>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            principals: DashMap::new(),
            boundaries: DashMap::new(),
        }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectory {
    async fn create_principal(&self, principal: &Principal) -> Result<Principal> {
        self.principals.insert(principal.id, principal.clone());
        Ok(principal.clone())
    }

    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>> {
        Ok(self.principals.get(&id).map(|p| p.clone()))
    }

    async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>> {
        Ok(self
            .principals
            .iter()
            .find(|entry| entry.value().email == email)
            .map(|entry| entry.value().clone()))
    }

    async fn update_principal(&self, principal: &Principal) -> Result<Principal> {
        if !self.principals.contains_key(&principal.id) {
            return Err(IdentityError::PrincipalNotFound);
        }
        self.principals.insert(principal.id, principal.clone());
        Ok(principal.clone())
    }

    async fn create_boundary(&self, boundary: &Boundary) -> Result<Boundary> {
        self.boundaries.insert(boundary.id, boundary.clone());
        Ok(boundary.clone())
    }

    async fn find_boundary(&self, id: Uuid) -> Result<Option<Boundary>> {
        Ok(self.boundaries.get(&id).map(|b| b.clone()))
    }

    async fn find_boundary_by_name(&self, name: &str) -> Result<Option<Boundary>> {
        Ok(self
            .boundaries
            .iter()
            .find(|entry| entry.value().name == name)
            .map(|entry| entry.value().clone()))
    }

    async fn update_boundary(&self, boundary: &Boundary) -> Result<Boundary> {
        if !self.boundaries.contains_key(&boundary.id) {
            return Err(IdentityError::BoundaryNotFound);
        }
        self.boundaries.insert(boundary.id, boundary.clone());
        Ok(boundary.clone())
    }
}
