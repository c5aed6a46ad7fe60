use crate::{directory::*, error::*, models::*};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Principal and boundary lifecycle on top of a [`DirectoryStore`].
///
/// Cheap to clone; implements the read-only [`PrincipalDirectory`] and
/// [`BoundaryDirectory`] traits the authorization engine consumes.
#[derive(Clone)]
pub struct DirectoryService {
    store: Arc<dyn DirectoryStore>,
}

impl DirectoryService {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self { store }
    }

    /// Register a new principal. Starts inactive and unverified; [`verify`]
    /// flips both flags.
    ///
    /// [`verify`]: DirectoryService::verify
    pub async fn register(
        &self,
        email: &str,
        credential: &str,
        boundary_id: Option<Uuid>,
    ) -> Result<Principal> {
        if self.store.find_principal_by_email(email).await?.is_some() {
            return Err(IdentityError::EmailAlreadyInUse);
        }
        if let Some(id) = boundary_id {
            if self.store.find_boundary(id).await?.is_none() {
                return Err(IdentityError::BoundaryNotFound);
            }
        }

        let now = Utc::now();
        let principal = Principal {
            id: Uuid::new_v4(),
            email: email.to_string(),
            credential: credential.to_string(),
            is_active: false,
            is_verified: false,
            boundary_id,
            created_at: now,
            updated_at: now,
            last_login: None,
        };
        info!(principal = %principal.id, "registering principal");
        self.store.create_principal(&principal).await
    }

    /// Mark a principal verified and active.
    pub async fn verify(&self, id: Uuid) -> Result<Principal> {
        let mut principal = self
            .store
            .find_principal(id)
            .await?
            .ok_or(IdentityError::PrincipalNotFound)?;
        principal.is_verified = true;
        principal.is_active = true;
        principal.updated_at = Utc::now();
        self.store.update_principal(&principal).await
    }

    /// Soft-deactivate a principal. The record is kept so audit references
    /// stay resolvable; a deactivated principal always decides deny.
    pub async fn deactivate(&self, id: Uuid) -> Result<Principal> {
        let mut principal = self
            .store
            .find_principal(id)
            .await?
            .ok_or(IdentityError::PrincipalNotFound)?;
        principal.is_active = false;
        principal.updated_at = Utc::now();
        info!(principal = %principal.id, "deactivating principal");
        self.store.update_principal(&principal).await
    }

    pub async fn record_login(&self, id: Uuid) -> Result<()> {
        let mut principal = self
            .store
            .find_principal(id)
            .await?
            .ok_or(IdentityError::PrincipalNotFound)?;
        principal.last_login = Some(Utc::now());
        self.store.update_principal(&principal).await?;
        Ok(())
    }

    pub async fn create_boundary(&self, name: &str, kind: BoundaryKind) -> Result<Boundary> {
        if self.store.find_boundary_by_name(name).await?.is_some() {
            return Err(IdentityError::BoundaryNameAlreadyInUse);
        }

        let now = Utc::now();
        let boundary = Boundary {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            is_active: true,
            settings: serde_json::json!({}),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        info!(boundary = %boundary.id, name, "creating boundary");
        self.store.create_boundary(&boundary).await
    }

    /// Soft-deactivate a boundary. Principals inside it will decide deny
    /// until it is reactivated.
    pub async fn deactivate_boundary(&self, id: Uuid) -> Result<Boundary> {
        let mut boundary = self
            .store
            .find_boundary(id)
            .await?
            .ok_or(IdentityError::BoundaryNotFound)?;
        boundary.is_active = false;
        boundary.updated_at = Utc::now();
        self.store.update_boundary(&boundary).await
    }

    /// Merge organisation details into the boundary metadata bag.
    pub async fn set_organisation_info(
        &self,
        id: Uuid,
        info: serde_json::Value,
    ) -> Result<Boundary> {
        let mut boundary = self
            .store
            .find_boundary(id)
            .await?
            .ok_or(IdentityError::BoundaryNotFound)?;
        if !boundary.is_organisation() {
            return Err(IdentityError::InternalError(anyhow::anyhow!(
                "cannot set organisation info for an individual boundary"
            )));
        }
        if let Some(bag) = boundary.metadata.as_object_mut() {
            bag.insert("organisation".to_string(), info);
        }
        boundary.updated_at = Utc::now();
        self.store.update_boundary(&boundary).await
    }

    pub async fn principal(&self, id: Uuid) -> Result<Option<Principal>> {
        self.store.find_principal(id).await
    }

    pub async fn boundary(&self, id: Uuid) -> Result<Option<Boundary>> {
        self.store.find_boundary(id).await
    }
}

#[async_trait]
impl PrincipalDirectory for DirectoryService {
    async fn get_principal(&self, id: Uuid) -> Result<Option<PrincipalView>> {
        Ok(self
            .store
            .find_principal(id)
            .await?
            .map(|p| PrincipalView::from(&p)))
    }
}

#[async_trait]
impl BoundaryDirectory for DirectoryService {
    async fn get_boundary(&self, id: Uuid) -> Result<Option<BoundaryView>> {
        Ok(self
            .store
            .find_boundary(id)
            .await?
            .map(|b| BoundaryView::from(&b)))
    }
}
