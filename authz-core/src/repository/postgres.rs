//! PostgreSQL-backed authorization stores
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE roles (
//!     id           UUID PRIMARY KEY,
//!     code         TEXT NOT NULL UNIQUE,
//!     description  TEXT NOT NULL,
//!     is_system    BOOLEAN NOT NULL,
//!     is_active    BOOLEAN NOT NULL,
//!     capabilities JSONB NOT NULL,
//!     created_at   TIMESTAMPTZ NOT NULL,
//!     updated_at   TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE assignments (
//!     id               UUID PRIMARY KEY,
//!     principal_id     UUID NOT NULL,
//!     role_id          UUID NOT NULL REFERENCES roles (id),
//!     granted_by       UUID NOT NULL,
//!     granted_at       TIMESTAMPTZ NOT NULL,
//!     expires_at       TIMESTAMPTZ,
//!     expiry_announced BOOLEAN NOT NULL DEFAULT FALSE
//! );
//! CREATE INDEX assignments_principal_idx ON assignments (principal_id, expires_at);
//!
//! CREATE TABLE grants (
//!     id               UUID PRIMARY KEY,
//!     principal_id     UUID NOT NULL,
//!     resource_type    TEXT NOT NULL,
//!     resource_id      TEXT NOT NULL,
//!     capability       TEXT NOT NULL,
//!     granted_by       UUID NOT NULL,
//!     granted_at       TIMESTAMPTZ NOT NULL,
//!     expires_at       TIMESTAMPTZ,
//!     revoked_at       TIMESTAMPTZ,
//!     revoked_by       UUID,
//!     revoke_reason    TEXT,
//!     superseded_at    TIMESTAMPTZ,
//!     metadata         JSONB NOT NULL,
//!     expiry_announced BOOLEAN NOT NULL DEFAULT FALSE
//! );
//! -- One open (non-revoked, non-superseded) row per tuple. This constraint,
//! -- not application locking, is what serializes concurrent writers across
//! -- processes. Expiry cannot appear in the predicate (now() is not
//! -- immutable), so an expired open row is superseded inside the inserting
//! -- transaction instead.
//! CREATE UNIQUE INDEX grants_open_tuple_idx
//!     ON grants (principal_id, resource_type, resource_id, capability)
//!     WHERE revoked_at IS NULL AND superseded_at IS NULL;
//! CREATE INDEX grants_resource_idx ON grants (resource_type, resource_id);
//! ```

use crate::{
    catalog::CapabilityCode,
    error::{AuthzError, Result},
    models::{Assignment, Grant, ResourceRef},
    repository::{AssignmentStore, GrantInsert, GrantStore, RoleStore},
    role::Role,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

fn store_err(context: &str, err: sqlx::Error) -> AuthzError {
    AuthzError::StoreError(format!("{}: {}", context, err))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| AuthzError::StoreError(format!("column {}: {}", name, e)))
}

pub struct PostgresRoleStore {
    pool: PgPool,
}

impl PostgresRoleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_role(row: &PgRow) -> Result<Role> {
    let capabilities: serde_json::Value = column(row, "capabilities")?;
    let capabilities = serde_json::from_value(capabilities)
        .map_err(|e| AuthzError::StoreError(format!("malformed capability set: {}", e)))?;
    Ok(Role {
        id: column(row, "id")?,
        code: column(row, "code")?,
        description: column(row, "description")?,
        is_system: column(row, "is_system")?,
        is_active: column(row, "is_active")?,
        capabilities,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

#[async_trait]
impl RoleStore for PostgresRoleStore {
    async fn create_role(&self, role: &Role) -> Result<Role> {
        let capabilities = serde_json::to_value(&role.capabilities).map_err(anyhow::Error::from)?;
        sqlx::query(
            r#"
            INSERT INTO roles (id, code, description, is_system, is_active,
                               capabilities, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(role.id)
        .bind(&role.code)
        .bind(&role.description)
        .bind(role.is_system)
        .bind(role.is_active)
        .bind(&capabilities)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => {
                AuthzError::Conflict(format!("role {} already exists", role.code))
            }
            _ => store_err("failed to create role", e),
        })?;
        Ok(role.clone())
    }

    async fn update_role(&self, role: &Role) -> Result<Role> {
        let capabilities = serde_json::to_value(&role.capabilities).map_err(anyhow::Error::from)?;
        let result = sqlx::query(
            r#"
            UPDATE roles
            SET description = $2, is_active = $3, capabilities = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(role.id)
        .bind(&role.description)
        .bind(role.is_active)
        .bind(&capabilities)
        .bind(role.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to update role", e))?;
        if result.rows_affected() == 0 {
            return Err(AuthzError::NotFound(format!("role {}", role.id)));
        }
        Ok(role.clone())
    }

    async fn find_role(&self, id: Uuid) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("failed to load role", e))?;
        row.as_ref().map(row_to_role).transpose()
    }

    async fn find_role_by_code(&self, code: &str) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("failed to load role", e))?;
        row.as_ref().map(row_to_role).transpose()
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let rows = sqlx::query("SELECT * FROM roles ORDER BY code")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_err("failed to list roles", e))?;
        rows.iter().map(row_to_role).collect()
    }
}

pub struct PostgresAssignmentStore {
    pool: PgPool,
}

impl PostgresAssignmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_assignment(row: &PgRow) -> Result<Assignment> {
    Ok(Assignment {
        id: column(row, "id")?,
        principal_id: column(row, "principal_id")?,
        role_id: column(row, "role_id")?,
        granted_by: column(row, "granted_by")?,
        granted_at: column(row, "granted_at")?,
        expires_at: column(row, "expires_at")?,
    })
}

#[async_trait]
impl AssignmentStore for PostgresAssignmentStore {
    async fn create(&self, assignment: &Assignment) -> Result<Assignment> {
        sqlx::query(
            r#"
            INSERT INTO assignments (id, principal_id, role_id, granted_by, granted_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(assignment.id)
        .bind(assignment.principal_id)
        .bind(assignment.role_id)
        .bind(assignment.granted_by)
        .bind(assignment.granted_at)
        .bind(assignment.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to create assignment", e))?;
        Ok(assignment.clone())
    }

    async fn update(&self, assignment: &Assignment) -> Result<Assignment> {
        let result = sqlx::query(
            r#"
            UPDATE assignments
            SET granted_by = $2, expires_at = $3
            WHERE id = $1
            "#,
        )
        .bind(assignment.id)
        .bind(assignment.granted_by)
        .bind(assignment.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to update assignment", e))?;
        if result.rows_affected() == 0 {
            return Err(AuthzError::NotFound(format!("assignment {}", assignment.id)));
        }
        Ok(assignment.clone())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Assignment>> {
        let row = sqlx::query("SELECT * FROM assignments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("failed to load assignment", e))?;
        row.as_ref().map(row_to_assignment).transpose()
    }

    async fn find_active(
        &self,
        principal_id: Uuid,
        role_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM assignments
            WHERE principal_id = $1 AND role_id = $2
              AND (expires_at IS NULL OR expires_at > $3)
            LIMIT 1
            "#,
        )
        .bind(principal_id)
        .bind(role_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("failed to load assignment", e))?;
        row.as_ref().map(row_to_assignment).transpose()
    }

    async fn active_for_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Assignment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM assignments
            WHERE principal_id = $1 AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(principal_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("failed to load assignments", e))?;
        rows.iter().map(row_to_assignment).collect()
    }

    async fn remove_uncommitted(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM assignments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_err("failed to roll back assignment", e))?;
        Ok(())
    }

    async fn expired_unannounced(&self, now: DateTime<Utc>) -> Result<Vec<Assignment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM assignments
            WHERE expires_at IS NOT NULL AND expires_at <= $1 AND NOT expiry_announced
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("failed to load expired assignments", e))?;
        rows.iter().map(row_to_assignment).collect()
    }

    async fn mark_expiry_announced(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query("UPDATE assignments SET expiry_announced = TRUE WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| store_err("failed to mark assignments announced", e))?;
        Ok(())
    }
}

pub struct PostgresGrantStore {
    pool: PgPool,
}

impl PostgresGrantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_grant(row: &PgRow) -> Result<Grant> {
    let capability: String = column(row, "capability")?;
    Ok(Grant {
        id: column(row, "id")?,
        principal_id: column(row, "principal_id")?,
        resource: ResourceRef {
            resource_type: column(row, "resource_type")?,
            resource_id: column(row, "resource_id")?,
        },
        capability: CapabilityCode::new(&capability)?,
        granted_by: column(row, "granted_by")?,
        granted_at: column(row, "granted_at")?,
        expires_at: column(row, "expires_at")?,
        revoked_at: column(row, "revoked_at")?,
        revoked_by: column(row, "revoked_by")?,
        revoke_reason: column(row, "revoke_reason")?,
        superseded_at: column(row, "superseded_at")?,
        metadata: column(row, "metadata")?,
    })
}

const ACTIVE_GRANT: &str =
    "revoked_at IS NULL AND superseded_at IS NULL AND (expires_at IS NULL OR expires_at > $1)";

#[async_trait]
impl GrantStore for PostgresGrantStore {
    async fn insert(&self, grant: &Grant) -> Result<GrantInsert> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_err("failed to open transaction", e))?;

        // An expired but still-open row blocks the partial unique index;
        // supersede it so the fresh grant becomes the single open row. The
        // superseded id is reported so an unaudited insert can be undone
        // completely.
        let superseded: Option<Uuid> = sqlx::query(
            r#"
            UPDATE grants SET superseded_at = $5
            WHERE principal_id = $1 AND resource_type = $2 AND resource_id = $3
              AND capability = $4
              AND revoked_at IS NULL AND superseded_at IS NULL
              AND expires_at IS NOT NULL AND expires_at <= $5
            RETURNING id
            "#,
        )
        .bind(grant.principal_id)
        .bind(&grant.resource.resource_type)
        .bind(&grant.resource.resource_id)
        .bind(grant.capability.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_err("failed to supersede expired grant", e))?
        .map(|row| column(&row, "id"))
        .transpose()?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO grants (id, principal_id, resource_type, resource_id, capability,
                                granted_by, granted_at, expires_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(grant.id)
        .bind(grant.principal_id)
        .bind(&grant.resource.resource_type)
        .bind(&grant.resource.resource_id)
        .bind(grant.capability.as_str())
        .bind(grant.granted_by)
        .bind(grant.granted_at)
        .bind(grant.expires_at)
        .bind(&grant.metadata)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit()
                    .await
                    .map_err(|e| store_err("failed to commit grant", e))?;
                debug!(grant = %grant.id, "grant inserted");
                Ok(GrantInsert {
                    grant: grant.clone(),
                    superseded,
                })
            }
            Err(e) => match e.as_database_error() {
                Some(db) if db.is_unique_violation() => Err(AuthzError::Conflict(format!(
                    "an active grant already covers {} {} for principal {}",
                    grant.resource, grant.capability, grant.principal_id
                ))),
                _ => Err(store_err("failed to insert grant", e)),
            },
        }
    }

    async fn update(&self, grant: &Grant) -> Result<Grant> {
        let result = sqlx::query(
            r#"
            UPDATE grants
            SET expires_at = $2, revoked_at = $3, revoked_by = $4,
                revoke_reason = $5, superseded_at = $6
            WHERE id = $1
            "#,
        )
        .bind(grant.id)
        .bind(grant.expires_at)
        .bind(grant.revoked_at)
        .bind(grant.revoked_by)
        .bind(&grant.revoke_reason)
        .bind(grant.superseded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("failed to update grant", e))?;
        if result.rows_affected() == 0 {
            return Err(AuthzError::NotFound(format!("grant {}", grant.id)));
        }
        Ok(grant.clone())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Grant>> {
        let row = sqlx::query("SELECT * FROM grants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("failed to load grant", e))?;
        row.as_ref().map(row_to_grant).transpose()
    }

    async fn active_for_tuple(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
        capability: &CapabilityCode,
        now: DateTime<Utc>,
    ) -> Result<Option<Grant>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM grants WHERE {} AND principal_id = $2 \
             AND resource_type = $3 AND resource_id = $4 AND capability = $5 LIMIT 1",
            ACTIVE_GRANT
        ))
        .bind(now)
        .bind(principal_id)
        .bind(&resource.resource_type)
        .bind(&resource.resource_id)
        .bind(capability.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("failed to load grant", e))?;
        row.as_ref().map(row_to_grant).transpose()
    }

    async fn active_for_principal_resource(
        &self,
        principal_id: Uuid,
        resource: &ResourceRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM grants WHERE {} AND principal_id = $2 \
             AND resource_type = $3 AND resource_id = $4",
            ACTIVE_GRANT
        ))
        .bind(now)
        .bind(principal_id)
        .bind(&resource.resource_type)
        .bind(&resource.resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("failed to load grants", e))?;
        rows.iter().map(row_to_grant).collect()
    }

    async fn active_for_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM grants WHERE {} AND principal_id = $2",
            ACTIVE_GRANT
        ))
        .bind(now)
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("failed to load grants", e))?;
        rows.iter().map(row_to_grant).collect()
    }

    async fn active_for_resource(
        &self,
        resource: &ResourceRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM grants WHERE {} AND resource_type = $2 AND resource_id = $3",
            ACTIVE_GRANT
        ))
        .bind(now)
        .bind(&resource.resource_type)
        .bind(&resource.resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("failed to load grants", e))?;
        rows.iter().map(row_to_grant).collect()
    }

    async fn remove_uncommitted(&self, id: Uuid, superseded: Option<Uuid>) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_err("failed to open transaction", e))?;
        sqlx::query("DELETE FROM grants WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("failed to roll back grant", e))?;
        // Undo the supersede the rolled-back insert performed; the partial
        // unique index stays satisfied because the fresh row is gone.
        if let Some(old_id) = superseded {
            sqlx::query("UPDATE grants SET superseded_at = NULL WHERE id = $1")
                .bind(old_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| store_err("failed to restore superseded grant", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| store_err("failed to commit grant rollback", e))?;
        Ok(())
    }

    async fn expired_unannounced(&self, now: DateTime<Utc>) -> Result<Vec<Grant>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM grants
            WHERE revoked_at IS NULL AND superseded_at IS NULL
              AND expires_at IS NOT NULL AND expires_at <= $1
              AND NOT expiry_announced
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("failed to load expired grants", e))?;
        rows.iter().map(row_to_grant).collect()
    }

    async fn mark_expiry_announced(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query("UPDATE grants SET expiry_announced = TRUE WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| store_err("failed to mark grants announced", e))?;
        Ok(())
    }
}
