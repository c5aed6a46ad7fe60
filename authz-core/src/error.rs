use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthzError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid capability code: {0}")]
    InvalidCapability(String),

    /// The audit entry for an otherwise-valid mutation could not be
    /// persisted. The mutation has been rolled back.
    #[error("Audit storage unavailable: {0}")]
    AuditUnavailable(String),

    /// Transient store failure. Safe to retry for reads; a write that sees
    /// this has not been applied.
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Identity directory error: {0}")]
    IdentityError(#[from] auth_identity::IdentityError),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl From<audit_trail::AuditError> for AuthzError {
    fn from(err: audit_trail::AuditError) -> Self {
        match err {
            audit_trail::AuditError::Unavailable(msg) => AuthzError::AuditUnavailable(msg),
            other => AuthzError::InternalError(anyhow::anyhow!(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthzError>;
