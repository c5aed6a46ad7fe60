use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    /// The sink could not persist the entry. The operation that produced the
    /// entry must not be considered complete.
    #[error("Audit storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AuditError>;
