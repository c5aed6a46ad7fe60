use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Principal not found")]
    PrincipalNotFound,

    #[error("Boundary not found")]
    BoundaryNotFound,

    #[error("Email already in use")]
    EmailAlreadyInUse,

    #[error("Boundary name already in use")]
    BoundaryNameAlreadyInUse,

    #[error("Principal is deactivated")]
    PrincipalDeactivated,

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;
