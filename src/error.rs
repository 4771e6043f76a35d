use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Storage or other infrastructure failure.
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type LocationResult<T> = Result<T, LocationError>;
