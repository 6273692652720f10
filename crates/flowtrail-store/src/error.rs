use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A stored value could not be decoded (bad uuid, timestamp or code).
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for flowtrail_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => flowtrail_core::Error::NotFound(what),
            StoreError::Serialization(e) => flowtrail_core::Error::Serialization(e),
            other => flowtrail_core::Error::Storage(other.to_string()),
        }
    }
}
