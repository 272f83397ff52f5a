use nudge_core::ReviewError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("injected failure: {0}")]
    Injected(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Every persistence failure is a `Storage` fault to the review pipeline.
impl From<StoreError> for ReviewError {
    fn from(e: StoreError) -> Self {
        ReviewError::storage(e.to_string()).with_cause(&e)
    }
}
