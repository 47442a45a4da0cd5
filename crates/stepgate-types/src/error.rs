use thiserror::Error;

/// Errors from repository operations (used by trait definitions in stepgate-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Whether the failure is transient and the operation may be retried.
    ///
    /// Conflicts and missing rows are answers, not outages.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Connection | RepositoryError::Query(_))
    }
}
