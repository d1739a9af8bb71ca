use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed or out-of-range reading; dropped at ingest.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Config error: {0}")]
    Config(String),
    /// No active tariff, or a home the engine does not own.
    #[error("Lookup error: {0}")]
    Lookup(String),
    #[error("Dependency error: {0}")]
    Dependency(#[source] Box<AppError>),
    #[error("Transient error: {0}")]
    Transient(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Wraps a failure from the resolver, accumulator or store so that a
    /// billing tick reports it as a dependency failure.
    pub fn dependency(err: AppError) -> Self {
        match err {
            AppError::Dependency(_) => err,
            other => AppError::Dependency(Box::new(other)),
        }
    }

    /// Whether a persistence attempt that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Transient(_) => true,
            AppError::Db(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            AppError::Dependency(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// The innermost error behind any dependency wrapping.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Dependency(inner) => inner.root(),
            other => other,
        }
    }
}
