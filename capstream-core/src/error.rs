use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Cursor invalidated: {0}")]
    CursorInvalidated(String),

    #[error("Collection is not bounded: {0}")]
    NotBounded(String),

    #[error("Record of {size} bytes exceeds store capacity of {capacity} bytes")]
    RecordTooLarge { size: usize, capacity: u64 },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Duplicate record id: {0}")]
    DuplicateId(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a reconnect loop should treat this error as transient.
    ///
    /// Validation failures are permanent; everything that depends on a
    /// remote party being reachable is worth another attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Redis(_)
                | Self::StoreUnavailable(_)
                | Self::CursorInvalidated(_)
                | Self::Broker(_)
                | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
