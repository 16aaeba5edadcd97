use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccrualError {
    #[error("invalid order number format: {0:?}")]
    InvalidOrderNumber(String),
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("user id must not be empty")]
    EmptyUserId,
    #[error("invalid concurrency limit {0}: at least 2 workers are required")]
    InvalidConcurrencyLimit(usize),
    #[error("order {0} is already uploaded by another user")]
    OrderOwnedByAnotherUser(String),
    #[error("order {0} not found")]
    OrderNotFound(String),
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },
    #[error("balance of user {0} would become negative")]
    NegativeBalance(String),
    #[error("task dispatcher is shut down")]
    DispatcherClosed,
    #[error("accrual synchronizer is already running")]
    SynchronizerRunning,
    #[error("previous synchronizer still has {0} running attempts")]
    SynchronizerDraining(usize),
    #[error("storage error: {context}")]
    Storage {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl AccrualError {
    /// Wraps a lower-level failure with the operation it interrupted.
    pub fn storage<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Storage {
            context: context.into(),
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AccrualError>;
