use thiserror::Error;

/// Errors that can occur within the event/outbox store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No event with the given ID exists in the store.
    #[error("Event not found: {id}")]
    NotFound { id: String },

    /// An event with the given ID already exists.
    #[error("Duplicate event id: {id}")]
    Duplicate { id: String },

    /// The row is no longer `IN_PROGRESS` under the claim being completed
    /// (it was reaped and possibly re-claimed elsewhere).
    #[error("Claim lost for event {id}")]
    ClaimLost { id: String },

    /// The row is held by another transaction and the operation does not wait.
    #[error("Row locked by another transaction: {id}")]
    RowLocked { id: String },

    /// The store cannot serve requests right now.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A blocking store task panicked or was cancelled.
    #[error("Store task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
