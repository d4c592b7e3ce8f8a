// Canopy — Store error types

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The request would break a tree invariant; nothing was written.
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    /// The transaction rolled back as a whole; state is unchanged.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// An identical message is already recorded for this conversation.
    #[error("Message already recorded for contact {contact_id} as {existing_id}")]
    Conflict { contact_id: Uuid, existing_id: Uuid },

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::enclave::EnclaveError),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::TransactionAborted(err.to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}
