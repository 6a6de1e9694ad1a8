use thiserror::Error;

/// Error taxonomy for the librarian core.
///
/// Tasks catch everything non-fatal at the work-unit boundary; the helpers
/// at the bottom tell them which bucket a given error falls into.
#[derive(Error, Debug)]
pub enum MagpieError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("Parse error: {0}")]
    Parse(String),

    // Catalog
    #[error("Stale state: {0}")]
    StaleState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Storage
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capacity exceeded on store {store}: need {needed} bytes, {available} free")]
    CapacityExceeded {
        store: String,
        needed: u64,
        available: u64,
    },

    #[error("Checksum mismatch: expected {expected}, measured {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Store disabled: {0}")]
    StoreDisabled(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // Peer
    #[error("Librarian not found: {0}")]
    LibrarianNotFound(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Peer protocol error: {0}")]
    Protocol(String),

    #[error("Peer rejected request: {0}")]
    Rejected(String),

    // Policy
    #[error("Insufficient remote copies: {0}")]
    InsufficientRemoteCopies(String),

    #[error("Deletion disallowed: {0}")]
    DeletionDisallowed(String),

    // Corruption
    #[error("Local copy corrupt: {0}")]
    LocalCorrupt(String),

    #[error("Remote copy corrupt: {0}")]
    RemoteCorrupt(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MagpieError {
    /// Errors worth retrying with backoff before the soft timeout runs out.
    pub fn is_transient(&self) -> bool {
        match self {
            MagpieError::Unreachable(_) => true,
            MagpieError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            MagpieError::Io(_) => true,
            _ => false,
        }
    }

    /// Errors that terminate a transfer with no retry from the same source.
    pub fn is_fatal_for_transfer(&self) -> bool {
        matches!(
            self,
            MagpieError::ChecksumMismatch { .. }
                | MagpieError::Protocol(_)
                | MagpieError::Rejected(_)
                | MagpieError::LocalCorrupt(_)
                | MagpieError::RemoteCorrupt(_)
        )
    }

    /// Policy errors cause the candidate to be skipped, not the task to fail.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            MagpieError::InsufficientRemoteCopies(_) | MagpieError::DeletionDisallowed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MagpieError>;
