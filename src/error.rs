//! Error handling for the node access layer and the stake miner
//!
//! Errors are grouped the way callers react to them: connectivity and daemon
//! status problems are reported and swallowed at the node boundary, storage
//! bring-up failures abort node construction, and template failures stop the
//! current mining attempt.

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Storage bring-up failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFailure {
    /// Underlying I/O error while opening the database
    Io,
    /// Database is locked or used by another process
    InUse,
    /// Schema still mismatched after one wipe-and-reinit attempt
    SchemaMismatch,
    /// Anything else
    Initialization,
}

impl std::fmt::Display for StorageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageFailure::Io => write!(f, "IO error"),
            StorageFailure::InUse => write!(f, "Database in usage"),
            StorageFailure::SchemaMismatch => write!(f, "Database schema version mismatch"),
            StorageFailure::Initialization => write!(f, "Database initialization failed"),
        }
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chain database errors
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The daemon could not be reached
    #[error("No connection: {message}")]
    NoConnection { message: String },

    /// The daemon answered with a non-OK status
    #[error("Daemon error: {message}")]
    Daemon { message: String },

    /// Storage could not be brought up
    #[error("Storage error: {kind}")]
    Storage { kind: StorageFailure },

    /// Node has not been initialized (or failed to initialize)
    #[error("Node not initialized: {message}")]
    NotInitialized { message: String },

    /// Operation not offered by this backend
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Block template assembly failed
    #[error("Block template error: {message}")]
    Template { message: String },

    /// Wallet cannot afford the stake required by the next block
    #[error("Not enough balance for stake: required {required}, available {available}")]
    InsufficientStake { required: u64, available: u64 },

    /// Wallet collaborator failure
    #[error("Wallet error: {message}")]
    Wallet { message: String },

    /// Block rejected by the backend
    #[error("Block rejected: {message}")]
    BlockRejected { message: String },

    /// Mining address could not be parsed
    #[error("Invalid address: {message}")]
    InvalidAddress { message: String },

    /// Payment id / transaction extra encoding errors
    #[error("Payment id error: {message}")]
    PaymentId { message: String },

    /// Miner is already running or has residual worker threads
    #[error("Miner is already running: {message}")]
    AlreadyRunning { message: String },

    /// Invalid state errors
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a no-connection error
    pub fn no_connection(message: impl Into<String>) -> Self {
        Self::NoConnection {
            message: message.into(),
        }
    }

    /// Create a daemon status error
    pub fn daemon(message: impl Into<String>) -> Self {
        Self::Daemon {
            message: message.into(),
        }
    }

    /// Create a storage bring-up error
    pub fn storage(kind: StorageFailure) -> Self {
        Self::Storage { kind }
    }

    /// Create a not-initialized error
    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::NotInitialized {
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create a block template error
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    /// Create a wallet error
    pub fn wallet(message: impl Into<String>) -> Self {
        Self::Wallet {
            message: message.into(),
        }
    }

    /// Create a block rejection error
    pub fn block_rejected(message: impl Into<String>) -> Self {
        Self::BlockRejected {
            message: message.into(),
        }
    }

    /// Create an invalid address error
    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            message: message.into(),
        }
    }

    /// Create a payment id error
    pub fn payment_id(message: impl Into<String>) -> Self {
        Self::PaymentId {
            message: message.into(),
        }
    }

    /// Create an already-running error
    pub fn already_running(message: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Check if a later attempt of the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            Error::NoConnection { .. } => true,
            Error::Daemon { .. } => true,
            Error::Template { .. } => true,
            Error::Wallet { .. } => true,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Database(_) => "database",
            Error::Config { .. } => "config",
            Error::NoConnection { .. } => "no_connection",
            Error::Daemon { .. } => "daemon",
            Error::Storage { .. } => "storage",
            Error::NotInitialized { .. } => "not_initialized",
            Error::Unsupported { .. } => "unsupported",
            Error::Template { .. } => "template",
            Error::InsufficientStake { .. } => "insufficient_stake",
            Error::Wallet { .. } => "wallet",
            Error::BlockRejected { .. } => "block_rejected",
            Error::InvalidAddress { .. } => "invalid_address",
            Error::PaymentId { .. } => "payment_id",
            Error::AlreadyRunning { .. } => "already_running",
            Error::InvalidState { .. } => "invalid_state",
        }
    }
}
