//! Error types shared by every settlement component

use crate::types::{AccountId, AssetId, Principal, Role, TransferId, TransferStatus};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a caller should treat a failure.
///
/// Every error in the workspace maps onto exactly one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Unknown rail, unauthorized caller, malformed transfer
    Precondition,
    /// Circuit restriction, rate limit, compliance denial
    GuardRejection,
    /// External rail unreachable or leg rejected
    Backend,
    /// Double release, cooldown violation, nonce replay
    InvariantViolation,
    /// Emergency circuit state, cleared only by an administrator
    Fatal,
}

impl ErrorClass {
    /// Whether the same request may succeed later without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::GuardRejection | ErrorClass::Backend)
    }
}

/// Core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transfer request failed validation
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    /// Transfer not found
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    /// Transfer already has a record
    #[error("Transfer already prepared: {0}")]
    AlreadyPrepared(TransferId),

    /// Status transition not permitted by the lifecycle
    #[error("Invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Transfer ID
        id: TransferId,
        /// Current status
        from: TransferStatus,
        /// Requested status
        to: TransferStatus,
    },

    /// Ledger balance too small
    #[error("Insufficient funds in {account} ({asset}): need {needed}, available {available}")]
    InsufficientFunds {
        /// Account debited
        account: AccountId,
        /// Asset
        asset: AssetId,
        /// Amount requested
        needed: Decimal,
        /// Amount available
        available: Decimal,
    },

    /// Caller lacks a role
    #[error("Access denied: {principal} lacks role {role:?}")]
    AccessDenied {
        /// Caller
        principal: Principal,
        /// Role required
        role: Role,
    },

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidTransfer(_)
            | Error::TransferNotFound(_)
            | Error::AccessDenied { .. }
            | Error::SignatureError(_)
            | Error::Config(_) => ErrorClass::Precondition,
            Error::AlreadyPrepared(_) | Error::InvalidTransition { .. } => {
                ErrorClass::InvariantViolation
            }
            Error::InsufficientFunds { .. }
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Other(_) => ErrorClass::Backend,
        }
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
