//! Error types for the settlement orchestrator

use crate::types::SettlementId;
use rail_core::{AccountId, AssetId, ErrorClass, RailKind, TransferId};
use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Core error
    #[error(transparent)]
    Core(#[from] rail_core::Error),

    /// Guard error (circuit, rate limit, attestation)
    #[error(transparent)]
    Guard(#[from] reserve_guard::Error),

    /// No adapter bound for the rail
    #[error("Unknown rail: {0}")]
    UnknownRail(RailKind),

    /// Rail already has an adapter
    #[error("Rail already bound: {0}")]
    RailAlreadyBound(RailKind),

    /// Request routed to the wrong adapter
    #[error("Rail mismatch: adapter {expected}, request {got}")]
    RailMismatch {
        /// Adapter rail
        expected: RailKind,
        /// Request rail
        got: RailKind,
    },

    /// Asset not on the rail's allow-list
    #[error("Asset {asset} not supported on rail {rail}")]
    AssetNotSupported {
        /// Rail
        rail: RailKind,
        /// Asset
        asset: AssetId,
    },

    /// Compliance evaluator refused a party
    #[error("Compliance denied for {0}")]
    ComplianceDenied(AccountId),

    /// External rail rejected or could not be reached
    #[error("Rail backend error: {0}")]
    Backend(String),

    /// Release failed after prepare
    #[error("Release of {id} failed: {reason} (refunded: {refunded})")]
    ReleaseFailed {
        /// Transfer
        id: TransferId,
        /// Backend reason
        reason: String,
        /// Whether the reservation was returned
        refunded: bool,
    },

    /// Multi-leg settlement rolled back
    #[error("Settlement {settlement_id} aborted: {reason}")]
    SettlementAborted {
        /// Settlement
        settlement_id: SettlementId,
        /// Why
        reason: String,
    },

    /// Some legs released before a later release failed
    #[error("Settlement {settlement_id} commit incomplete: {reason}")]
    CommitIncomplete {
        /// Settlement
        settlement_id: SettlementId,
        /// Why
        reason: String,
    },

    /// Settlement not found
    #[error("Settlement not found: {0}")]
    SettlementNotFound(SettlementId),

    /// Confirmation for a transfer that is not awaiting one
    #[error("Transfer not awaiting confirmation: {0}")]
    NotPending(TransferId),

    /// Confirmation failed verification
    #[error("Invalid confirmation: {0}")]
    InvalidConfirmation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Actor mailbox closed
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classification for callers
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Core(e) => e.class(),
            Error::Guard(e) => e.class(),
            Error::UnknownRail(_)
            | Error::RailAlreadyBound(_)
            | Error::RailMismatch { .. }
            | Error::AssetNotSupported { .. }
            | Error::SettlementNotFound(_)
            | Error::NotPending(_)
            | Error::Config(_) => ErrorClass::Precondition,
            Error::ComplianceDenied(_) => ErrorClass::GuardRejection,
            Error::Backend(_)
            | Error::ReleaseFailed { .. }
            | Error::SettlementAborted { .. }
            | Error::Concurrency(_)
            | Error::Io(_)
            | Error::Other(_) => ErrorClass::Backend,
            Error::InvalidConfirmation(_) => ErrorClass::InvariantViolation,
            Error::CommitIncomplete { .. } => ErrorClass::Fatal,
        }
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
