//! Error types for the reserve guard

use crate::{circuit::CircuitState, rate_limit::LimitId};
use chrono::{DateTime, Utc};
use rail_core::{ErrorClass, FunctionId, Principal, TransitionTrigger};
use thiserror::Error;

/// Reserve guard error
#[derive(Debug, Error)]
pub enum Error {
    /// Core error
    #[error(transparent)]
    Core(#[from] rail_core::Error),

    /// Circuit not found
    #[error("Circuit not found: {0}")]
    CircuitNotFound(String),

    /// Circuit ID already in use
    #[error("Circuit already exists: {0}")]
    CircuitExists(String),

    /// Invalid circuit or limit definition
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transition attempted before the cooldown elapsed
    #[error("Circuit {circuit} in cooldown for another {remaining_secs}s")]
    CooldownActive {
        /// Circuit
        circuit: String,
        /// Seconds until transitions are allowed again
        remaining_secs: i64,
    },

    /// Transition not permitted for this trigger
    #[error("Circuit {circuit}: {from:?} -> {to:?} not allowed via {trigger:?}: {reason}")]
    TransitionNotAllowed {
        /// Circuit
        circuit: String,
        /// Current state
        from: CircuitState,
        /// Requested state
        to: CircuitState,
        /// Trigger path
        trigger: TransitionTrigger,
        /// Why
        reason: String,
    },

    /// Voter is not in the circuit's validator set
    #[error("{principal} is not a validator of circuit {circuit}")]
    NotValidator {
        /// Circuit
        circuit: String,
        /// Voter
        principal: Principal,
    },

    /// Metric reported to a circuit that is not automated
    #[error("Circuit {0} is not automated")]
    NotAutomated(String),

    /// Function restricted by a circuit in `Restricted` state
    #[error("Function {function} restricted by circuit {circuit}")]
    FunctionRestricted {
        /// Circuit
        circuit: String,
        /// Function
        function: FunctionId,
    },

    /// Circuit in `Emergency` state; every function is halted
    #[error("Emergency halt on circuit {circuit}")]
    EmergencyHalt {
        /// Circuit
        circuit: String,
    },

    /// Rate limit not found
    #[error("Rate limit not found: {0}")]
    LimitNotFound(LimitId),

    /// Rate limit ID already in use
    #[error("Rate limit already exists: {0}")]
    LimitExists(LimitId),

    /// Rate limit exceeded
    #[error("Rate limit {limit} exceeded for {subject}")]
    LimitExceeded {
        /// Limit
        limit: LimitId,
        /// Subject
        subject: String,
    },

    /// Attestation signer not registered
    #[error("Unknown attestation signer: {0}")]
    UnknownSigner(String),

    /// Signer ID already registered
    #[error("Attestation signer already registered: {0}")]
    SignerExists(String),

    /// Signature does not verify against the signer key
    #[error("Invalid attestation signature from {0}")]
    InvalidSignature(String),

    /// Nonce not greater than the last accepted nonce
    #[error("Nonce replay for {subject}: {nonce} <= {last}")]
    NonceReplay {
        /// Subject
        subject: String,
        /// Submitted nonce
        nonce: u64,
        /// Last accepted nonce
        last: u64,
    },

    /// Attestation validity already over
    #[error("Attestation for {subject} expired at {valid_until}")]
    AttestationExpired {
        /// Subject
        subject: String,
        /// End of validity
        valid_until: DateTime<Utc>,
    },

    /// Malformed attestation
    #[error("Invalid attestation: {0}")]
    InvalidAttestation(String),
}

impl Error {
    /// Classification for callers
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Core(e) => e.class(),
            Error::CircuitNotFound(_)
            | Error::CircuitExists(_)
            | Error::InvalidConfig(_)
            | Error::NotValidator { .. }
            | Error::NotAutomated(_)
            | Error::LimitNotFound(_)
            | Error::LimitExists(_)
            | Error::UnknownSigner(_)
            | Error::SignerExists(_)
            | Error::InvalidAttestation(_) => ErrorClass::Precondition,
            Error::FunctionRestricted { .. } | Error::LimitExceeded { .. } => {
                ErrorClass::GuardRejection
            }
            Error::CooldownActive { .. }
            | Error::TransitionNotAllowed { .. }
            | Error::InvalidSignature(_)
            | Error::NonceReplay { .. }
            | Error::AttestationExpired { .. } => ErrorClass::InvariantViolation,
            Error::EmergencyHalt { .. } => ErrorClass::Fatal,
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
