//! DelTran Reserve Guard
//!
//! Guards that can throttle or halt settlement:
//!
//! - [`CircuitBreaker`] - threshold, consensus and manual state machine per circuit
//! - [`RateLimiter`] - per-subject count/volume windows
//! - [`AttestationRegistry`] - replay-protected signed reserve claims
//! - [`ReserveFeed`] - pushes attested metrics into automated circuits

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod attestation;
pub mod circuit;
pub mod error;
pub mod feed;
pub mod rate_limit;

pub use attestation::{Attestation, AttestationRegistry, StoredAttestation};
pub use circuit::{
    Circuit, CircuitBreaker, CircuitDefinition, CircuitId, CircuitState, CircuitTransition,
    VoteOutcome,
};
pub use error::{Error, Result};
pub use feed::ReserveFeed;
pub use rate_limit::{LimitId, LimitKind, RateLimitDefinition, RateLimiter, UsageWindow, WindowKind};
