//! DelTran Rail Core
//!
//! Shared vocabulary for the settlement rail orchestrator and its guards.
//!
//! # Architecture
//!
//! - **Deterministic IDs**: transfer IDs and rail keys are BLAKE3 digests of their inputs
//! - **Injected collaborators**: ledger, compliance, oracle and role store are traits
//! - **Transactional store**: records change only through insert-new and compare-and-swap
//! - **Typed digests**: signed claims are bound to a deployment by a domain separator
//!
//! # Invariants
//!
//! - Transfer status is monotonic: `None → Prepared → {Released | Refunded}`
//! - Terminal statuses never change
//! - Records are retained, never deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod access;
pub mod clock;
pub mod collaborators;
pub mod crypto;
pub mod error;
pub mod events;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports
pub use access::AccessControl;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use collaborators::{AssetLedger, ComplianceEvaluator, MetricOracle, RoleStore};
pub use error::{Error, ErrorClass, Result};
pub use events::{EventBus, SettlementEvent, TransitionTrigger};
pub use metrics::Metrics;
pub use storage::{MemoryStore, TransferStore};
pub use types::{
    AccountId, AssetId, FunctionId, Principal, RailKind, Role, TransferId, TransferRecord,
    TransferRequest, TransferStatus,
};
