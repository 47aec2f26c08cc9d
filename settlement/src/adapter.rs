//! Rail adapter contract
//!
//! Every settlement backend exposes the same lifecycle:
//!
//! ```text
//! None ──prepare──▶ Prepared ──release──▶ Released
//!                       │
//!                       └────refund────▶ Refunded
//! ```
//!
//! `prepare` is idempotent per transfer ID; `release` and `refund` are accepted only
//! from `Prepared`, so a repeat is an invalid-transition error with no effect.

use crate::{
    types::{Confirmation, ConfirmationMode, PrepareOutcome},
    Result,
};
use async_trait::async_trait;
use rail_core::{RailKind, TransferId, TransferRecord, TransferRequest, TransferStatus};
use std::fmt;
use std::time::Duration;

/// Default time an asynchronous transfer may wait for its confirmation
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Uniform settlement backend
#[async_trait]
pub trait RailAdapter: Send + Sync + fmt::Debug {
    /// Registry key
    fn kind(&self) -> RailKind;

    /// Logical rail name
    fn name(&self) -> &str;

    /// Deterministic transfer ID; pure
    fn transfer_id(&self, request: &TransferRequest) -> TransferId {
        request.derive_id()
    }

    /// Check backend preconditions, reserve resources, record `Prepared`.
    ///
    /// A second call for the same ID returns [`PrepareOutcome::AlreadyPrepared`]
    /// without reserving again. A failed precondition leaves nothing reserved.
    async fn prepare(&self, request: &TransferRequest) -> Result<PrepareOutcome>;

    /// Finalize a `Prepared` transfer
    async fn release(&self, id: &TransferId, request: &TransferRequest) -> Result<()>;

    /// Reverse a `Prepared` transfer's reservation
    async fn refund(&self, id: &TransferId, request: &TransferRequest) -> Result<()>;

    /// Current status (`None` if never prepared)
    fn status(&self, id: &TransferId) -> Result<TransferStatus>;

    /// Stored record
    fn record(&self, id: &TransferId) -> Result<Option<TransferRecord>>;

    /// Synchronous or asynchronous completion
    fn confirmation_mode(&self) -> ConfirmationMode {
        ConfirmationMode::Synchronous
    }

    /// How long an asynchronous transfer may stay pending
    fn confirmation_timeout(&self) -> Duration {
        DEFAULT_CONFIRMATION_TIMEOUT
    }

    /// Check an incoming confirmation before acting on it
    fn verify_confirmation(&self, _confirmation: &Confirmation) -> Result<()> {
        Ok(())
    }
}
