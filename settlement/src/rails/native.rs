//! Native rail: same-ledger transfer through escrow

use crate::{
    adapter::RailAdapter,
    book::{RailContext, TransferBook},
    types::PrepareOutcome,
    Result,
};
use async_trait::async_trait;
use rail_core::{
    AccountId, AssetLedger, RailKind, TransferId, TransferRecord, TransferRequest, TransferStatus,
};
use std::sync::Arc;
use tracing::error;

/// Moves value on the injected asset ledger.
///
/// `prepare` debits the sender into the rail's escrow account, `release` pays the
/// receiver from escrow and `refund` returns escrow to the sender.
#[derive(Debug)]
pub struct NativeRail {
    name: String,
    kind: RailKind,
    escrow: AccountId,
    ledger: Arc<dyn AssetLedger>,
    book: TransferBook,
}

impl NativeRail {
    /// Create a native rail named `name`
    pub fn new(name: &str, ledger: Arc<dyn AssetLedger>, ctx: RailContext) -> Self {
        let kind = RailKind::from_name(name);
        Self {
            name: name.to_string(),
            kind,
            escrow: AccountId::escrow(&kind),
            ledger,
            book: TransferBook::new(kind, ctx),
        }
    }

    /// Escrow account holding prepared value
    pub fn escrow_account(&self) -> &AccountId {
        &self.escrow
    }
}

#[async_trait]
impl RailAdapter for NativeRail {
    fn kind(&self) -> RailKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, request: &TransferRequest) -> Result<PrepareOutcome> {
        self.book.check_rail(request)?;
        request.validate()?;

        let id = self.transfer_id(request);
        let _guard = self.book.lock(&id).await;
        if self.book.status(&id)? != TransferStatus::None {
            return Ok(PrepareOutcome::AlreadyPrepared);
        }

        self.ledger
            .transfer(&request.sender, &self.escrow, &request.asset, request.amount)?;

        if let Err(e) = self.book.record_prepared(id, request) {
            if let Err(undo) =
                self.ledger
                    .transfer(&self.escrow, &request.sender, &request.asset, request.amount)
            {
                error!(transfer_id = %id, error = %undo, "Failed to return escrow after record failure");
            }
            return Err(e);
        }
        Ok(PrepareOutcome::Prepared)
    }

    async fn release(&self, id: &TransferId, request: &TransferRequest) -> Result<()> {
        let _guard = self.book.lock(id).await;
        let record = self
            .book
            .require_prepared(id, request, TransferStatus::Released)?;

        self.ledger.transfer(
            &self.escrow,
            &record.request.receiver,
            &record.request.asset,
            record.request.amount,
        )?;
        self.book.finish(record, TransferStatus::Released, "")
    }

    async fn refund(&self, id: &TransferId, request: &TransferRequest) -> Result<()> {
        let _guard = self.book.lock(id).await;
        let record = self
            .book
            .require_prepared(id, request, TransferStatus::Refunded)?;

        self.ledger.transfer(
            &self.escrow,
            &record.request.sender,
            &record.request.asset,
            record.request.amount,
        )?;
        self.book
            .finish(record, TransferStatus::Refunded, "escrow returned to sender")
    }

    fn status(&self, id: &TransferId) -> Result<TransferStatus> {
        self.book.status(id)
    }

    fn record(&self, id: &TransferId) -> Result<Option<TransferRecord>> {
        self.book.record(id)
    }
}
