//! Transfer book: an adapter's view of the transfer store
//!
//! Adapters serialize work per transfer ID through the book's keyed lock, then move
//! value and record the new status. The book owns status bookkeeping, lifecycle
//! events and transfer counters, so every rail reports them the same way.

use crate::{locks::KeyedLocks, Error, Result};
use rail_core::{
    EventBus, MemoryStore, Metrics, RailKind, SettlementEvent, SharedClock, TransferId,
    TransferRecord, TransferRequest, TransferStatus, TransferStore,
};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::info;

/// Shared services every adapter is built with
#[derive(Debug, Clone)]
pub struct RailContext {
    /// Transfer record store
    pub store: Arc<dyn TransferStore>,
    /// Time source
    pub clock: SharedClock,
    /// Audit events
    pub events: EventBus,
    /// Counters
    pub metrics: Metrics,
}

impl RailContext {
    /// Context over a fresh in-memory store
    pub fn in_memory(clock: SharedClock, events: EventBus, metrics: Metrics) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            clock,
            events,
            metrics,
        }
    }
}

/// Per-rail record keeper
#[derive(Debug)]
pub struct TransferBook {
    rail: RailKind,
    ctx: RailContext,
    locks: KeyedLocks<TransferId>,
}

impl TransferBook {
    /// Book for `rail`
    pub fn new(rail: RailKind, ctx: RailContext) -> Self {
        Self {
            rail,
            ctx,
            locks: KeyedLocks::new(),
        }
    }

    /// Shared services
    pub fn context(&self) -> &RailContext {
        &self.ctx
    }

    /// Exclusive access to one transfer
    pub async fn lock(&self, id: &TransferId) -> OwnedMutexGuard<()> {
        self.locks.lock(id).await
    }

    /// Fail unless `request` targets this rail
    pub fn check_rail(&self, request: &TransferRequest) -> Result<()> {
        if request.rail != self.rail {
            return Err(Error::RailMismatch {
                expected: self.rail,
                got: request.rail,
            });
        }
        Ok(())
    }

    /// Record for `id`, if it belongs to this rail
    pub fn record(&self, id: &TransferId) -> Result<Option<TransferRecord>> {
        Ok(self
            .ctx
            .store
            .get(id)?
            .filter(|record| record.request.rail == self.rail))
    }

    /// Status of `id` on this rail
    pub fn status(&self, id: &TransferId) -> Result<TransferStatus> {
        Ok(self
            .record(id)?
            .map(|record| record.status)
            .unwrap_or(TransferStatus::None))
    }

    /// Store a new `Prepared` record and announce it
    pub fn record_prepared(&self, id: TransferId, request: &TransferRequest) -> Result<()> {
        let now = self.ctx.clock.now();
        self.ctx
            .store
            .insert_new(TransferRecord::prepared(id, request.clone(), now))?;

        info!(
            transfer_id = %id,
            asset = %request.asset,
            amount = %request.amount,
            sender = %request.sender,
            receiver = %request.receiver,
            "Transfer prepared"
        );
        self.ctx.metrics.transfers_prepared.inc();
        self.ctx.events.publish(SettlementEvent::TransferPrepared {
            transfer_id: id,
            rail: self.rail,
            asset: request.asset.clone(),
            amount: request.amount,
            at: now,
        });
        Ok(())
    }

    /// Load the record of a transfer that must be `Prepared` before moving to `next`
    pub fn require_prepared(
        &self,
        id: &TransferId,
        request: &TransferRequest,
        next: TransferStatus,
    ) -> Result<TransferRecord> {
        if request.derive_id() != *id {
            return Err(rail_core::Error::InvalidTransfer(format!(
                "request does not match transfer {}",
                id
            ))
            .into());
        }

        let record = self
            .record(id)?
            .ok_or(rail_core::Error::TransferNotFound(*id))?;
        if record.status != TransferStatus::Prepared {
            return Err(rail_core::Error::InvalidTransition {
                id: *id,
                from: record.status,
                to: next,
            }
            .into());
        }
        Ok(record)
    }

    /// Move a `Prepared` record to a terminal status and announce it
    pub fn finish(
        &self,
        mut record: TransferRecord,
        next: TransferStatus,
        reason: &str,
    ) -> Result<()> {
        let now = self.ctx.clock.now();
        let id = record.transfer_id;
        record.transition(next, now)?;
        self.ctx
            .store
            .compare_and_swap(TransferStatus::Prepared, record)?;

        match next {
            TransferStatus::Released => {
                info!(transfer_id = %id, "Transfer released");
                self.ctx.metrics.transfers_released.inc();
                self.ctx
                    .events
                    .publish(SettlementEvent::TransferReleased { transfer_id: id, at: now });
            }
            TransferStatus::Refunded => {
                info!(transfer_id = %id, reason = %reason, "Transfer refunded");
                self.ctx.metrics.transfers_refunded.inc();
                self.ctx.events.publish(SettlementEvent::TransferRefunded {
                    transfer_id: id,
                    reason: reason.to_string(),
                    at: now,
                });
            }
            TransferStatus::None | TransferStatus::Prepared => {}
        }
        Ok(())
    }

    /// Prepared records on this rail
    pub fn prepared(&self) -> Result<Vec<TransferRecord>> {
        Ok(self
            .ctx
            .store
            .with_status(TransferStatus::Prepared)?
            .into_iter()
            .filter(|record| record.request.rail == self.rail)
            .collect())
    }
}
