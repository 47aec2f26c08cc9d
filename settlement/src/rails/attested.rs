//! Attested rail: off-chain network reached through a relayer gateway
//!
//! `prepare` submits an instruction to the gateway and escrows the sender's value.
//! The network reports the outcome later as a [`Confirmation`] signed by the relayer
//! key; the orchestrator releases or refunds on it, or refunds once the
//! confirmation timeout passes.

use crate::{
    adapter::RailAdapter,
    book::{RailContext, TransferBook},
    types::{Confirmation, ConfirmationMode, PrepareOutcome},
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rail_core::{
    AccountId, AssetId, AssetLedger, RailKind, TransferId, TransferRecord, TransferRequest,
    TransferStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Payment instruction handed to the external network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Transfer
    pub transfer_id: TransferId,
    /// Asset
    pub asset: AssetId,
    /// Amount
    pub amount: Decimal,
    /// Paying account
    pub sender: AccountId,
    /// Receiving account
    pub receiver: AccountId,
}

impl Instruction {
    /// Instruction for a validated request
    pub fn for_request(transfer_id: TransferId, request: &TransferRequest) -> Self {
        Self {
            transfer_id,
            asset: request.asset.clone(),
            amount: request.amount,
            sender: request.sender.clone(),
            receiver: request.receiver.clone(),
        }
    }
}

/// Connection to the external network's relayer
#[async_trait]
pub trait RailGateway: Send + Sync + fmt::Debug {
    /// Hand over an instruction; an error means the network did not accept it
    async fn submit(&self, instruction: &Instruction) -> Result<()>;

    /// Withdraw an instruction that will not be settled
    async fn cancel(&self, transfer_id: &TransferId) -> Result<()>;
}

/// Gateway that records instructions in memory
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    submitted: Mutex<Vec<Instruction>>,
    cancelled: Mutex<Vec<TransferId>>,
    rejection: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryGateway {
    /// Accepting gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every following submission with `reason`
    pub fn reject_with(&self, reason: impl Into<String>) {
        *self.rejection.lock() = Some(reason.into());
    }

    /// Accept submissions again
    pub fn accept_all(&self) {
        *self.rejection.lock() = None;
    }

    /// Wait this long before answering a submission
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Accepted instructions
    pub fn submitted(&self) -> Vec<Instruction> {
        self.submitted.lock().clone()
    }

    /// Cancelled transfers
    pub fn cancelled(&self) -> Vec<TransferId> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl RailGateway for InMemoryGateway {
    async fn submit(&self, instruction: &Instruction) -> Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.rejection.lock().clone() {
            return Err(Error::Backend(reason));
        }
        self.submitted.lock().push(instruction.clone());
        Ok(())
    }

    async fn cancel(&self, transfer_id: &TransferId) -> Result<()> {
        self.cancelled.lock().push(*transfer_id);
        Ok(())
    }
}

/// Construction parameters for [`AttestedRail`]
#[derive(Debug, Clone)]
pub struct AttestedRailConfig {
    /// Relayer Ed25519 public key
    pub relayer_key: [u8; 32],
    /// Domain separator confirmations are signed under
    pub domain_separator: [u8; 32],
    /// Time allowed for a confirmation
    pub confirmation_timeout: Duration,
}

/// Asynchronous rail with relayer-signed confirmations
#[derive(Debug)]
pub struct AttestedRail {
    name: String,
    kind: RailKind,
    escrow: AccountId,
    ledger: Arc<dyn AssetLedger>,
    gateway: Arc<dyn RailGateway>,
    config: AttestedRailConfig,
    book: TransferBook,
}

impl AttestedRail {
    /// Create an attested rail named `name`
    pub fn new(
        name: &str,
        ledger: Arc<dyn AssetLedger>,
        gateway: Arc<dyn RailGateway>,
        config: AttestedRailConfig,
        ctx: RailContext,
    ) -> Self {
        let kind = RailKind::from_name(name);
        Self {
            name: name.to_string(),
            kind,
            escrow: AccountId::escrow(&kind),
            ledger,
            gateway,
            config,
            book: TransferBook::new(kind, ctx),
        }
    }

    /// Escrow account holding prepared value
    pub fn escrow_account(&self) -> &AccountId {
        &self.escrow
    }

    async fn withdraw(&self, id: &TransferId) {
        if let Err(e) = self.gateway.cancel(id).await {
            warn!(transfer_id = %id, error = %e, "Gateway cancel failed");
        }
    }
}

#[async_trait]
impl RailAdapter for AttestedRail {
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

        let available = self.ledger.balance_of(&request.sender, &request.asset);
        if available < request.amount {
            return Err(rail_core::Error::InsufficientFunds {
                account: request.sender.clone(),
                asset: request.asset.clone(),
                needed: request.amount,
                available,
            }
            .into());
        }

        // Submit before touching balances: a future dropped here leaves no escrow
        self.gateway
            .submit(&Instruction::for_request(id, request))
            .await?;
        debug!(transfer_id = %id, rail = %self.name, "Instruction accepted by gateway");

        if let Err(e) =
            self.ledger
                .transfer(&request.sender, &self.escrow, &request.asset, request.amount)
        {
            self.withdraw(&id).await;
            return Err(e.into());
        }

        if let Err(e) = self.book.record_prepared(id, request) {
            if let Err(undo) =
                self.ledger
                    .transfer(&self.escrow, &request.sender, &request.asset, request.amount)
            {
                error!(transfer_id = %id, error = %undo, "Failed to return escrow after record failure");
            }
            self.withdraw(&id).await;
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
        self.withdraw(id).await;
        self.book
            .finish(record, TransferStatus::Refunded, "escrow returned to sender")
    }

    fn status(&self, id: &TransferId) -> Result<TransferStatus> {
        self.book.status(id)
    }

    fn record(&self, id: &TransferId) -> Result<Option<TransferRecord>> {
        self.book.record(id)
    }

    fn confirmation_mode(&self) -> ConfirmationMode {
        ConfirmationMode::Asynchronous
    }

    fn confirmation_timeout(&self) -> Duration {
        self.config.confirmation_timeout
    }

    fn verify_confirmation(&self, confirmation: &Confirmation) -> Result<()> {
        let signature = confirmation
            .signature
            .as_ref()
            .ok_or_else(|| Error::InvalidConfirmation("missing relayer signature".into()))?;

        let digest = confirmation.digest(&self.config.domain_separator);
        if !signature.verify(&digest, &self.config.relayer_key) {
            return Err(Error::InvalidConfirmation(format!(
                "bad relayer signature for {}",
                confirmation.transfer_id
            )));
        }
        Ok(())
    }
}
