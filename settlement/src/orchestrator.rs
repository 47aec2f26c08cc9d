//! Settlement orchestrator
//!
//! Single-leg path:
//!
//! ```text
//! validate → resolve adapter → lock id → duplicate? ──yes──▶ existing id
//!                                            │ no
//!                                            ▼
//!            circuit check → compliance → rate limits → prepare
//!                                                          │
//!                         ┌────────────────────────────────┴───────────┐
//!                    synchronous                                 asynchronous
//!                         ▼                                            ▼
//!                 release (refund on failure)            pending queue until confirm
//!                                                        or deadline (refund)
//! ```
//!
//! Multi-leg settlements run two-phase: every leg prepares under a timeout, then all
//! release; any prepare failure refunds every leg that prepared.
//!
//! # Lock order
//!
//! Settlement lock, then leg locks in sorted order. Single-leg paths take only their
//! own leg lock, and settlement legs are always mutated under their settlement lock.

use crate::{
    adapter::RailAdapter,
    confirmation::PendingQueue,
    locks::KeyedLocks,
    netting::{NetSettlement, NettingEngine},
    registry::RailRegistry,
    types::{
        Confirmation, ConfirmationMode, ConfirmationOutcome, PendingTransfer, Settlement,
        SettlementId, SettlementStatus,
    },
    Error, Result,
};
use dashmap::DashMap;
use rail_core::{
    AccessControl, ComplianceEvaluator, EventBus, FunctionId, Metrics, Principal, Role,
    SettlementEvent, SharedClock, TransferId, TransferRecord, TransferRequest, TransferStatus,
};
use reserve_guard::{CircuitBreaker, LimitId, RateLimiter};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default orchestrator-level prepare timeout for multi-leg settlements
pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Function name circuits may restrict
    pub transfer_function: FunctionId,
    /// Limits every sender is admitted against
    pub sender_limits: Vec<LimitId>,
    /// Per-leg prepare timeout in two-phase settlements
    pub prepare_timeout: Duration,
    /// Minimum netting efficiency for net legs to replace gross legs
    pub min_netting_ratio: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            transfer_function: FunctionId::new("transfer"),
            sender_limits: Vec::new(),
            prepare_timeout: DEFAULT_PREPARE_TIMEOUT,
            min_netting_ratio: 0.0,
        }
    }
}

/// Everything the orchestrator consults
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Rail bindings
    pub registry: Arc<RailRegistry>,
    /// Circuit breaker
    pub breaker: Arc<CircuitBreaker>,
    /// Rate limiter
    pub limiter: Arc<RateLimiter>,
    /// Compliance evaluator
    pub compliance: Arc<dyn ComplianceEvaluator>,
    /// Role checks for operator actions
    pub access: AccessControl,
    /// Time source
    pub clock: SharedClock,
    /// Audit events
    pub events: EventBus,
    /// Counters
    pub metrics: Metrics,
}

/// Single-leg and multi-leg settlement coordinator
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    deps: Collaborators,
    netting: NettingEngine,
    locks: KeyedLocks<TransferId>,
    settlement_locks: KeyedLocks<SettlementId>,
    pending: PendingQueue,
    settlements: DashMap<SettlementId, Settlement>,
    leg_index: DashMap<TransferId, SettlementId>,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(config: OrchestratorConfig, deps: Collaborators) -> Self {
        let netting = NettingEngine::new(config.min_netting_ratio);
        Self {
            config,
            deps,
            netting,
            locks: KeyedLocks::new(),
            settlement_locks: KeyedLocks::new(),
            pending: PendingQueue::new(),
            settlements: DashMap::new(),
            leg_index: DashMap::new(),
        }
    }

    /// Settings
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Collaborators
    pub fn collaborators(&self) -> &Collaborators {
        &self.deps
    }

    /// Submit a single transfer and drive it as far as the rail allows.
    ///
    /// A request whose transfer already exists returns the existing ID without
    /// consulting guards or the adapter.
    pub async fn request_transfer(&self, request: TransferRequest) -> Result<TransferId> {
        request.validate()?;
        let adapter = self.deps.registry.get(&request.rail)?;
        let id = adapter.transfer_id(&request);

        let _guard = self.locks.lock(&id).await;
        if adapter.status(&id)? != TransferStatus::None {
            debug!(transfer_id = %id, "Duplicate transfer request");
            return Ok(id);
        }

        self.check_guards(&request)?;
        self.deps
            .limiter
            .check_limits(&self.config.sender_limits, request.sender.as_str(), request.amount)?;

        adapter.prepare(&request).await?;

        match adapter.confirmation_mode() {
            ConfirmationMode::Synchronous => {
                self.release_or_refund(adapter.as_ref(), &id, &request)
                    .await?;
            }
            ConfirmationMode::Asynchronous => {
                self.enqueue(adapter.as_ref(), id, None)?;
            }
        }
        Ok(id)
    }

    /// Apply an external confirmation; returns the transfer's resulting status
    pub async fn confirm(&self, confirmation: Confirmation) -> Result<TransferStatus> {
        let id = confirmation.transfer_id;
        let pending = self.pending.get(&id).ok_or(Error::NotPending(id))?;
        let adapter = self.deps.registry.get(&pending.rail)?;
        adapter.verify_confirmation(&confirmation)?;

        if let Some(settlement_id) = pending.settlement {
            return self
                .confirm_leg(settlement_id, adapter.as_ref(), &confirmation)
                .await;
        }

        let _guard = self.locks.lock(&id).await;
        if self.take_pending(&id).is_none() {
            return Err(Error::NotPending(id));
        }
        let record = Self::load(adapter.as_ref(), &id)?;

        match confirmation.outcome {
            ConfirmationOutcome::Settled => {
                self.release_or_refund(adapter.as_ref(), &id, &record.request)
                    .await?;
                Ok(TransferStatus::Released)
            }
            ConfirmationOutcome::Failed => {
                warn!(
                    transfer_id = %id,
                    reason = confirmation.reason.as_deref().unwrap_or(""),
                    "Rail reported failure"
                );
                adapter.refund(&id, &record.request).await?;
                Ok(TransferStatus::Refunded)
            }
        }
    }

    /// Operator refund of a `Prepared` transfer. Settlement legs abort their settlement.
    pub async fn cancel(&self, caller: &Principal, id: &TransferId) -> Result<()> {
        self.deps
            .access
            .require_any(caller, &[Role::Operator, Role::Admin])?;

        if let Some(settlement_id) = self.leg_index.get(id).map(|entry| *entry) {
            let reason = format!("cancelled by {}", caller);
            if self.abort_settlement(settlement_id, &reason).await? {
                return Ok(());
            }
            let (_, record) = self.locate(id)?;
            return Err(rail_core::Error::InvalidTransition {
                id: *id,
                from: record.status,
                to: TransferStatus::Refunded,
            }
            .into());
        }

        let _guard = self.locks.lock(id).await;
        let (adapter, record) = self.locate(id)?;
        adapter.refund(id, &record.request).await?;
        self.take_pending(id);
        info!(transfer_id = %id, caller = %caller, "Transfer cancelled");
        Ok(())
    }

    /// Refund every pending transfer past its deadline; returns how many were handled
    pub async fn expire_pending(&self) -> usize {
        let now = self.deps.clock.now();
        let mut expired = 0;

        for pending in self.pending.expired(now) {
            let id = pending.transfer_id;
            let result = match pending.settlement {
                Some(settlement_id) => {
                    self.abort_settlement(settlement_id, "confirmation timeout")
                        .await
                }
                None => self.expire_single(&pending).await,
            };
            match result {
                Ok(true) => {
                    expired += 1;
                    warn!(transfer_id = %id, deadline = %pending.deadline, "Confirmation timed out");
                }
                Ok(false) => {}
                Err(e) => error!(transfer_id = %id, error = %e, "Timeout refund failed"),
            }
        }

        self.locks.prune();
        self.settlement_locks.prune();
        expired
    }

    /// Two-phase settlement of several legs; all release or none do.
    ///
    /// The settlement ID is derived from the ordered leg IDs, so a resubmission
    /// replays the existing settlement's outcome: its ID while it is pending or
    /// committed, the stored error once it aborted or failed to commit.
    pub async fn request_atomic_settlement(
        &self,
        legs: Vec<TransferRequest>,
    ) -> Result<SettlementId> {
        let admission = admission_entries(&legs);
        self.settle_legs(legs, &admission).await
    }

    /// Settle `legs` two-phase, charging `admission` to the sender limits first
    async fn settle_legs(
        &self,
        legs: Vec<TransferRequest>,
        admission: &[(String, Decimal)],
    ) -> Result<SettlementId> {
        if legs.is_empty() {
            return Err(rail_core::Error::InvalidTransfer("Settlement has no legs".into()).into());
        }

        let mut adapters = Vec::with_capacity(legs.len());
        let mut ids = Vec::with_capacity(legs.len());
        for leg in &legs {
            leg.validate()?;
            let adapter = self.deps.registry.get(&leg.rail)?;
            ids.push(adapter.transfer_id(leg));
            adapters.push(adapter);
        }
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != ids.len() {
            return Err(
                rail_core::Error::InvalidTransfer("Settlement repeats a leg".into()).into(),
            );
        }

        let settlement_id = SettlementId::derive(&ids);
        let _settlement_guard = self.settlement_locks.lock(&settlement_id).await;
        if let Some(existing) = self.settlements.get(&settlement_id) {
            debug!(
                settlement_id = %settlement_id,
                status = ?existing.status,
                "Duplicate settlement request"
            );
            return replay(&existing);
        }
        let _leg_guards = self.locks.lock_all(&ids).await;

        for (adapter, id) in adapters.iter().zip(&ids) {
            if adapter.status(id)? != TransferStatus::None {
                return Err(rail_core::Error::AlreadyPrepared(*id).into());
            }
        }
        for leg in &legs {
            self.check_guards(leg)?;
        }
        self.deps
            .limiter
            .admit_batch(&self.config.sender_limits, admission)?;

        let mut settlement = Settlement::new(
            settlement_id,
            ids.clone(),
            legs.iter().map(|leg| leg.rail).collect(),
            self.deps.clock.now(),
        );
        for id in &ids {
            self.leg_index.insert(*id, settlement_id);
        }
        info!(settlement_id = %settlement_id, legs = ids.len(), "Settlement preparing");

        // Phase 1
        let mut failure = None;
        for ((adapter, leg), id) in adapters.iter().zip(&legs).zip(&ids) {
            match tokio::time::timeout(self.config.prepare_timeout, adapter.prepare(leg)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    failure = Some(format!("leg {} failed to prepare: {}", id, e));
                    break;
                }
                Err(_) => {
                    failure = Some(format!("leg {} timed out in prepare", id));
                    break;
                }
            }
        }
        if let Some(reason) = failure {
            self.rollback(&mut settlement, &reason).await;
            self.settlements.insert(settlement_id, settlement);
            return Err(Error::SettlementAborted {
                settlement_id,
                reason,
            });
        }

        // Phase 2
        for ((adapter, _), id) in adapters.iter().zip(&legs).zip(&ids) {
            if adapter.confirmation_mode() == ConfirmationMode::Asynchronous {
                self.enqueue(adapter.as_ref(), *id, Some(settlement_id))?;
                settlement.awaiting.insert(*id);
            }
        }
        if !settlement.awaiting.is_empty() {
            settlement.status = SettlementStatus::AwaitingConfirmation;
            settlement.updated_at = self.deps.clock.now();
            info!(
                settlement_id = %settlement_id,
                awaiting = settlement.awaiting.len(),
                "Settlement awaiting confirmations"
            );
            self.settlements.insert(settlement_id, settlement);
            return Ok(settlement_id);
        }

        let result = self.commit(&mut settlement).await;
        self.settlements.insert(settlement_id, settlement);
        result.map(|_| settlement_id)
    }

    /// Net gross legs bilaterally, then settle the net legs two-phase.
    ///
    /// Sender limits are charged for the gross legs, so netting never admits
    /// more than submitting each leg would.
    pub async fn net_settle(&self, legs: Vec<TransferRequest>) -> Result<NetSettlement> {
        let plan = self.netting.compute(&legs)?;
        for leg in &legs {
            self.check_guards(leg)?;
        }
        let admission = admission_entries(&legs);

        if plan.legs.is_empty() {
            self.deps
                .limiter
                .admit_batch(&self.config.sender_limits, &admission)?;
            info!(gross_legs = legs.len(), "Batch fully offset by netting");
            return Ok(NetSettlement {
                plan,
                settlement_id: None,
            });
        }

        let settlement_id = self.settle_legs(plan.legs.clone(), &admission).await?;
        info!(
            settlement_id = %settlement_id,
            gross = %plan.total_gross_amount,
            net = %plan.total_net_amount,
            efficiency = plan.netting_efficiency,
            "Net settlement submitted"
        );
        Ok(NetSettlement {
            plan,
            settlement_id: Some(settlement_id),
        })
    }

    /// Status of a transfer on whichever rail holds it
    pub fn transfer_status(&self, id: &TransferId) -> Result<TransferStatus> {
        match self.locate(id) {
            Ok((_, record)) => Ok(record.status),
            Err(Error::Core(rail_core::Error::TransferNotFound(_))) => Ok(TransferStatus::None),
            Err(e) => Err(e),
        }
    }

    /// Stored record of a transfer
    pub fn transfer(&self, id: &TransferId) -> Result<TransferRecord> {
        self.locate(id).map(|(_, record)| record)
    }

    /// Settlement by ID
    pub fn settlement(&self, id: &SettlementId) -> Result<Settlement> {
        self.settlements
            .get(id)
            .map(|entry| entry.clone())
            .ok_or(Error::SettlementNotFound(*id))
    }

    /// Transfers awaiting confirmation
    pub fn pending(&self) -> Vec<PendingTransfer> {
        self.pending.snapshot()
    }

    fn check_guards(&self, request: &TransferRequest) -> Result<()> {
        self.deps
            .breaker
            .check_function(&self.config.transfer_function)?;

        for party in [&request.sender, &request.receiver] {
            if !self.deps.compliance.is_authorized(party, request) {
                warn!(account = %party, "Compliance denied");
                return Err(Error::ComplianceDenied(party.clone()));
            }
        }
        Ok(())
    }

    async fn release_or_refund(
        &self,
        adapter: &dyn RailAdapter,
        id: &TransferId,
        request: &TransferRequest,
    ) -> Result<()> {
        let Err(e) = adapter.release(id, request).await else {
            return Ok(());
        };

        warn!(transfer_id = %id, error = %e, "Release failed, refunding");
        let refunded = match adapter.refund(id, request).await {
            Ok(()) => true,
            Err(refund_error) => {
                error!(transfer_id = %id, error = %refund_error, "Refund after failed release failed");
                false
            }
        };
        Err(Error::ReleaseFailed {
            id: *id,
            reason: e.to_string(),
            refunded,
        })
    }

    fn enqueue(
        &self,
        adapter: &dyn RailAdapter,
        id: TransferId,
        settlement: Option<SettlementId>,
    ) -> Result<()> {
        let timeout = chrono::Duration::from_std(adapter.confirmation_timeout())
            .map_err(|e| Error::Config(format!("confirmation timeout: {}", e)))?;
        let deadline = self
            .deps
            .clock
            .now()
            .checked_add_signed(timeout)
            .ok_or_else(|| Error::Config(format!("confirmation timeout {} out of range", timeout)))?;

        self.pending.insert(PendingTransfer {
            transfer_id: id,
            rail: adapter.kind(),
            deadline,
            settlement,
        });
        self.deps
            .metrics
            .pending_transfers
            .set(self.pending.len() as i64);
        debug!(transfer_id = %id, deadline = %deadline, "Awaiting confirmation");
        Ok(())
    }

    fn take_pending(&self, id: &TransferId) -> Option<PendingTransfer> {
        let taken = self.pending.remove(id);
        self.deps
            .metrics
            .pending_transfers
            .set(self.pending.len() as i64);
        taken
    }

    async fn expire_single(&self, pending: &PendingTransfer) -> Result<bool> {
        let id = pending.transfer_id;
        let _guard = self.locks.lock(&id).await;
        if self.take_pending(&id).is_none() {
            return Ok(false);
        }
        let adapter = self.deps.registry.get(&pending.rail)?;
        let record = Self::load(adapter.as_ref(), &id)?;
        adapter.refund(&id, &record.request).await?;
        Ok(true)
    }

    async fn confirm_leg(
        &self,
        settlement_id: SettlementId,
        adapter: &dyn RailAdapter,
        confirmation: &Confirmation,
    ) -> Result<TransferStatus> {
        let id = confirmation.transfer_id;
        let _settlement_guard = self.settlement_locks.lock(&settlement_id).await;
        let mut settlement = self.settlement(&settlement_id)?;
        let _leg_guards = self.locks.lock_all(&settlement.legs).await;

        if self.take_pending(&id).is_none() {
            return Err(Error::NotPending(id));
        }
        settlement.awaiting.remove(&id);

        match confirmation.outcome {
            ConfirmationOutcome::Failed => {
                let reason = format!(
                    "leg {} failed: {}",
                    id,
                    confirmation.reason.as_deref().unwrap_or("rail reported failure")
                );
                self.rollback(&mut settlement, &reason).await;
                self.settlements.insert(settlement_id, settlement);
            }
            ConfirmationOutcome::Settled if settlement.awaiting.is_empty() => {
                let result = self.commit(&mut settlement).await;
                self.settlements.insert(settlement_id, settlement);
                result?;
            }
            ConfirmationOutcome::Settled => {
                debug!(
                    settlement_id = %settlement_id,
                    remaining = settlement.awaiting.len(),
                    "Settlement leg confirmed"
                );
                settlement.updated_at = self.deps.clock.now();
                self.settlements.insert(settlement_id, settlement);
            }
        }
        adapter.status(&id)
    }

    /// Abort a settlement still waiting on confirmations. `Ok(false)` if it already
    /// reached a final status.
    async fn abort_settlement(&self, settlement_id: SettlementId, reason: &str) -> Result<bool> {
        let _settlement_guard = self.settlement_locks.lock(&settlement_id).await;
        let mut settlement = self.settlement(&settlement_id)?;
        if settlement.status != SettlementStatus::AwaitingConfirmation {
            return Ok(false);
        }
        let _leg_guards = self.locks.lock_all(&settlement.legs).await;

        self.rollback(&mut settlement, reason).await;
        self.settlements.insert(settlement_id, settlement);
        Ok(true)
    }

    /// Refund every prepared leg in reverse order and mark the settlement aborted
    async fn rollback(&self, settlement: &mut Settlement, reason: &str) {
        let legs: Vec<_> = settlement
            .leg_rails()
            .map(|(id, rail)| (*id, *rail))
            .collect();

        for (id, rail) in legs.into_iter().rev() {
            self.take_pending(&id);
            let refunded = match self.deps.registry.get(&rail) {
                Ok(adapter) => match adapter.record(&id) {
                    Ok(Some(record)) if record.status == TransferStatus::Prepared => {
                        adapter.refund(&id, &record.request).await
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = refunded {
                error!(settlement_id = %settlement.settlement_id, transfer_id = %id, error = %e, "Leg refund failed during rollback");
            }
        }

        settlement.awaiting.clear();
        settlement.status = SettlementStatus::Aborted;
        settlement.reason = Some(reason.to_string());
        settlement.updated_at = self.deps.clock.now();

        warn!(settlement_id = %settlement.settlement_id, reason = %reason, "Settlement aborted");
        self.deps.events.publish(SettlementEvent::SettlementAborted {
            settlement_id: settlement.settlement_id.as_uuid(),
            reason: reason.to_string(),
            at: settlement.updated_at,
        });
    }

    /// Release every leg. A failure on the first release still rolls back cleanly;
    /// a failure after any leg released leaves the settlement `CommitIncomplete`.
    async fn commit(&self, settlement: &mut Settlement) -> Result<()> {
        let settlement_id = settlement.settlement_id;
        let legs: Vec<_> = settlement
            .leg_rails()
            .map(|(id, rail)| (*id, *rail))
            .collect();

        for (released, (id, rail)) in legs.iter().enumerate() {
            let outcome = match self.deps.registry.get(rail) {
                Ok(adapter) => match Self::load(adapter.as_ref(), id) {
                    Ok(record) => adapter.release(id, &record.request).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                let reason = format!("leg {} failed to release: {}", id, e);
                if released == 0 {
                    self.rollback(settlement, &reason).await;
                    return Err(Error::SettlementAborted {
                        settlement_id,
                        reason,
                    });
                }
                error!(settlement_id = %settlement_id, released, reason = %reason, "Settlement commit incomplete");
                settlement.status = SettlementStatus::CommitIncomplete;
                settlement.reason = Some(reason.clone());
                settlement.updated_at = self.deps.clock.now();
                return Err(Error::CommitIncomplete {
                    settlement_id,
                    reason,
                });
            }
        }

        settlement.status = SettlementStatus::Committed;
        settlement.updated_at = self.deps.clock.now();
        info!(settlement_id = %settlement_id, legs = legs.len(), "Settlement committed");
        self.deps.events.publish(SettlementEvent::SettlementCommitted {
            settlement_id: settlement_id.as_uuid(),
            legs: legs.len(),
            at: settlement.updated_at,
        });
        Ok(())
    }

    fn load(adapter: &dyn RailAdapter, id: &TransferId) -> Result<TransferRecord> {
        adapter
            .record(id)?
            .ok_or_else(|| rail_core::Error::TransferNotFound(*id).into())
    }

    fn locate(&self, id: &TransferId) -> Result<(Arc<dyn RailAdapter>, TransferRecord)> {
        for adapter in self.deps.registry.adapters() {
            if let Some(record) = adapter.record(id)? {
                return Ok((adapter, record));
            }
        }
        Err(rail_core::Error::TransferNotFound(*id).into())
    }
}

/// Sender-limit charges for a batch, one per leg
fn admission_entries(legs: &[TransferRequest]) -> Vec<(String, Decimal)> {
    legs.iter()
        .map(|leg| (leg.sender.to_string(), leg.amount))
        .collect()
}

/// Outcome of a settlement that already exists
fn replay(settlement: &Settlement) -> Result<SettlementId> {
    let settlement_id = settlement.settlement_id;
    let reason = || settlement.reason.clone().unwrap_or_default();
    match settlement.status {
        SettlementStatus::Aborted => Err(Error::SettlementAborted {
            settlement_id,
            reason: reason(),
        }),
        SettlementStatus::CommitIncomplete => Err(Error::CommitIncomplete {
            settlement_id,
            reason: reason(),
        }),
        SettlementStatus::Preparing
        | SettlementStatus::AwaitingConfirmation
        | SettlementStatus::Committed => Ok(settlement_id),
    }
}
