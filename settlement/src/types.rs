//! Core types for the settlement orchestrator

use chrono::{DateTime, Utc};
use rail_core::crypto::{typed_digest, KeyPair, Signature, StructHasher};
use rail_core::{RailKind, TransferId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// How an adapter learns that value moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationMode {
    /// Release follows prepare in the same call
    Synchronous,
    /// Release waits for an external confirmation
    Asynchronous,
}

/// Result of `prepare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Resources reserved by this call
    Prepared,
    /// A record already existed; nothing was reserved
    AlreadyPrepared,
}

/// Outcome reported by an external network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationOutcome {
    /// Value delivered; release
    Settled,
    /// Delivery failed; refund
    Failed,
}

impl ConfirmationOutcome {
    /// Stable name used in the signed digest
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationOutcome::Settled => "Settled",
            ConfirmationOutcome::Failed => "Failed",
        }
    }
}

/// Completion callback for an asynchronous transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Transfer
    pub transfer_id: TransferId,
    /// Outcome
    pub outcome: ConfirmationOutcome,
    /// Failure reason from the network
    pub reason: Option<String>,
    /// Relayer signature over [`Confirmation::digest`]
    pub signature: Option<Signature>,
}

impl Confirmation {
    /// Struct type tag
    pub const TYPE_TAG: &'static str = "Confirmation(bytes32 transferId,string outcome)";

    /// Unsigned success confirmation
    pub fn settled(transfer_id: TransferId) -> Self {
        Self {
            transfer_id,
            outcome: ConfirmationOutcome::Settled,
            reason: None,
            signature: None,
        }
    }

    /// Unsigned failure confirmation
    pub fn failed(transfer_id: TransferId, reason: impl Into<String>) -> Self {
        Self {
            transfer_id,
            outcome: ConfirmationOutcome::Failed,
            reason: Some(reason.into()),
            signature: None,
        }
    }

    /// Digest a relayer signs
    pub fn digest(&self, domain_separator: &[u8; 32]) -> [u8; 32] {
        let struct_hash = StructHasher::new(Self::TYPE_TAG)
            .bytes32(self.transfer_id.as_bytes())
            .str(self.outcome.as_str())
            .finish();
        typed_digest(domain_separator, &struct_hash)
    }

    /// Attach a relayer signature
    pub fn signed(mut self, domain_separator: &[u8; 32], key: &KeyPair) -> Self {
        self.signature = Some(key.sign(&self.digest(domain_separator)));
        self
    }
}

/// Settlement identifier, derived from the ordered leg IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SettlementId(Uuid);

impl SettlementId {
    /// Derive from leg IDs; the same legs in the same order give the same ID
    pub fn derive(legs: &[TransferId]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"deltran.settlement.v1");
        hasher.update(&(legs.len() as u64).to_be_bytes());
        for leg in legs {
            hasher.update(leg.as_bytes());
        }
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    /// As UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SettlementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    /// Legs being prepared
    Preparing,
    /// All legs prepared; waiting on asynchronous confirmations
    AwaitingConfirmation,
    /// Every leg released
    Committed,
    /// Every prepared leg refunded
    Aborted,
    /// A release failed after others succeeded
    CommitIncomplete,
}

impl SettlementStatus {
    /// No further changes
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SettlementStatus::Committed
                | SettlementStatus::Aborted
                | SettlementStatus::CommitIncomplete
        )
    }
}

/// Multi-leg settlement record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    /// Settlement ID
    pub settlement_id: SettlementId,

    /// Leg transfer IDs, in submission order
    pub legs: Vec<TransferId>,

    /// Rail of each leg
    pub rails: Vec<RailKind>,

    /// Asynchronous legs still waiting for a confirmation
    pub awaiting: BTreeSet<TransferId>,

    /// Status
    pub status: SettlementStatus,

    /// Abort or failure reason
    pub reason: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Settlement {
    /// New settlement in `Preparing`
    pub fn new(
        settlement_id: SettlementId,
        legs: Vec<TransferId>,
        rails: Vec<RailKind>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            settlement_id,
            legs,
            rails,
            awaiting: BTreeSet::new(),
            status: SettlementStatus::Preparing,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Legs paired with their rails
    pub fn leg_rails(&self) -> impl Iterator<Item = (&TransferId, &RailKind)> {
        self.legs.iter().zip(self.rails.iter())
    }
}

/// Transfer waiting for an external confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransfer {
    /// Transfer
    pub transfer_id: TransferId,
    /// Rail
    pub rail: RailKind,
    /// Refund after this time
    pub deadline: DateTime<Utc>,
    /// Owning settlement, for multi-leg transfers
    pub settlement: Option<SettlementId>,
}
