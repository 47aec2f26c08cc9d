//! Core types for settlement rails
//!
//! All types are designed for:
//! - Deterministic identifiers (BLAKE3 over length-prefixed fields)
//! - Exact arithmetic (Decimal for money)
//! - Serde round-tripping for storage and events

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Account identifier (ledger address, IBAN, bridge account, etc.)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Escrow account a rail parks reserved value in
    pub fn escrow(rail: &RailKind) -> Self {
        Self(format!("escrow:{}", rail.short_hex()))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asset identifier (currency code, token symbol)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    /// Create new asset ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller identity as known to the role store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    /// Create new principal
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named capability granted to a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Manages circuits, limits, rail bindings, roles and signers
    Admin,
    /// Votes on circuit transitions
    Validator,
    /// Submits metric values to automated circuits
    Reporter,
    /// Cancels prepared transfers
    Operator,
}

/// Operation name a circuit can restrict (e.g. `"transfer"`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(String);

impl FunctionId {
    /// Create new function ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry key of a settlement rail: BLAKE3 of its logical name
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RailKind([u8; 32]);

impl RailKind {
    /// Derive the key for a rail name. Identical for every caller using the same name.
    pub fn from_name(name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"deltran.rail.v1");
        hasher.update(name.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight bytes, hex encoded
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for RailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rail:{}", self.short_hex())
    }
}

impl fmt::Debug for RailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RailKind({})", self.short_hex())
    }
}

/// Deterministic transfer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId([u8; 32]);

impl TransferId {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..12]))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", hex::encode(&self.0[..12]))
    }
}

/// A value-movement request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Rail that settles this transfer
    pub rail: RailKind,

    /// Asset moved
    pub asset: AssetId,

    /// Amount (exact decimal, must be positive)
    pub amount: Decimal,

    /// Paying account
    pub sender: AccountId,

    /// Receiving account
    pub receiver: AccountId,

    /// Caller-chosen nonce distinguishing otherwise identical requests
    pub nonce: u64,

    /// Free-form metadata (not part of the transfer ID)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TransferRequest {
    /// Create a request without metadata
    pub fn new(
        rail: RailKind,
        asset: AssetId,
        amount: Decimal,
        sender: AccountId,
        receiver: AccountId,
        nonce: u64,
    ) -> Self {
        Self {
            rail,
            asset,
            amount,
            sender,
            receiver,
            nonce,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Derive the transfer ID from `(rail, asset, sender, receiver, amount, nonce)`.
    ///
    /// Amounts are normalized first, so `100` and `100.00` name the same transfer.
    pub fn derive_id(&self) -> TransferId {
        let amount = self.amount.normalize().to_string();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"deltran.transfer.v1");
        hasher.update(self.rail.as_bytes());
        for field in [
            self.asset.as_str(),
            self.sender.as_str(),
            self.receiver.as_str(),
            amount.as_str(),
        ] {
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(&self.nonce.to_be_bytes());
        TransferId(*hasher.finalize().as_bytes())
    }

    /// Check request invariants
    pub fn validate(&self) -> crate::Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(crate::Error::InvalidTransfer(
                "Amount must be positive".to_string(),
            ));
        }
        if self.sender == self.receiver {
            return Err(crate::Error::InvalidTransfer(
                "Sender and receiver must differ".to_string(),
            ));
        }
        if self.asset.as_str().is_empty() {
            return Err(crate::Error::InvalidTransfer("Asset is empty".to_string()));
        }
        Ok(())
    }
}

/// Lifecycle status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Never seen
    None,
    /// Resources reserved, awaiting release or refund
    Prepared,
    /// Value moved (terminal)
    Released,
    /// Reservation reversed (terminal)
    Refunded,
}

impl TransferStatus {
    /// Released or Refunded
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Released | TransferStatus::Refunded)
    }

    /// Whether `self -> next` is a lifecycle edge
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        matches!(
            (self, next),
            (TransferStatus::None, TransferStatus::Prepared)
                | (TransferStatus::Prepared, TransferStatus::Released)
                | (TransferStatus::Prepared, TransferStatus::Refunded)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::None => "none",
            TransferStatus::Prepared => "prepared",
            TransferStatus::Released => "released",
            TransferStatus::Refunded => "refunded",
        };
        write!(f, "{}", s)
    }
}

/// One recorded status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// New status
    pub status: TransferStatus,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

/// Stored transfer, retained for audit and idempotency lookups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Transfer ID
    pub transfer_id: TransferId,

    /// Original request
    pub request: TransferRequest,

    /// Current status
    pub status: TransferStatus,

    /// Every status the record has held, oldest first
    pub history: Vec<StatusChange>,
}

impl TransferRecord {
    /// Fresh record in `Prepared`
    pub fn prepared(transfer_id: TransferId, request: TransferRequest, at: DateTime<Utc>) -> Self {
        Self {
            transfer_id,
            request,
            status: TransferStatus::Prepared,
            history: vec![StatusChange {
                status: TransferStatus::Prepared,
                at,
            }],
        }
    }

    /// Apply a lifecycle transition
    pub fn transition(&mut self, next: TransferStatus, at: DateTime<Utc>) -> crate::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::Error::InvalidTransition {
                id: self.transfer_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.history.push(StatusChange { status: next, at });
        Ok(())
    }
}
