//! Audit events
//!
//! Components publish [`SettlementEvent`]s on an [`EventBus`] (a tokio broadcast
//! channel). External monitoring subscribes; publishing never blocks and never fails
//! when nobody is listening.

use crate::types::{AssetId, RailKind, TransferId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default broadcast capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What drove a circuit transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransitionTrigger {
    /// Threshold evaluation of a reported metric
    Automatic,
    /// Validator quorum
    Consensus,
    /// Administrator override
    Manual,
}

/// Event emitted for audit and observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SettlementEvent {
    /// Resources reserved on a rail
    TransferPrepared {
        /// Transfer ID
        transfer_id: TransferId,
        /// Rail
        rail: RailKind,
        /// Asset
        asset: AssetId,
        /// Amount
        amount: Decimal,
        /// Time
        at: DateTime<Utc>,
    },

    /// Value moved
    TransferReleased {
        /// Transfer ID
        transfer_id: TransferId,
        /// Time
        at: DateTime<Utc>,
    },

    /// Reservation reversed
    TransferRefunded {
        /// Transfer ID
        transfer_id: TransferId,
        /// Why
        reason: String,
        /// Time
        at: DateTime<Utc>,
    },

    /// Circuit changed state
    CircuitStateChanged {
        /// Circuit
        circuit_id: String,
        /// Previous state
        old: String,
        /// New state
        new: String,
        /// Trigger path
        trigger: TransitionTrigger,
        /// Time
        at: DateTime<Utc>,
    },

    /// Rate limit refused an admission
    LimitRejected {
        /// Limit
        limit_id: String,
        /// Subject (usually the sender)
        subject: String,
        /// Time
        at: DateTime<Utc>,
    },

    /// Signed attestation stored
    AttestationAccepted {
        /// Subject
        subject_id: String,
        /// Accepted nonce
        nonce: u64,
        /// Time
        at: DateTime<Utc>,
    },

    /// All legs of a multi-leg settlement released
    SettlementCommitted {
        /// Settlement
        settlement_id: Uuid,
        /// Number of legs
        legs: usize,
        /// Time
        at: DateTime<Utc>,
    },

    /// Multi-leg settlement rolled back
    SettlementAborted {
        /// Settlement
        settlement_id: Uuid,
        /// Why
        reason: String,
        /// Time
        at: DateTime<Utc>,
    },

    /// Rail adapter bound or rebound
    RailBound {
        /// Rail
        rail: RailKind,
        /// Whether an existing binding was replaced
        replaced: bool,
        /// Time
        at: DateTime<Utc>,
    },
}

impl SettlementEvent {
    /// Short event name for logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            SettlementEvent::TransferPrepared { .. } => "TransferPrepared",
            SettlementEvent::TransferReleased { .. } => "TransferReleased",
            SettlementEvent::TransferRefunded { .. } => "TransferRefunded",
            SettlementEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
            SettlementEvent::LimitRejected { .. } => "LimitRejected",
            SettlementEvent::AttestationAccepted { .. } => "AttestationAccepted",
            SettlementEvent::SettlementCommitted { .. } => "SettlementCommitted",
            SettlementEvent::SettlementAborted { .. } => "SettlementAborted",
            SettlementEvent::RailBound { .. } => "RailBound",
        }
    }
}

/// Broadcast bus for settlement events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SettlementEvent>,
}

impl EventBus {
    /// Bus with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; dropped silently when there are no subscribers
    pub fn publish(&self, event: SettlementEvent) {
        tracing::debug!(event = event.name(), "Publishing settlement event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
