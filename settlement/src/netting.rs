//! Bilateral netting
//!
//! Gross legs are grouped by `(rail, asset, counterparty pair)`; within a group the
//! flows in both directions offset and at most one net leg remains.
//!
//! # Example
//!
//! ```text
//! Gross legs (same rail, USD):
//!   A → B: 100
//!   B → A:  80
//!   A → C:  50
//!
//! Net legs:
//!   A → B:  20
//!   A → C:  50
//!
//! Gross 230 → net 70 (70% reduction)
//! ```
//!
//! Every account's balance change is the same whether the gross legs or the net legs
//! settle. Net legs get a nonce derived from the gross transfer IDs they replace, so
//! netting the same batch twice yields the same net legs and settlement ID.

use crate::{types::SettlementId, Result};
use rail_core::{AccountId, AssetId, RailKind, TransferId, TransferRequest};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Metadata key listing how many gross legs a net leg replaces
pub const GROSS_LEGS_KEY: &str = "netting.gross_legs";

/// Net obligation between two accounts on one rail and asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BilateralObligation {
    /// Rail
    pub rail: RailKind,
    /// Asset
    pub asset: AssetId,
    /// Net payer
    pub debtor: AccountId,
    /// Net receiver
    pub creditor: AccountId,
    /// Sum of gross legs in both directions
    pub gross_amount: Decimal,
    /// Amount left after offsetting (zero when the flows cancel)
    pub net_amount: Decimal,
    /// Gross legs folded into this obligation
    pub transfer_ids: Vec<TransferId>,
}

/// Result of netting a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NettingPlan {
    /// One entry per counterparty pair
    pub obligations: Vec<BilateralObligation>,
    /// Legs to execute: the net legs, or the gross legs if netting was not worth it
    pub legs: Vec<TransferRequest>,
    /// Sum of gross amounts
    pub total_gross_amount: Decimal,
    /// Sum of net amounts
    pub total_net_amount: Decimal,
    /// `(gross - net) / gross`
    pub netting_efficiency: f64,
    /// Whether `legs` are net legs
    pub netted: bool,
}

/// Netted batch as executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetSettlement {
    /// Netting result
    pub plan: NettingPlan,
    /// Settlement of the executed legs; `None` when everything offset
    pub settlement_id: Option<SettlementId>,
}

/// Netting engine
#[derive(Debug, Clone)]
pub struct NettingEngine {
    /// Minimum efficiency for net legs to replace gross legs
    min_netting_ratio: f64,
}

impl Default for NettingEngine {
    fn default() -> Self {
        Self::new(0.0)
    }
}

type PairKey = (RailKind, AssetId, AccountId, AccountId);

#[derive(Default)]
struct PairFlow {
    // low → high minus high → low, accounts ordered
    balance: Decimal,
    gross: Decimal,
    ids: Vec<TransferId>,
}

impl NettingEngine {
    /// Create new netting engine
    pub fn new(min_netting_ratio: f64) -> Self {
        Self { min_netting_ratio }
    }

    /// Net a batch of gross legs. Pure: reads nothing but its input.
    pub fn compute(&self, gross: &[TransferRequest]) -> Result<NettingPlan> {
        if gross.is_empty() {
            return Err(rail_core::Error::InvalidTransfer("No legs to net".to_string()).into());
        }
        for leg in gross {
            leg.validate()?;
        }

        let mut flows: BTreeMap<PairKey, PairFlow> = BTreeMap::new();
        let mut total_gross = Decimal::ZERO;

        for leg in gross {
            total_gross += leg.amount;
            let (low, high, sign) = if leg.sender < leg.receiver {
                (&leg.sender, &leg.receiver, Decimal::ONE)
            } else {
                (&leg.receiver, &leg.sender, Decimal::NEGATIVE_ONE)
            };
            let flow = flows
                .entry((leg.rail, leg.asset.clone(), low.clone(), high.clone()))
                .or_default();
            flow.balance += leg.amount * sign;
            flow.gross += leg.amount;
            flow.ids.push(leg.derive_id());
        }

        let mut obligations = Vec::with_capacity(flows.len());
        let mut net_legs = Vec::new();
        let mut total_net = Decimal::ZERO;

        for ((rail, asset, low, high), flow) in flows {
            let (debtor, creditor) = if flow.balance >= Decimal::ZERO {
                (low, high)
            } else {
                (high, low)
            };
            let net_amount = flow.balance.abs();
            total_net += net_amount;

            if net_amount > Decimal::ZERO {
                net_legs.push(
                    TransferRequest::new(
                        rail,
                        asset.clone(),
                        net_amount,
                        debtor.clone(),
                        creditor.clone(),
                        net_nonce(&flow.ids),
                    )
                    .with_metadata(GROSS_LEGS_KEY, flow.ids.len().to_string()),
                );
            }

            obligations.push(BilateralObligation {
                rail,
                asset,
                debtor,
                creditor,
                gross_amount: flow.gross,
                net_amount,
                transfer_ids: flow.ids,
            });
        }

        let netting_efficiency = if total_gross > Decimal::ZERO {
            ((total_gross - total_net) / total_gross)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let netted = netting_efficiency >= self.min_netting_ratio;
        debug!(
            gross_legs = gross.len(),
            net_legs = net_legs.len(),
            efficiency = netting_efficiency,
            netted,
            "Netting computed"
        );

        Ok(NettingPlan {
            obligations,
            legs: if netted { net_legs } else { gross.to_vec() },
            total_gross_amount: total_gross,
            total_net_amount: total_net,
            netting_efficiency,
            netted,
        })
    }
}

/// Nonce for a net leg: first 8 bytes of BLAKE3 over the sorted gross IDs
fn net_nonce(ids: &[TransferId]) -> u64 {
    let mut sorted = ids.to_vec();
    sorted.sort();

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"deltran.netting.v1");
    for id in &sorted {
        hasher.update(id.as_bytes());
    }
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_be_bytes(nonce)
}
