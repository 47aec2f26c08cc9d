//! External collaborators the orchestrator depends on
//!
//! Balances, KYC decisions, reserve metrics and role grants are owned by other systems.
//! Each is a trait here, with an in-memory implementation used by tests and the
//! single-node binary.

use crate::{
    types::{AccountId, AssetId, Principal, Role, TransferRequest},
    Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Asset ledger: balance debits/credits
pub trait AssetLedger: Send + Sync + fmt::Debug {
    /// Remove value from an account; fails without effect if the balance is short
    fn debit(&self, account: &AccountId, asset: &AssetId, amount: Decimal) -> Result<()>;

    /// Add value to an account
    fn credit(&self, account: &AccountId, asset: &AssetId, amount: Decimal) -> Result<()>;

    /// Current balance
    fn balance_of(&self, account: &AccountId, asset: &AssetId) -> Decimal;

    /// Move value between accounts; fails without effect if the source is short
    fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        asset: &AssetId,
        amount: Decimal,
    ) -> Result<()> {
        self.debit(from, asset, amount)?;
        if let Err(e) = self.credit(to, asset, amount) {
            self.credit(from, asset, amount)?;
            return Err(e);
        }
        Ok(())
    }
}

/// Compliance/KYC evaluator
pub trait ComplianceEvaluator: Send + Sync + fmt::Debug {
    /// Whether `account` may take part in `transfer`
    fn is_authorized(&self, account: &AccountId, transfer: &TransferRequest) -> bool;
}

/// Price/reserve oracle
pub trait MetricOracle: Send + Sync + fmt::Debug {
    /// Latest value of a metric and when it was observed
    fn current_metric(&self, metric_id: &str) -> Option<(Decimal, DateTime<Utc>)>;
}

/// Identity/role store
pub trait RoleStore: Send + Sync + fmt::Debug {
    /// Whether `principal` holds `role`
    fn has_role(&self, principal: &Principal, role: Role) -> bool;

    /// Grant a role
    fn grant(&self, principal: &Principal, role: Role);

    /// Revoke a role; returns whether it was held
    fn revoke(&self, principal: &Principal, role: Role) -> bool;
}

/// In-memory asset ledger
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    balances: Mutex<HashMap<(AccountId, AssetId), Decimal>>,
}

impl InMemoryLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a balance
    pub fn with_balance(self, account: &str, asset: &str, amount: Decimal) -> Self {
        self.balances
            .lock()
            .insert((AccountId::new(account), AssetId::new(asset)), amount);
        self
    }

    /// Sum of all balances of an asset (conservation checks)
    pub fn total_supply(&self, asset: &AssetId) -> Decimal {
        self.balances
            .lock()
            .iter()
            .filter(|((_, a), _)| a == asset)
            .map(|(_, amount)| *amount)
            .sum()
    }
}

impl AssetLedger for InMemoryLedger {
    fn debit(&self, account: &AccountId, asset: &AssetId, amount: Decimal) -> Result<()> {
        let mut balances = self.balances.lock();
        let balance = balances
            .entry((account.clone(), asset.clone()))
            .or_insert(Decimal::ZERO);
        if *balance < amount {
            return Err(Error::InsufficientFunds {
                account: account.clone(),
                asset: asset.clone(),
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    fn credit(&self, account: &AccountId, asset: &AssetId, amount: Decimal) -> Result<()> {
        let mut balances = self.balances.lock();
        *balances
            .entry((account.clone(), asset.clone()))
            .or_insert(Decimal::ZERO) += amount;
        Ok(())
    }

    fn balance_of(&self, account: &AccountId, asset: &AssetId) -> Decimal {
        self.balances
            .lock()
            .get(&(account.clone(), asset.clone()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        asset: &AssetId,
        amount: Decimal,
    ) -> Result<()> {
        // Single lock so the pair of writes is atomic
        let mut balances = self.balances.lock();
        let available = balances
            .get(&(from.clone(), asset.clone()))
            .copied()
            .unwrap_or(Decimal::ZERO);
        if available < amount {
            return Err(Error::InsufficientFunds {
                account: from.clone(),
                asset: asset.clone(),
                needed: amount,
                available,
            });
        }
        balances.insert((from.clone(), asset.clone()), available - amount);
        *balances
            .entry((to.clone(), asset.clone()))
            .or_insert(Decimal::ZERO) += amount;
        Ok(())
    }
}

/// Compliance evaluator backed by a deny list
#[derive(Debug, Default)]
pub struct DenyListCompliance {
    denied: DashSet<AccountId>,
}

impl DenyListCompliance {
    /// Allow everyone
    pub fn new() -> Self {
        Self::default()
    }

    /// Block an account
    pub fn deny(&self, account: AccountId) {
        self.denied.insert(account);
    }

    /// Unblock an account
    pub fn allow(&self, account: &AccountId) {
        self.denied.remove(account);
    }
}

impl ComplianceEvaluator for DenyListCompliance {
    fn is_authorized(&self, account: &AccountId, _transfer: &TransferRequest) -> bool {
        !self.denied.contains(account)
    }
}

/// Oracle holding pushed values
#[derive(Debug, Default)]
pub struct InMemoryOracle {
    metrics: DashMap<String, (Decimal, DateTime<Utc>)>,
}

impl InMemoryOracle {
    /// Empty oracle
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a value
    pub fn publish(&self, metric_id: impl Into<String>, value: Decimal, as_of: DateTime<Utc>) {
        self.metrics.insert(metric_id.into(), (value, as_of));
    }
}

impl MetricOracle for InMemoryOracle {
    fn current_metric(&self, metric_id: &str) -> Option<(Decimal, DateTime<Utc>)> {
        self.metrics.get(metric_id).map(|entry| *entry.value())
    }
}

/// In-memory role store
#[derive(Debug, Default)]
pub struct InMemoryRoles {
    grants: DashMap<Principal, HashSet<Role>>,
}

impl InMemoryRoles {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a grant
    pub fn with_role(self, principal: &str, role: Role) -> Self {
        self.grant(&Principal::new(principal), role);
        self
    }

    /// Roles held by a principal
    pub fn roles_of(&self, principal: &Principal) -> HashSet<Role> {
        self.grants
            .get(principal)
            .map(|roles| roles.value().clone())
            .unwrap_or_default()
    }
}

impl RoleStore for InMemoryRoles {
    fn has_role(&self, principal: &Principal, role: Role) -> bool {
        self.grants
            .get(principal)
            .map(|roles| roles.contains(&role))
            .unwrap_or(false)
    }

    fn grant(&self, principal: &Principal, role: Role) {
        self.grants.entry(principal.clone()).or_default().insert(role);
    }

    fn revoke(&self, principal: &Principal, role: Role) -> bool {
        self.grants
            .get_mut(principal)
            .map(|mut roles| roles.remove(&role))
            .unwrap_or(false)
    }
}
