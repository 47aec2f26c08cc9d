//! Token rail: allow-listed assets settled by holds on spendable balance

use crate::{
    adapter::RailAdapter,
    book::{RailContext, TransferBook},
    types::PrepareOutcome,
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rail_core::{
    AccountId, AssetId, AssetLedger, RailKind, TransferId, TransferRecord, TransferRequest,
    TransferStatus,
};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

/// Reserves by holding part of the sender's balance; value moves only on release
#[derive(Debug)]
pub struct TokenRail {
    name: String,
    kind: RailKind,
    allowed: BTreeSet<AssetId>,
    ledger: Arc<dyn AssetLedger>,
    holds: Mutex<HashMap<(AccountId, AssetId), Decimal>>,
    book: TransferBook,
}

impl TokenRail {
    /// Create a token rail accepting `allowed` assets.
    ///
    /// Holds are rebuilt from the transfers the store still has prepared, so a
    /// restarted rail never treats held balance as spendable.
    pub fn new<I, S>(
        name: &str,
        allowed: I,
        ledger: Arc<dyn AssetLedger>,
        ctx: RailContext,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kind = RailKind::from_name(name);
        let book = TransferBook::new(kind, ctx);

        let mut holds: HashMap<(AccountId, AssetId), Decimal> = HashMap::new();
        let prepared = book.prepared()?;
        for record in &prepared {
            let r = &record.request;
            *holds
                .entry((r.sender.clone(), r.asset.clone()))
                .or_insert(Decimal::ZERO) += r.amount;
        }
        if !prepared.is_empty() {
            info!(rail = %name, transfers = prepared.len(), "Restored token holds");
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            allowed: allowed.into_iter().map(AssetId::new).collect(),
            ledger,
            holds: Mutex::new(holds),
            book,
        })
    }

    /// Amount currently held for `account`
    pub fn held(&self, account: &AccountId, asset: &AssetId) -> Decimal {
        self.holds
            .lock()
            .get(&(account.clone(), asset.clone()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Balance minus holds
    pub fn spendable(&self, account: &AccountId, asset: &AssetId) -> Decimal {
        self.ledger.balance_of(account, asset) - self.held(account, asset)
    }

    fn place_hold(&self, request: &TransferRequest) -> Result<()> {
        let mut holds = self.holds.lock();
        let key = (request.sender.clone(), request.asset.clone());
        let held = holds.get(&key).copied().unwrap_or(Decimal::ZERO);
        let available = self.ledger.balance_of(&request.sender, &request.asset) - held;
        if available < request.amount {
            return Err(rail_core::Error::InsufficientFunds {
                account: request.sender.clone(),
                asset: request.asset.clone(),
                needed: request.amount,
                available,
            }
            .into());
        }
        holds.insert(key, held + request.amount);
        Ok(())
    }

    fn drop_hold(&self, request: &TransferRequest) {
        let mut holds = self.holds.lock();
        let key = (request.sender.clone(), request.asset.clone());
        if let Some(held) = holds.get_mut(&key) {
            *held -= request.amount;
            if *held <= Decimal::ZERO {
                holds.remove(&key);
            }
        }
    }
}

#[async_trait]
impl RailAdapter for TokenRail {
    fn kind(&self) -> RailKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, request: &TransferRequest) -> Result<PrepareOutcome> {
        self.book.check_rail(request)?;
        request.validate()?;
        if !self.allowed.contains(&request.asset) {
            return Err(Error::AssetNotSupported {
                rail: self.kind,
                asset: request.asset.clone(),
            });
        }

        let id = self.transfer_id(request);
        let _guard = self.book.lock(&id).await;
        if self.book.status(&id)? != TransferStatus::None {
            return Ok(PrepareOutcome::AlreadyPrepared);
        }

        self.place_hold(request)?;
        if let Err(e) = self.book.record_prepared(id, request) {
            self.drop_hold(request);
            return Err(e);
        }
        Ok(PrepareOutcome::Prepared)
    }

    async fn release(&self, id: &TransferId, request: &TransferRequest) -> Result<()> {
        let _guard = self.book.lock(id).await;
        let record = self
            .book
            .require_prepared(id, request, TransferStatus::Released)?;

        let r = &record.request;
        self.ledger.transfer(&r.sender, &r.receiver, &r.asset, r.amount)?;
        self.drop_hold(r);
        self.book.finish(record, TransferStatus::Released, "")
    }

    async fn refund(&self, id: &TransferId, request: &TransferRequest) -> Result<()> {
        let _guard = self.book.lock(id).await;
        let record = self
            .book
            .require_prepared(id, request, TransferStatus::Refunded)?;

        self.drop_hold(&record.request);
        self.book
            .finish(record, TransferStatus::Refunded, "hold released")
    }

    fn status(&self, id: &TransferId) -> Result<TransferStatus> {
        self.book.status(id)
    }

    fn record(&self, id: &TransferId) -> Result<Option<TransferRecord>> {
        self.book.record(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rail_core::clock::system_clock;
    use rail_core::collaborators::InMemoryLedger;
    use rail_core::{EventBus, Metrics};

    fn setup() -> (TokenRail, Arc<InMemoryLedger>, RailContext) {
        let ledger = Arc::new(
            InMemoryLedger::new()
                .with_balance("A", "USDX", Decimal::from(100))
                .with_balance("A", "EURX", Decimal::from(100)),
        );
        let ctx = RailContext::in_memory(system_clock(), EventBus::default(), Metrics::new().unwrap());
        let rail = TokenRail::new("token", ["USDX"], ledger.clone(), ctx.clone()).unwrap();
        (rail, ledger, ctx)
    }

    fn request(asset: &str, amount: i64, nonce: u64) -> TransferRequest {
        TransferRequest::new(
            RailKind::from_name("token"),
            AssetId::new(asset),
            Decimal::from(amount),
            AccountId::new("A"),
            AccountId::new("B"),
            nonce,
        )
    }

    #[tokio::test]
    async fn test_holds_limit_concurrent_prepares() {
        let (rail, _, _) = setup();
        let a = AccountId::new("A");
        let usdx = AssetId::new("USDX");

        rail.prepare(&request("USDX", 70, 1)).await.unwrap();
        assert_eq!(rail.spendable(&a, &usdx), Decimal::from(30));

        // Balance is still 100 but only 30 is spendable
        assert!(matches!(
            rail.prepare(&request("USDX", 40, 2)).await,
            Err(Error::Core(rail_core::Error::InsufficientFunds { .. }))
        ));
        assert_eq!(rail.status(&request("USDX", 40, 2).derive_id()).unwrap(), TransferStatus::None);
    }

    #[tokio::test]
    async fn test_release_moves_value_and_clears_hold() {
        let (rail, ledger, _) = setup();
        let req = request("USDX", 70, 1);
        let id = req.derive_id();
        rail.prepare(&req).await.unwrap();
        rail.release(&id, &req).await.unwrap();

        assert_eq!(
            ledger.balance_of(&AccountId::new("B"), &AssetId::new("USDX")),
            Decimal::from(70)
        );
        assert_eq!(rail.held(&AccountId::new("A"), &AssetId::new("USDX")), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_refund_keeps_balance() {
        let (rail, ledger, _) = setup();
        let req = request("USDX", 70, 1);
        let id = req.derive_id();
        rail.prepare(&req).await.unwrap();
        rail.refund(&id, &req).await.unwrap();

        assert_eq!(
            ledger.balance_of(&AccountId::new("A"), &AssetId::new("USDX")),
            Decimal::from(100)
        );
        assert_eq!(rail.spendable(&AccountId::new("A"), &AssetId::new("USDX")), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_unlisted_asset_rejected() {
        let (rail, _, _) = setup();
        assert!(matches!(
            rail.prepare(&request("EURX", 10, 1)).await,
            Err(Error::AssetNotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_holds_survive_restart() {
        let (rail, ledger, ctx) = setup();
        let a = AccountId::new("A");
        let usdx = AssetId::new("USDX");
        rail.prepare(&request("USDX", 30, 1)).await.unwrap();
        rail.prepare(&request("USDX", 40, 2)).await.unwrap();
        let released = request("USDX", 10, 3);
        rail.prepare(&released).await.unwrap();
        rail.release(&released.derive_id(), &released).await.unwrap();

        let restarted = TokenRail::new("token", ["USDX"], ledger, ctx).unwrap();
        assert_eq!(restarted.held(&a, &usdx), Decimal::from(70));
        assert_eq!(restarted.spendable(&a, &usdx), Decimal::from(20));
        assert!(matches!(
            restarted.prepare(&request("USDX", 30, 4)).await,
            Err(Error::Core(rail_core::Error::InsufficientFunds { .. }))
        ));
    }
}
