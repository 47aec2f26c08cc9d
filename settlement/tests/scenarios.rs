//! End-to-end settlement scenarios across native, token and attested rails

use rail_core::collaborators::{DenyListCompliance, InMemoryLedger, InMemoryRoles};
use rail_core::crypto::KeyPair;
use rail_core::{
    AccessControl, AccountId, AssetId, AssetLedger, EventBus, ManualClock, Metrics, Principal,
    RailKind, Role, SharedClock, TransferRequest, TransferStatus,
};
use reserve_guard::{
    CircuitBreaker, CircuitDefinition, CircuitId, CircuitState, LimitId, RateLimitDefinition,
    RateLimiter, VoteOutcome, WindowKind,
};
use rust_decimal::Decimal;
use settlement::rails::{AttestedRail, AttestedRailConfig, InMemoryGateway, NativeRail, TokenRail};
use settlement::{
    spawn_confirmation_actor, Collaborators, Confirmation, Error, Orchestrator, OrchestratorConfig,
    RailContext, RailRegistry, SettlementStatus,
};
use std::sync::Arc;
use std::time::Duration;

const DOMAIN: [u8; 32] = [7u8; 32];

struct World {
    orchestrator: Arc<Orchestrator>,
    ledger: Arc<InMemoryLedger>,
    gateway: Arc<InMemoryGateway>,
    relayer: KeyPair,
    clock: Arc<ManualClock>,
    admin: Principal,
}

fn world() -> World {
    world_with_sender_limits(Vec::new())
}

fn world_with_sender_limits(limits: Vec<(&str, RateLimitDefinition)>) -> World {
    let roles = Arc::new(
        InMemoryRoles::new()
            .with_role("admin", Role::Admin)
            .with_role("ops", Role::Operator),
    );
    let access = AccessControl::new(roles);
    let manual = ManualClock::shared();
    let clock: SharedClock = manual.clone();
    let events = EventBus::default();
    let metrics = Metrics::new().unwrap();
    let admin = Principal::new("admin");
    let ctx = RailContext::in_memory(clock.clone(), events.clone(), metrics.clone());

    let ledger = Arc::new(
        InMemoryLedger::new()
            .with_balance("A", "USD", Decimal::from(1_000))
            .with_balance("B", "USDX", Decimal::from(1_000)),
    );
    let gateway = Arc::new(InMemoryGateway::new());
    let relayer = KeyPair::from_seed(&[42u8; 32]);

    let registry = Arc::new(RailRegistry::new(access.clone(), events.clone(), clock.clone()));
    registry
        .set(&admin, Arc::new(NativeRail::new("native", ledger.clone(), ctx.clone())))
        .unwrap();
    registry
        .set(
            &admin,
            Arc::new(TokenRail::new("usdx", ["USDX"], ledger.clone(), ctx.clone()).unwrap()),
        )
        .unwrap();
    registry
        .set(
            &admin,
            Arc::new(AttestedRail::new(
                "swift",
                ledger.clone(),
                gateway.clone(),
                AttestedRailConfig {
                    relayer_key: relayer.public_key(),
                    domain_separator: DOMAIN,
                    confirmation_timeout: Duration::from_secs(60),
                },
                ctx,
            )),
        )
        .unwrap();

    let breaker = Arc::new(CircuitBreaker::new(
        access.clone(),
        clock.clone(),
        events.clone(),
        metrics.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(
        access.clone(),
        clock.clone(),
        events.clone(),
        metrics.clone(),
    ));
    let mut sender_limits = Vec::with_capacity(limits.len());
    for (id, definition) in limits {
        let id = LimitId::new(id);
        limiter.create_limit(&admin, id.clone(), definition).unwrap();
        sender_limits.push(id);
    }

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorConfig {
            sender_limits,
            ..OrchestratorConfig::default()
        },
        Collaborators {
            registry,
            breaker,
            limiter,
            compliance: Arc::new(DenyListCompliance::new()),
            access,
            clock,
            events,
            metrics,
        },
    ));

    World {
        orchestrator,
        ledger,
        gateway,
        relayer,
        clock: manual,
        admin,
    }
}

fn transfer(rail: &str, asset: &str, from: &str, to: &str, amount: i64, nonce: u64) -> TransferRequest {
    TransferRequest::new(
        RailKind::from_name(rail),
        AssetId::new(asset),
        Decimal::from(amount),
        AccountId::new(from),
        AccountId::new(to),
        nonce,
    )
}

fn balance(w: &World, account: &str, asset: &str) -> Decimal {
    w.ledger
        .balance_of(&AccountId::new(account), &AssetId::new(asset))
}

#[tokio::test]
async fn native_transfer_settles_immediately() {
    let w = world();
    let id = w
        .orchestrator
        .request_transfer(transfer("native", "USD", "A", "B", 100, 1))
        .await
        .unwrap();

    assert_eq!(w.orchestrator.transfer_status(&id).unwrap(), TransferStatus::Released);
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(900));
    assert_eq!(balance(&w, "B", "USD"), Decimal::from(100));
}

#[tokio::test]
async fn resubmission_returns_same_id_and_moves_value_once() {
    let w = world();
    let req = transfer("native", "USD", "A", "B", 100, 1);
    let first = w.orchestrator.request_transfer(req.clone()).await.unwrap();
    let second = w.orchestrator.request_transfer(req).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(balance(&w, "B", "USD"), Decimal::from(100));
}

#[tokio::test]
async fn restricted_circuit_blocks_before_prepare() {
    let w = world();
    let breaker = &w.orchestrator.collaborators().breaker;
    let circuit = CircuitId::new("reserve-ratio");
    breaker
        .create_circuit(
            &w.admin,
            circuit.clone(),
            CircuitDefinition::new("reserve-ratio", 10.into(), 20.into(), 30.into())
                .restrict("transfer"),
        )
        .unwrap();
    breaker
        .set_state(&w.admin, &circuit, CircuitState::Restricted, "reserve shortfall")
        .unwrap();

    let req = transfer("native", "USD", "A", "B", 100, 1);
    let err = w.orchestrator.request_transfer(req.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Guard(reserve_guard::Error::FunctionRestricted { .. })
    ));
    assert_eq!(
        w.orchestrator.transfer_status(&req.derive_id()).unwrap(),
        TransferStatus::None
    );
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(1_000));
}

#[tokio::test]
async fn delivery_versus_payment_rolls_back_when_one_leg_fails() {
    let w = world();
    let cash = transfer("native", "USD", "A", "B", 100, 1);
    // Not on the token rail's allow-list
    let security = transfer("usdx", "BOND", "B", "A", 5, 1);

    let err = w
        .orchestrator
        .request_atomic_settlement(vec![cash.clone(), security])
        .await
        .unwrap_err();
    let settlement_id = match err {
        Error::SettlementAborted { settlement_id, .. } => settlement_id,
        other => panic!("expected abort, got {other}"),
    };

    assert_eq!(
        w.orchestrator.transfer_status(&cash.derive_id()).unwrap(),
        TransferStatus::Refunded
    );
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(1_000));
    assert_eq!(balance(&w, "B", "USD"), Decimal::ZERO);
    assert_eq!(
        w.orchestrator.settlement(&settlement_id).unwrap().status,
        SettlementStatus::Aborted
    );
}

#[tokio::test]
async fn delivery_versus_payment_commits_both_legs() {
    let w = world();
    let settlement_id = w
        .orchestrator
        .request_atomic_settlement(vec![
            transfer("native", "USD", "A", "B", 100, 1),
            transfer("usdx", "USDX", "B", "A", 100, 1),
        ])
        .await
        .unwrap();

    assert_eq!(
        w.orchestrator.settlement(&settlement_id).unwrap().status,
        SettlementStatus::Committed
    );
    assert_eq!(balance(&w, "A", "USDX"), Decimal::from(100));
    assert_eq!(balance(&w, "B", "USD"), Decimal::from(100));
}

#[tokio::test]
async fn signed_confirmation_releases_attested_transfer() {
    let w = world();
    let (confirmations, actor) =
        spawn_confirmation_actor(w.orchestrator.clone(), Duration::from_secs(3600), 16);

    let id = w
        .orchestrator
        .request_transfer(transfer("swift", "USD", "A", "B", 250, 1))
        .await
        .unwrap();
    assert_eq!(w.orchestrator.transfer_status(&id).unwrap(), TransferStatus::Prepared);
    assert_eq!(w.gateway.submitted().len(), 1);
    assert_eq!(w.orchestrator.pending().len(), 1);

    // Unsigned callbacks are refused and leave the transfer pending
    assert!(matches!(
        confirmations.confirm(Confirmation::settled(id)).await,
        Err(Error::InvalidConfirmation(_))
    ));
    assert_eq!(w.orchestrator.pending().len(), 1);

    let status = confirmations
        .confirm(Confirmation::settled(id).signed(&DOMAIN, &w.relayer))
        .await
        .unwrap();
    assert_eq!(status, TransferStatus::Released);
    assert_eq!(balance(&w, "B", "USD"), Decimal::from(250));
    assert!(w.orchestrator.pending().is_empty());

    confirmations.shutdown().await.unwrap();
    actor.await.unwrap();
}

#[tokio::test]
async fn missing_confirmation_refunds_after_deadline() {
    let w = world();
    let id = w
        .orchestrator
        .request_transfer(transfer("swift", "USD", "A", "B", 250, 1))
        .await
        .unwrap();
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(750));

    assert_eq!(w.orchestrator.expire_pending().await, 0);
    w.clock.advance(chrono::Duration::seconds(61));
    assert_eq!(w.orchestrator.expire_pending().await, 1);

    assert_eq!(w.orchestrator.transfer_status(&id).unwrap(), TransferStatus::Refunded);
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(1_000));
    assert_eq!(w.gateway.cancelled(), vec![id]);

    // A late confirmation finds nothing to complete
    assert!(matches!(
        w.orchestrator
            .confirm(Confirmation::settled(id).signed(&DOMAIN, &w.relayer))
            .await,
        Err(Error::NotPending(_))
    ));
}

#[tokio::test]
async fn operator_cancel_refunds_once() {
    let w = world();
    let id = w
        .orchestrator
        .request_transfer(transfer("swift", "USD", "A", "B", 250, 1))
        .await
        .unwrap();
    let ops = Principal::new("ops");

    w.orchestrator.cancel(&ops, &id).await.unwrap();
    assert_eq!(w.orchestrator.transfer_status(&id).unwrap(), TransferStatus::Refunded);
    assert!(w.orchestrator.pending().is_empty());

    assert!(matches!(
        w.orchestrator.cancel(&ops, &id).await,
        Err(Error::Core(rail_core::Error::InvalidTransition { .. }))
    ));
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(1_000));
}

#[tokio::test]
async fn mixed_settlement_commits_after_confirmation() {
    let w = world();
    let settlement_id = w
        .orchestrator
        .request_atomic_settlement(vec![
            transfer("usdx", "USDX", "B", "A", 50, 1),
            transfer("swift", "USD", "A", "B", 50, 1),
        ])
        .await
        .unwrap();
    assert_eq!(
        w.orchestrator.settlement(&settlement_id).unwrap().status,
        SettlementStatus::AwaitingConfirmation
    );
    // Nothing released yet
    assert_eq!(balance(&w, "A", "USDX"), Decimal::ZERO);

    let swift_leg = transfer("swift", "USD", "A", "B", 50, 1).derive_id();
    w.orchestrator
        .confirm(Confirmation::settled(swift_leg).signed(&DOMAIN, &w.relayer))
        .await
        .unwrap();

    assert_eq!(
        w.orchestrator.settlement(&settlement_id).unwrap().status,
        SettlementStatus::Committed
    );
    assert_eq!(balance(&w, "A", "USDX"), Decimal::from(50));
    assert_eq!(balance(&w, "B", "USD"), Decimal::from(50));
}

#[tokio::test]
async fn failed_leg_confirmation_aborts_settlement() {
    let w = world();
    let token_leg = transfer("usdx", "USDX", "B", "A", 50, 1);
    let swift_leg = transfer("swift", "USD", "A", "B", 50, 1);
    let settlement_id = w
        .orchestrator
        .request_atomic_settlement(vec![token_leg.clone(), swift_leg.clone()])
        .await
        .unwrap();

    w.orchestrator
        .confirm(Confirmation::failed(swift_leg.derive_id(), "beneficiary bank closed").signed(&DOMAIN, &w.relayer))
        .await
        .unwrap();

    let settlement = w.orchestrator.settlement(&settlement_id).unwrap();
    assert_eq!(settlement.status, SettlementStatus::Aborted);
    assert_eq!(
        w.orchestrator.transfer_status(&token_leg.derive_id()).unwrap(),
        TransferStatus::Refunded
    );
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(1_000));
    assert_eq!(balance(&w, "B", "USDX"), Decimal::from(1_000));
}

#[tokio::test]
async fn validator_quorum_halts_transfers() {
    let w = world();
    let breaker = &w.orchestrator.collaborators().breaker;
    let circuit = CircuitId::new("peg");
    breaker
        .create_circuit(
            &w.admin,
            circuit.clone(),
            CircuitDefinition::new("peg", 1.into(), 2.into(), 3.into())
                .with_validators(["v1", "v2", "v3", "v4", "v5"], 3),
        )
        .unwrap();

    for (validator, nonce) in [("v1", 1), ("v2", 2)] {
        let outcome = breaker
            .vote(&Principal::new(validator), &circuit, CircuitState::Emergency)
            .unwrap();
        assert!(matches!(outcome, VoteOutcome::Recorded { required: 3, .. }));
        // Two votes are not a quorum
        w.orchestrator
            .request_transfer(transfer("native", "USD", "A", "B", 10, nonce))
            .await
            .unwrap();
    }

    let outcome = breaker
        .vote(&Principal::new("v3"), &circuit, CircuitState::Emergency)
        .unwrap();
    assert!(matches!(outcome, VoteOutcome::Transitioned(_)));
    assert_eq!(breaker.state(&circuit).unwrap(), CircuitState::Emergency);

    let err = w
        .orchestrator
        .request_transfer(transfer("native", "USD", "A", "B", 10, 3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Guard(reserve_guard::Error::EmergencyHalt { .. })
    ));
    assert_eq!(balance(&w, "B", "USD"), Decimal::from(20));
}

#[tokio::test]
async fn net_settlement_matches_gross_balances() {
    let w = world();
    let net = w
        .orchestrator
        .net_settle(vec![
            transfer("native", "USD", "A", "B", 100, 1),
            transfer("native", "USD", "B", "A", 80, 2),
        ])
        .await
        .unwrap();

    assert!(net.plan.netted);
    assert_eq!(net.plan.legs.len(), 1);
    assert_eq!(net.plan.total_gross_amount, Decimal::from(180));
    assert_eq!(net.plan.total_net_amount, Decimal::from(20));
    let settlement_id = net.settlement_id.unwrap();
    assert_eq!(
        w.orchestrator.settlement(&settlement_id).unwrap().status,
        SettlementStatus::Committed
    );
    // Same end state as settling A -> B 100 then B -> A 80
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(980));
    assert_eq!(balance(&w, "B", "USD"), Decimal::from(20));
}

#[tokio::test]
async fn net_settlement_charges_sender_limits_per_gross_leg() {
    let w = world_with_sender_limits(vec![(
        "per-sender",
        RateLimitDefinition::count(1, 60, WindowKind::Rolling),
    )]);
    let legs = vec![
        transfer("native", "USD", "A", "B", 100, 1),
        transfer("native", "USD", "A", "B", 50, 2),
    ];

    let err = w
        .orchestrator
        .request_atomic_settlement(legs.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Guard(reserve_guard::Error::LimitExceeded { .. })
    ));

    // Netting folds both legs into one, but A still sent twice
    let err = w.orchestrator.net_settle(legs).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Guard(reserve_guard::Error::LimitExceeded { .. })
    ));
    assert_eq!(balance(&w, "A", "USD"), Decimal::from(1_000));
    assert_eq!(balance(&w, "B", "USD"), Decimal::ZERO);

    // A single leg still fits the limit
    w.orchestrator
        .net_settle(vec![transfer("native", "USD", "A", "B", 100, 3)])
        .await
        .unwrap();
    assert_eq!(balance(&w, "B", "USD"), Decimal::from(100));
}
