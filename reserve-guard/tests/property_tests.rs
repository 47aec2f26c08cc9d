//! Property-based tests for guard invariants
//!
//! - Window bounds: after every admission, usage stays within the limit
//! - Rejections leave usage untouched
//! - Threshold evaluation is monotonic in the metric value
//! - Accepted attestation nonces strictly increase

use chrono::Duration;
use proptest::prelude::*;
use rail_core::collaborators::InMemoryRoles;
use rail_core::crypto::{Domain, KeyPair};
use rail_core::{AccessControl, Clock, EventBus, ManualClock, Metrics, Principal, Role};
use reserve_guard::{
    Attestation, AttestationRegistry, CircuitDefinition, LimitId, RateLimitDefinition,
    RateLimiter, WindowKind,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;

fn access() -> AccessControl {
    AccessControl::new(Arc::new(InMemoryRoles::new().with_role("admin", Role::Admin)))
}

/// Strategy for window semantics
fn window_kind_strategy() -> impl Strategy<Value = WindowKind> {
    prop_oneof![Just(WindowKind::Rolling), Just(WindowKind::Fixed)]
}

/// Strategy for admission attempts: (seconds to advance, amount)
fn attempts_strategy() -> impl Strategy<Value = Vec<(i64, u64)>> {
    prop::collection::vec((0i64..90, 1u64..500), 1..60)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_usage_never_exceeds_limit(
        max_count in 1u64..10,
        max_volume in 100u64..2_000,
        window_kind in window_kind_strategy(),
        attempts in attempts_strategy(),
    ) {
        let clock = ManualClock::shared();
        let limiter = RateLimiter::new(access(), clock.clone(), EventBus::default(), Metrics::new().unwrap());
        let id = LimitId::new("both");
        limiter
            .create_limit(
                &Principal::new("admin"),
                id.clone(),
                RateLimitDefinition::both(max_count, Decimal::from(max_volume), 60, window_kind),
            )
            .unwrap();

        for (advance, amount) in attempts {
            clock.advance(Duration::seconds(advance));
            let before = limiter.usage(&id, "A");
            let result = limiter.check_limit(&id, "A", Decimal::from(amount));
            let after = limiter.usage(&id, "A");

            if result.is_err() {
                prop_assert_eq!(&before, &after);
            }
            if let Some(window) = after {
                prop_assert!(window.count <= max_count);
                prop_assert!(window.volume <= Decimal::from(max_volume));
                prop_assert!(window.window_start <= clock.now());
                prop_assert!(clock.now() < window.window_start + Duration::seconds(60));
            }
        }
    }

    #[test]
    fn prop_threshold_target_monotonic(a in 0i64..2_000, b in 0i64..2_000) {
        let def = CircuitDefinition::new(
            "monotonic",
            Decimal::from(100),
            Decimal::from(500),
            Decimal::from(900),
        );
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            def.target_for(Decimal::from(low)).severity()
                <= def.target_for(Decimal::from(high)).severity()
        );
    }

    #[test]
    fn prop_accepted_nonces_increase(nonces in prop::collection::vec(1u64..50, 1..30)) {
        let clock = ManualClock::shared();
        let registry = AttestationRegistry::new(
            &Domain::new("deltran-settlement", "1", "test", "node-1"),
            access(),
            clock.clone(),
            EventBus::default(),
            Metrics::new().unwrap(),
        );
        let key = KeyPair::from_seed(&[1u8; 32]);
        registry
            .register_signer(&Principal::new("admin"), "auditor", key.public_key())
            .unwrap();

        let mut highest = 0u64;
        for nonce in nonces {
            let now = clock.now();
            let claim = Attestation {
                subject_id: "custodian".to_string(),
                signer: "auditor".to_string(),
                period_start: now,
                period_end: now,
                valid_until: now + Duration::minutes(5),
                payload: BTreeMap::new(),
                content_hash: [0u8; 32],
                nonce,
            };
            let signature = claim.sign(&registry.domain_separator(), &key);
            let accepted = registry.submit(claim, &signature).is_ok();

            prop_assert_eq!(accepted, nonce > highest);
            if accepted {
                highest = nonce;
            }
            prop_assert_eq!(registry.last_nonce("custodian"), highest);
        }
    }
}
