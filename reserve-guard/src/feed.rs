//! Reserve feed: attested metrics into automated circuits

use crate::{
    attestation::{Attestation, AttestationRegistry, StoredAttestation},
    circuit::CircuitBreaker,
    Error, Result,
};
use rail_core::crypto::Signature;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pushes the registry's fresh metrics into every circuit that follows one
#[derive(Debug, Clone)]
pub struct ReserveFeed {
    registry: Arc<AttestationRegistry>,
    breaker: Arc<CircuitBreaker>,
}

impl ReserveFeed {
    /// Connect a registry to a breaker
    pub fn new(registry: Arc<AttestationRegistry>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { registry, breaker }
    }

    /// Submit an attestation and immediately re-evaluate followed circuits
    pub fn submit(&self, claim: Attestation, signature: &Signature) -> Result<StoredAttestation> {
        let stored = self.registry.submit(claim, signature)?;
        self.refresh();
        Ok(stored)
    }

    /// Re-evaluate followed circuits; returns the number of transitions applied
    pub fn refresh(&self) -> usize {
        let mut applied = 0;
        for (circuit, result) in self.breaker.refresh_from_oracle(self.registry.as_ref()) {
            match result {
                Ok(Some(transition)) => {
                    applied += 1;
                    info!(circuit = %circuit, to = %transition.to, "Reserve feed moved circuit");
                }
                Ok(None) => {}
                Err(Error::CooldownActive { remaining_secs, .. }) => {
                    debug!(circuit = %circuit, remaining_secs, "Reserve feed deferred by cooldown");
                }
                Err(e) => warn!(circuit = %circuit, error = %e, "Reserve feed evaluation failed"),
            }
        }
        applied
    }

    /// Refresh periodically until the task is aborted
    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                self.refresh();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitDefinition, CircuitId, CircuitState};
    use chrono::Duration as ChronoDuration;
    use rail_core::collaborators::InMemoryRoles;
    use rail_core::crypto::{Domain, KeyPair};
    use rail_core::{AccessControl, Clock, EventBus, ManualClock, Metrics, Principal, Role};
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn setup() -> (ReserveFeed, Arc<CircuitBreaker>, Arc<ManualClock>, KeyPair) {
        let roles = Arc::new(InMemoryRoles::new().with_role("admin", Role::Admin));
        let access = AccessControl::new(roles);
        let clock = ManualClock::shared();
        let events = EventBus::default();
        let metrics = Metrics::new().unwrap();

        let registry = Arc::new(AttestationRegistry::new(
            &Domain::new("deltran-settlement", "1", "test", "node-1"),
            access.clone(),
            clock.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(access, clock.clone(), events, metrics));

        let admin = Principal::new("admin");
        let key = KeyPair::from_seed(&[9u8; 32]);
        registry
            .register_signer(&admin, "auditor", key.public_key())
            .unwrap();
        breaker
            .create_circuit(
                &admin,
                CircuitId::new("deficit"),
                CircuitDefinition::new(
                    "reserve deficit",
                    Decimal::from(100),
                    Decimal::from(500),
                    Decimal::from(900),
                )
                .automated(Some("custodian-1/deficit")),
            )
            .unwrap();

        (ReserveFeed::new(registry, breaker.clone()), breaker, clock, key)
    }

    #[test]
    fn test_attestation_drives_circuit() {
        let (feed, breaker, clock, key) = setup();
        let now = clock.now();
        let mut payload = BTreeMap::new();
        payload.insert("deficit".to_string(), Decimal::from(950));
        let claim = Attestation {
            subject_id: "custodian-1".to_string(),
            signer: "auditor".to_string(),
            period_start: now - ChronoDuration::days(1),
            period_end: now,
            valid_until: now + ChronoDuration::hours(1),
            payload,
            content_hash: [0u8; 32],
            nonce: 1,
        };
        let signature = claim.sign(&feed.registry.domain_separator(), &key);

        feed.submit(claim, &signature).unwrap();
        assert_eq!(
            breaker.state(&CircuitId::new("deficit")).unwrap(),
            CircuitState::Emergency
        );

        // Nothing left to move
        assert_eq!(feed.refresh(), 0);
    }

    #[test]
    fn test_refresh_without_attestation_is_noop() {
        let (feed, breaker, _, _) = setup();
        assert_eq!(feed.refresh(), 0);
        assert_eq!(
            breaker.state(&CircuitId::new("deficit")).unwrap(),
            CircuitState::Active
        );
    }
}
