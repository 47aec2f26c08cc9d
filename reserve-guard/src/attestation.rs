//! Signed reserve attestations
//!
//! An attestation is a claim about a subject (e.g. a custodian's reserves) over a
//! period, signed by a registered signer. The signed message is a typed digest:
//!
//! ```text
//! digest = SHA256(0x19 ‖ 0x01 ‖ domain_separator ‖ struct_hash(claim))
//! ```
//!
//! so a signature produced for one environment never verifies in another. Accepted
//! nonces strictly increase per subject; the latest accepted claim supersedes the
//! previous one and is exposed as oracle metrics `"<subject>/<field>"`.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use rail_core::crypto::{typed_digest, Domain, KeyPair, Signature, StructHasher};
use rail_core::{
    AccessControl, EventBus, MetricOracle, Metrics, Principal, Role, SettlementEvent, SharedClock,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// Claim signed by an attestation signer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    /// Subject the claim is about
    pub subject_id: String,
    /// Registered signer ID
    pub signer: String,
    /// Start of the attested period
    pub period_start: DateTime<Utc>,
    /// End of the attested period
    pub period_end: DateTime<Utc>,
    /// Claim must be accepted before this time
    pub valid_until: DateTime<Utc>,
    /// Attested figures (e.g. `reserves`, `liabilities`)
    pub payload: BTreeMap<String, Decimal>,
    /// Hash of the off-chain report backing the figures
    pub content_hash: [u8; 32],
    /// Per-subject sequence number
    pub nonce: u64,
}

impl Attestation {
    /// Struct type tag
    pub const TYPE_TAG: &'static str = "Attestation(string subjectId,string signer,\
        int64 periodStart,int64 periodEnd,int64 validUntil,bytes32 payloadHash,\
        bytes32 contentHash,uint64 nonce)";

    /// Hash of the payload fields in key order
    pub fn payload_hash(&self) -> [u8; 32] {
        self.payload
            .iter()
            .fold(
                StructHasher::new("Payload(string field,string value)[]")
                    .u64(self.payload.len() as u64),
                |hasher, (field, value)| hasher.str(field).str(&value.normalize().to_string()),
            )
            .finish()
    }

    /// Struct hash over every field
    pub fn struct_hash(&self) -> [u8; 32] {
        StructHasher::new(Self::TYPE_TAG)
            .str(&self.subject_id)
            .str(&self.signer)
            .i64(self.period_start.timestamp_millis())
            .i64(self.period_end.timestamp_millis())
            .i64(self.valid_until.timestamp_millis())
            .bytes32(&self.payload_hash())
            .bytes32(&self.content_hash)
            .u64(self.nonce)
            .finish()
    }

    /// Digest signed for the given domain
    pub fn digest(&self, domain_separator: &[u8; 32]) -> [u8; 32] {
        typed_digest(domain_separator, &self.struct_hash())
    }

    /// Sign for the given domain
    pub fn sign(&self, domain_separator: &[u8; 32], key: &KeyPair) -> Signature {
        key.sign(&self.digest(domain_separator))
    }

    /// Attested figure
    pub fn field(&self, name: &str) -> Option<Decimal> {
        self.payload.get(name).copied()
    }
}

/// Accepted attestation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAttestation {
    /// The claim
    pub claim: Attestation,
    /// Typed digest that was signed
    pub digest: [u8; 32],
    /// SHA-256 of the signature bytes
    pub signature_digest: [u8; 32],
    /// Acceptance time
    pub accepted_at: DateTime<Utc>,
}

/// Registry of signers and latest accepted claims
#[derive(Debug)]
pub struct AttestationRegistry {
    domain_separator: [u8; 32],
    signers: RwLock<HashMap<String, [u8; 32]>>,
    latest: DashMap<String, StoredAttestation>,
    access: AccessControl,
    clock: SharedClock,
    events: EventBus,
    metrics: Metrics,
}

impl AttestationRegistry {
    /// Create a registry bound to `domain`
    pub fn new(
        domain: &Domain,
        access: AccessControl,
        clock: SharedClock,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            domain_separator: domain.separator(),
            signers: RwLock::new(HashMap::new()),
            latest: DashMap::new(),
            access,
            clock,
            events,
            metrics,
        }
    }

    /// Domain separator claims must be signed under
    pub fn domain_separator(&self) -> [u8; 32] {
        self.domain_separator
    }

    /// Register a signer's Ed25519 public key (admin only)
    pub fn register_signer(
        &self,
        caller: &Principal,
        signer: impl Into<String>,
        public_key: [u8; 32],
    ) -> Result<()> {
        self.access.require(caller, Role::Admin)?;
        let signer = signer.into();
        let mut signers = self.signers.write();
        if signers.contains_key(&signer) {
            return Err(Error::SignerExists(signer));
        }
        info!(signer = %signer, key = %hex::encode(public_key), "Attestation signer registered");
        signers.insert(signer, public_key);
        Ok(())
    }

    /// Remove a signer (admin only); returns whether it was registered
    pub fn revoke_signer(&self, caller: &Principal, signer: &str) -> Result<bool> {
        self.access.require(caller, Role::Admin)?;
        let removed = self.signers.write().remove(signer).is_some();
        if removed {
            warn!(signer = %signer, "Attestation signer revoked");
        }
        Ok(removed)
    }

    /// Registered key of a signer
    pub fn signer_key(&self, signer: &str) -> Option<[u8; 32]> {
        self.signers.read().get(signer).copied()
    }

    /// Verify and store a claim
    pub fn submit(&self, claim: Attestation, signature: &Signature) -> Result<StoredAttestation> {
        if claim.subject_id.is_empty() {
            return Err(Error::InvalidAttestation("empty subject".to_string()));
        }
        if claim.period_start > claim.period_end {
            return Err(Error::InvalidAttestation(format!(
                "period starts after it ends ({} > {})",
                claim.period_start, claim.period_end
            )));
        }

        let public_key = self
            .signer_key(&claim.signer)
            .ok_or_else(|| Error::UnknownSigner(claim.signer.clone()))?;
        let digest = claim.digest(&self.domain_separator);
        if !signature.verify(&digest, &public_key) {
            warn!(subject = %claim.subject_id, signer = %claim.signer, "Attestation signature rejected");
            return Err(Error::InvalidSignature(claim.signer.clone()));
        }

        let now = self.clock.now();
        let subject = claim.subject_id.clone();
        let nonce = claim.nonce;

        // Nonce check and store happen under the subject's entry lock
        let stored = match self.latest.entry(subject.clone()) {
            Entry::Occupied(mut slot) => {
                let last = slot.get().claim.nonce;
                Self::check_fresh(&claim, nonce, last, now)?;
                let stored = Self::stored(claim, digest, signature, now);
                slot.insert(stored.clone());
                stored
            }
            Entry::Vacant(slot) => {
                Self::check_fresh(&claim, nonce, 0, now)?;
                let stored = Self::stored(claim, digest, signature, now);
                slot.insert(stored.clone());
                stored
            }
        };

        info!(subject = %subject, nonce, signer = %stored.claim.signer, "Attestation accepted");
        self.metrics.attestations_accepted.inc();
        self.events.publish(SettlementEvent::AttestationAccepted {
            subject_id: subject,
            nonce,
            at: now,
        });
        Ok(stored)
    }

    fn check_fresh(claim: &Attestation, nonce: u64, last: u64, now: DateTime<Utc>) -> Result<()> {
        if nonce <= last {
            return Err(Error::NonceReplay {
                subject: claim.subject_id.clone(),
                nonce,
                last,
            });
        }
        if now > claim.valid_until {
            return Err(Error::AttestationExpired {
                subject: claim.subject_id.clone(),
                valid_until: claim.valid_until,
            });
        }
        Ok(())
    }

    fn stored(
        claim: Attestation,
        digest: [u8; 32],
        signature: &Signature,
        now: DateTime<Utc>,
    ) -> StoredAttestation {
        StoredAttestation {
            claim,
            digest,
            signature_digest: signature.digest(),
            accepted_at: now,
        }
    }

    /// Latest accepted claim for a subject
    pub fn latest(&self, subject: &str) -> Option<StoredAttestation> {
        self.latest.get(subject).map(|entry| entry.value().clone())
    }

    /// Last accepted nonce (0 before the first)
    pub fn last_nonce(&self, subject: &str) -> u64 {
        self.latest
            .get(subject)
            .map(|entry| entry.claim.nonce)
            .unwrap_or(0)
    }

    /// Whether the latest claim for `subject` is still within its validity
    pub fn is_fresh(&self, subject: &str) -> bool {
        let now = self.clock.now();
        self.latest
            .get(subject)
            .map(|entry| now <= entry.claim.valid_until)
            .unwrap_or(false)
    }

    /// Attested figure from the latest claim, regardless of freshness
    pub fn metric(&self, subject: &str, field: &str) -> Option<Decimal> {
        self.latest.get(subject)?.claim.field(field)
    }
}

impl MetricOracle for AttestationRegistry {
    /// `metric_id` is `"<subject>/<field>"`; only fresh claims are reported
    fn current_metric(&self, metric_id: &str) -> Option<(Decimal, DateTime<Utc>)> {
        let (subject, field) = metric_id.rsplit_once('/')?;
        if !self.is_fresh(subject) {
            return None;
        }
        let entry = self.latest.get(subject)?;
        Some((entry.claim.field(field)?, entry.claim.period_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rail_core::collaborators::InMemoryRoles;
    use rail_core::{Clock, ManualClock};
    use std::sync::Arc;

    struct Fixture {
        registry: AttestationRegistry,
        clock: Arc<ManualClock>,
        key: KeyPair,
    }

    fn domain(environment: &str) -> Domain {
        Domain::new("deltran-settlement", "1", environment, "node-1")
    }

    fn fixture() -> Fixture {
        let roles = InMemoryRoles::new().with_role("admin", Role::Admin);
        let clock = ManualClock::shared();
        let registry = AttestationRegistry::new(
            &domain("test"),
            AccessControl::new(Arc::new(roles)),
            clock.clone(),
            EventBus::default(),
            Metrics::new().unwrap(),
        );
        let key = KeyPair::from_seed(&[7u8; 32]);
        registry
            .register_signer(&Principal::new("admin"), "auditor", key.public_key())
            .unwrap();
        Fixture {
            registry,
            clock,
            key,
        }
    }

    fn claim(clock: &ManualClock, nonce: u64, reserves: i64) -> Attestation {
        let now = clock.now();
        let mut payload = BTreeMap::new();
        payload.insert("reserves".to_string(), Decimal::from(reserves));
        payload.insert("liabilities".to_string(), Decimal::from(1_000));
        Attestation {
            subject_id: "custodian-1".to_string(),
            signer: "auditor".to_string(),
            period_start: now - Duration::days(1),
            period_end: now,
            valid_until: now + Duration::hours(1),
            payload,
            content_hash: [3u8; 32],
            nonce,
        }
    }

    #[test]
    fn test_submit_and_latest() {
        let f = fixture();
        let claim = claim(&f.clock, 1, 1_200);
        let signature = claim.sign(&f.registry.domain_separator(), &f.key);

        let stored = f.registry.submit(claim.clone(), &signature).unwrap();
        assert_eq!(stored.signature_digest, signature.digest());
        assert_eq!(f.registry.latest("custodian-1").unwrap().claim, claim);
        assert_eq!(
            f.registry.metric("custodian-1", "reserves"),
            Some(Decimal::from(1_200))
        );
        assert_eq!(f.registry.last_nonce("custodian-1"), 1);
    }

    #[test]
    fn test_replay_rejected() {
        let f = fixture();
        let sep = f.registry.domain_separator();

        let first = claim(&f.clock, 5, 1_200);
        f.registry
            .submit(first.clone(), &first.sign(&sep, &f.key))
            .unwrap();

        // Exact replay
        assert!(matches!(
            f.registry.submit(first.clone(), &first.sign(&sep, &f.key)),
            Err(Error::NonceReplay { nonce: 5, last: 5, .. })
        ));

        // Lower nonce with different content
        let older = claim(&f.clock, 4, 900);
        assert!(matches!(
            f.registry.submit(older.clone(), &older.sign(&sep, &f.key)),
            Err(Error::NonceReplay { .. })
        ));

        assert_eq!(
            f.registry.latest("custodian-1").unwrap().claim.nonce,
            5
        );
    }

    #[test]
    fn test_signature_bound_to_domain() {
        let f = fixture();
        let claim = claim(&f.clock, 1, 1_200);
        let foreign = claim.sign(&domain("production").separator(), &f.key);
        assert!(matches!(
            f.registry.submit(claim, &foreign),
            Err(Error::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let f = fixture();
        let original = claim(&f.clock, 1, 1_200);
        let signature = original.sign(&f.registry.domain_separator(), &f.key);

        let mut tampered = original;
        tampered.payload.insert("reserves".to_string(), Decimal::from(9_999));
        assert!(f.registry.submit(tampered, &signature).is_err());
        assert!(f.registry.latest("custodian-1").is_none());
    }

    #[test]
    fn test_unknown_and_revoked_signer() {
        let f = fixture();
        let sep = f.registry.domain_separator();
        let mut claim = claim(&f.clock, 1, 1_200);
        claim.signer = "stranger".to_string();
        assert!(matches!(
            f.registry.submit(claim.clone(), &claim.sign(&sep, &f.key)),
            Err(Error::UnknownSigner(_))
        ));

        assert!(f
            .registry
            .revoke_signer(&Principal::new("admin"), "auditor")
            .unwrap());
        claim.signer = "auditor".to_string();
        assert!(matches!(
            f.registry.submit(claim.clone(), &claim.sign(&sep, &f.key)),
            Err(Error::UnknownSigner(_))
        ));
    }

    #[test]
    fn test_expired_claim_rejected() {
        let f = fixture();
        let claim = claim(&f.clock, 1, 1_200);
        let signature = claim.sign(&f.registry.domain_separator(), &f.key);
        f.clock.advance(Duration::hours(2));
        assert!(matches!(
            f.registry.submit(claim, &signature),
            Err(Error::AttestationExpired { .. })
        ));
    }

    #[test]
    fn test_oracle_reports_fresh_claims_only() {
        let f = fixture();
        let claim = claim(&f.clock, 1, 1_200);
        f.registry
            .submit(claim.clone(), &claim.sign(&f.registry.domain_separator(), &f.key))
            .unwrap();

        let (value, as_of) = f
            .registry
            .current_metric("custodian-1/reserves")
            .unwrap();
        assert_eq!(value, Decimal::from(1_200));
        assert_eq!(as_of, claim.period_end);
        assert!(f.registry.current_metric("custodian-1/missing").is_none());

        f.clock.advance(Duration::hours(2));
        assert!(!f.registry.is_fresh("custodian-1"));
        assert!(f.registry.current_metric("custodian-1/reserves").is_none());
    }

    #[test]
    fn test_inverted_period_rejected() {
        let f = fixture();
        let mut claim = claim(&f.clock, 1, 1_200);
        claim.period_start = claim.period_end + Duration::seconds(1);
        let signature = claim.sign(&f.registry.domain_separator(), &f.key);
        assert!(matches!(
            f.registry.submit(claim, &signature),
            Err(Error::InvalidAttestation(_))
        ));
    }
}
