//! Cryptographic operations
//!
//! This module provides:
//! - Ed25519 key pair generation, signing, and verification
//! - SHA-256 hashing
//! - Domain-separated typed digests for signed claims
//!
//! Typed digests follow `SHA256(0x19 ‖ 0x01 ‖ domain_separator ‖ struct_hash)`, where
//! `struct_hash = SHA256(type_tag ‖ field₁ ‖ … ‖ fieldₙ)` with every variable-length field
//! length-prefixed. The domain separator binds a signature to one deployment.

use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Ed25519 key pair for signing
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }

    /// Verify a signature made by this key
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(message, &dalek_sig)
            .map_err(|e| Error::SignatureError(format!("Verification failed: {}", e)))
    }
}

/// Digital signature (Ed25519), hex encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify against a public key
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> bool {
        let signature = DalekSignature::from_bytes(&self.bytes);

        let verifying_key = match VerifyingKey::from_bytes(public_key) {
            Ok(key) => key,
            Err(_) => return false,
        };

        verifying_key.verify(message, &signature).is_ok()
    }

    /// SHA-256 of the signature bytes, kept for audit
    pub fn digest(&self) -> [u8; 32] {
        hash_bytes(&self.bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.bytes[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.bytes))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let raw = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Self { bytes })
    }
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Signing domain of one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    /// Protocol name
    pub name: String,
    /// Protocol version
    pub version: String,
    /// Environment (e.g. `production`, `staging`)
    pub environment: String,
    /// Deployment instance identifier
    pub instance: String,
}

impl Domain {
    /// Create a domain
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        environment: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            environment: environment.into(),
            instance: instance.into(),
        }
    }

    /// Domain separator: differs whenever any domain field differs
    pub fn separator(&self) -> [u8; 32] {
        StructHasher::new("Domain(string name,string version,string environment,string instance)")
            .str(&self.name)
            .str(&self.version)
            .str(&self.environment)
            .str(&self.instance)
            .finish()
    }
}

/// Incremental struct hash with length-prefixed fields
#[derive(Clone)]
pub struct StructHasher {
    hasher: Sha256,
}

impl fmt::Debug for StructHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StructHasher")
    }
}

impl StructHasher {
    /// Start a struct hash with its type tag
    pub fn new(type_tag: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(hash_bytes(type_tag.as_bytes()));
        Self { hasher }
    }

    /// Append a string field
    pub fn str(mut self, value: &str) -> Self {
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    /// Append an unsigned integer field
    pub fn u64(mut self, value: u64) -> Self {
        self.hasher.update(value.to_be_bytes());
        self
    }

    /// Append a signed integer field
    pub fn i64(mut self, value: i64) -> Self {
        self.hasher.update(value.to_be_bytes());
        self
    }

    /// Append a fixed 32-byte field
    pub fn bytes32(mut self, value: &[u8; 32]) -> Self {
        self.hasher.update(value);
        self
    }

    /// Finish the struct hash
    pub fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

/// Final digest a signer signs: `SHA256(0x19 ‖ 0x01 ‖ domain_separator ‖ struct_hash)`
pub fn typed_digest(domain_separator: &[u8; 32], struct_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x19u8, 0x01u8]);
    hasher.update(domain_separator);
    hasher.update(struct_hash);
    hasher.finalize().into()
}
