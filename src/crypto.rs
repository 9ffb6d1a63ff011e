//! Cryptographic capabilities for the ledger core
//!
//! Hashing and vote signature checks are injected behind traits so the
//! ledger and the consensus engine never hard-code a scheme.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Result, SdupiError};
use crate::round::Vote;
use crate::types::{Hash, ValidatorId};

/// Collision-resistant hash used for DAG node content hashes
pub trait ContentHasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> Hash;

    fn name(&self) -> &'static str;
}

/// SHA-256 content hasher
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, data: &[u8]) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn name(&self) -> &'static str {
        "sha256"
    }
}

/// BLAKE3 content hasher
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn hash(&self, data: &[u8]) -> Hash {
        *blake3::hash(data).as_bytes()
    }

    fn name(&self) -> &'static str {
        "blake3"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn hasher(&self) -> Arc<dyn ContentHasher> {
        match self {
            HashAlgorithm::Sha256 => Arc::new(Sha256Hasher),
            HashAlgorithm::Blake3 => Arc::new(Blake3Hasher),
        }
    }
}

/// Checks that a vote was really cast by the validator it names
pub trait VoteVerifier: Send + Sync {
    fn verify(&self, vote: &Vote) -> bool;
}

/// Verifies ed25519 signatures over [`Vote::signing_bytes`], treating the
/// validator id as the public key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519VoteVerifier;

impl VoteVerifier for Ed25519VoteVerifier {
    fn verify(&self, vote: &Vote) -> bool {
        match verify_signature(vote.validator.as_bytes(), &vote.signing_bytes(), &vote.signature) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::debug!("Malformed vote signature from {}: {}", vote.validator.short(), e);
                false
            }
        }
    }
}

/// Accepts every vote. For transports that authenticate peers themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl VoteVerifier for AcceptAllVerifier {
    fn verify(&self, _vote: &Vote) -> bool {
        true
    }
}

/// Validator key pair used to sign votes
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate new key pair
    ///
    /// # Example
    /// ```
    /// use sdupi::crypto::KeyPair;
    ///
    /// let keypair = KeyPair::generate();
    /// let id = keypair.validator_id();
    /// assert_eq!(id.as_bytes().len(), 32);
    /// ```
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let mut secret_bytes = [0u8; 32];
        csprng.fill_bytes(&mut secret_bytes);
        Self::from_seed(secret_bytes)
    }

    /// Deterministic key pair from a 32-byte secret
    pub fn from_seed(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Validator identity derived from the public key
    pub fn validator_id(&self) -> ValidatorId {
        ValidatorId(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign data with this key pair, returning a 64-byte ed25519 signature
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Verify a signature
///
/// Returns `Ok(true)` if the signature is valid, `Ok(false)` if invalid, or an
/// error if the inputs are malformed.
///
/// # Example
/// ```
/// use sdupi::crypto::{KeyPair, verify_signature};
///
/// let keypair = KeyPair::generate();
/// let message = b"prepare round 7";
/// let signature = keypair.sign(message);
/// let public_key = keypair.verifying_key().to_bytes();
///
/// assert!(verify_signature(&public_key, message, &signature).unwrap());
/// assert!(!verify_signature(&public_key, b"commit round 7", &signature).unwrap());
/// ```
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    let verifying_key = VerifyingKey::from_bytes(
        public_key
            .try_into()
            .map_err(|_| SdupiError::Crypto("Invalid public key length".to_string()))?,
    )
    .map_err(|e| SdupiError::Crypto(format!("Invalid public key: {}", e)))?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SdupiError::Crypto("Invalid signature length".to_string()))?;
    let sig = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(message, &sig).is_ok())
}
