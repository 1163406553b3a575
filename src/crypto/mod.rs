//! Crypto Engine seam.
//!
//! The protocol core never interprets algebraic values. It moves opaque,
//! fixed-width byte strings between the wire and a [`CryptoEngine`], which owns
//! key generation, commitments and the sigma-protocol equations.

use std::path::Path;

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::protocol::store::write_private;
use crate::{Error, Result};

/// Modular-arithmetic engine over a prime-order subgroup of Z_p^*.
pub mod modp;

pub use modp::ModpEngine;

/// Public credential `(a, b, alpha, beta)` as serialized group elements.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "hex")]
    a: Vec<u8>,
    #[serde(with = "hex")]
    b: Vec<u8>,
    #[serde(with = "hex")]
    alpha: Vec<u8>,
    #[serde(with = "hex")]
    beta: Vec<u8>,
}

impl PublicKey {
    /// Creates a public key from its four serialized components.
    pub fn new(a: Vec<u8>, b: Vec<u8>, alpha: Vec<u8>, beta: Vec<u8>) -> Self {
        Self { a, b, alpha, beta }
    }

    pub fn a(&self) -> &[u8] {
        &self.a
    }

    pub fn b(&self) -> &[u8] {
        &self.b
    }

    pub fn alpha(&self) -> &[u8] {
        &self.alpha
    }

    pub fn beta(&self) -> &[u8] {
        &self.beta
    }

    /// Returns true if every component is exactly `element_len` bytes long.
    pub fn has_shape(&self, element_len: usize) -> bool {
        [&self.a, &self.b, &self.alpha, &self.beta]
            .iter()
            .all(|c| c.len() == element_len)
    }

    /// Derives the fixed-size identifier the registry indexes credentials by.
    ///
    /// Components are length-prefixed so that no two distinct keys share a digest input.
    pub fn credential_id(&self) -> CredentialId {
        let mut hasher = Sha256::new();
        hasher.update(b"anonvote-credential-v1");
        for component in [&self.a, &self.b, &self.alpha, &self.beta] {
            hasher.update((component.len() as u64).to_be_bytes());
            hasher.update(component);
        }
        CredentialId(hasher.finalize().into())
    }
}

/// SHA-256 fingerprint of a [`PublicKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialId([u8; 32]);

impl CredentialId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// First sigma-protocol message `(ka, kb)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commitment {
    ka: Vec<u8>,
    kb: Vec<u8>,
}

impl Commitment {
    pub fn new(ka: Vec<u8>, kb: Vec<u8>) -> Self {
        Self { ka, kb }
    }

    pub fn ka(&self) -> &[u8] {
        &self.ka
    }

    pub fn kb(&self) -> &[u8] {
        &self.kb
    }

    /// Returns true if both values are exactly `element_len` bytes long.
    pub fn has_shape(&self, element_len: usize) -> bool {
        self.ka.len() == element_len && self.kb.len() == element_len
    }
}

/// Secret commitment randomness `k`. Never leaves the voter's client.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Nonce(Vec<u8>);

impl Nonce {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Output of [`CryptoEngine::commit`]: the public commitment plus its nonce.
pub struct ChallengeCommitment {
    /// Values sent to the server with a vote.
    pub commitment: Commitment,
    /// Randomness kept by the client to answer the challenge.
    pub nonce: Nonce,
}

/// Server-chosen challenge scalar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge(Vec<u8>);

impl Challenge {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Prover response to a challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Solution(Vec<u8>);

impl Solution {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Voter secret together with the public key derived from it.
///
/// Only ever held by the client. The secret scalar is zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    #[serde(with = "hex")]
    secret: Vec<u8>,
    #[zeroize(skip)]
    public: PublicKey,
}

impl SecretKey {
    pub fn new(secret: Vec<u8>, public: PublicKey) -> Self {
        Self { secret, public }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Writes the key to a new JSON file readable by the owner only.
    ///
    /// Refuses to replace an existing file, which may hold another credential.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = Zeroizing::new(
            serde_json::to_vec_pretty(self)
                .map_err(|e| Error::Storage(format!("cannot encode key: {e}")))?,
        );
        write_private(path, &json, false).map_err(|e| {
            Error::Storage(format!("cannot write key file {}: {e}", path.display()))
        })
    }

    /// Reads a key written by [`SecretKey::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let json = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            Error::Storage(format!("cannot read key file {}: {e}", path.display()))
        })?);
        serde_json::from_str(&json)
            .map_err(|e| Error::MalformedInput(format!("invalid key file: {e}")))
    }
}

/// Group arithmetic behind the voting protocol.
///
/// Implementations must satisfy the sigma-protocol contract: `verify` returns
/// true for `(commit, random_challenge, respond)` produced with the secret
/// matching the public key, and is infeasible to satisfy otherwise.
pub trait CryptoEngine: Send + Sync + 'static {
    /// Human-readable group name.
    fn name(&self) -> &'static str;

    /// Serialized width of a group element.
    fn element_len(&self) -> usize;

    /// Serialized width of a scalar.
    fn scalar_len(&self) -> usize;

    /// Generates a fresh secret key and its public key.
    fn generate_keypair<R: RngCore + CryptoRng>(&self, rng: &mut R) -> SecretKey;

    /// Checks that a public key decodes to valid, non-identity subgroup elements.
    fn validate_public_key(&self, public_key: &PublicKey) -> bool;

    /// Produces the first protocol message and its secret nonce.
    fn commit<R: RngCore + CryptoRng>(
        &self,
        secret_key: &SecretKey,
        rng: &mut R,
    ) -> ChallengeCommitment;

    /// Draws a uniformly random challenge.
    fn random_challenge<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Challenge;

    /// Answers `challenge` for the commitment made with `nonce`.
    fn respond(&self, secret_key: &SecretKey, nonce: &Nonce, challenge: &Challenge) -> Solution;

    /// Checks a proof transcript against a public key.
    fn verify(
        &self,
        public_key: &PublicKey,
        commitment: &Commitment,
        challenge: &Challenge,
        solution: &Solution,
    ) -> bool;
}
