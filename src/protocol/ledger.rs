use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::store::{ElectionSnapshot, ElectionStore};
use crate::{Error, Result};

/// Default registration key length, in alphanumeric characters.
pub const DEFAULT_REGISTRATION_KEY_LEN: usize = 16;

/// Default bound on registration keys issued over an election.
pub const DEFAULT_MAX_KEYS: usize = 1_000_000;

/// External proof-of-eligibility check for a real-world identity.
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Returns true if `identity` is eligible to vote.
    fn verify_identity(&self, identity: &str) -> bool;
}

/// Simulated eligibility check accepting identities of an exact length.
#[derive(Clone, Debug)]
pub struct LengthRule {
    length: usize,
}

impl LengthRule {
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl Default for LengthRule {
    fn default() -> Self {
        Self::new(5)
    }
}

impl IdentityVerifier for LengthRule {
    fn verify_identity(&self, identity: &str) -> bool {
        identity.chars().count() == self.length
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyState {
    Unconsumed,
    Consumed,
}

#[derive(Default)]
struct LedgerInner {
    /// SHA-256 of the identity -> issued registration key.
    issued: HashMap<[u8; 32], String>,
    keys: HashMap<String, KeyState>,
}

/// Tracks validated identities and their one-time registration keys.
///
/// Identities are stored only as SHA-256 digests.
pub struct EligibilityLedger {
    verifier: Arc<dyn IdentityVerifier>,
    store: Arc<dyn ElectionStore>,
    key_len: usize,
    max_keys: usize,
    inner: Mutex<LedgerInner>,
}

impl EligibilityLedger {
    /// Creates an empty ledger backed by `verifier`, persisting to `store`.
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn ElectionStore>,
        key_len: usize,
        max_keys: usize,
    ) -> Self {
        Self {
            verifier,
            store,
            key_len,
            max_keys,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Reloads issued and consumed keys from a snapshot.
    pub(crate) fn restore(&mut self, snapshot: &ElectionSnapshot) -> Result<()> {
        let inner = self.inner.get_mut();
        for (digest, key) in &snapshot.issued_keys {
            let mut bytes = [0u8; 32];
            hex::decode_to_slice(digest, &mut bytes)
                .map_err(|_| Error::Storage("malformed identity digest".to_string()))?;
            let state = if snapshot.consumed_keys.contains(key) {
                KeyState::Consumed
            } else {
                KeyState::Unconsumed
            };
            inner.keys.insert(key.clone(), state);
            inner.issued.insert(bytes, key.clone());
        }
        if snapshot.consumed_keys.iter().any(|key| !inner.keys.contains_key(key)) {
            return Err(Error::Storage(
                "consumed key was never issued".to_string(),
            ));
        }
        Ok(())
    }

    /// Issues the registration key for `identity`.
    ///
    /// Calling this again for the same identity returns the key issued the
    /// first time, whether or not it has been consumed since.
    pub async fn validate_id(&self, identity: &str) -> Result<String> {
        if !self.verifier.verify_identity(identity) {
            return Err(Error::IneligibleIdentity);
        }

        let digest = identity_digest(identity);
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.issued.get(&digest) {
            debug!("Re-issuing registration key to a validated identity");
            return Ok(existing.clone());
        }

        if inner.keys.len() >= self.max_keys {
            return Err(Error::CapacityExceeded(format!(
                "registration key limit reached ({})",
                self.max_keys
            )));
        }

        let key = loop {
            let candidate = generate_key(self.key_len);
            if !inner.keys.contains_key(&candidate) {
                break candidate;
            }
        };

        self.store.put_issued_key(&digest, &key)?;
        inner.keys.insert(key.clone(), KeyState::Unconsumed);
        inner.issued.insert(digest, key.clone());
        info!("Issued registration key");

        Ok(key)
    }

    /// Locks the ledger and checks that `key` may be spent.
    ///
    /// The key is consumed only when [`Redemption::commit`] is called; dropping
    /// the redemption leaves it spendable. The ledger stays locked for the
    /// redemption's lifetime, so concurrent redemptions of one key serialize.
    pub(crate) async fn redeem(&self, key: &str) -> Result<Redemption<'_>> {
        let inner = self.inner.lock().await;

        match inner.keys.get(key) {
            None => Err(Error::UnknownRegistrationKey),
            Some(KeyState::Consumed) => Err(Error::KeyAlreadyConsumed),
            Some(KeyState::Unconsumed) => Ok(Redemption {
                inner,
                key: key.to_string(),
            }),
        }
    }

    /// Returns `(issued, consumed)` key counts.
    pub async fn key_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        let consumed = inner
            .keys
            .values()
            .filter(|state| **state == KeyState::Consumed)
            .count();
        (inner.keys.len(), consumed)
    }
}

/// A registration key checked out for spending.
pub(crate) struct Redemption<'a> {
    inner: MutexGuard<'a, LedgerInner>,
    key: String,
}

impl Redemption<'_> {
    /// Marks the key consumed and releases the ledger.
    pub(crate) fn commit(mut self) {
        let key = std::mem::take(&mut self.key);
        self.inner.keys.insert(key, KeyState::Consumed);
    }
}

fn identity_digest(identity: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"anonvote-identity-v1");
    hasher.update(identity.as_bytes());
    hasher.finalize().into()
}

fn generate_key(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
