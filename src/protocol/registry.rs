use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use super::ledger::EligibilityLedger;
use super::session::SessionId;
use super::store::{ElectionSnapshot, ElectionStore};
use crate::crypto::{CredentialId, PublicKey};
use crate::{Error, Result};

/// A registered credential and its voting progress.
///
/// Records are never removed during an election. All mutation happens while
/// the record's own mutex is held, which serializes every state change of a
/// single credential.
#[derive(Debug)]
pub struct VoterRecord {
    public_key: PublicKey,
    has_voted: bool,
    open_session: Option<SessionId>,
}

impl VoterRecord {
    pub(crate) fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            has_voted: false,
            open_session: None,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn has_voted(&self) -> bool {
        self.has_voted
    }

    /// Id of the session currently authorized to commit this credential's vote.
    pub fn open_session(&self) -> Option<&SessionId> {
        self.open_session.as_ref()
    }

    pub(crate) fn set_open_session(&mut self, session: Option<SessionId>) {
        self.open_session = session;
    }

    pub(crate) fn mark_voted(&mut self) {
        self.has_voted = true;
        self.open_session = None;
    }
}

/// Shared handle to one credential's record.
pub type VoterHandle = Arc<Mutex<VoterRecord>>;

/// Registered credentials, indexed by [`CredentialId`].
pub struct Registry {
    voters: RwLock<HashMap<CredentialId, VoterHandle>>,
    store: Arc<dyn ElectionStore>,
    max_voters: usize,
}

impl Registry {
    pub fn new(store: Arc<dyn ElectionStore>, max_voters: usize) -> Self {
        Self {
            voters: RwLock::new(HashMap::new()),
            store,
            max_voters,
        }
    }

    /// Reloads registered voters and their voting status from a snapshot.
    pub(crate) fn restore(&mut self, snapshot: &ElectionSnapshot) {
        let voters = self.voters.get_mut();
        for stored in snapshot.voters.values() {
            let mut record = VoterRecord::new(stored.public_key.clone());
            if stored.has_voted {
                record.mark_voted();
            }
            voters.insert(
                stored.public_key.credential_id(),
                Arc::new(Mutex::new(record)),
            );
        }
    }

    /// Spends `registration_key` on `public_key`.
    ///
    /// The key is consumed and the voter inserted under both the ledger and
    /// registry locks, always taken in that order, once the store has
    /// accepted the registration. If the credential is already registered,
    /// or the store fails, the key stays spendable.
    pub async fn register(
        &self,
        ledger: &EligibilityLedger,
        registration_key: &str,
        public_key: PublicKey,
    ) -> Result<()> {
        let redemption = ledger.redeem(registration_key).await?;
        let mut voters = self.voters.write().await;

        let credential = public_key.credential_id();
        if voters.contains_key(&credential) {
            return Err(Error::CredentialAlreadyRegistered);
        }

        if voters.len() >= self.max_voters {
            return Err(Error::CapacityExceeded(format!(
                "registry is full ({} voters)",
                self.max_voters
            )));
        }

        self.store.put_registration(registration_key, &public_key)?;
        voters.insert(credential, Arc::new(Mutex::new(VoterRecord::new(public_key))));
        redemption.commit();

        info!(voters = voters.len(), "Registered credential");
        Ok(())
    }

    /// Returns the record for `credential`, if registered.
    pub async fn voter(&self, credential: &CredentialId) -> Option<VoterHandle> {
        self.voters.read().await.get(credential).cloned()
    }

    /// Number of registered credentials.
    pub async fn voter_count(&self) -> usize {
        self.voters.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ledger::LengthRule;
    use crate::protocol::store::MemoryStore;

    fn public_key(seed: u8) -> PublicKey {
        PublicKey::new(vec![seed; 2], vec![2; 2], vec![3; 2], vec![4; 2])
    }

    fn ledger_on(store: Arc<dyn ElectionStore>) -> EligibilityLedger {
        EligibilityLedger::new(Arc::new(LengthRule::default()), store, 16, 100)
    }

    fn ledger() -> EligibilityLedger {
        ledger_on(Arc::new(MemoryStore::new()))
    }

    fn registry(max_voters: usize) -> Registry {
        Registry::new(Arc::new(MemoryStore::new()), max_voters)
    }

    /// Store that accepts key issuance but fails every later write.
    struct ReadOnlyStore(MemoryStore);

    impl ElectionStore for ReadOnlyStore {
        fn load(&self) -> Result<ElectionSnapshot> {
            self.0.load()
        }

        fn put_issued_key(&self, identity_digest: &[u8; 32], key: &str) -> Result<()> {
            self.0.put_issued_key(identity_digest, key)
        }

        fn put_registration(&self, _key: &str, _public_key: &PublicKey) -> Result<()> {
            Err(Error::Storage("read-only".to_string()))
        }

        fn put_vote(&self, _credential: &CredentialId, _option: u32) -> Result<()> {
            Err(Error::Storage("read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn register_consumes_key() {
        let ledger = ledger();
        let registry = registry(10);
        let key = ledger.validate_id("ID-01").await.unwrap();

        registry.register(&ledger, &key, public_key(1)).await.unwrap();
        assert_eq!(registry.voter_count().await, 1);

        let err = registry.register(&ledger, &key, public_key(2)).await;
        assert_eq!(err, Err(Error::KeyAlreadyConsumed));

        let voter = registry.voter(&public_key(1).credential_id()).await.unwrap();
        let voter = voter.lock().await;
        assert!(!voter.has_voted());
        assert!(voter.open_session().is_none());
    }

    #[tokio::test]
    async fn duplicate_credential_keeps_key_spendable() {
        let ledger = ledger();
        let registry = registry(10);
        let first = ledger.validate_id("ID-01").await.unwrap();
        let second = ledger.validate_id("ID-02").await.unwrap();

        registry.register(&ledger, &first, public_key(1)).await.unwrap();
        assert_eq!(
            registry.register(&ledger, &second, public_key(1)).await,
            Err(Error::CredentialAlreadyRegistered)
        );

        registry.register(&ledger, &second, public_key(2)).await.unwrap();
        assert_eq!(registry.voter_count().await, 2);
    }

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let ledger = ledger();
        let registry = registry(10);
        assert_eq!(
            registry.register(&ledger, "bogus", public_key(1)).await,
            Err(Error::UnknownRegistrationKey)
        );
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let ledger = ledger();
        let registry = registry(1);
        let first = ledger.validate_id("ID-01").await.unwrap();
        let second = ledger.validate_id("ID-02").await.unwrap();

        registry.register(&ledger, &first, public_key(1)).await.unwrap();
        assert!(matches!(
            registry.register(&ledger, &second, public_key(2)).await,
            Err(Error::CapacityExceeded(_))
        ));
        assert_eq!(ledger.key_counts().await, (2, 1));
    }

    #[tokio::test]
    async fn failed_write_leaves_key_spendable() {
        let store: Arc<dyn ElectionStore> = Arc::new(ReadOnlyStore(MemoryStore::new()));
        let ledger = ledger_on(Arc::clone(&store));
        let registry = Registry::new(store, 10);
        let key = ledger.validate_id("ID-01").await.unwrap();

        assert!(matches!(
            registry.register(&ledger, &key, public_key(1)).await,
            Err(Error::Storage(_))
        ));
        assert_eq!(registry.voter_count().await, 0);
        assert_eq!(ledger.key_counts().await, (1, 0));
    }

    #[tokio::test]
    async fn restore_keeps_voting_status() {
        let store = Arc::new(MemoryStore::new());
        store.put_registration("K1", &public_key(1)).unwrap();
        store.put_registration("K2", &public_key(2)).unwrap();
        store
            .put_vote(&public_key(2).credential_id(), 1)
            .unwrap();

        let mut registry = Registry::new(store.clone(), 10);
        registry.restore(&store.load().unwrap());
        assert_eq!(registry.voter_count().await, 2);

        let fresh = registry.voter(&public_key(1).credential_id()).await.unwrap();
        assert!(!fresh.lock().await.has_voted());
        let voted = registry.voter(&public_key(2).credential_id()).await.unwrap();
        assert!(voted.lock().await.has_voted());
    }
}
