use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use tracing::{debug, info, instrument, warn};

use super::backoff::{BackoffConfig, FailureLimiter};
use super::ledger::{
    EligibilityLedger, IdentityVerifier, DEFAULT_MAX_KEYS, DEFAULT_REGISTRATION_KEY_LEN,
};
use super::registry::Registry;
use super::session::{
    SessionId, SessionManager, SessionState, DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TIMEOUT,
};
use super::store::{ElectionStore, MemoryStore};
use super::tally::TallyStore;
use super::verifier::ProofVerifier;
use crate::crypto::{Challenge, Commitment, CryptoEngine, PublicKey, Solution};
use crate::{Error, Result};

/// Longest identity string accepted by [`Election::validate_id`].
pub const MAX_IDENTITY_LEN: usize = 256;

/// Longest registration key accepted by [`Election::register`].
pub const MAX_REGISTRATION_KEY_LEN: usize = 256;

/// Election parameters.
#[derive(Clone, Debug)]
pub struct ElectionConfig {
    /// Human-readable option labels, in ballot order. Votes are 1-based indices.
    pub options: Vec<String>,
    pub session_timeout: Duration,
    pub max_open_sessions: usize,
    pub max_voters: usize,
    /// Upper bound on registration keys issued over the election.
    pub max_keys: usize,
    pub registration_key_len: usize,
    /// Must stay below `session_timeout`; see [`ElectionConfig::validate`].
    pub backoff: BackoffConfig,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            options: vec!["Yes".to_string(), "No".to_string(), "Abstain".to_string()],
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            max_open_sessions: DEFAULT_MAX_SESSIONS,
            max_voters: 1_000_000,
            max_keys: DEFAULT_MAX_KEYS,
            registration_key_len: DEFAULT_REGISTRATION_KEY_LEN,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ElectionConfig {
    /// Checks that the parameters describe a runnable election.
    ///
    /// Proof-failure backoff is counted per credential, and anyone holding a
    /// voter's public key can spend that voter's failures. The longest backoff
    /// must therefore be shorter than a session's lifetime, so a blocked
    /// owner always gets a window in which to finish a vote.
    pub fn validate(&self) -> Result<()> {
        if self.options.is_empty() {
            return Err(Error::Config("at least one vote option is required".to_string()));
        }
        if u32::try_from(self.options.len()).is_err() {
            return Err(Error::Config("too many vote options".to_string()));
        }
        if self.session_timeout.is_zero() {
            return Err(Error::Config("session timeout cannot be zero".to_string()));
        }
        if self.max_open_sessions == 0 || self.max_voters == 0 || self.max_keys == 0 {
            return Err(Error::Config("capacity limits cannot be zero".to_string()));
        }
        if self.registration_key_len < 8 {
            return Err(Error::Config(
                "registration keys must be at least 8 characters".to_string(),
            ));
        }
        if self.backoff.max_backoff >= self.session_timeout {
            return Err(Error::Config(
                "maximum proof-failure backoff must be shorter than the session timeout"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Reply to a successful [`Election::vote`].
#[derive(Clone, Debug)]
pub struct VoteTicket {
    /// Server-drawn challenge the voter must answer.
    pub challenge: Challenge,
    /// Session the answer must be submitted against.
    pub session_id: SessionId,
}

/// Point-in-time counters for operators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElectionStats {
    pub issued_keys: usize,
    pub consumed_keys: usize,
    pub registered_voters: usize,
    pub open_sessions: usize,
    pub votes_cast: u64,
}

struct Inner<E: CryptoEngine> {
    engine: Arc<E>,
    options: Vec<String>,
    ledger: EligibilityLedger,
    registry: Registry,
    sessions: SessionManager,
    verifier: ProofVerifier<E>,
    tally: TallyStore,
    failures: FailureLimiter,
    store: Arc<dyn ElectionStore>,
}

/// The four voting operations and two read-only queries over shared election state.
///
/// Cloning is cheap; clones share the same state.
pub struct Election<E: CryptoEngine> {
    inner: Arc<Inner<E>>,
}

impl<E: CryptoEngine> Clone for Election<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: CryptoEngine> Election<E> {
    /// Creates an election whose state lives only in process memory.
    pub fn new(
        engine: E,
        identity_verifier: Arc<dyn IdentityVerifier>,
        config: ElectionConfig,
    ) -> Result<Self> {
        Self::with_store(engine, identity_verifier, config, Arc::new(MemoryStore::new()))
    }

    /// Creates an election persisting to `store`, resuming from whatever the
    /// store already holds.
    ///
    /// Issued and spent keys, registered voters, voting status and the tally
    /// are restored. Sessions and failure counters start empty. A deployment
    /// that must survive restarts supplies a durable store here.
    pub fn with_store(
        engine: E,
        identity_verifier: Arc<dyn IdentityVerifier>,
        config: ElectionConfig,
        store: Arc<dyn ElectionStore>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = Arc::new(engine);
        let option_count = config.options.len();
        let snapshot = store.load()?;

        let mut ledger = EligibilityLedger::new(
            identity_verifier,
            Arc::clone(&store),
            config.registration_key_len,
            config.max_keys,
        );
        ledger.restore(&snapshot)?;
        let mut registry = Registry::new(Arc::clone(&store), config.max_voters);
        registry.restore(&snapshot);
        let tally = TallyStore::restore(option_count, &snapshot.tally)?;

        info!(
            group = engine.name(),
            options = option_count,
            session_timeout_secs = config.session_timeout.as_secs(),
            restored_voters = snapshot.voters.len(),
            restored_votes = tally.total(),
            "Election opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                verifier: ProofVerifier::new(Arc::clone(&engine)),
                engine,
                options: config.options,
                ledger,
                registry,
                sessions: SessionManager::new(config.session_timeout, config.max_open_sessions),
                tally,
                failures: FailureLimiter::new(config.backoff),
                store,
            }),
        })
    }

    pub fn engine(&self) -> &E {
        &self.inner.engine
    }

    /// Issues the one-time registration key for an eligible identity.
    #[instrument(skip_all)]
    pub async fn validate_id(&self, identity: &str) -> Result<String> {
        if identity.is_empty() {
            return Err(Error::MalformedInput("identity cannot be empty".to_string()));
        }
        if identity.len() > MAX_IDENTITY_LEN {
            return Err(Error::MalformedInput("identity too long".to_string()));
        }
        if identity.chars().any(char::is_control) {
            return Err(Error::MalformedInput(
                "identity contains control characters".to_string(),
            ));
        }

        self.inner.ledger.validate_id(identity).await.map_err(|e| {
            debug!(error = %e, "Identity rejected");
            e
        })
    }

    /// Spends a registration key on a new anonymous credential.
    #[instrument(skip_all)]
    pub async fn register(&self, registration_key: &str, public_key: PublicKey) -> Result<()> {
        if registration_key.is_empty() || registration_key.len() > MAX_REGISTRATION_KEY_LEN {
            return Err(Error::UnknownRegistrationKey);
        }
        self.check_public_key(&public_key)?;
        if !self.inner.engine.validate_public_key(&public_key) {
            return Err(Error::MalformedInput(
                "public key is not a valid group credential".to_string(),
            ));
        }

        self.inner
            .registry
            .register(&self.inner.ledger, registration_key, public_key)
            .await
    }

    /// Opens an authentication session for casting `vote` with `public_key`.
    ///
    /// Any session the credential already had open is superseded.
    #[instrument(skip(self, public_key, commitment))]
    pub async fn vote(
        &self,
        vote: u32,
        public_key: &PublicKey,
        commitment: Commitment,
    ) -> Result<VoteTicket> {
        self.check_option(vote)?;
        self.check_public_key(public_key)?;
        let element_len = self.inner.engine.element_len();
        if !commitment.has_shape(element_len) {
            return Err(Error::MalformedInput(format!(
                "commitment values must be {element_len} bytes"
            )));
        }

        let credential = public_key.credential_id();
        let handle = self
            .inner
            .registry
            .voter(&credential)
            .await
            .ok_or(Error::UnregisteredCredential)?;
        self.inner.failures.check(&credential).await?;

        let mut voter = handle.lock().await;
        if voter.public_key() != public_key {
            return Err(Error::UnregisteredCredential);
        }
        if voter.has_voted() {
            return Err(Error::AlreadyVoted);
        }

        let challenge = self.inner.engine.random_challenge(&mut OsRng);
        let session_id = self
            .inner
            .sessions
            .open(&mut voter, credential, vote, commitment, challenge.clone())
            .await?;

        debug!("Opened authentication session");
        Ok(VoteTicket {
            challenge,
            session_id,
        })
    }

    /// Verifies the answer to a session's challenge and, if it holds, counts the vote.
    #[instrument(skip(self, session_id, solution))]
    pub async fn validate_vote(
        &self,
        session_id: &str,
        vote: u32,
        solution: Solution,
    ) -> Result<()> {
        let session_id = SessionId::parse(session_id)?;
        let scalar_len = self.inner.engine.scalar_len();
        if solution.as_bytes().len() != scalar_len {
            return Err(Error::MalformedInput(format!(
                "solution must be {scalar_len} bytes"
            )));
        }

        let credential = self.inner.sessions.credential_of(&session_id).await?;
        let handle = self
            .inner
            .registry
            .voter(&credential)
            .await
            .ok_or(Error::SessionNotFound)?;
        let mut voter = handle.lock().await;

        let session = match self.inner.sessions.lookup(&session_id).await {
            Ok(session) => session,
            Err(Error::SessionExpired) => {
                self.inner
                    .sessions
                    .close(&mut voter, &session_id, SessionState::Expired)
                    .await;
                return Err(Error::SessionExpired);
            }
            Err(e) => return Err(e),
        };
        if voter.open_session() != Some(&session_id) {
            return Err(Error::SessionNotFound);
        }

        if session.vote != vote {
            self.inner
                .sessions
                .close(&mut voter, &session_id, SessionState::Rejected)
                .await;
            warn!("Vote changed between challenge and answer, session rejected");
            return Err(Error::VoteMismatch);
        }

        if !self
            .inner
            .verifier
            .verify(&session, voter.public_key(), &solution)
        {
            self.inner
                .sessions
                .close(&mut voter, &session_id, SessionState::Rejected)
                .await;
            self.inner.failures.record_failure(&credential).await;
            warn!("Proof rejected");
            return Err(Error::ProofInvalid);
        }

        let Inner { tally, store, .. } = &*self.inner;
        self.inner
            .sessions
            .commit_with(&mut voter, &session_id, |record| {
                store.put_vote(&credential, session.vote)?;
                tally.increment(session.vote);
                record.mark_voted();
                Ok(())
            })
            .await?;
        drop(voter);

        self.inner.failures.clear(&credential).await;
        info!("Vote committed");
        Ok(())
    }

    /// Option labels in ballot order.
    pub fn vote_options(&self) -> &[String] {
        &self.inner.options
    }

    /// Current per-option counts, in the same order as [`Election::vote_options`].
    pub fn vote_results(&self) -> Vec<u64> {
        self.inner.tally.read()
    }

    /// Reclaims expired and terminal sessions. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let removed = self.inner.sessions.cleanup_expired().await;
        let pruned = self.inner.failures.prune().await;
        if removed > 0 || pruned > 0 {
            debug!(removed, pruned, "Reclaimed stale election state");
        }
        removed
    }

    pub async fn stats(&self) -> ElectionStats {
        let (issued_keys, consumed_keys) = self.inner.ledger.key_counts().await;
        ElectionStats {
            issued_keys,
            consumed_keys,
            registered_voters: self.inner.registry.voter_count().await,
            open_sessions: self.inner.sessions.open_count().await,
            votes_cast: self.inner.tally.total(),
        }
    }

    fn check_option(&self, vote: u32) -> Result<()> {
        let option_count = self.inner.options.len();
        if vote == 0 || vote as usize > option_count {
            return Err(Error::InvalidOption {
                option: vote,
                option_count,
            });
        }
        Ok(())
    }

    fn check_public_key(&self, public_key: &PublicKey) -> Result<()> {
        let element_len = self.inner.engine.element_len();
        if !public_key.has_shape(element_len) {
            return Err(Error::MalformedInput(format!(
                "public key components must be {element_len} bytes"
            )));
        }
        Ok(())
    }
}
