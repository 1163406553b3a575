use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::registry::VoterRecord;
use crate::crypto::{Challenge, Commitment, CredentialId};
use crate::{Error, Result};

/// Default lifetime of an authentication session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound on session records held at once.
pub const DEFAULT_MAX_SESSIONS: usize = 100_000;

const SESSION_ID_BYTES: usize = 32;

/// Unguessable authentication session identifier (64 hex characters).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parses a client-supplied session id.
    pub fn parse(raw: &str) -> Result<Self> {
        let well_formed = raw.len() == SESSION_ID_BYTES * 2
            && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(Error::MalformedInput(
                "session id must be 64 lowercase hex characters".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Session ids are bearer secrets until committed; keep them out of logs.
impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}..)", &self.0[..8])
    }
}

/// Lifecycle of an authentication session.
///
/// `Open` is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Committed,
    Rejected,
    Expired,
}

/// One in-flight vote attempt.
#[derive(Clone, Debug)]
pub struct AuthSession {
    pub id: SessionId,
    /// 1-based option the session was opened for.
    pub vote: u32,
    pub credential: CredentialId,
    pub commitment: Commitment,
    pub challenge: Challenge,
    pub created_at: Instant,
    pub state: SessionState,
}

impl AuthSession {
    /// Returns true once `timeout` has elapsed since creation.
    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= timeout
    }
}

/// Opens, expires and closes authentication sessions.
///
/// Callers must hold the owning credential's [`VoterRecord`] lock around
/// [`SessionManager::open`] and [`SessionManager::close`]; the record's
/// `open_session` pointer is what makes a session current.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, AuthSession>>,
    timeout: Duration,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
            max_sessions,
        }
    }

    /// Opens a session for `voter`, superseding any session it already had.
    pub async fn open(
        &self,
        voter: &mut VoterRecord,
        credential: CredentialId,
        vote: u32,
        commitment: Commitment,
        challenge: Challenge,
    ) -> Result<SessionId> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();

        if let Some(previous) = voter.open_session().cloned() {
            if sessions.remove(&previous).is_some() {
                debug!("Superseded open session");
            }
            voter.set_open_session(None);
        }

        if sessions.len() >= self.max_sessions {
            let timeout = self.timeout;
            sessions.retain(|_, s| s.state == SessionState::Open && !s.is_expired(timeout, now));
            if sessions.len() >= self.max_sessions {
                return Err(Error::CapacityExceeded(format!(
                    "too many open sessions ({})",
                    self.max_sessions
                )));
            }
        }

        let mut id = SessionId::generate();
        while sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        sessions.insert(
            id.clone(),
            AuthSession {
                id: id.clone(),
                vote,
                credential,
                commitment,
                challenge,
                created_at: now,
                state: SessionState::Open,
            },
        );
        voter.set_open_session(Some(id.clone()));

        Ok(id)
    }

    /// Returns the credential a session belongs to, without checking its state.
    pub async fn credential_of(&self, id: &SessionId) -> Result<CredentialId> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|s| s.credential)
            .ok_or(Error::SessionNotFound)
    }

    /// Returns a snapshot of an open, unexpired session.
    ///
    /// An open session found past its timeout is transitioned to `Expired`.
    pub async fn lookup(&self, id: &SessionId) -> Result<AuthSession> {
        let now = Instant::now();
        {
            let sessions = self.sessions.read().await;
            let session = sessions.get(id).ok_or(Error::SessionNotFound)?;
            match session.state {
                SessionState::Open if !session.is_expired(self.timeout, now) => {
                    return Ok(session.clone());
                }
                SessionState::Open | SessionState::Expired => {}
                SessionState::Committed | SessionState::Rejected => {
                    return Err(Error::SessionNotFound);
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            if session.state == SessionState::Open {
                debug!("Session expired");
                session.state = SessionState::Expired;
            }
        }
        Err(Error::SessionExpired)
    }

    /// Moves the current session of `voter` into a terminal state.
    ///
    /// Committed and rejected sessions are dropped at once. Expired ones are
    /// kept, answering [`Error::SessionExpired`], until the next sweep.
    pub async fn close(&self, voter: &mut VoterRecord, id: &SessionId, state: SessionState) {
        let mut sessions = self.sessions.write().await;
        Self::close_locked(&mut sessions, voter, id, state);
    }

    /// Runs `commit` and closes the session as `Committed` in one step.
    ///
    /// Re-checks that `id` is still the voter's current, unexpired session
    /// after the session table lock is taken. Nothing awaits between that
    /// check and the state changes, so the commit cannot be cancelled halfway.
    /// If `commit` fails the session stays open and the error is returned.
    pub async fn commit_with<F>(
        &self,
        voter: &mut VoterRecord,
        id: &SessionId,
        commit: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut VoterRecord) -> Result<()>,
    {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();

        if voter.open_session() != Some(id) {
            return Err(Error::SessionNotFound);
        }
        let session = sessions.get_mut(id).ok_or(Error::SessionNotFound)?;
        if session.state != SessionState::Open {
            return Err(Error::SessionNotFound);
        }
        if session.is_expired(self.timeout, now) {
            Self::close_locked(&mut sessions, voter, id, SessionState::Expired);
            return Err(Error::SessionExpired);
        }

        commit(voter)?;
        Self::close_locked(&mut sessions, voter, id, SessionState::Committed);
        Ok(())
    }

    fn close_locked(
        sessions: &mut HashMap<SessionId, AuthSession>,
        voter: &mut VoterRecord,
        id: &SessionId,
        state: SessionState,
    ) {
        if voter.open_session() == Some(id) {
            voter.set_open_session(None);
        }
        match state {
            SessionState::Expired => {
                if let Some(session) = sessions.get_mut(id) {
                    session.state = SessionState::Expired;
                }
            }
            SessionState::Committed | SessionState::Rejected => {
                sessions.remove(id);
            }
            SessionState::Open => {}
        }
        debug!(?state, "Closed session");
    }

    /// Drops expired and terminal session records. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let timeout = self.timeout;
        let before = sessions.len();
        sessions.retain(|_, s| s.state == SessionState::Open && !s.is_expired(timeout, now));
        before - sessions.len()
    }

    /// Number of sessions that are open and not yet past their timeout.
    pub async fn open_count(&self) -> usize {
        let now = Instant::now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state == SessionState::Open && !s.is_expired(self.timeout, now))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PublicKey;

    fn voter() -> (VoterRecord, CredentialId) {
        let public_key = PublicKey::new(vec![1], vec![2], vec![3], vec![4]);
        let credential = public_key.credential_id();
        (VoterRecord::new(public_key), credential)
    }

    fn commitment() -> Commitment {
        Commitment::new(vec![8], vec![4])
    }

    fn challenge() -> Challenge {
        Challenge::from_bytes(vec![4])
    }

    fn mark_voted(voter: &mut VoterRecord) -> Result<()> {
        voter.mark_voted();
        Ok(())
    }

    #[test]
    fn session_id_parsing() {
        let id = SessionId::generate();
        assert_eq!(SessionId::parse(id.as_str()).unwrap(), id);
        assert!(SessionId::parse("abc").is_err());
        assert!(SessionId::parse(&"G".repeat(64)).is_err());
        assert!(SessionId::parse(&"AB".repeat(32)).is_err());
    }

    #[test]
    fn session_id_debug_is_truncated() {
        let id = SessionId::generate();
        let rendered = format!("{id:?}");
        assert!(!rendered.contains(id.as_str()));
    }

    #[tokio::test]
    async fn open_supersedes_previous_session() {
        let manager = SessionManager::new(DEFAULT_SESSION_TIMEOUT, 10);
        let (mut voter, credential) = voter();

        let first = manager
            .open(&mut voter, credential, 1, commitment(), challenge())
            .await
            .unwrap();
        let second = manager
            .open(&mut voter, credential, 2, commitment(), challenge())
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(voter.open_session(), Some(&second));
        assert!(matches!(
            manager.lookup(&first).await,
            Err(Error::SessionNotFound)
        ));
        assert_eq!(manager.lookup(&second).await.unwrap().vote, 2);
        assert_eq!(manager.open_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_expires_stale_sessions() {
        let manager = SessionManager::new(Duration::from_secs(30), 10);
        let (mut voter, credential) = voter();
        let id = manager
            .open(&mut voter, credential, 1, commitment(), challenge())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(manager.lookup(&id).await.is_ok());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(manager.lookup(&id).await, Err(Error::SessionExpired)));
        assert!(matches!(manager.lookup(&id).await, Err(Error::SessionExpired)));

        assert_eq!(manager.cleanup_expired().await, 1);
        assert!(matches!(manager.lookup(&id).await, Err(Error::SessionNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn commit_refuses_expired_session() {
        let manager = SessionManager::new(Duration::from_secs(30), 10);
        let (mut voter, credential) = voter();
        let id = manager
            .open(&mut voter, credential, 1, commitment(), challenge())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let result = manager.commit_with(&mut voter, &id, mark_voted).await;

        assert!(matches!(result, Err(Error::SessionExpired)));
        assert!(!voter.has_voted());
        assert!(voter.open_session().is_none());
    }

    #[tokio::test]
    async fn commit_closes_session() {
        let manager = SessionManager::new(DEFAULT_SESSION_TIMEOUT, 10);
        let (mut voter, credential) = voter();
        let id = manager
            .open(&mut voter, credential, 1, commitment(), challenge())
            .await
            .unwrap();

        manager
            .commit_with(&mut voter, &id, mark_voted)
            .await
            .unwrap();

        assert!(voter.has_voted());
        assert!(matches!(manager.lookup(&id).await, Err(Error::SessionNotFound)));
        assert!(matches!(
            manager.commit_with(&mut voter, &id, mark_voted).await,
            Err(Error::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn failed_commit_keeps_session_open() {
        let manager = SessionManager::new(DEFAULT_SESSION_TIMEOUT, 10);
        let (mut voter, credential) = voter();
        let id = manager
            .open(&mut voter, credential, 1, commitment(), challenge())
            .await
            .unwrap();

        let result = manager
            .commit_with(&mut voter, &id, |_| {
                Err(Error::Storage("disk full".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(!voter.has_voted());
        assert_eq!(voter.open_session(), Some(&id));

        manager
            .commit_with(&mut voter, &id, mark_voted)
            .await
            .unwrap();
        assert!(voter.has_voted());
    }

    #[tokio::test]
    async fn rejected_session_cannot_be_reused() {
        let manager = SessionManager::new(DEFAULT_SESSION_TIMEOUT, 10);
        let (mut voter, credential) = voter();
        let id = manager
            .open(&mut voter, credential, 1, commitment(), challenge())
            .await
            .unwrap();

        manager.close(&mut voter, &id, SessionState::Rejected).await;
        assert!(voter.open_session().is_none());
        assert!(matches!(manager.lookup(&id).await, Err(Error::SessionNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_reclaims_stale_sessions_first() {
        let manager = SessionManager::new(Duration::from_secs(10), 1);
        let (mut first, first_credential) = voter();
        let (mut second, second_credential) = voter();

        manager
            .open(&mut first, first_credential, 1, commitment(), challenge())
            .await
            .unwrap();
        assert!(matches!(
            manager
                .open(&mut second, second_credential, 1, commitment(), challenge())
                .await,
            Err(Error::CapacityExceeded(_))
        ));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(manager
            .open(&mut second, second_credential, 1, commitment(), challenge())
            .await
            .is_ok());
    }
}
