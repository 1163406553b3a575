use std::sync::Arc;

use super::session::AuthSession;
use crate::crypto::{CryptoEngine, PublicKey, Solution};

/// Checks a session's proof of key possession with the [`CryptoEngine`].
///
/// The challenge and commitment always come from the server-held session,
/// never from the request that carries the solution.
pub struct ProofVerifier<E: CryptoEngine> {
    engine: Arc<E>,
}

impl<E: CryptoEngine> ProofVerifier<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Returns true if `solution` answers the session challenge for `public_key`.
    pub fn verify(&self, session: &AuthSession, public_key: &PublicKey, solution: &Solution) -> bool {
        if solution.as_bytes().len() != self.engine.scalar_len() {
            return false;
        }
        self.engine
            .verify(public_key, &session.commitment, &session.challenge, solution)
    }
}

impl<E: CryptoEngine> Clone for ProofVerifier<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;
    use tokio::time::Instant;

    use super::*;
    use crate::crypto::ModpEngine;
    use crate::protocol::session::{SessionId, SessionState};

    #[test]
    fn verifies_against_session_challenge() {
        let engine = Arc::new(ModpEngine::rfc5114());
        let verifier = ProofVerifier::new(Arc::clone(&engine));

        let secret_key = engine.generate_keypair(&mut OsRng);
        let public_key = secret_key.public_key().clone();
        let committed = engine.commit(&secret_key, &mut OsRng);
        let challenge = engine.random_challenge(&mut OsRng);

        let session = AuthSession {
            id: SessionId::parse(&"ab".repeat(32)).unwrap(),
            vote: 1,
            credential: public_key.credential_id(),
            commitment: committed.commitment.clone(),
            challenge: challenge.clone(),
            created_at: Instant::now(),
            state: SessionState::Open,
        };

        let solution = engine.respond(&secret_key, &committed.nonce, &challenge);
        assert!(verifier.verify(&session, &public_key, &solution));

        let replayed_challenge = engine.random_challenge(&mut OsRng);
        let stale = engine.respond(&secret_key, &committed.nonce, &replayed_challenge);
        if replayed_challenge != challenge {
            assert!(!verifier.verify(&session, &public_key, &stale));
        }

        let truncated = Solution::from_bytes(solution.as_bytes()[1..].to_vec());
        assert!(!verifier.verify(&session, &public_key, &truncated));
    }
}
