//! Anonymous single-use voting over a Chaum-Pedersen proof of knowledge.
//!
//! A voter proves real-world eligibility once ([`Election::validate_id`]) and
//! receives a one-time registration key. The key is spent to register an
//! anonymous credential ([`Election::register`]); from then on the voter is
//! known only by that credential. Casting a vote is a two-round exchange: the
//! voter commits and names an option ([`Election::vote`]), the server answers
//! with a random challenge, and the vote is counted once the voter proves
//! knowledge of the credential's secret ([`Election::validate_vote`]).
//!
//! [`Election::new`] keeps all state in memory. [`Election::with_store`] takes
//! an [`ElectionStore`], such as [`JsonFileStore`], so issued keys, voters and
//! the tally survive a restart.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use anonvote::{CryptoEngine, Election, ElectionConfig, LengthRule, ModpEngine};
//! use rand::rngs::OsRng;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anonvote::Result<()> {
//! let election = Election::new(
//!     ModpEngine::rfc5114(),
//!     Arc::new(LengthRule::default()),
//!     ElectionConfig::default(),
//! )?;
//!
//! let key = election.validate_id("ID-01").await?;
//! let secret = election.engine().generate_keypair(&mut OsRng);
//! election.register(&key, secret.public_key().clone()).await?;
//!
//! let committed = election.engine().commit(&secret, &mut OsRng);
//! let ticket = election.vote(2, secret.public_key(), committed.commitment).await?;
//! let solution = election
//!     .engine()
//!     .respond(&secret, &committed.nonce, &ticket.challenge);
//! election
//!     .validate_vote(ticket.session_id.as_str(), 2, solution)
//!     .await?;
//!
//! assert_eq!(election.vote_results(), vec![0, 1, 0]);
//! # Ok(())
//! # }
//! ```

/// Crypto engine seam and the modular-arithmetic engine.
pub mod crypto;
/// Error types.
pub mod error;
/// Ledger, registry, sessions, tally and the election orchestrator.
pub mod protocol;
/// gRPC service, configuration and rate limiting.
pub mod server;

/// Generated gRPC bindings for the `anonvote` package.
#[allow(clippy::all)]
pub mod proto {
    include!("proto/anonvote.rs");
}

pub use crypto::{
    Challenge, ChallengeCommitment, Commitment, CredentialId, CryptoEngine, ModpEngine, Nonce,
    PublicKey, SecretKey, Solution,
};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{
    Election, ElectionConfig, ElectionStats, ElectionStore, IdentityVerifier, JsonFileStore,
    LengthRule, MemoryStore, VoteTicket,
};
