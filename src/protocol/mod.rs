//! Voting protocol core.
//!
//! [`Election`] binds the eligibility ledger, registry, session manager, proof
//! verifier and tally into the public operations. Lock order across
//! components is always ledger, then registry, then a voter record, then the
//! session table. Durable transitions are written through an
//! [`ElectionStore`] while those locks are held.

/// Proof-failure backoff per credential.
pub mod backoff;
/// Orchestrator for the public voting operations.
pub mod election;
/// Identity validation and one-time registration keys.
pub mod ledger;
/// Registered anonymous credentials.
pub mod registry;
/// Authentication sessions and their lifecycle.
pub mod session;
/// Persistence of keys, voters and the tally.
pub mod store;
/// Per-option vote counters.
pub mod tally;
/// Session-bound proof verification.
pub mod verifier;

pub use backoff::{BackoffConfig, FailureLimiter};
pub use election::{Election, ElectionConfig, ElectionStats, VoteTicket};
pub use ledger::{EligibilityLedger, IdentityVerifier, LengthRule};
pub use registry::{Registry, VoterRecord};
pub use session::{AuthSession, SessionId, SessionManager, SessionState};
pub use store::{ElectionSnapshot, ElectionStore, JsonFileStore, MemoryStore, StoredVoter};
pub use tally::TallyStore;
pub use verifier::ProofVerifier;
