//! Common test utilities shared across integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use anonvote::{CryptoEngine, Election, ElectionConfig, LengthRule, ModpEngine, SecretKey};
use rand::rngs::OsRng;

/// Initialize test tracing (call once at the beginning of tests).
///
/// Only logs from this crate are shown. Subsequent calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new("anonvote=debug");

    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();
}

/// An RFC 5114 election with three options and default limits.
pub fn election() -> Election<ModpEngine> {
    election_with(ElectionConfig::default())
}

pub fn election_with(config: ElectionConfig) -> Election<ModpEngine> {
    Election::new(
        ModpEngine::rfc5114(),
        Arc::new(LengthRule::default()),
        config,
    )
    .unwrap()
}

/// Five-character identity unique to `n`.
pub fn identity(n: usize) -> String {
    format!("{n:05}")
}

/// Validates `identity`, registers a fresh credential with the key, and
/// returns the credential's secret.
pub async fn registered_voter(election: &Election<ModpEngine>, identity: &str) -> SecretKey {
    let key = election.validate_id(identity).await.unwrap();
    let secret = election.engine().generate_keypair(&mut OsRng);
    election
        .register(&key, secret.public_key().clone())
        .await
        .unwrap();
    secret
}

/// Runs a full Vote + ValidateVote exchange with a correct proof.
pub async fn cast(
    election: &Election<ModpEngine>,
    secret: &SecretKey,
    vote: u32,
) -> anonvote::Result<()> {
    let engine = election.engine();
    let committed = engine.commit(secret, &mut OsRng);
    let ticket = election
        .vote(vote, secret.public_key(), committed.commitment)
        .await?;
    let solution = engine.respond(secret, &committed.nonce, &ticket.challenge);
    election
        .validate_vote(ticket.session_id.as_str(), vote, solution)
        .await
}
