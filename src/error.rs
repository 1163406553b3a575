//! Error types for the voting protocol.

use std::time::Duration;

/// Errors surfaced by protocol operations.
///
/// Every variant except [`Error::Config`] and [`Error::Storage`] is a
/// recoverable, client-facing condition. None of them carry identity or
/// credential material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// External eligibility verification rejected the identity.
    #[error("Identity is not eligible to vote")]
    IneligibleIdentity,

    /// The identity was already issued a registration key.
    ///
    /// Not produced by the shipped ledger, which re-issues the existing key.
    #[error("Identity has already been validated")]
    AlreadyValidated,

    /// The registration key was never issued.
    #[error("Unknown registration key")]
    UnknownRegistrationKey,

    /// The registration key was already spent on a registration.
    #[error("Registration key has already been used")]
    KeyAlreadyConsumed,

    /// The public key is already bound to a registered voter.
    #[error("Credential is already registered")]
    CredentialAlreadyRegistered,

    /// The public key does not belong to a registered voter.
    #[error("Credential is not registered")]
    UnregisteredCredential,

    /// The credential has already cast its vote.
    #[error("Credential has already voted")]
    AlreadyVoted,

    /// The vote index is outside `1..=option_count`.
    #[error("Invalid vote option {option} (expected 1..={option_count})")]
    InvalidOption {
        /// Option supplied by the caller.
        option: u32,
        /// Number of configured options.
        option_count: usize,
    },

    /// The vote submitted for validation differs from the vote the session was opened for.
    #[error("Vote does not match the authentication session")]
    VoteMismatch,

    /// No open authentication session has this id.
    #[error("Authentication session not found")]
    SessionNotFound,

    /// The authentication session outlived its timeout.
    #[error("Authentication session expired")]
    SessionExpired,

    /// The proof of key possession did not verify.
    #[error("Proof verification failed")]
    ProofInvalid,

    /// A request field has the wrong shape.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The credential failed too many proofs and is backing off.
    #[error("Too many failed proofs, retry in {}s", whole_secs(.retry_after))]
    RateLimited {
        /// Time until the credential may open a new session.
        retry_after: Duration,
    },

    /// An in-memory bound was reached.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The election store could not read or persist state.
    #[error("Storage unavailable: {0}")]
    Storage(String),
}

fn whole_secs(duration: &Duration) -> u64 {
    duration.as_secs().max(1)
}

/// Stable machine-readable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IneligibleIdentity,
    AlreadyValidated,
    UnknownRegistrationKey,
    KeyAlreadyConsumed,
    CredentialAlreadyRegistered,
    UnregisteredCredential,
    AlreadyVoted,
    InvalidOption,
    VoteMismatch,
    SessionNotFound,
    SessionExpired,
    ProofInvalid,
    MalformedInput,
    RateLimited,
    CapacityExceeded,
    Config,
    Storage,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IneligibleIdentity => "INELIGIBLE_IDENTITY",
            ErrorKind::AlreadyValidated => "ALREADY_VALIDATED",
            ErrorKind::UnknownRegistrationKey => "UNKNOWN_REGISTRATION_KEY",
            ErrorKind::KeyAlreadyConsumed => "KEY_ALREADY_CONSUMED",
            ErrorKind::CredentialAlreadyRegistered => "CREDENTIAL_ALREADY_REGISTERED",
            ErrorKind::UnregisteredCredential => "UNREGISTERED_CREDENTIAL",
            ErrorKind::AlreadyVoted => "ALREADY_VOTED",
            ErrorKind::InvalidOption => "INVALID_OPTION",
            ErrorKind::VoteMismatch => "VOTE_MISMATCH",
            ErrorKind::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorKind::SessionExpired => "SESSION_EXPIRED",
            ErrorKind::ProofInvalid => "PROOF_INVALID",
            ErrorKind::MalformedInput => "MALFORMED_INPUT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Storage => "STORAGE_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Returns the stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IneligibleIdentity => ErrorKind::IneligibleIdentity,
            Error::AlreadyValidated => ErrorKind::AlreadyValidated,
            Error::UnknownRegistrationKey => ErrorKind::UnknownRegistrationKey,
            Error::KeyAlreadyConsumed => ErrorKind::KeyAlreadyConsumed,
            Error::CredentialAlreadyRegistered => ErrorKind::CredentialAlreadyRegistered,
            Error::UnregisteredCredential => ErrorKind::UnregisteredCredential,
            Error::AlreadyVoted => ErrorKind::AlreadyVoted,
            Error::InvalidOption { .. } => ErrorKind::InvalidOption,
            Error::VoteMismatch => ErrorKind::VoteMismatch,
            Error::SessionNotFound => ErrorKind::SessionNotFound,
            Error::SessionExpired => ErrorKind::SessionExpired,
            Error::ProofInvalid => ErrorKind::ProofInvalid,
            Error::MalformedInput(_) => ErrorKind::MalformedInput,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Error::Config(_) => ErrorKind::Config,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
