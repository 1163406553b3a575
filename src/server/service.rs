use std::time::Instant;

use metrics::{counter, histogram};
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};
use tracing::debug;

use super::config::RateLimiter;
use crate::crypto::{Commitment, CryptoEngine, PublicKey, Solution};
use crate::proto::anon_vote_server::AnonVote;
use crate::proto::{
    RegisterReq, RegisterRes, ValidateIdReq, ValidateIdRes, ValidateVoteReq, ValidateVoteRes,
    VoteOptionsReq, VoteOptionsRes, VoteReq, VoteRes, VoteResultsReq, VoteResultsRes,
};
use crate::protocol::Election;
use crate::Error;

/// Metadata key carrying the machine-readable error kind on failed calls.
pub const ERROR_KIND_METADATA: &str = "anonvote-error";

/// Wire kind shared by unregistered and already-voted credentials.
pub const CREDENTIAL_INELIGIBLE: &str = "CREDENTIAL_INELIGIBLE";

const MAX_FIELD_LEN: usize = 4096;

/// gRPC front end of an [`Election`].
pub struct AnonVoteService<E: CryptoEngine> {
    election: Election<E>,
    rate_limiter: RateLimiter,
}

impl<E: CryptoEngine> AnonVoteService<E> {
    /// Creates a service over `election`, throttled by `rate_limiter`.
    pub fn new(election: Election<E>, rate_limiter: RateLimiter) -> Self {
        Self {
            election,
            rate_limiter,
        }
    }

    async fn admit(&self, rpc: &'static str) -> Result<Instant, Status> {
        counter!(format!("anonvote.{rpc}.requests")).increment(1);
        if let Err(e) = self.rate_limiter.check_rate_limit().await {
            counter!(format!("anonvote.{rpc}.throttled")).increment(1);
            return Err(status_from_error(&e));
        }
        Ok(Instant::now())
    }
}

/// Maps a protocol error onto a gRPC status.
///
/// Unregistered and already-voted credentials get one indistinguishable
/// status, so a caller cannot tell which credentials have voted.
pub fn status_from_error(error: &Error) -> Status {
    let (mut status, kind) = match error {
        Error::UnregisteredCredential | Error::AlreadyVoted => (
            Status::permission_denied("Credential is not eligible to vote"),
            CREDENTIAL_INELIGIBLE,
        ),
        other => {
            let message = other.to_string();
            let status = match other {
                Error::IneligibleIdentity => Status::permission_denied(message),
                Error::AlreadyValidated
                | Error::KeyAlreadyConsumed
                | Error::CredentialAlreadyRegistered => Status::already_exists(message),
                Error::UnknownRegistrationKey | Error::SessionNotFound => {
                    Status::not_found(message)
                }
                Error::InvalidOption { .. } | Error::MalformedInput(_) => {
                    Status::invalid_argument(message)
                }
                Error::VoteMismatch | Error::SessionExpired => {
                    Status::failed_precondition(message)
                }
                Error::ProofInvalid => Status::unauthenticated(message),
                Error::RateLimited { .. } | Error::CapacityExceeded(_) => {
                    Status::resource_exhausted(message)
                }
                Error::Storage(_) => Status::unavailable(message),
                Error::Config(_) | Error::UnregisteredCredential | Error::AlreadyVoted => {
                    Status::internal(message)
                }
            };
            (status, other.kind().as_str())
        }
    };

    status
        .metadata_mut()
        .insert(ERROR_KIND_METADATA, MetadataValue::from_static(kind));
    status
}

/// Reads the error kind attached by [`status_from_error`].
pub fn error_kind(status: &Status) -> Option<&str> {
    status
        .metadata()
        .get(ERROR_KIND_METADATA)
        .and_then(|value| value.to_str().ok())
}

fn finish<T>(rpc: &'static str, start: Instant, result: crate::Result<T>) -> Result<T, Status> {
    histogram!(format!("anonvote.{rpc}.duration")).record(start.elapsed().as_secs_f64());
    match result {
        Ok(value) => {
            counter!(format!("anonvote.{rpc}.success")).increment(1);
            Ok(value)
        }
        Err(e) => {
            counter!(format!("anonvote.{rpc}.failure")).increment(1);
            let status = status_from_error(&e);
            debug!(rpc, kind = error_kind(&status).unwrap_or_default(), "Request failed");
            Err(status)
        }
    }
}

#[allow(clippy::result_large_err)]
fn check_field_len(name: &str, value: &[u8]) -> Result<(), Status> {
    if value.len() > MAX_FIELD_LEN {
        return Err(status_from_error(&Error::MalformedInput(format!(
            "{name} too large"
        ))));
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn public_key_from_wire(
    a: Vec<u8>,
    b: Vec<u8>,
    alpha: Vec<u8>,
    beta: Vec<u8>,
) -> Result<PublicKey, Status> {
    for (name, value) in [("a", &a), ("b", &b), ("alpha", &alpha), ("beta", &beta)] {
        check_field_len(name, value)?;
    }
    Ok(PublicKey::new(a, b, alpha, beta))
}

#[tonic::async_trait]
impl<E: CryptoEngine> AnonVote for AnonVoteService<E> {
    async fn validate_id(
        &self,
        request: Request<ValidateIdReq>,
    ) -> Result<Response<ValidateIdRes>, Status> {
        let start = self.admit("validate_id").await?;
        let req = request.into_inner();

        let result = self.election.validate_id(&req.id).await;
        let registration_key = finish("validate_id", start, result)?;

        Ok(Response::new(ValidateIdRes { registration_key }))
    }

    async fn register(
        &self,
        request: Request<RegisterReq>,
    ) -> Result<Response<RegisterRes>, Status> {
        let start = self.admit("register").await?;
        let req = request.into_inner();

        let public_key = public_key_from_wire(req.a, req.b, req.alpha, req.beta)?;
        let result = self
            .election
            .register(&req.registration_key, public_key)
            .await;
        finish("register", start, result)?;

        Ok(Response::new(RegisterRes {}))
    }

    async fn vote(&self, request: Request<VoteReq>) -> Result<Response<VoteRes>, Status> {
        let start = self.admit("vote").await?;
        let req = request.into_inner();

        let public_key = public_key_from_wire(req.a, req.b, req.alpha, req.beta)?;
        check_field_len("ka", &req.ka)?;
        check_field_len("kb", &req.kb)?;
        let commitment = Commitment::new(req.ka, req.kb);

        let result = self.election.vote(req.vote, &public_key, commitment).await;
        let ticket = finish("vote", start, result)?;

        Ok(Response::new(VoteRes {
            auth_session_id: ticket.session_id.as_str().to_string(),
            challenge: ticket.challenge.into_bytes(),
        }))
    }

    async fn validate_vote(
        &self,
        request: Request<ValidateVoteReq>,
    ) -> Result<Response<ValidateVoteRes>, Status> {
        let start = self.admit("validate_vote").await?;
        let req = request.into_inner();

        check_field_len("solution", &req.solution)?;
        let result = self
            .election
            .validate_vote(
                &req.auth_session_id,
                req.vote,
                Solution::from_bytes(req.solution),
            )
            .await;
        finish("validate_vote", start, result)?;

        Ok(Response::new(ValidateVoteRes {}))
    }

    async fn vote_options(
        &self,
        _request: Request<VoteOptionsReq>,
    ) -> Result<Response<VoteOptionsRes>, Status> {
        let start = self.admit("vote_options").await?;
        let options = self.election.vote_options().to_vec();
        let options = finish("vote_options", start, Ok(options))?;

        Ok(Response::new(VoteOptionsRes { options }))
    }

    async fn vote_results(
        &self,
        _request: Request<VoteResultsReq>,
    ) -> Result<Response<VoteResultsRes>, Status> {
        let start = self.admit("vote_results").await?;
        let votes = finish("vote_results", start, Ok(self.election.vote_results()))?;

        Ok(Response::new(VoteResultsRes { votes }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tonic::Code;

    use super::*;

    #[test]
    fn ineligible_credentials_are_indistinguishable() {
        let unregistered = status_from_error(&Error::UnregisteredCredential);
        let voted = status_from_error(&Error::AlreadyVoted);

        assert_eq!(unregistered.code(), Code::PermissionDenied);
        assert_eq!(unregistered.code(), voted.code());
        assert_eq!(unregistered.message(), voted.message());
        assert_eq!(error_kind(&unregistered), Some(CREDENTIAL_INELIGIBLE));
        assert_eq!(error_kind(&voted), Some(CREDENTIAL_INELIGIBLE));
    }

    #[test]
    fn errors_carry_their_kind() {
        let cases = [
            (Error::KeyAlreadyConsumed, Code::AlreadyExists, "KEY_ALREADY_CONSUMED"),
            (Error::SessionExpired, Code::FailedPrecondition, "SESSION_EXPIRED"),
            (Error::ProofInvalid, Code::Unauthenticated, "PROOF_INVALID"),
            (
                Error::RateLimited {
                    retry_after: Duration::from_secs(2),
                },
                Code::ResourceExhausted,
                "RATE_LIMITED",
            ),
            (
                Error::InvalidOption {
                    option: 9,
                    option_count: 3,
                },
                Code::InvalidArgument,
                "INVALID_OPTION",
            ),
            (
                Error::Storage("state file is read-only".to_string()),
                Code::Unavailable,
                "STORAGE_UNAVAILABLE",
            ),
        ];

        for (error, code, kind) in cases {
            let status = status_from_error(&error);
            assert_eq!(status.code(), code, "{error}");
            assert_eq!(error_kind(&status), Some(kind));
        }
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let huge = vec![0u8; MAX_FIELD_LEN + 1];
        let status = public_key_from_wire(huge, vec![1], vec![1], vec![1]).unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(error_kind(&status), Some("MALFORMED_INPUT"));
    }
}
