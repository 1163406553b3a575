/// gRPC service implementation.
pub mod service;

/// Server configuration and rate limiting.
pub mod config;

pub use config::{RateLimiter, ServerConfig};
pub use service::{error_kind, status_from_error, AnonVoteService};
