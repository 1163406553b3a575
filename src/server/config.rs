use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::protocol::{BackoffConfig, ElectionConfig};
use crate::{Error, Result};

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname or IP address to bind to.
    pub host: String,
    /// Port number to listen on.
    pub port: u16,
    /// Rate limiting configuration.
    pub rate_limit: RateLimitSettings,
    /// Metrics exporter configuration.
    pub metrics: MetricsSettings,
    /// Ballot and session settings.
    pub election: ElectionSettings,
    /// Backoff after repeated proof failures.
    pub proof_failures: ProofFailureSettings,
}

impl ServerConfig {
    /// Converts host and port into a socket address.
    pub fn addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.host, self.port)
    }
}

/// Rate limiting settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Maximum sustained requests per minute across all clients.
    pub requests_per_minute: u64,
    /// Burst capacity for short-term spikes.
    pub burst: u64,
}

impl RateLimitSettings {
    /// Creates a rate limiter from these settings.
    pub fn build_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.requests_per_minute, self.burst)
    }
}

/// Rate limiter using token bucket algorithm.
///
/// Shared by every RPC. Cloning shares the bucket.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
    rate: u64,
    burst: u64,
}

struct RateLimiterState {
    tokens: f64,
    last_update: Instant,
}

impl RateLimiter {
    /// Creates a new rate limiter.
    ///
    /// # Arguments
    /// * `requests_per_minute` - Maximum sustained request rate
    /// * `burst` - Maximum burst capacity
    pub fn new(requests_per_minute: u64, burst: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                tokens: burst as f64,
                last_update: Instant::now(),
            })),
            rate: requests_per_minute,
            burst,
        }
    }

    /// Attempts to take a token for one request.
    ///
    /// Fails with [`Error::RateLimited`] carrying the time until the next token.
    pub async fn check_rate_limit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();

        let tokens_per_second = self.rate as f64 / 60.0;
        state.tokens = (state.tokens + elapsed * tokens_per_second).min(self.burst as f64);
        state.last_update = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let wait = if tokens_per_second > 0.0 {
                (1.0 - state.tokens) / tokens_per_second
            } else {
                60.0
            };
            Err(Error::RateLimited {
                retry_after: Duration::from_secs_f64(wait),
            })
        }
    }
}

/// Metrics exporter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Whether the Prometheus exporter is started.
    pub enabled: bool,
    /// Hostname or IP address for metrics server.
    pub host: String,
    /// Port number for metrics server.
    pub port: u16,
}

impl MetricsSettings {
    /// Converts host and port into a socket address for metrics server.
    pub fn addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.host, self.port)
    }
}

/// Ballot and session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectionSettings {
    /// Option labels in ballot order.
    pub options: Vec<String>,
    /// Seconds an authentication session stays valid.
    pub session_timeout_secs: u64,
    /// Seconds between sweeps of expired sessions.
    pub cleanup_interval_secs: u64,
    /// Upper bound on session records held at once.
    pub max_open_sessions: usize,
    /// Upper bound on registered credentials.
    pub max_voters: usize,
    /// Upper bound on issued registration keys.
    pub max_keys: usize,
    /// JSON file holding keys, voters and the tally across restarts.
    /// State is kept in memory only when unset.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Length of issued registration keys.
    pub registration_key_len: usize,
    /// Exact identity length accepted by the simulated eligibility check.
    pub identity_len: usize,
}

impl ElectionSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Proof-failure backoff settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofFailureSettings {
    /// Failed proofs tolerated per credential before backing off.
    pub max_failures: u32,
    /// First backoff delay, in milliseconds.
    pub base_backoff_ms: u64,
    /// Longest backoff delay, in seconds.
    pub max_backoff_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let election = ElectionConfig::default();
        Self {
            host: "127.0.0.1".to_string(),
            port: 50051,
            rate_limit: RateLimitSettings {
                requests_per_minute: 600,
                burst: 50,
            },
            metrics: MetricsSettings {
                enabled: false,
                host: "127.0.0.1".to_string(),
                port: 9090,
            },
            election: ElectionSettings {
                options: election.options,
                session_timeout_secs: election.session_timeout.as_secs(),
                cleanup_interval_secs: 60,
                max_open_sessions: election.max_open_sessions,
                max_voters: election.max_voters,
                max_keys: election.max_keys,
                state_file: None,
                registration_key_len: election.registration_key_len,
                identity_len: 5,
            },
            proof_failures: ProofFailureSettings {
                max_failures: election.backoff.max_failures,
                base_backoff_ms: election.backoff.base_backoff.as_millis() as u64,
                max_backoff_secs: election.backoff.max_backoff.as_secs(),
            },
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `.env` file, TOML file, and environment variables.
    ///
    /// Configuration priority (highest to lowest):
    /// 1. Environment variables with `SERVER_` prefix; nested keys use `__`
    ///    (e.g. `SERVER_PORT=8080`, `SERVER_ELECTION__SESSION_TIMEOUT_SECS=120`)
    /// 2. TOML configuration file (if exists)
    /// 3. Built-in defaults
    ///
    /// The `.env` file is loaded first if present, so its entries act as
    /// environment variables.
    ///
    /// The TOML file path can be set via `SERVER_CONFIG_PATH`. If not set, it
    /// defaults to `./config/server.toml`. A missing file is skipped.
    ///
    /// # Errors
    /// Returns an error if the configuration is malformed.
    pub fn from_env() -> Result<Self> {
        use figment::providers::{Env, Format, Serialized, Toml};
        use figment::Figment;

        let _ = dotenvy::dotenv();

        let config_path = std::env::var("SERVER_CONFIG_PATH")
            .unwrap_or_else(|_| "config/server.toml".to_string());

        Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("SERVER_").ignore(&["CONFIG_PATH"]).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Checks the configuration before the server starts.
    pub fn validate(&self) -> Result<()> {
        self.addr()?;
        if self.metrics.enabled {
            self.metrics.addr()?;
        }

        if self.rate_limit.requests_per_minute == 0 {
            return Err(Error::Config(
                "rate limit requests_per_minute cannot be zero".to_string(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(Error::Config("rate limit burst cannot be zero".to_string()));
        }
        if self.election.cleanup_interval_secs == 0 {
            return Err(Error::Config("cleanup interval cannot be zero".to_string()));
        }
        if self.election.identity_len == 0 {
            return Err(Error::Config("identity length cannot be zero".to_string()));
        }

        self.election_config().validate()
    }

    /// Election parameters described by this configuration.
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            options: self.election.options.clone(),
            session_timeout: Duration::from_secs(self.election.session_timeout_secs),
            max_open_sessions: self.election.max_open_sessions,
            max_voters: self.election.max_voters,
            max_keys: self.election.max_keys,
            registration_key_len: self.election.registration_key_len,
            backoff: BackoffConfig {
                max_failures: self.proof_failures.max_failures,
                base_backoff: Duration::from_millis(self.proof_failures.base_backoff_ms),
                max_backoff: Duration::from_secs(self.proof_failures.max_backoff_secs),
            },
        }
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Config(format!("invalid address {host}:{port}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_within_limit() {
        let limiter = RateLimiter::new(60, 10);

        for _ in 0..10 {
            assert!(limiter.check_rate_limit().await.is_ok());
        }
    }

    #[tokio::test]
    async fn rate_limiter_blocks_over_limit() {
        let limiter = RateLimiter::new(60, 5);

        for _ in 0..5 {
            limiter.check_rate_limit().await.unwrap();
        }

        assert!(matches!(
            limiter.check_rate_limit().await,
            Err(Error::RateLimited { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_refills_tokens() {
        let limiter = RateLimiter::new(120, 2);

        limiter.check_rate_limit().await.unwrap();
        limiter.check_rate_limit().await.unwrap();
        assert!(limiter.check_rate_limit().await.is_err());

        tokio::time::advance(Duration::from_millis(600)).await;

        assert!(limiter.check_rate_limit().await.is_ok());
    }

    #[test]
    fn rate_limit_settings_build_limiter() {
        let settings = RateLimitSettings {
            requests_per_minute: 100,
            burst: 10,
        };

        let limiter = settings.build_limiter();
        assert_eq!(limiter.rate, 100);
        assert_eq!(limiter.burst, 10);
    }

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.addr().unwrap().port(), 50051);

        let election = config.election_config();
        assert_eq!(election.options.len(), 3);
        assert_eq!(election.session_timeout, Duration::from_secs(300));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.election.options.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ServerConfig::default();
        config.rate_limit.burst = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.election.session_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.host = "not a host".to_string();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.election.max_keys = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.proof_failures.max_backoff_secs = config.election.session_timeout_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn figment_reads_nested_toml() {
        use figment::providers::{Format, Serialized, Toml};
        use figment::Figment;

        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::string(
                r#"
                port = 6000

                [election]
                options = ["Red", "Blue"]
                session_timeout_secs = 45
                state_file = "/var/lib/anonvote/state.json"
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(
            config.election.state_file,
            Some(PathBuf::from("/var/lib/anonvote/state.json"))
        );
        assert!(ServerConfig::default().election.state_file.is_none());

        assert_eq!(config.port, 6000);
        assert_eq!(config.election.options, vec!["Red", "Blue"]);
        assert_eq!(config.election.session_timeout_secs, 45);
        assert_eq!(config.election.cleanup_interval_secs, 60);
    }
}
