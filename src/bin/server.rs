use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anonvote::proto::anon_vote_server::AnonVoteServer;
use anonvote::server::{AnonVoteService, ServerConfig};
use anonvote::{
    CryptoEngine, Election, ElectionStore, JsonFileStore, LengthRule, MemoryStore, ModpEngine,
};
use clap::Parser;
use crossterm::execute;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::{signal, time};
use tonic::transport::Server;
use tonic_health::server::{health_reporter, HealthReporter};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type Service = AnonVoteServer<AnonVoteService<ModpEngine>>;

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Anonymous voting server", long_about = None)]
#[command(version)]
struct Args {
    /// Host to bind to (overrides the configuration file)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable the Prometheus metrics endpoint
    #[arg(long, env = "METRICS_ENABLED")]
    metrics: bool,

    /// Metrics port (overrides the configuration file)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Disable the interactive operator console
    #[arg(long)]
    no_console: bool,
}

enum Command {
    Status,
    Results,
    Cleanup,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(input: &str) -> Self {
        let input = input.trim();

        if input.is_empty() {
            return Command::Unknown(String::new());
        }

        if !input.starts_with('/') {
            return Command::Unknown(
                "Commands must start with '/'. Type /help for available commands.".to_string(),
            );
        }

        let cmd = input.split_whitespace().next().unwrap_or("").to_lowercase();

        match cmd.as_str() {
            "/status" | "/st" => Command::Status,
            "/results" | "/r" => Command::Results,
            "/cleanup" | "/gc" => Command::Cleanup,
            "/help" | "/h" | "/?" => Command::Help,
            "/quit" | "/exit" | "/q" => Command::Quit,
            _ => Command::Unknown(format!(
                "Unknown command: {cmd}. Type /help for available commands."
            )),
        }
    }
}

fn print_colored(color: Color, text: &str) {
    let mut stdout = io::stdout();
    execute!(stdout, SetForegroundColor(color), Print(text), ResetColor).ok();
    stdout.flush().ok();
}

fn println_colored(color: Color, text: &str) {
    print_colored(color, text);
    println!();
}

fn display_banner() {
    println!();
    println_colored(
        Color::Cyan,
        "+---------------------------------------------------------+",
    );
    println_colored(
        Color::Cyan,
        "|              AnonVote Election Server                   |",
    );
    println_colored(
        Color::Cyan,
        "+---------------------------------------------------------+",
    );
    println!();
}

fn display_help() {
    println!();
    println_colored(Color::Yellow, "Available Commands:");
    println!();
    println!("  /status              - Show server configuration and election counters");
    println!("  /results             - Show the current tally");
    println!("  /cleanup             - Reclaim expired sessions now");
    println!("  /help                - Show this help message");
    println!("  /quit or /exit       - Initiate graceful shutdown");
    println!();
}

fn display_prompt(addr: &str) {
    print_colored(Color::Green, &format!("anonvote@{addr}"));
    print_colored(Color::White, "> ");
    io::stdout().flush().ok();
}

fn display_results(election: &Election<ModpEngine>) {
    println!();
    println_colored(Color::Cyan, "Results:");
    for (option, count) in election
        .vote_options()
        .iter()
        .zip(election.vote_results())
    {
        println_colored(Color::White, &format!("  {option:<24} {count}"));
    }
    println!();
}

#[cfg(feature = "small-group")]
fn engine() -> ModpEngine {
    ModpEngine::toy()
}

#[cfg(not(feature = "small-group"))]
fn engine() -> ModpEngine {
    ModpEngine::rfc5114()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    display_banner();

    let mut config = ServerConfig::from_env().unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        info!("Using default configuration");
        ServerConfig::default()
    });
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.metrics {
        config.metrics.enabled = true;
    }
    if let Some(port) = args.metrics_port {
        config.metrics.port = port;
    }

    if let Err(e) = config.validate() {
        println_colored(Color::Red, &format!("Configuration validation failed: {e}"));
        return Err(format!("Invalid configuration: {e}").into());
    }

    let store: Arc<dyn ElectionStore> = match &config.election.state_file {
        Some(path) => {
            info!("Persisting election state to {}", path.display());
            Arc::new(JsonFileStore::open(path)?)
        }
        None => {
            info!("No state file configured, election state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let election = Election::with_store(
        engine(),
        Arc::new(LengthRule::new(config.election.identity_len)),
        config.election_config(),
        store,
    )?;
    let service = AnonVoteService::new(election.clone(), config.rate_limit.build_limiter());

    let cleanup_election = election.clone();
    let cleanup_interval = config.election.cleanup_interval();
    tokio::spawn(async move {
        loop {
            let election = cleanup_election.clone();
            let cleanup_handle = tokio::spawn(async move {
                let mut interval = time::interval(cleanup_interval);
                loop {
                    interval.tick().await;
                    election.cleanup_expired().await;
                }
            });

            match cleanup_handle.await {
                Ok(()) => {
                    error!("Cleanup task terminated unexpectedly, restarting...");
                }
                Err(e) => {
                    error!("Cleanup task panicked: {:?}, restarting...", e);
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    if config.metrics.enabled {
        let metrics_addr = config.metrics.addr()?;
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
        {
            Ok(()) => info!("Metrics server started on {metrics_addr}"),
            Err(e) => error!("Failed to start metrics server: {e}"),
        }
    }

    let (mut health_reporter, health_service) = health_reporter();
    health_reporter.set_serving::<Service>().await;

    let addr = config.addr()?;
    let addr_str = addr.to_string();

    println_colored(Color::Green, &format!("Server starting on {addr}"));
    println_colored(
        Color::White,
        &format!("  Group: {}", election.engine().name()),
    );
    println_colored(
        Color::White,
        &format!("  Options: {}", election.vote_options().join(", ")),
    );
    println_colored(
        Color::White,
        &format!(
            "  Session timeout: {}s",
            config.election.session_timeout_secs
        ),
    );
    println_colored(
        Color::White,
        &format!(
            "  Rate limit: {} req/min, burst: {}",
            config.rate_limit.requests_per_minute, config.rate_limit.burst
        ),
    );
    println_colored(
        Color::White,
        &format!(
            "  State: {}",
            config
                .election
                .state_file
                .as_ref()
                .map_or_else(|| "in memory".to_string(), |path| path.display().to_string())
        ),
    );
    println_colored(
        Color::White,
        &format!(
            "  Metrics: {}",
            if config.metrics.enabled { "enabled" } else { "disabled" }
        ),
    );
    println_colored(Color::White, "  Health check: enabled");
    println!();

    let shutdown = Arc::new(Notify::new());
    let shutdown_reporter = health_reporter.clone();
    let server_shutdown = Arc::clone(&shutdown);

    let server_handle = tokio::spawn(async move {
        Server::builder()
            .add_service(health_service)
            .add_service(AnonVoteServer::new(service))
            .serve_with_shutdown(addr, shutdown_signal(shutdown_reporter, server_shutdown))
            .await
    });

    if !args.no_console {
        println_colored(
            Color::Yellow,
            "Type /help for available commands or /quit to exit",
        );
        println!();
        run_console(&election, &config, &addr_str, &shutdown).await;
    }

    match server_handle.await {
        Ok(Ok(())) => {
            display_results(&election);
            println_colored(Color::Green, "Server shutdown complete. Goodbye!");
        }
        Ok(Err(e)) => {
            println_colored(Color::Red, &format!("Server error: {e}"));
        }
        Err(e) => {
            println_colored(Color::Red, &format!("Server task panicked: {e}"));
        }
    }

    println!();
    Ok(())
}

async fn run_console(
    election: &Election<ModpEngine>,
    config: &ServerConfig,
    addr: &str,
    shutdown: &Notify,
) {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        display_prompt(addr);

        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                println_colored(Color::Red, &format!("Error reading input: {e}"));
                continue;
            }
        }

        match Command::parse(&line) {
            Command::Status => {
                let stats = election.stats().await;

                println!();
                println_colored(Color::Cyan, "Server Status:");
                println_colored(Color::White, &format!("  Address: {addr}"));
                println_colored(
                    Color::White,
                    &format!(
                        "  Rate limit: {} req/min",
                        config.rate_limit.requests_per_minute
                    ),
                );
                println_colored(Color::White, &format!("  Burst: {}", config.rate_limit.burst));
                println!();
                println_colored(Color::Cyan, "Election:");
                println_colored(
                    Color::White,
                    &format!(
                        "  Registration keys issued: {} ({} spent)",
                        stats.issued_keys, stats.consumed_keys
                    ),
                );
                println_colored(
                    Color::White,
                    &format!("  Registered credentials: {}", stats.registered_voters),
                );
                println_colored(
                    Color::White,
                    &format!("  Open sessions: {}", stats.open_sessions),
                );
                println_colored(Color::White, &format!("  Votes cast: {}", stats.votes_cast));
                println!();
            }
            Command::Results => display_results(election),
            Command::Cleanup => {
                println_colored(Color::White, "Running cleanup...");
                let removed = election.cleanup_expired().await;
                println_colored(
                    Color::Green,
                    &format!("Cleanup complete, {removed} session(s) reclaimed"),
                );
            }
            Command::Help => display_help(),
            Command::Quit => {
                println!();
                println_colored(Color::Yellow, "Initiating graceful shutdown...");
                shutdown.notify_one();
                break;
            }
            Command::Unknown(msg) => {
                if !msg.is_empty() {
                    println_colored(Color::Red, &msg);
                }
            }
        }
    }
}

async fn shutdown_signal(mut health_reporter: HealthReporter, console_quit: Arc<Notify>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
        _ = console_quit.notified() => {
            info!("Shutdown requested via console");
        },
    }

    health_reporter.set_not_serving::<Service>().await;

    info!("Initiating graceful shutdown (allowing in-flight requests to complete)");

    tokio::time::sleep(Duration::from_secs(2)).await;
}
