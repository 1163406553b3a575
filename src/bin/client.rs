use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anonvote::proto::anon_vote_client::AnonVoteClient;
use anonvote::proto::{
    RegisterReq, ValidateIdReq, ValidateVoteReq, VoteOptionsReq, VoteReq, VoteResultsReq,
};
use anonvote::server::error_kind;
use anonvote::{CryptoEngine, ModpEngine, PublicKey, SecretKey};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use tonic::transport::Channel;
use tonic::{Request, Status};

type Client = AnonVoteClient<Channel>;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Anonymous voting client", long_about = None)]
struct Cli {
    #[arg(short, long, env = "ANONVOTE_SERVER", default_value = "http://127.0.0.1:50051")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exchange an identity for a registration key
    ValidateId {
        #[arg(short, long)]
        id: String,
    },

    /// Generate a credential, register it, and save it to a key file
    Register {
        #[arg(short = 'k', long)]
        registration_key: String,

        #[arg(short, long, default_value = "voter-key.json")]
        out: PathBuf,
    },

    /// Cast a vote with a saved credential
    Vote {
        #[arg(short = 'k', long, default_value = "voter-key.json")]
        key_file: PathBuf,

        /// 1-based option number
        #[arg(short, long)]
        option: u32,
    },

    /// List the ballot options
    Options,

    /// Show the current tally
    Results,

    /// Run validate-id, register and vote interactively
    Flow {
        #[arg(short, long, default_value = "voter-key.json")]
        out: PathBuf,
    },
}

#[cfg(feature = "small-group")]
fn engine() -> ModpEngine {
    ModpEngine::toy()
}

#[cfg(not(feature = "small-group"))]
fn engine() -> ModpEngine {
    ModpEngine::rfc5114()
}

fn describe(status: &Status) -> String {
    match error_kind(status) {
        Some(kind) => format!("{kind}: {}", status.message()),
        None => format!("{:?}: {}", status.code(), status.message()),
    }
}

fn input_string(prompt: &str) -> io::Result<String> {
    print!("{prompt}: ");
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

async fn validate_id(client: &mut Client, id: String) -> Result<String, Status> {
    let response = client.validate_id(Request::new(ValidateIdReq { id })).await?;
    Ok(response.into_inner().registration_key)
}

async fn register(
    client: &mut Client,
    secret_key: &SecretKey,
    registration_key: String,
) -> Result<(), Status> {
    let public_key = secret_key.public_key();

    client
        .register(Request::new(RegisterReq {
            registration_key,
            a: public_key.a().to_vec(),
            b: public_key.b().to_vec(),
            alpha: public_key.alpha().to_vec(),
            beta: public_key.beta().to_vec(),
        }))
        .await?;

    Ok(())
}

/// Generates a credential, saves it to `out` and then spends the key on it.
///
/// The file is removed again only when the server rejects the registration.
async fn register_and_save(
    client: &mut Client,
    engine: &ModpEngine,
    registration_key: String,
    out: &Path,
) -> Result<SecretKey, Box<dyn std::error::Error>> {
    let secret_key = engine.generate_keypair(&mut OsRng);
    secret_key.save(out)?;

    if let Err(status) = register(client, &secret_key, registration_key).await {
        if let Err(e) = std::fs::remove_file(out) {
            eprintln!("Could not remove {}: {e}", out.display());
        }
        return Err(describe(&status).into());
    }
    Ok(secret_key)
}

async fn cast_vote(
    client: &mut Client,
    engine: &ModpEngine,
    secret_key: &SecretKey,
    vote: u32,
) -> Result<(), Status> {
    let public_key: &PublicKey = secret_key.public_key();
    let committed = engine.commit(secret_key, &mut OsRng);

    let response = client
        .vote(Request::new(VoteReq {
            vote,
            a: public_key.a().to_vec(),
            b: public_key.b().to_vec(),
            alpha: public_key.alpha().to_vec(),
            beta: public_key.beta().to_vec(),
            ka: committed.commitment.ka().to_vec(),
            kb: committed.commitment.kb().to_vec(),
        }))
        .await?
        .into_inner();

    let challenge = anonvote::Challenge::from_bytes(response.challenge);
    let solution = engine.respond(secret_key, &committed.nonce, &challenge);

    client
        .validate_vote(Request::new(ValidateVoteReq {
            auth_session_id: response.auth_session_id,
            vote,
            solution: solution.into_bytes(),
        }))
        .await?;

    Ok(())
}

async fn print_options(client: &mut Client) -> Result<Vec<String>, Status> {
    let options = client
        .vote_options(Request::new(VoteOptionsReq {}))
        .await?
        .into_inner()
        .options;
    for (index, option) in options.iter().enumerate() {
        println!("  {}. {option}", index + 1);
    }
    Ok(options)
}

async fn print_results(client: &mut Client) -> Result<(), Status> {
    let options = client
        .vote_options(Request::new(VoteOptionsReq {}))
        .await?
        .into_inner()
        .options;
    let votes = client
        .vote_results(Request::new(VoteResultsReq {}))
        .await?
        .into_inner()
        .votes;
    for (option, count) in options.iter().zip(votes) {
        println!("  {option:<24} {count}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let engine = engine();

    let mut client = AnonVoteClient::connect(cli.server.clone()).await?;

    let outcome: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Commands::ValidateId { id } => match validate_id(&mut client, id).await {
            Ok(key) => {
                println!("Registration key: {key}");
                Ok(())
            }
            Err(status) => Err(describe(&status).into()),
        },

        Commands::Register {
            registration_key,
            out,
        } => register_and_save(&mut client, &engine, registration_key, &out)
            .await
            .map(|_| println!("Registered. Credential saved to {}", out.display())),

        Commands::Vote { key_file, option } => {
            let secret_key = SecretKey::load(&key_file)?;
            let start = Instant::now();
            match cast_vote(&mut client, &engine, &secret_key, option).await {
                Ok(()) => {
                    println!("Vote for option {option} accepted in {:?}", start.elapsed());
                    Ok(())
                }
                Err(status) => Err(describe(&status).into()),
            }
        }

        Commands::Options => print_options(&mut client)
            .await
            .map(|_| ())
            .map_err(|status| describe(&status).into()),

        Commands::Results => print_results(&mut client)
            .await
            .map_err(|status| describe(&status).into()),

        Commands::Flow { out } => run_flow(&mut client, &engine, &out).await,
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_flow(
    client: &mut Client,
    engine: &ModpEngine,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = input_string("Please provide ID number")?;
    let registration_key = validate_id(client, id)
        .await
        .map_err(|status| describe(&status))?;

    let secret_key = register_and_save(client, engine, registration_key, out).await?;
    println!("Credential registered and saved to {}", out.display());

    println!("Options:");
    let options = print_options(client)
        .await
        .map_err(|status| describe(&status))?;

    let vote: u32 = input_string("Enter a vote")?
        .parse()
        .map_err(|_| format!("Enter a number between 1 and {}", options.len()))?;

    cast_vote(client, engine, &secret_key, vote)
        .await
        .map_err(|status| {
            format!(
                "{}. Retry with: client vote -k {} -o {vote}",
                describe(&status),
                out.display()
            )
        })?;

    println!("You've successfully voted!");
    Ok(())
}
