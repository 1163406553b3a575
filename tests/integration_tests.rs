mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use anonvote::proto::anon_vote_client::AnonVoteClient;
use anonvote::proto::anon_vote_server::AnonVoteServer;
use anonvote::proto::{
    RegisterReq, ValidateIdReq, ValidateVoteReq, VoteOptionsReq, VoteReq, VoteResultsReq,
};
use anonvote::server::{error_kind, AnonVoteService, RateLimiter};
use anonvote::{
    Challenge, CryptoEngine, Election, ElectionConfig, Error, LengthRule, ModpEngine, PublicKey,
};
use common::{cast, election, identity, init_tracing, registered_voter};
use rand::rngs::OsRng;
use tonic::transport::{Channel, Server};
use tonic::{Code, Request};

async fn start_test_server(election: Election<ModpEngine>) -> (String, tokio::task::JoinHandle<()>) {
    let service = AnonVoteService::new(election, RateLimiter::new(10_000, 1_000));

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(AnonVoteServer::new(service))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    (format!("http://{}", local_addr), handle)
}

fn register_req(registration_key: String, public_key: &PublicKey) -> RegisterReq {
    RegisterReq {
        registration_key,
        a: public_key.a().to_vec(),
        b: public_key.b().to_vec(),
        alpha: public_key.alpha().to_vec(),
        beta: public_key.beta().to_vec(),
    }
}

fn vote_req(vote: u32, public_key: &PublicKey, ka: &[u8], kb: &[u8]) -> VoteReq {
    VoteReq {
        vote,
        a: public_key.a().to_vec(),
        b: public_key.b().to_vec(),
        alpha: public_key.alpha().to_vec(),
        beta: public_key.beta().to_vec(),
        ka: ka.to_vec(),
        kb: kb.to_vec(),
    }
}

#[tokio::test]
async fn documented_election_scenario() {
    init_tracing();
    let election = Election::new(
        ModpEngine::rfc5114(),
        Arc::new(LengthRule::new(4)),
        ElectionConfig::default(),
    )
    .unwrap();
    let engine = election.engine();

    let k1 = election.validate_id("ID-1").await.unwrap();
    let secret = engine.generate_keypair(&mut OsRng);
    let pk_a = secret.public_key().clone();

    election.register(&k1, pk_a.clone()).await.unwrap();
    assert_eq!(
        election.register(&k1, pk_a.clone()).await,
        Err(Error::KeyAlreadyConsumed)
    );

    let committed = engine.commit(&secret, &mut OsRng);
    let ticket = election.vote(2, &pk_a, committed.commitment).await.unwrap();
    let solution = engine.respond(&secret, &committed.nonce, &ticket.challenge);
    election
        .validate_vote(ticket.session_id.as_str(), 2, solution)
        .await
        .unwrap();
    assert_eq!(election.vote_results(), vec![0, 1, 0]);

    assert_eq!(cast(&election, &secret, 1).await, Err(Error::AlreadyVoted));
    assert_eq!(election.vote_results(), vec![0, 1, 0]);
}

#[tokio::test]
async fn validate_id_is_idempotent() {
    let election = election();
    let first = election.validate_id("ABCDE").await.unwrap();
    let second = election.validate_id("ABCDE").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(election.stats().await.issued_keys, 1);

    assert_eq!(
        election.validate_id("ABCDEF").await,
        Err(Error::IneligibleIdentity)
    );
}

#[tokio::test]
async fn each_voter_moves_exactly_one_slot() {
    let election = election();
    let mut expected = vec![0u64; 3];

    for n in 0..9 {
        let secret = registered_voter(&election, &identity(n)).await;
        let vote = (n % 3) as u32 + 1;
        cast(&election, &secret, vote).await.unwrap();
        expected[n % 3] += 1;
        assert_eq!(election.vote_results(), expected);
    }

    let stats = election.stats().await;
    assert_eq!(stats.registered_voters, 9);
    assert_eq!(stats.consumed_keys, 9);
    assert_eq!(stats.votes_cast, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_with_one_key_succeed_once() {
    let election = election();
    let key = election.validate_id("ABCDE").await.unwrap();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let election = election.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let secret = election.engine().generate_keypair(&mut OsRng);
                election.register(&key, secret.public_key().clone()).await
            })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(e) => assert_eq!(e, Error::KeyAlreadyConsumed),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(election.stats().await.registered_voters, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_of_one_credential_succeed_once() {
    let election = election();
    let secret = election.engine().generate_keypair(&mut OsRng);

    let mut keys = Vec::new();
    for n in 0..8 {
        keys.push(election.validate_id(&identity(n)).await.unwrap());
    }

    let handles: Vec<_> = keys
        .into_iter()
        .map(|key| {
            let election = election.clone();
            let public_key = secret.public_key().clone();
            tokio::spawn(async move { election.register(&key, public_key).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(e) => assert_eq!(e, Error::CredentialAlreadyRegistered),
        }
    }

    assert_eq!(successes, 1);
    let stats = election.stats().await;
    assert_eq!(stats.registered_voters, 1);
    assert_eq!(stats.consumed_keys, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_answers_to_one_session_commit_once() {
    let election = election();
    let secret = registered_voter(&election, "ABCDE").await;
    let engine = election.engine();

    let committed = engine.commit(&secret, &mut OsRng);
    let ticket = election
        .vote(3, secret.public_key(), committed.commitment)
        .await
        .unwrap();
    let solution = engine.respond(&secret, &committed.nonce, &ticket.challenge);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let election = election.clone();
            let session_id = ticket.session_id.as_str().to_string();
            let solution = solution.clone();
            tokio::spawn(async move { election.validate_vote(&session_id, 3, solution).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(e) => assert_eq!(e, Error::SessionNotFound),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(election.vote_results(), vec![0, 0, 1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_vote_cycles_for_one_credential_commit_at_most_once() {
    let election = election();
    let secret = Arc::new(registered_voter(&election, "ABCDE").await);

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let election = election.clone();
            let secret = Arc::clone(&secret);
            tokio::spawn(async move { cast(&election, &secret, (i % 3) as u32 + 1).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(e) => assert!(
                matches!(e, Error::AlreadyVoted | Error::SessionNotFound),
                "unexpected error: {e}"
            ),
        }
    }

    assert!(successes <= 1);
    assert_eq!(election.stats().await.votes_cast, successes);

    let retry = cast(&election, &secret, 1).await;
    if successes == 1 {
        assert_eq!(retry, Err(Error::AlreadyVoted));
    } else {
        assert_eq!(retry, Ok(()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_voters_in_parallel_are_all_counted() {
    let election = election();

    let handles: Vec<_> = (0..24)
        .map(|n| {
            let election = election.clone();
            tokio::spawn(async move {
                let secret = registered_voter(&election, &identity(n)).await;
                cast(&election, &secret, (n % 3) as u32 + 1).await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(election.vote_results(), vec![8, 8, 8]);
}

#[tokio::test]
async fn full_voting_flow_over_grpc() {
    init_tracing();
    let election = election();
    let engine = ModpEngine::rfc5114();
    let (server_url, _handle) = start_test_server(election).await;

    let mut client: AnonVoteClient<Channel> = AnonVoteClient::connect(server_url)
        .await
        .expect("Failed to connect to server");

    let options = client
        .vote_options(Request::new(VoteOptionsReq {}))
        .await
        .unwrap()
        .into_inner()
        .options;
    assert_eq!(options, vec!["Yes", "No", "Abstain"]);

    let registration_key = client
        .validate_id(Request::new(ValidateIdReq {
            id: "ABCDE".to_string(),
        }))
        .await
        .expect("Validation should succeed")
        .into_inner()
        .registration_key;
    assert_eq!(registration_key.len(), 16);

    let secret = engine.generate_keypair(&mut OsRng);
    client
        .register(Request::new(register_req(
            registration_key.clone(),
            secret.public_key(),
        )))
        .await
        .expect("Registration should succeed");

    let status = client
        .register(Request::new(register_req(
            registration_key,
            secret.public_key(),
        )))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);
    assert_eq!(error_kind(&status), Some("KEY_ALREADY_CONSUMED"));

    let committed = engine.commit(&secret, &mut OsRng);
    let vote_res = client
        .vote(Request::new(vote_req(
            1,
            secret.public_key(),
            committed.commitment.ka(),
            committed.commitment.kb(),
        )))
        .await
        .expect("Vote should succeed")
        .into_inner();
    assert_eq!(vote_res.auth_session_id.len(), 64);
    assert_eq!(vote_res.challenge.len(), engine.scalar_len());

    let solution = engine.respond(
        &secret,
        &committed.nonce,
        &Challenge::from_bytes(vote_res.challenge),
    );
    client
        .validate_vote(Request::new(ValidateVoteReq {
            auth_session_id: vote_res.auth_session_id,
            vote: 1,
            solution: solution.into_bytes(),
        }))
        .await
        .expect("Proof should be accepted");

    let votes = client
        .vote_results(Request::new(VoteResultsReq {}))
        .await
        .unwrap()
        .into_inner()
        .votes;
    assert_eq!(votes, vec![1, 0, 0]);

    let committed = engine.commit(&secret, &mut OsRng);
    let status = client
        .vote(Request::new(vote_req(
            2,
            secret.public_key(),
            committed.commitment.ka(),
            committed.commitment.kb(),
        )))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);
    assert_eq!(error_kind(&status), Some("CREDENTIAL_INELIGIBLE"));
}

#[tokio::test]
async fn grpc_rejects_malformed_values() {
    let (server_url, _handle) = start_test_server(election()).await;
    let mut client = AnonVoteClient::connect(server_url).await.unwrap();

    let status = client
        .validate_id(Request::new(ValidateIdReq { id: String::new() }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let bogus = PublicKey::new(vec![1; 3], vec![2; 3], vec![3; 3], vec![4; 3]);
    let status = client
        .register(Request::new(register_req("abc".to_string(), &bogus)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(error_kind(&status), Some("MALFORMED_INPUT"));

    let status = client
        .validate_vote(Request::new(ValidateVoteReq {
            auth_session_id: "0".repeat(64),
            vote: 1,
            solution: vec![0; 20],
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(error_kind(&status), Some("SESSION_NOT_FOUND"));
}
