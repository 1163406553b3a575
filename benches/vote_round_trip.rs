use std::sync::Arc;

use anonvote::{CryptoEngine, Election, ElectionConfig, LengthRule, ModpEngine};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::OsRng;

fn bench_vote_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let election = Election::new(
        ModpEngine::rfc5114(),
        Arc::new(LengthRule::new(8)),
        ElectionConfig::default(),
    )
    .unwrap();
    let mut next_identity = 0u64;

    c.bench_function("register_vote_validate", |b| {
        b.iter_batched(
            || {
                next_identity += 1;
                let identity = format!("{next_identity:08}");
                let secret = election.engine().generate_keypair(&mut OsRng);
                rt.block_on(async {
                    let key = election.validate_id(&identity).await.unwrap();
                    election
                        .register(&key, secret.public_key().clone())
                        .await
                        .unwrap();
                });
                secret
            },
            |secret| {
                rt.block_on(async {
                    let engine = election.engine();
                    let committed = engine.commit(&secret, &mut OsRng);
                    let ticket = election
                        .vote(1, secret.public_key(), committed.commitment)
                        .await
                        .unwrap();
                    let solution = engine.respond(&secret, &committed.nonce, &ticket.challenge);
                    election
                        .validate_vote(ticket.session_id.as_str(), 1, solution)
                        .await
                        .unwrap();
                })
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_vote_round_trip);
criterion_main!(benches);
