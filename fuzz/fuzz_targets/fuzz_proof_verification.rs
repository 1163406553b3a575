#![no_main]

use anonvote::{Challenge, Commitment, CryptoEngine, ModpEngine, PublicKey, Solution};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let engine = ModpEngine::toy();
    // Toy group: 1-byte elements and scalars.
    if data.len() < 8 {
        return;
    }

    let public_key = PublicKey::new(
        vec![data[0]],
        vec![data[1]],
        vec![data[2]],
        vec![data[3]],
    );
    let commitment = Commitment::new(vec![data[4]], vec![data[5]]);
    let challenge = Challenge::from_bytes(vec![data[6]]);
    let solution = Solution::from_bytes(data[7..].to_vec());

    let _ = engine.verify(&public_key, &commitment, &challenge, &solution);
});
