#![no_main]

use anonvote::{CryptoEngine, ModpEngine, PublicKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let engine = ModpEngine::rfc5114();
    let len = engine.element_len();
    if data.len() < 4 * len {
        return;
    }

    let public_key = PublicKey::new(
        data[..len].to_vec(),
        data[len..2 * len].to_vec(),
        data[2 * len..3 * len].to_vec(),
        data[3 * len..4 * len].to_vec(),
    );

    if engine.validate_public_key(&public_key) {
        assert!(public_key.has_shape(len));
    }
});
