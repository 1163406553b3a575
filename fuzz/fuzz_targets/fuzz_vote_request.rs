#![no_main]

use anonvote::proto::VoteReq;
use anonvote::{Commitment, PublicKey};
use libfuzzer_sys::fuzz_target;
use prost::Message;

fuzz_target!(|data: &[u8]| {
    if let Ok(req) = VoteReq::decode(data) {
        let public_key = PublicKey::new(req.a, req.b, req.alpha, req.beta);
        let commitment = Commitment::new(req.ka, req.kb);
        let _ = public_key.credential_id();
        let _ = public_key.has_shape(128);
        let _ = commitment.has_shape(128);
    }
});
