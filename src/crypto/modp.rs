use num_bigint::{BigUint, RandBigInt};
use rand::{CryptoRng, RngCore};

use super::{
    Challenge, ChallengeCommitment, Commitment, CryptoEngine, Nonce, PublicKey, SecretKey,
    Solution,
};
use crate::{Error, Result};

// RFC 5114 section 2.1: 1024-bit MODP group with 160-bit prime order subgroup.
const RFC5114_P: &str = "B10B8F96A080E01DDE92DE5EAE5D54EC52C99FBCFB06A3C69A6A9DCA52D23B61\
                         6073E28675A23D189838EF1E2EE652C013ECB4AEA906112324975C3CD49B83BF\
                         ACCBDD7D90C4BD7098488E9C219A73724EFFD6FAE5644738FAA31A4FF55BCCC0\
                         A151AF5F0DC8B4BD45BF37DF365C1A65E68CFDA76D4DA708DF1FB2BC2E4A4371";
const RFC5114_Q: &str = "F518AA8781A8DF278ABA4E7D64B7CB9D49462353";
const RFC5114_G: &str = "A4D1CBD5C3FD34126765A442EFB99905F8104DD258AC507FD6406CFF14266D31\
                         266FEA1E5C41564B777E690F5504F213160217B4B01B886A5E91547F9E2749F4\
                         D7FBD7D3B9A92EE1909D0D2263F80A76A6A24C087A091F531DBF0A0169B6A28A\
                         D662A4D18E73AFA32D779D5918D08BC8858F4DCEF97C2A24855E6EEB22B3B2E5";

/// Chaum-Pedersen style proof of knowledge over a prime-order subgroup of Z_p^*.
///
/// A credential proves knowledge of `x` with `a = alpha^x` and `b = beta^x`:
///
/// - commit: `ka = alpha^k`, `kb = beta^k`
/// - respond: `s = k - c * x (mod q)`
/// - verify: `ka = alpha^s * a^c` and `kb = beta^s * b^c` (mod p)
///
/// Elements serialize as big-endian integers left-padded to the byte width of
/// `p`, scalars to the byte width of `q`.
#[derive(Clone, Debug)]
pub struct ModpEngine {
    name: &'static str,
    p: BigUint,
    q: BigUint,
    g: BigUint,
    element_len: usize,
    scalar_len: usize,
}

impl ModpEngine {
    /// Creates an engine over a custom group.
    ///
    /// Returns an error unless `q` is a divisor of `p - 1` and `g` generates a
    /// non-trivial subgroup of order `q`. Primality is the caller's responsibility.
    pub fn new(name: &'static str, p: BigUint, q: BigUint, g: BigUint) -> Result<Self> {
        let one = BigUint::from(1u32);
        if p <= BigUint::from(3u32) || q <= one {
            return Err(Error::Config("group parameters are too small".into()));
        }
        if (&p - &one) % &q != BigUint::from(0u32) {
            return Err(Error::Config("subgroup order must divide p - 1".into()));
        }
        if g <= one || g >= p || g.modpow(&q, &p) != one {
            return Err(Error::Config("generator is not of order q".into()));
        }

        Ok(Self {
            name,
            element_len: byte_len(&p),
            scalar_len: byte_len(&q),
            p,
            q,
            g,
        })
    }

    /// The RFC 5114 1024-bit group with a 160-bit subgroup.
    pub fn rfc5114() -> Self {
        let parse = |hex: &str| {
            BigUint::parse_bytes(hex.as_bytes(), 16)
                .unwrap_or_else(|| unreachable!("RFC 5114 constants are valid hex"))
        };
        Self::new(
            "RFC5114-1024-160",
            parse(RFC5114_P),
            parse(RFC5114_Q),
            parse(RFC5114_G),
        )
        .unwrap_or_else(|e| unreachable!("RFC 5114 parameters are well formed: {e}"))
    }

    /// The textbook `p = 23, q = 11, g = 4` group. Only for demos and tests.
    pub fn toy() -> Self {
        Self::new(
            "Toy-23-11",
            BigUint::from(23u32),
            BigUint::from(11u32),
            BigUint::from(4u32),
        )
        .unwrap_or_else(|e| unreachable!("toy parameters are well formed: {e}"))
    }

    fn encode(value: &BigUint, len: usize) -> Vec<u8> {
        let bytes = value.to_bytes_be();
        let mut out = vec![0u8; len.saturating_sub(bytes.len())];
        out.extend_from_slice(&bytes);
        out
    }

    fn encode_element(&self, value: &BigUint) -> Vec<u8> {
        Self::encode(value, self.element_len)
    }

    fn encode_scalar(&self, value: &BigUint) -> Vec<u8> {
        Self::encode(value, self.scalar_len)
    }

    /// Decodes an element in `[1, p)`.
    fn decode_element(&self, bytes: &[u8]) -> Option<BigUint> {
        if bytes.len() != self.element_len {
            return None;
        }
        let value = BigUint::from_bytes_be(bytes);
        (value > BigUint::from(0u32) && value < self.p).then_some(value)
    }

    /// Decodes a scalar in `[0, q)`.
    fn decode_scalar(&self, bytes: &[u8]) -> Option<BigUint> {
        if bytes.len() != self.scalar_len {
            return None;
        }
        let value = BigUint::from_bytes_be(bytes);
        (value < self.q).then_some(value)
    }

    fn in_subgroup(&self, value: &BigUint) -> bool {
        value.modpow(&self.q, &self.p) == BigUint::from(1u32)
    }

    fn random_nonzero_scalar<R: RngCore + CryptoRng>(&self, rng: &mut R) -> BigUint {
        rng.gen_biguint_range(&BigUint::from(1u32), &self.q)
    }

    fn keypair_from_scalars(&self, x: &BigUint, beta: BigUint) -> SecretKey {
        let alpha = &self.g;
        let a = alpha.modpow(x, &self.p);
        let b = beta.modpow(x, &self.p);
        let public = PublicKey::new(
            self.encode_element(&a),
            self.encode_element(&b),
            self.encode_element(alpha),
            self.encode_element(&beta),
        );
        SecretKey::new(self.encode_scalar(x), public)
    }

    fn commit_with_nonce(&self, secret_key: &SecretKey, k: &BigUint) -> Option<ChallengeCommitment> {
        let public = secret_key.public_key();
        let alpha = self.decode_element(public.alpha())?;
        let beta = self.decode_element(public.beta())?;

        let ka = alpha.modpow(k, &self.p);
        let kb = beta.modpow(k, &self.p);

        Some(ChallengeCommitment {
            commitment: Commitment::new(self.encode_element(&ka), self.encode_element(&kb)),
            nonce: Nonce::new(self.encode_scalar(k)),
        })
    }

    /// Checks `lhs == base^s * y^c (mod p)`.
    fn check_equation(
        &self,
        lhs: &BigUint,
        base: &BigUint,
        y: &BigUint,
        c: &BigUint,
        s: &BigUint,
    ) -> bool {
        let rhs = (base.modpow(s, &self.p) * y.modpow(c, &self.p)) % &self.p;
        *lhs == rhs
    }
}

fn byte_len(value: &BigUint) -> usize {
    usize::try_from(value.bits().div_ceil(8)).unwrap_or(usize::MAX)
}

impl CryptoEngine for ModpEngine {
    fn name(&self) -> &'static str {
        self.name
    }

    fn element_len(&self) -> usize {
        self.element_len
    }

    fn scalar_len(&self) -> usize {
        self.scalar_len
    }

    fn generate_keypair<R: RngCore + CryptoRng>(&self, rng: &mut R) -> SecretKey {
        let x = self.random_nonzero_scalar(rng);
        let r = self.random_nonzero_scalar(rng);
        let beta = self.g.modpow(&r, &self.p);
        self.keypair_from_scalars(&x, beta)
    }

    fn validate_public_key(&self, public_key: &PublicKey) -> bool {
        let components = [
            public_key.a(),
            public_key.b(),
            public_key.alpha(),
            public_key.beta(),
        ];
        components.iter().all(|bytes| {
            self.decode_element(bytes)
                .is_some_and(|value| value != BigUint::from(1u32) && self.in_subgroup(&value))
        })
    }

    fn commit<R: RngCore + CryptoRng>(
        &self,
        secret_key: &SecretKey,
        rng: &mut R,
    ) -> ChallengeCommitment {
        let k = self.random_nonzero_scalar(rng);
        self.commit_with_nonce(secret_key, &k).unwrap_or_else(|| ChallengeCommitment {
            // A key from another group cannot commit; an empty commitment never verifies.
            commitment: Commitment::new(Vec::new(), Vec::new()),
            nonce: Nonce::new(Vec::new()),
        })
    }

    fn random_challenge<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Challenge {
        let c = rng.gen_biguint_below(&self.q);
        Challenge::from_bytes(self.encode_scalar(&c))
    }

    fn respond(&self, secret_key: &SecretKey, nonce: &Nonce, challenge: &Challenge) -> Solution {
        let x = BigUint::from_bytes_be(secret_key.secret()) % &self.q;
        let k = BigUint::from_bytes_be(nonce.as_bytes()) % &self.q;
        let c = BigUint::from_bytes_be(challenge.as_bytes()) % &self.q;

        let cx = (c * x) % &self.q;
        let s = (k + &self.q - cx) % &self.q;
        Solution::from_bytes(self.encode_scalar(&s))
    }

    fn verify(
        &self,
        public_key: &PublicKey,
        commitment: &Commitment,
        challenge: &Challenge,
        solution: &Solution,
    ) -> bool {
        let decoded = (|| {
            Some((
                self.decode_element(public_key.a())?,
                self.decode_element(public_key.b())?,
                self.decode_element(public_key.alpha())?,
                self.decode_element(public_key.beta())?,
                self.decode_element(commitment.ka())?,
                self.decode_element(commitment.kb())?,
                self.decode_scalar(challenge.as_bytes())?,
                self.decode_scalar(solution.as_bytes())?,
            ))
        })();

        let Some((a, b, alpha, beta, ka, kb, c, s)) = decoded else {
            return false;
        };

        let check1 = self.check_equation(&ka, &alpha, &a, &c, &s);
        let check2 = self.check_equation(&kb, &beta, &b, &c, &s);
        check1 && check2
    }
}
