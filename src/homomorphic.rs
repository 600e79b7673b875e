//! Homomorphic capability adapters.
//!
//! A capability is one key pair of an additively homomorphic cryptosystem.
//! The key manager creates one capability per KEK version and hands it out
//! by version; the codec uses it to encode scaled numeric values so they can
//! be summed without decryption.
//!
//! Capabilities only ever see integers. Scaling floats to integers is the
//! codec's job.
//!
//! The shipped backend is Paillier with `g = n + 1`:
//!
//! ```text
//! Enc(m)        = (1 + m·n) · r^n        mod n²
//! Dec(c)        = L(c^λ mod n²) · μ      mod n,   L(x) = (x - 1) / n
//! Enc(a)·Enc(b) = Enc(a + b)
//! Enc(a)^k      = Enc(k·a)
//! ```

use std::fmt;
use std::sync::Arc;

use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, ToPrimitive, Zero};
use rand::rngs::OsRng;

use crate::crypto;
use crate::error::{EnvelopeError, Result};

/// Length of the capability fingerprint carried by every token.
pub const KEY_ID_LEN: usize = 8;

/// Fingerprint identifying the capability that produced a token.
pub type KeyId = [u8; KEY_ID_LEN];

/// An encrypted integer bound to the capability that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct NumericToken {
    key_id: KeyId,
    ciphertext: Vec<u8>,
}

impl NumericToken {
    pub fn new(key_id: KeyId, ciphertext: Vec<u8>) -> Self {
        Self { key_id, ciphertext }
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Serialised form: `key_id || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_ID_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.key_id);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= KEY_ID_LEN {
            return Err(EnvelopeError::MalformedPayload(
                "numeric token too short".into(),
            ));
        }
        let (id, ciphertext) = bytes.split_at(KEY_ID_LEN);
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(id);
        Ok(Self::new(key_id, ciphertext.to_vec()))
    }
}

impl fmt::Debug for NumericToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumericToken")
            .field("key_id", &hex(&self.key_id))
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One key pair of an additively homomorphic cryptosystem.
///
/// Every operation rejects tokens from another capability with
/// `IncompatibleCapability`.
pub trait HomomorphicCapability: Send + Sync + fmt::Debug {
    /// Fingerprint stamped on every token this capability produces.
    fn key_id(&self) -> KeyId;

    fn encode_numeric(&self, value: i64) -> Result<NumericToken>;

    fn decode_numeric(&self, token: &NumericToken) -> Result<i64>;

    /// A token that decodes to the sum of the two inputs.
    fn add(&self, a: &NumericToken, b: &NumericToken) -> Result<NumericToken>;

    /// A token that decodes to `factor` times the input.
    fn scalar_mul(&self, token: &NumericToken, factor: i64) -> Result<NumericToken>;
}

/// Factory for capabilities. The key manager calls `new_capability` once per
/// rotation.
pub trait HomomorphicScheme: Send + Sync {
    fn name(&self) -> &'static str;

    fn new_capability(&self) -> Result<Arc<dyn HomomorphicCapability>>;
}

fn ensure_owned(owner: &KeyId, token: &NumericToken) -> Result<()> {
    if owner != token.key_id() {
        return Err(EnvelopeError::IncompatibleCapability(format!(
            "token from capability {} used with capability {}",
            hex(token.key_id()),
            hex(owner)
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Paillier scheme
// ---------------------------------------------------------------------------

/// Creates a fresh Paillier key pair per capability.
#[derive(Debug, Clone, Copy)]
pub struct PaillierScheme {
    modulus_bits: usize,
}

impl PaillierScheme {
    pub const DEFAULT_MODULUS_BITS: usize = 2048;

    /// Smallest accepted modulus. Anything below cannot hold the full `i64`
    /// range with room for sums.
    pub const MIN_MODULUS_BITS: usize = 256;

    pub fn new() -> Self {
        Self::with_modulus_bits(Self::DEFAULT_MODULUS_BITS)
    }

    pub fn with_modulus_bits(modulus_bits: usize) -> Self {
        Self { modulus_bits }
    }

    pub fn modulus_bits(&self) -> usize {
        self.modulus_bits
    }
}

impl Default for PaillierScheme {
    fn default() -> Self {
        Self::new()
    }
}

impl HomomorphicScheme for PaillierScheme {
    fn name(&self) -> &'static str {
        "paillier"
    }

    fn new_capability(&self) -> Result<Arc<dyn HomomorphicCapability>> {
        Ok(Arc::new(PaillierCapability::generate(self.modulus_bits)?))
    }
}

// ---------------------------------------------------------------------------
// Paillier capability
// ---------------------------------------------------------------------------

/// A Paillier key pair.
pub struct PaillierCapability {
    n: BigUint,
    n_squared: BigUint,
    half_n: BigUint,
    lambda: BigUint,
    mu: BigUint,
    key_id: KeyId,
    ciphertext_len: usize,
}

impl PaillierCapability {
    /// Generate a key pair whose modulus is exactly `modulus_bits` long.
    pub fn generate(modulus_bits: usize) -> Result<Self> {
        if modulus_bits < PaillierScheme::MIN_MODULUS_BITS || modulus_bits % 2 != 0 {
            return Err(EnvelopeError::CapabilityFailure(format!(
                "modulus must be an even bit length >= {}, got {modulus_bits}",
                PaillierScheme::MIN_MODULUS_BITS
            )));
        }
        let half = modulus_bits / 2;
        loop {
            let p = random_prime(half)?;
            let q = random_prime(half)?;
            // Two half-length primes can multiply to one bit short.
            if p == q || (&p * &q).bits() as usize != modulus_bits {
                continue;
            }
            return Self::from_primes(&p, &q);
        }
    }

    fn from_primes(p: &BigUint, q: &BigUint) -> Result<Self> {
        let one = BigUint::one();
        let n = p * q;
        let lambda = (p - &one) * (q - &one);
        if !n.gcd(&lambda).is_one() {
            return Err(EnvelopeError::CapabilityFailure(
                "modulus shares a factor with phi(n)".into(),
            ));
        }
        let mu = lambda.modinv(&n).ok_or_else(|| {
            EnvelopeError::CapabilityFailure("phi(n) is not invertible mod n".into())
        })?;

        let n_squared = &n * &n;
        let digest = crypto::sha256(&n.to_bytes_be());
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&digest[..KEY_ID_LEN]);

        Ok(Self {
            half_n: &n >> 1u32,
            ciphertext_len: ((n_squared.bits() + 7) / 8) as usize,
            n,
            n_squared,
            lambda,
            mu,
            key_id,
        })
    }

    pub fn modulus_bits(&self) -> u64 {
        self.n.bits()
    }

    /// Map a signed value into `Z_n`; negatives wrap to the top half.
    fn embed(&self, value: i64) -> BigUint {
        let magnitude = BigUint::from(value.unsigned_abs());
        if value < 0 {
            &self.n - magnitude
        } else {
            magnitude
        }
    }

    fn extract(&self, m: BigUint) -> Result<i64> {
        let overflow = || EnvelopeError::MalformedPayload("numeric value exceeds i64".into());
        let (negative, magnitude) = if m > self.half_n {
            (true, &self.n - m)
        } else {
            (false, m)
        };
        let magnitude = i128::from(magnitude.to_u64().ok_or_else(overflow)?);
        let value = if negative { -magnitude } else { magnitude };
        i64::try_from(value).map_err(|_| overflow())
    }

    fn encrypt(&self, m: &BigUint) -> BigUint {
        let r = loop {
            let r = OsRng.gen_biguint_below(&self.n);
            if !r.is_zero() && r.gcd(&self.n).is_one() {
                break r;
            }
        };
        let gm = (&self.n * m + 1u32) % &self.n_squared;
        let rn = r.modpow(&self.n, &self.n_squared);
        (gm * rn) % &self.n_squared
    }

    fn decrypt(&self, c: &BigUint) -> BigUint {
        let u = c.modpow(&self.lambda, &self.n_squared);
        let l = (u - 1u32) / &self.n;
        (l * &self.mu) % &self.n
    }

    fn to_token(&self, c: &BigUint) -> NumericToken {
        let raw = c.to_bytes_be();
        let mut ciphertext = vec![0u8; self.ciphertext_len.saturating_sub(raw.len())];
        ciphertext.extend_from_slice(&raw);
        NumericToken::new(self.key_id, ciphertext)
    }

    fn from_token(&self, token: &NumericToken) -> Result<BigUint> {
        ensure_owned(&self.key_id, token)?;
        if token.ciphertext().len() != self.ciphertext_len {
            return Err(EnvelopeError::MalformedPayload(
                "numeric ciphertext has wrong width".into(),
            ));
        }
        let c = BigUint::from_bytes_be(token.ciphertext());
        if c.is_zero() || c >= self.n_squared || !c.gcd(&self.n).is_one() {
            return Err(EnvelopeError::MalformedPayload(
                "numeric ciphertext out of range".into(),
            ));
        }
        Ok(c)
    }
}

impl HomomorphicCapability for PaillierCapability {
    fn key_id(&self) -> KeyId {
        self.key_id
    }

    fn encode_numeric(&self, value: i64) -> Result<NumericToken> {
        let c = self.encrypt(&self.embed(value));
        Ok(self.to_token(&c))
    }

    fn decode_numeric(&self, token: &NumericToken) -> Result<i64> {
        let c = self.from_token(token)?;
        self.extract(self.decrypt(&c))
    }

    fn add(&self, a: &NumericToken, b: &NumericToken) -> Result<NumericToken> {
        let ca = self.from_token(a)?;
        let cb = self.from_token(b)?;
        Ok(self.to_token(&((ca * cb) % &self.n_squared)))
    }

    fn scalar_mul(&self, token: &NumericToken, factor: i64) -> Result<NumericToken> {
        let c = self.from_token(token)?;
        let exponent = self.embed(factor);
        Ok(self.to_token(&c.modpow(&exponent, &self.n_squared)))
    }
}

/// A random prime of exactly `bits` bits.
fn random_prime(bits: usize) -> Result<BigUint> {
    glass_pumpkin::prime::new(bits).map_err(|e| EnvelopeError::CapabilityFailure(e.to_string()))
}

impl fmt::Debug for PaillierCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaillierCapability")
            .field("key_id", &hex(&self.key_id))
            .field("modulus_bits", &self.n.bits())
            .finish_non_exhaustive()
    }
}
