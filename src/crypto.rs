//! Low-level cryptographic primitives.
//!
//! This module is one of exactly two places in the crate that import `ring`
//! directly (the other is `keys`). Everything else reaches randomness,
//! sub-key derivation and the PRF through the functions exposed here.
//!
//! Primitive choices:
//! - **Randomness**: `ring::rand::SystemRandom`
//! - **Sub-key derivation**: HKDF-SHA256
//! - **PRF**: HMAC-SHA256 in counter mode
//! - **Fingerprints**: SHA-256, truncated by the caller

use ring::digest;
use ring::hkdf;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{EnvelopeError, Result};

/// Length of one HMAC-SHA256 output block.
pub const PRF_BLOCK_LEN: usize = 32;

/// Length of a derived sub-key (HKDF-SHA256 output).
pub const SUBKEY_LEN: usize = 32;

/// Fill `buf` with cryptographically secure random bytes.
///
/// `SystemRandom` is the only source of randomness in the crate.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| EnvelopeError::RandomnessFailure)
}

/// Draw a fixed-size array of random bytes.
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}

/// Derive a 256-bit sub-key from `ikm` for the given purpose label.
///
/// ```text
/// HKDF-SHA256(ikm = key, salt = None, info = label)
/// ```
///
/// Different labels give statistically independent outputs, so one DEK can
/// feed several independent round keys without reuse.
pub fn derive_subkey(ikm: &[u8], label: &str) -> Result<[u8; SUBKEY_LEN]> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(ikm);

    let info = [label.as_bytes()];
    let okm = prk
        .expand(&info, hkdf::HKDF_SHA256)
        .map_err(|_| EnvelopeError::KeyDerivationFailure)?;

    let mut derived = [0u8; SUBKEY_LEN];
    okm.fill(&mut derived)
        .map_err(|_| EnvelopeError::KeyDerivationFailure)?;
    Ok(derived)
}

/// Expand `input` into `out.len()` pseudorandom bytes keyed by `key`.
///
/// Block `i` is `HMAC-SHA256(key, i_be32 || input)`; the blocks are
/// concatenated and truncated. Every output byte depends on every input
/// byte.
pub fn prf_stream(key: &[u8; SUBKEY_LEN], input: &[u8], out: &mut [u8]) {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    for (counter, chunk) in out.chunks_mut(PRF_BLOCK_LEN).enumerate() {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&(counter as u32).to_be_bytes());
        ctx.update(input);
        let tag = ctx.sign();
        chunk.copy_from_slice(&tag.as_ref()[..chunk.len()]);
    }
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let d = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    out
}
