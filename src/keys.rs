//! Fixed-length key material and the DEK wrap primitive.
//!
//! This module owns two responsibilities:
//! 1. Holding key material in a type that is opaque, non-cloneable and
//!    zeroised on drop.
//! 2. Wrapping one key under another with AES-128 key wrap (RFC 3394).
//!
//! AES key wrap is deterministic and carries a 64-bit integrity check, so a
//! wrong KEK or a single flipped bit in the wrapped bytes is detected on
//! unwrap instead of yielding a garbage key.
//!
//! ## Wrapped layout
//!
//! ```text
//! [ AES-KW(KEK, DEK) (24 bytes) ]
//! ```

use aes_kw::KekAes128;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto;
use crate::error::{EnvelopeError, Result};

/// Size of every DEK and KEK in bytes (128 bits).
pub const KEY_LEN: usize = 16;

/// AES-KW output for a 16-byte key: 16 + 8 bytes of integrity block.
pub const WRAPPED_KEY_LEN: usize = KEY_LEN + 8;

/// 128 bits of secret key material.
///
/// - Not `Clone`. Duplicating a key requires an explicit `from_bytes`.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct FixedLengthKey {
    bytes: [u8; KEY_LEN],
}

/// A per-item data encryption key.
pub type Dek = FixedLengthKey;

/// The secret half of a KEK record.
pub type KekMaterial = FixedLengthKey;

impl FixedLengthKey {
    /// Construct a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Draw a fresh key from the system random source.
    pub fn generate() -> Result<Self> {
        Ok(Self::from_bytes(crypto::random_array()?))
    }

    /// Borrow the raw key bytes.
    ///
    /// Exposed so that external `ContentCipher` backends can key themselves.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for FixedLengthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FixedLengthKey(..)")
    }
}

/// Wrap `key` under `kek`.
pub(crate) fn wrap_key(key: &FixedLengthKey, kek: &KekMaterial) -> Result<Vec<u8>> {
    let kek = KekAes128::from(*kek.as_bytes());
    let mut out = vec![0u8; WRAPPED_KEY_LEN];
    kek.wrap(key.as_bytes(), &mut out)
        .map_err(|_| EnvelopeError::WrapFailure)?;
    Ok(out)
}

/// Unwrap bytes produced by `wrap_key`.
///
/// Any length mismatch or integrity failure is `DekUnwrapFailed`; no
/// partially unwrapped key ever leaves this function.
pub(crate) fn unwrap_key(wrapped: &[u8], kek: &KekMaterial) -> Result<FixedLengthKey> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(EnvelopeError::DekUnwrapFailed);
    }
    let kek = KekAes128::from(*kek.as_bytes());
    let mut out = FixedLengthKey::from_bytes([0u8; KEY_LEN]);
    kek.unwrap(wrapped, &mut out.bytes)
        .map_err(|_| EnvelopeError::DekUnwrapFailed)?;
    Ok(out)
}
