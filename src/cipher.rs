//! Content cipher adapters.
//!
//! A content cipher is a keyed, deterministic, invertible transform over
//! payload bytes. The key manager only relies on the contract:
//!
//! - `decode(encode(p, k), k) == p` for every payload and key
//! - flipping one input bit flips roughly half of the output bits
//!
//! Two backends ship with the crate. `FeistelCipher` is a wide-block
//! permutation over the padded payload. `GeneticCipher` renders the Feistel
//! output as a nucleotide sequence.

use crate::crypto::{self, SUBKEY_LEN};
use crate::error::{EnvelopeError, Result};
use crate::keys::FixedLengthKey;

/// A pluggable payload transform keyed by a DEK.
pub trait ContentCipher: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Transform `payload` into an opaque content token.
    fn encode(&self, payload: &[u8], key: &FixedLengthKey) -> Result<Vec<u8>>;

    /// Invert `encode`.
    fn decode(&self, token: &[u8], key: &FixedLengthKey) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Feistel
// ---------------------------------------------------------------------------

/// Number of Feistel rounds. Four rounds spread a change in either half
/// across the whole block.
const ROUNDS: usize = 4;

/// End-of-payload marker; everything after it in a block is zero.
const PAD_MARKER: u8 = 0x80;

/// Four-round unbalanced Feistel network over the whole payload.
///
/// The payload is first padded with `0x80` and zero bytes up to at least
/// [`FeistelCipher::MIN_BLOCK_LEN`], so even a one-byte payload permutes
/// over two 64-bit halves. Tokens are `max(n + 1, MIN_BLOCK_LEN)` bytes.
///
/// The block splits into `A = p[..n/2]` and `B = p[n/2..]`. Odd rounds
/// apply `B ^= F(A)`, even rounds `A ^= F(B)`, where `F` is an HMAC-SHA256
/// stream under a per-round key derived from the DEK.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeistelCipher;

impl FeistelCipher {
    /// Smallest block the network runs over.
    pub const MIN_BLOCK_LEN: usize = 16;

    pub fn new() -> Self {
        Self
    }

    fn pad(payload: &[u8]) -> Vec<u8> {
        let len = (payload.len() + 1).max(Self::MIN_BLOCK_LEN);
        let mut block = Vec::with_capacity(len);
        block.extend_from_slice(payload);
        block.push(PAD_MARKER);
        block.resize(len, 0);
        block
    }

    fn unpad(mut block: Vec<u8>) -> Result<Vec<u8>> {
        let end = block
            .iter()
            .rposition(|&b| b != 0)
            .filter(|&i| block[i] == PAD_MARKER)
            .ok_or_else(|| EnvelopeError::MalformedPayload("missing payload end marker".into()))?;
        block.truncate(end);
        Ok(block)
    }

    fn round_keys(key: &FixedLengthKey) -> Result<[[u8; SUBKEY_LEN]; ROUNDS]> {
        let mut keys = [[0u8; SUBKEY_LEN]; ROUNDS];
        for (i, slot) in keys.iter_mut().enumerate() {
            *slot = crypto::derive_subkey(key.as_bytes(), &format!("feistel:round:{i}"))?;
        }
        Ok(keys)
    }

    /// XOR `F(round_key, src)` into `dst`.
    fn mix(round_key: &[u8; SUBKEY_LEN], src: &[u8], dst: &mut [u8]) {
        let mut stream = vec![0u8; dst.len()];
        crypto::prf_stream(round_key, src, &mut stream);
        for (d, s) in dst.iter_mut().zip(stream) {
            *d ^= s;
        }
    }

    fn permute(&self, data: &[u8], key: &FixedLengthKey, forward: bool) -> Result<Vec<u8>> {
        let keys = Self::round_keys(key)?;
        let mut out = data.to_vec();
        let (a, b) = out.split_at_mut(data.len() / 2);

        let order: Vec<usize> = if forward {
            (0..ROUNDS).collect()
        } else {
            (0..ROUNDS).rev().collect()
        };

        for round in order {
            if round % 2 == 0 {
                Self::mix(&keys[round], a, b);
            } else {
                Self::mix(&keys[round], b, a);
            }
        }
        Ok(out)
    }
}

impl ContentCipher for FeistelCipher {
    fn name(&self) -> &'static str {
        "feistel"
    }

    fn encode(&self, payload: &[u8], key: &FixedLengthKey) -> Result<Vec<u8>> {
        self.permute(&Self::pad(payload), key, true)
    }

    fn decode(&self, token: &[u8], key: &FixedLengthKey) -> Result<Vec<u8>> {
        if token.len() < Self::MIN_BLOCK_LEN {
            return Err(EnvelopeError::MalformedPayload(format!(
                "content token of {} bytes is shorter than one block",
                token.len()
            )));
        }
        Self::unpad(self.permute(token, key, false)?)
    }
}

// ---------------------------------------------------------------------------
// Genetic
// ---------------------------------------------------------------------------

const NUCLEOTIDES: [u8; 4] = *b"ACGT";

/// Bases per byte: two bits each.
const BASES_PER_BYTE: usize = 4;

/// Feistel output rendered as a DNA sequence.
///
/// Each byte becomes four nucleotides, most significant bits first. The
/// mapping from 2-bit symbols to `A`/`C`/`G`/`T` is one of the 24
/// permutations of the alphabet, selected by a key-derived byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneticCipher {
    inner: FeistelCipher,
}

impl GeneticCipher {
    pub fn new() -> Self {
        Self {
            inner: FeistelCipher::new(),
        }
    }

    fn alphabet(key: &FixedLengthKey) -> Result<[u8; 4]> {
        let selector = crypto::derive_subkey(key.as_bytes(), "genetic:alphabet")?;
        Ok(nth_permutation(selector[0] as usize % 24))
    }
}

/// The `index`-th permutation of `ACGT` in lexicographic order.
fn nth_permutation(mut index: usize) -> [u8; 4] {
    const FACTORIALS: [usize; 4] = [6, 2, 1, 1];

    let mut pool = NUCLEOTIDES.to_vec();
    let mut out = [0u8; 4];
    for (slot, radix) in out.iter_mut().zip(FACTORIALS) {
        *slot = pool.remove(index / radix);
        index %= radix;
    }
    out
}

impl ContentCipher for GeneticCipher {
    fn name(&self) -> &'static str {
        "genetic"
    }

    fn encode(&self, payload: &[u8], key: &FixedLengthKey) -> Result<Vec<u8>> {
        let alphabet = Self::alphabet(key)?;
        let scrambled = self.inner.encode(payload, key)?;

        let mut sequence = Vec::with_capacity(scrambled.len() * BASES_PER_BYTE);
        for byte in scrambled {
            for shift in [6u8, 4, 2, 0] {
                sequence.push(alphabet[((byte >> shift) & 0b11) as usize]);
            }
        }
        Ok(sequence)
    }

    fn decode(&self, token: &[u8], key: &FixedLengthKey) -> Result<Vec<u8>> {
        if token.len() % BASES_PER_BYTE != 0 {
            return Err(EnvelopeError::MalformedPayload(format!(
                "sequence length {} is not a multiple of {BASES_PER_BYTE}",
                token.len()
            )));
        }
        let alphabet = Self::alphabet(key)?;

        let mut scrambled = Vec::with_capacity(token.len() / BASES_PER_BYTE);
        for codon in token.chunks(BASES_PER_BYTE) {
            let mut byte = 0u8;
            for &base in codon {
                let symbol = alphabet.iter().position(|&b| b == base).ok_or_else(|| {
                    EnvelopeError::MalformedPayload(format!("invalid nucleotide 0x{base:02x}"))
                })?;
                byte = (byte << 2) | symbol as u8;
            }
            scrambled.push(byte);
        }
        self.inner.decode(&scrambled, key)
    }
}
