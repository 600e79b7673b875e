//! # genvault
//!
//! Versioned envelope key management.
//!
//! Every item is encrypted under its own data encryption key (DEK). The DEK
//! is wrapped under a rotating key encryption key (KEK) and stored next to
//! the ciphertext, tagged with the KEK version. Rotation installs a new KEK
//! and archives the old one; archived KEKs keep opening what they sealed, so
//! nothing has to be re-encrypted when keys rotate.
//!
//! Payloads go through a pluggable [`cipher::ContentCipher`]. Floats can
//! additionally carry a token from a pluggable
//! [`homomorphic::HomomorphicCapability`], issued per KEK version, so sums
//! can be computed without opening any package.
//!
//! ```no_run
//! use std::sync::Arc;
//! use genvault::{EnvelopeCodec, EnvelopeKeyManager, ManagerConfig, PaillierScheme, Value};
//!
//! # fn main() -> genvault::error::Result<()> {
//! let scheme = Arc::new(PaillierScheme::new());
//! let manager = EnvelopeKeyManager::new(ManagerConfig::default(), scheme)?;
//! manager.rotate()?;
//!
//! let codec = EnvelopeCodec::default();
//! let package = codec.seal(&Value::Float(3.14), &manager)?;
//! manager.rotate()?;
//! assert_eq!(codec.open(&package, &manager)?, Value::Float(3.14));
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod cipher;
pub mod clock;
pub mod codec;
pub mod config;
pub(crate) mod crypto;
pub mod error;
pub mod homomorphic;
pub mod keys;
pub mod manager;
pub mod package;
pub mod store;

pub use cipher::{ContentCipher, FeistelCipher, GeneticCipher};
pub use codec::{EnvelopeCodec, Value};
pub use config::ManagerConfig;
pub use error::EnvelopeError;
pub use homomorphic::{HomomorphicCapability, HomomorphicScheme, NumericToken, PaillierScheme};
pub use keys::FixedLengthKey;
pub use manager::EnvelopeKeyManager;
pub use package::{EnvelopeBody, EnvelopePackage, PersistedPackage, ValueKind, WrappedDek};
pub use store::{KeyState, KeyVersion};

/// Generate a cryptographically secure 128-bit key.
///
/// Useful for callers that bring their own `ContentCipher` and want key
/// material from the same random source the manager uses.
pub fn generate_key() -> error::Result<FixedLengthKey> {
    FixedLengthKey::generate()
}
