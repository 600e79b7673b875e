//! Error types for genvault.
//!
//! Every variant is a deterministic, caller-surfaced failure. Nothing is
//! retried internally. Messages say *what* failed and carry key versions
//! where useful, but never key material.

use thiserror::Error;

use crate::store::KeyVersion;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// The single error type for all genvault operations.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// No KEK has been created yet. Only possible before the first rotation.
    #[error("no active key encryption key")]
    NoActiveKey,

    /// The requested KEK version is neither active nor archived.
    #[error("unknown key version: {0}")]
    UnknownKeyVersion(KeyVersion),

    /// Eviction was attempted on the currently active KEK.
    #[error("cannot evict active key version {0}")]
    CannotEvictActive(KeyVersion),

    /// The KEK has outlived its TTL and may no longer issue new wraps.
    #[error("key version {0} has expired")]
    KeyExpired(KeyVersion),

    /// Wrapping a DEK under a KEK failed.
    #[error("DEK wrap failed")]
    WrapFailure,

    /// The wrapped DEK failed its integrity check (wrong KEK or tampering).
    #[error("wrapped DEK failed integrity check")]
    DekUnwrapFailed,

    /// Numeric tokens from different capabilities (or incompatible
    /// packages) were combined.
    #[error("incompatible capability: {0}")]
    IncompatibleCapability(String),

    /// A package, token or decoded payload is structurally invalid.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The system random source failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// HKDF sub-key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// The homomorphic backend could not complete an operation.
    #[error("homomorphic capability failure: {0}")]
    CapabilityFailure(String),

    /// Manager configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
