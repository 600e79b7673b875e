//! Top-level seal / open entry points.
//!
//! `seal` composes the pieces into one package:
//! 1. Snapshot the active KEK record
//! 2. Generate a DEK and wrap it under that record
//! 3. Encode the payload with the content cipher
//! 4. For floats, encode the scaled value with the record's capability
//!
//! `open` reverses steps 2 and 3. Both the wrap and the numeric token come from
//! the same record snapshot, so the version stamped on a package is always
//! the version that was actually used, even if a rotation runs concurrently.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cipher::{ContentCipher, GeneticCipher};
use crate::error::{EnvelopeError, Result};
use crate::manager::EnvelopeKeyManager;
use crate::package::{EnvelopeBody, EnvelopePackage, ValueKind};

/// A value accepted by `seal` and returned by `open`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Composes a content cipher with a key manager.
#[derive(Clone)]
pub struct EnvelopeCodec {
    cipher: Arc<dyn ContentCipher>,
    scale_factor: u32,
    numeric: bool,
}

impl EnvelopeCodec {
    /// Three decimal digits of float precision.
    pub const DEFAULT_SCALE_FACTOR: u32 = 1000;

    pub fn new(cipher: Arc<dyn ContentCipher>) -> Self {
        Self {
            cipher,
            scale_factor: Self::DEFAULT_SCALE_FACTOR,
            numeric: true,
        }
    }

    /// Scale applied to floats before they become integers. Zero is
    /// treated as one.
    pub fn with_scale_factor(mut self, scale_factor: u32) -> Self {
        self.scale_factor = scale_factor.max(1);
        self
    }

    /// Skip the homomorphic token; floats are sealed content-only.
    pub fn without_numeric(mut self) -> Self {
        self.numeric = false;
        self
    }

    pub fn scale_factor(&self) -> u32 {
        self.scale_factor
    }

    /// Encrypt `value` under a fresh DEK wrapped by the active KEK.
    pub fn seal(&self, value: &Value, manager: &EnvelopeKeyManager) -> Result<EnvelopePackage> {
        let record = manager.active_record()?;
        let dek = manager.generate_dek()?;
        let wrapped = manager.wrap_dek(&dek, &record)?;

        let (payload, scaled) = match value {
            Value::Float(v) => {
                let scaled = scale(*v, self.scale_factor)?;
                (scaled.to_be_bytes().to_vec(), Some(scaled))
            }
            Value::Text(s) => (s.as_bytes().to_vec(), None),
        };
        let content_length = u32::try_from(payload.len())
            .map_err(|_| EnvelopeError::MalformedPayload("payload too large".into()))?;
        let content_token = self.cipher.encode(&payload, &dek)?;

        let body = match scaled {
            Some(scaled) if self.numeric => EnvelopeBody::ContentPlusNumeric {
                content_token,
                numeric_token: record.capability().encode_numeric(scaled)?,
            },
            _ => EnvelopeBody::ContentOnly { content_token },
        };

        debug!(
            version = %record.version(),
            kind = ?value.kind(),
            cipher = self.cipher.name(),
            content_length,
            "sealed package"
        );
        EnvelopePackage::new(
            wrapped,
            body,
            value.kind(),
            self.scale_factor,
            content_length,
        )
    }

    /// Recover the value sealed in `package`.
    ///
    /// Works for any version still held by the manager, active or archived,
    /// expired or not.
    pub fn open(&self, package: &EnvelopePackage, manager: &EnvelopeKeyManager) -> Result<Value> {
        let dek = manager.unwrap_dek(package.wrapped_dek())?;
        let payload = self.cipher.decode(package.body().content_token(), &dek)?;

        if payload.len() != package.content_length() as usize {
            return Err(EnvelopeError::MalformedPayload(format!(
                "decoded {} bytes, package records {}",
                payload.len(),
                package.content_length()
            )));
        }

        debug!(version = %package.kek_version(), kind = ?package.value_kind(), "opened package");
        match package.value_kind() {
            ValueKind::Float => {
                let raw: [u8; 8] = payload.as_slice().try_into().map_err(|_| {
                    EnvelopeError::MalformedPayload("float payload must be 8 bytes".into())
                })?;
                Ok(Value::Float(descale(
                    i64::from_be_bytes(raw),
                    package.scale_factor(),
                )))
            }
            ValueKind::Text => String::from_utf8(payload)
                .map(Value::Text)
                .map_err(|_| EnvelopeError::MalformedPayload("text is not valid UTF-8".into())),
        }
    }

    /// Sum the numeric values of `packages` without opening their content.
    ///
    /// All packages must share one KEK version and one scale factor; any
    /// mismatch aborts the whole batch.
    pub fn homomorphic_sum(
        &self,
        packages: &[EnvelopePackage],
        manager: &EnvelopeKeyManager,
    ) -> Result<f64> {
        let Some(first) = packages.first() else {
            return Ok(0.0);
        };
        let version = first.kek_version();
        let scale_factor = first.scale_factor();

        for package in packages {
            if package.kek_version() != version {
                warn!(
                    expected = %version,
                    found = %package.kek_version(),
                    "rejected mixed-version sum"
                );
                return Err(EnvelopeError::IncompatibleCapability(format!(
                    "packages sealed under {} and {}",
                    version,
                    package.kek_version()
                )));
            }
            if package.scale_factor() != scale_factor {
                return Err(EnvelopeError::IncompatibleCapability(format!(
                    "scale factors {} and {} differ",
                    scale_factor,
                    package.scale_factor()
                )));
            }
        }

        let capability = manager.capability(version)?;
        let mut tokens = packages.iter().map(|p| {
            p.body().numeric_token().ok_or_else(|| {
                EnvelopeError::MalformedPayload("package carries no numeric token".into())
            })
        });

        // `packages` is non-empty, so the first token exists.
        let mut acc = match tokens.next() {
            Some(token) => token?.clone(),
            None => return Ok(0.0),
        };
        for token in tokens {
            acc = capability.add(&acc, token?)?;
        }

        let total = capability.decode_numeric(&acc)?;
        debug!(%version, count = packages.len(), "computed homomorphic sum");
        Ok(descale(total, scale_factor))
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(Arc::new(GeneticCipher::new()))
    }
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("cipher", &self.cipher.name())
            .field("scale_factor", &self.scale_factor)
            .field("numeric", &self.numeric)
            .finish()
    }
}

fn scale(value: f64, scale_factor: u32) -> Result<i64> {
    let scaled = (value * f64::from(scale_factor)).round();
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    if !scaled.is_finite() || scaled < i64::MIN as f64 || scaled >= i64::MAX as f64 {
        return Err(EnvelopeError::MalformedPayload(format!(
            "{value} cannot be scaled by {scale_factor}"
        )));
    }
    Ok(scaled as i64)
}

fn descale(value: i64, scale_factor: u32) -> f64 {
    value as f64 / f64::from(scale_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_roundtrip_within_tolerance() {
        for v in [3.14, -2.71, 0.0, 1234.5678, -0.0004] {
            let scaled = scale(v, 1000).unwrap();
            assert!((descale(scaled, 1000) - v).abs() <= 0.5 / 1000.0 + f64::EPSILON);
        }
        assert_eq!(scale(3.14159, 1000).unwrap(), 3142);
    }

    #[test]
    fn test_scale_rejects_unrepresentable() {
        assert!(scale(f64::NAN, 1000).is_err());
        assert!(scale(f64::INFINITY, 1).is_err());
        assert!(scale(1e300, 1000).is_err());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(1.5).kind(), ValueKind::Float);
        assert_eq!(Value::from("abc"), Value::Text("abc".into()));
    }

    #[test]
    fn test_zero_scale_factor_is_clamped() {
        assert_eq!(EnvelopeCodec::default().with_scale_factor(0).scale_factor(), 1);
    }
}
