//! Envelope packages and their persisted layouts.
//!
//! `EnvelopePackage` is the in-memory form produced by `seal` and consumed
//! by `open`. Its body is a tagged union, so decode logic matches on
//! `ContentOnly` / `ContentPlusNumeric` instead of probing optional fields.
//!
//! `PersistedPackage` is the flat, stable interchange record. It has a JSON
//! form (serde) and a compact binary form:
//!
//! ```text
//! "GVP1" | kek_version u32 | value_kind u8 | scale_factor u32
//!        | content_length u32 | has_numeric u8
//!        | len u32 + wrapped_dek | len u32 + content_token
//!        | [len u32 + numeric_token]
//! ```
//!
//! All integers are big-endian.

use serde::{Deserialize, Serialize};

use crate::error::{EnvelopeError, Result};
use crate::homomorphic::NumericToken;
use crate::store::KeyVersion;

const MAGIC: &[u8; 4] = b"GVP1";

/// The only durable form of a DEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedDek {
    ciphertext: Vec<u8>,
    kek_version: KeyVersion,
}

impl WrappedDek {
    pub fn new(ciphertext: Vec<u8>, kek_version: KeyVersion) -> Self {
        Self {
            ciphertext,
            kek_version,
        }
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn kek_version(&self) -> KeyVersion {
        self.kek_version
    }
}

/// How the decoded payload is turned back into a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Float,
    Text,
}

impl ValueKind {
    fn tag(self) -> u8 {
        match self {
            Self::Float => 0,
            Self::Text => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Float),
            1 => Ok(Self::Text),
            other => Err(malformed(format!("unknown value kind {other}"))),
        }
    }
}

/// Encrypted content, optionally accompanied by a homomorphic token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeBody {
    ContentOnly {
        content_token: Vec<u8>,
    },
    ContentPlusNumeric {
        content_token: Vec<u8>,
        numeric_token: NumericToken,
    },
}

impl EnvelopeBody {
    pub fn content_token(&self) -> &[u8] {
        match self {
            Self::ContentOnly { content_token } => content_token,
            Self::ContentPlusNumeric { content_token, .. } => content_token,
        }
    }

    pub fn numeric_token(&self) -> Option<&NumericToken> {
        match self {
            Self::ContentOnly { .. } => None,
            Self::ContentPlusNumeric { numeric_token, .. } => Some(numeric_token),
        }
    }
}

/// The sole unit of exchange between the seal and open paths. Immutable
/// once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopePackage {
    wrapped_dek: WrappedDek,
    body: EnvelopeBody,
    value_kind: ValueKind,
    scale_factor: u32,
    content_length: u32,
}

impl EnvelopePackage {
    pub(crate) fn new(
        wrapped_dek: WrappedDek,
        body: EnvelopeBody,
        value_kind: ValueKind,
        scale_factor: u32,
        content_length: u32,
    ) -> Result<Self> {
        if body.numeric_token().is_some() && value_kind != ValueKind::Float {
            return Err(malformed("numeric token on a non-float package"));
        }
        if value_kind == ValueKind::Float && scale_factor == 0 {
            return Err(malformed("float package with zero scale factor"));
        }
        Ok(Self {
            wrapped_dek,
            body,
            value_kind,
            scale_factor,
            content_length,
        })
    }

    pub fn wrapped_dek(&self) -> &WrappedDek {
        &self.wrapped_dek
    }

    pub fn kek_version(&self) -> KeyVersion {
        self.wrapped_dek.kek_version
    }

    pub fn body(&self) -> &EnvelopeBody {
        &self.body
    }

    pub fn value_kind(&self) -> ValueKind {
        self.value_kind
    }

    pub fn scale_factor(&self) -> u32 {
        self.scale_factor
    }

    pub fn content_length(&self) -> u32 {
        self.content_length
    }

    /// The same package under a new wrap and body. The content token must
    /// be carried over unchanged; only migration rebuilds packages this way.
    pub(crate) fn rewrapped(&self, wrapped_dek: WrappedDek, body: EnvelopeBody) -> Result<Self> {
        Self::new(
            wrapped_dek,
            body,
            self.value_kind,
            self.scale_factor,
            self.content_length,
        )
    }

    pub fn to_persisted(&self) -> PersistedPackage {
        PersistedPackage::from(self)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.to_persisted()).map_err(|e| malformed(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let persisted: PersistedPackage =
            serde_json::from_str(json).map_err(|e| malformed(e.to_string()))?;
        Self::try_from(persisted)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_persisted().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::try_from(PersistedPackage::from_bytes(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Persisted layout
// ---------------------------------------------------------------------------

/// Flat interchange record. Every field round-trips exactly through both
/// the JSON and binary encodings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPackage {
    pub kek_version: u32,
    pub wrapped_dek: Vec<u8>,
    pub content_token: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_token: Option<Vec<u8>>,
    pub value_kind: ValueKind,
    pub scale_factor: u32,
    pub content_length: u32,
}

impl From<&EnvelopePackage> for PersistedPackage {
    fn from(package: &EnvelopePackage) -> Self {
        Self {
            kek_version: package.kek_version().get(),
            wrapped_dek: package.wrapped_dek.ciphertext.clone(),
            content_token: package.body.content_token().to_vec(),
            numeric_token: package.body.numeric_token().map(NumericToken::to_bytes),
            value_kind: package.value_kind,
            scale_factor: package.scale_factor,
            content_length: package.content_length,
        }
    }
}

impl TryFrom<PersistedPackage> for EnvelopePackage {
    type Error = EnvelopeError;

    fn try_from(p: PersistedPackage) -> Result<Self> {
        let body = match p.numeric_token {
            None => EnvelopeBody::ContentOnly {
                content_token: p.content_token,
            },
            Some(raw) => EnvelopeBody::ContentPlusNumeric {
                content_token: p.content_token,
                numeric_token: NumericToken::from_bytes(&raw)?,
            },
        };
        EnvelopePackage::new(
            WrappedDek::new(p.wrapped_dek, KeyVersion::new(p.kek_version)),
            body,
            p.value_kind,
            p.scale_factor,
            p.content_length,
        )
    }
}

impl PersistedPackage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            32 + self.wrapped_dek.len()
                + self.content_token.len()
                + self.numeric_token.as_ref().map_or(0, Vec::len),
        );
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.kek_version.to_be_bytes());
        out.push(self.value_kind.tag());
        out.extend_from_slice(&self.scale_factor.to_be_bytes());
        out.extend_from_slice(&self.content_length.to_be_bytes());
        out.push(u8::from(self.numeric_token.is_some()));
        put_field(&mut out, &self.wrapped_dek);
        put_field(&mut out, &self.content_token);
        if let Some(numeric) = &self.numeric_token {
            put_field(&mut out, numeric);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        if r.take(MAGIC.len())? != MAGIC {
            return Err(malformed("bad package magic"));
        }
        let kek_version = r.u32()?;
        let value_kind = ValueKind::from_tag(r.u8()?)?;
        let scale_factor = r.u32()?;
        let content_length = r.u32()?;
        let has_numeric = match r.u8()? {
            0 => false,
            1 => true,
            other => return Err(malformed(format!("bad numeric flag {other}"))),
        };
        let wrapped_dek = r.field()?;
        let content_token = r.field()?;
        let numeric_token = if has_numeric { Some(r.field()?) } else { None };
        r.finish()?;

        Ok(Self {
            kek_version,
            wrapped_dek,
            content_token,
            numeric_token,
            value_kind,
            scale_factor,
            content_length,
        })
    }
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

fn malformed(reason: impl Into<String>) -> EnvelopeError {
    EnvelopeError::MalformedPayload(reason.into())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed("package truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    fn field(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(malformed("trailing bytes after package"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_package() -> EnvelopePackage {
        EnvelopePackage::new(
            WrappedDek::new(vec![0xAA; 24], KeyVersion::new(3)),
            EnvelopeBody::ContentPlusNumeric {
                content_token: b"ACGTTGCA".to_vec(),
                numeric_token: NumericToken::new([7; 8], vec![1, 2, 3, 4]),
            },
            ValueKind::Float,
            1000,
            8,
        )
        .unwrap()
    }

    fn text_package() -> EnvelopePackage {
        EnvelopePackage::new(
            WrappedDek::new(vec![0xBB; 24], KeyVersion::new(1)),
            EnvelopeBody::ContentOnly {
                content_token: b"GGCC".to_vec(),
            },
            ValueKind::Text,
            1000,
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_persisted_fields() {
        let persisted = numeric_package().to_persisted();
        assert_eq!(persisted.kek_version, 3);
        assert_eq!(persisted.value_kind, ValueKind::Float);
        assert_eq!(persisted.numeric_token.as_ref().unwrap().len(), 8 + 4);
        assert!(text_package().to_persisted().numeric_token.is_none());
    }

    #[test]
    fn test_json_and_binary_preserve_every_field() {
        for package in [numeric_package(), text_package()] {
            let json = package.to_json().unwrap();
            assert_eq!(EnvelopePackage::from_json(&json).unwrap(), package);

            let bytes = package.to_bytes();
            assert_eq!(EnvelopePackage::from_bytes(&bytes).unwrap(), package);
        }
        let json = text_package().to_json().unwrap();
        assert!(json.contains("\"value_kind\":\"text\""));
        assert!(!json.contains("numeric_token"));
    }

    #[test]
    fn test_binary_rejects_damage() {
        let bytes = numeric_package().to_bytes();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(EnvelopePackage::from_bytes(&bad_magic).is_err());

        assert!(EnvelopePackage::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(EnvelopePackage::from_bytes(&trailing).is_err());

        let mut bad_kind = bytes.clone();
        bad_kind[8] = 9;
        assert!(matches!(
            EnvelopePackage::from_bytes(&bad_kind),
            Err(EnvelopeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_numeric_token_requires_float_kind() {
        let mut persisted = numeric_package().to_persisted();
        persisted.value_kind = ValueKind::Text;
        assert!(matches!(
            EnvelopePackage::try_from(persisted),
            Err(EnvelopeError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_rewrapped_keeps_metadata_and_revalidates() {
        let package = numeric_package();
        let moved = package
            .rewrapped(
                WrappedDek::new(vec![1; 24], KeyVersion::new(9)),
                package.body().clone(),
            )
            .unwrap();
        assert_eq!(moved.kek_version(), KeyVersion::new(9));
        assert_eq!(moved.body(), package.body());
        assert_eq!(moved.content_length(), package.content_length());

        let text = text_package();
        assert!(matches!(
            text.rewrapped(text.wrapped_dek().clone(), package.body().clone()),
            Err(EnvelopeError::MalformedPayload(_))
        ));
    }
}
