//! Versioned KEK storage.
//!
//! The store holds every KEK that can still unwrap a DEK: exactly one
//! `Active` record (once the first rotation has happened) plus any number
//! of `Archived` ones. Versions are allocated monotonically from 1 and are
//! never reused, even after eviction.
//!
//! The store is a plain data structure. It performs no locking and no I/O;
//! the key manager wraps it in a lock so that every operation here is
//! serialised with respect to the others.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EnvelopeError, Result};
use crate::homomorphic::HomomorphicCapability;
use crate::keys::KekMaterial;

/// Identifies exactly one KEK record for the lifetime of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersion(u32);

impl KeyVersion {
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lifecycle state of a KEK record. `Active -> Archived` happens exactly
/// once and never reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Active,
    Archived,
}

/// A KEK together with the homomorphic capability issued alongside it.
///
/// Cloning a record is cheap: the material and capability are shared.
#[derive(Clone)]
pub struct KekRecord {
    version: KeyVersion,
    material: Arc<KekMaterial>,
    capability: Arc<dyn HomomorphicCapability>,
    created_at: DateTime<Utc>,
    state: KeyState,
}

impl KekRecord {
    pub fn version(&self) -> KeyVersion {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == KeyState::Active
    }

    pub fn capability(&self) -> &Arc<dyn HomomorphicCapability> {
        &self.capability
    }

    /// `pub(crate)`: KEK material never leaves the crate.
    pub(crate) fn material(&self) -> &KekMaterial {
        &self.material
    }
}

impl fmt::Debug for KekRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KekRecord")
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .field("state", &self.state)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

/// Summary of one stored version, safe to hand to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: KeyVersion,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
}

/// Active and archived KEK records indexed by version.
#[derive(Default)]
pub struct KeyVersionStore {
    records: BTreeMap<KeyVersion, KekRecord>,
    active: Option<KeyVersion>,
    last_allocated: u32,
}

impl KeyVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next version, install it as `Active` and archive the
    /// previous active record in the same step.
    ///
    /// Returns the new version and the version it displaced, if any.
    pub fn create(
        &mut self,
        material: KekMaterial,
        capability: Arc<dyn HomomorphicCapability>,
        created_at: DateTime<Utc>,
    ) -> Result<(KeyVersion, Option<KeyVersion>)> {
        let next = self.last_allocated.checked_add(1).ok_or_else(|| {
            EnvelopeError::InvalidConfig("key version space exhausted".into())
        })?;
        let version = KeyVersion(next);

        let previous = self.active.take();
        if let Some(prev) = previous {
            if let Some(record) = self.records.get_mut(&prev) {
                record.state = KeyState::Archived;
            }
        }

        self.records.insert(
            version,
            KekRecord {
                version,
                material: Arc::new(material),
                capability,
                created_at,
                state: KeyState::Active,
            },
        );
        self.active = Some(version);
        self.last_allocated = next;

        Ok((version, previous))
    }

    /// The current active record. Fails only before the first `create`.
    pub fn get_active(&self) -> Result<KekRecord> {
        self.active
            .and_then(|v| self.records.get(&v))
            .cloned()
            .ok_or(EnvelopeError::NoActiveKey)
    }

    /// Look up a record by version, active or archived.
    pub fn get(&self, version: KeyVersion) -> Result<KekRecord> {
        self.records
            .get(&version)
            .cloned()
            .ok_or(EnvelopeError::UnknownKeyVersion(version))
    }

    /// Permanently remove an archived record.
    pub fn evict(&mut self, version: KeyVersion) -> Result<()> {
        if self.active == Some(version) {
            return Err(EnvelopeError::CannotEvictActive(version));
        }
        self.records
            .remove(&version)
            .map(|_| ())
            .ok_or(EnvelopeError::UnknownKeyVersion(version))
    }

    pub fn active_version(&self) -> Option<KeyVersion> {
        self.active
    }

    /// Every stored version in ascending order.
    pub fn versions(&self) -> Vec<VersionInfo> {
        self.records
            .values()
            .map(|r| VersionInfo {
                version: r.version,
                state: r.state,
                created_at: r.created_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::homomorphic::{HomomorphicScheme, PaillierScheme};
    use crate::keys::FixedLengthKey;

    fn cap() -> Arc<dyn HomomorphicCapability> {
        PaillierScheme::with_modulus_bits(256).new_capability().unwrap()
    }

    fn active_count(store: &KeyVersionStore) -> usize {
        store
            .versions()
            .iter()
            .filter(|v| v.state == KeyState::Active)
            .count()
    }

    #[test]
    fn test_empty_store_has_no_active_key() {
        let store = KeyVersionStore::new();
        assert!(matches!(store.get_active(), Err(EnvelopeError::NoActiveKey)));
        assert!(matches!(
            store.get(KeyVersion::new(1)),
            Err(EnvelopeError::UnknownKeyVersion(_))
        ));
    }

    #[test]
    fn test_create_archives_previous() {
        let mut store = KeyVersionStore::new();
        let now = Utc::now();
        let capability = cap();

        let (v1, prev) = store
            .create(FixedLengthKey::from_bytes([1; 16]), capability.clone(), now)
            .unwrap();
        assert_eq!(v1, KeyVersion::new(1));
        assert_eq!(prev, None);
        assert_eq!(active_count(&store), 1);

        let (v2, prev) = store
            .create(FixedLengthKey::from_bytes([2; 16]), capability, now)
            .unwrap();
        assert_eq!(v2, KeyVersion::new(2));
        assert_eq!(prev, Some(v1));
        assert_eq!(active_count(&store), 1);

        assert_eq!(store.get_active().unwrap().version(), v2);
        assert_eq!(store.get(v1).unwrap().state(), KeyState::Archived);
        assert_eq!(store.get(v1).unwrap().material().as_bytes(), &[1; 16]);
    }

    #[test]
    fn test_evict_rules() {
        let mut store = KeyVersionStore::new();
        let now = Utc::now();
        let capability = cap();
        let (v1, _) = store
            .create(FixedLengthKey::from_bytes([1; 16]), capability.clone(), now)
            .unwrap();

        assert!(matches!(
            store.evict(v1),
            Err(EnvelopeError::CannotEvictActive(v)) if v == v1
        ));

        let (v2, _) = store
            .create(FixedLengthKey::from_bytes([2; 16]), capability.clone(), now)
            .unwrap();
        store.evict(v1).unwrap();
        assert!(matches!(
            store.get(v1),
            Err(EnvelopeError::UnknownKeyVersion(_))
        ));
        assert!(matches!(
            store.evict(v1),
            Err(EnvelopeError::UnknownKeyVersion(_))
        ));

        // Versions are never reused after eviction.
        let (v3, prev) = store
            .create(FixedLengthKey::from_bytes([3; 16]), capability, now)
            .unwrap();
        assert_eq!(v3, KeyVersion::new(3));
        assert_eq!(prev, Some(v2));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_version_display_and_serde() {
        let v = KeyVersion::new(7);
        assert_eq!(v.to_string(), "v7");
        assert_eq!(serde_json::to_string(&v).unwrap(), "7");
        assert_eq!(serde_json::to_string(&KeyState::Archived).unwrap(), "\"archived\"");
    }
}
