//! Envelope key management.
//!
//! The manager owns the KEK collection and is its only mutator. It
//! generates DEKs, wraps them under the active KEK, unwraps them under
//! whichever version they name, and rotates KEKs without touching anything
//! already wrapped.
//!
//! ## Locking
//!
//! The version store sits behind one `RwLock`. Lookups take the read side
//! and clone the record they need; `rotate` and `evict` take the write side
//! for the whole check-and-mutate step, so no reader ever sees zero or two
//! active records. Their audit records are appended before the write lock
//! is released, so the trail lists versions in allocation order. Slow work
//! (capability key generation, AES-KW, content encoding) happens outside
//! the lock on cloned records.
//!
//! ## Expiry
//!
//! A KEK older than `key_ttl` can no longer wrap new DEKs (`KeyExpired`),
//! but it keeps unwrapping DEKs it wrapped before it expired.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditLog, AuditRecord, AuditSink, FileAuditSink, KeyEvent};
use crate::clock::{Clock, SystemClock};
use crate::config::ManagerConfig;
use crate::error::{EnvelopeError, Result};
use crate::homomorphic::{HomomorphicCapability, HomomorphicScheme};
use crate::keys::{self, Dek, FixedLengthKey};
use crate::package::{EnvelopeBody, EnvelopePackage, WrappedDek};
use crate::store::{KekRecord, KeyState, KeyVersion, KeyVersionStore, VersionInfo};

pub struct EnvelopeKeyManager {
    config: ManagerConfig,
    ttl: chrono::Duration,
    rotation_interval: chrono::Duration,
    store: RwLock<KeyVersionStore>,
    scheme: Arc<dyn HomomorphicScheme>,
    clock: Arc<dyn Clock>,
    audit: Mutex<AuditLog>,
}

impl EnvelopeKeyManager {
    /// Create a manager with no keys. Call `rotate` once before sealing.
    pub fn new(config: ManagerConfig, scheme: Arc<dyn HomomorphicScheme>) -> Result<Self> {
        let ttl = config.ttl()?;
        let rotation_interval = config.rotation()?;
        Ok(Self {
            config,
            ttl,
            rotation_interval,
            store: RwLock::new(KeyVersionStore::new()),
            scheme,
            clock: Arc::new(SystemClock),
            audit: Mutex::new(AuditLog::new()),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // DEK protocol
    // -----------------------------------------------------------------------

    /// Draw a fresh 128-bit DEK. DEKs are never reused across items.
    pub fn generate_dek(&self) -> Result<Dek> {
        FixedLengthKey::generate()
    }

    /// Wrap `dek` under `record`. Fails with `KeyExpired` once the record is
    /// past its TTL.
    pub fn wrap_dek(&self, dek: &Dek, record: &KekRecord) -> Result<WrappedDek> {
        self.ensure_issuable(record)?;
        let ciphertext = keys::wrap_key(dek, record.material())?;
        Ok(WrappedDek::new(ciphertext, record.version()))
    }

    /// Resolve the KEK named by `wrapped` and unwrap the DEK.
    ///
    /// Integrity failures surface as `DekUnwrapFailed`; a wrong or tampered
    /// wrap never yields a key.
    pub fn unwrap_dek(&self, wrapped: &WrappedDek) -> Result<Dek> {
        let record = self.record(wrapped.kek_version())?;
        keys::unwrap_key(wrapped.ciphertext(), record.material()).map_err(|e| {
            warn!(version = %wrapped.kek_version(), "wrapped DEK failed integrity check");
            e
        })
    }

    /// Move a wrapped DEK from its current KEK onto the active one. The
    /// payload it protects is not touched.
    #[instrument(skip_all, fields(from = %wrapped.kek_version()))]
    pub fn reencrypt_dek(&self, wrapped: &WrappedDek) -> Result<WrappedDek> {
        let active = self.active_record()?;
        let rewrapped = self.rewrap_onto(wrapped, &active)?;

        debug!(to = %active.version(), "re-wrapped DEK");
        self.audit_event(KeyEvent::Rewrapped, active.version(), Some(wrapped.kek_version()));
        Ok(rewrapped)
    }

    /// Move a whole package onto the active KEK version.
    ///
    /// The DEK is re-wrapped and a numeric token is re-encoded under the
    /// active capability, both from the same active record, so the migrated
    /// package stays summable with anything sealed under that version. The
    /// content token is not touched.
    #[instrument(skip_all, fields(from = %package.kek_version()))]
    pub fn migrate_package(&self, package: &EnvelopePackage) -> Result<EnvelopePackage> {
        let source = package.kek_version();
        let active = self.active_record()?;
        let wrapped = self.rewrap_onto(package.wrapped_dek(), &active)?;

        let body = match package.body() {
            EnvelopeBody::ContentOnly { .. } => package.body().clone(),
            EnvelopeBody::ContentPlusNumeric {
                content_token,
                numeric_token,
            } => {
                let value = self.capability(source)?.decode_numeric(numeric_token)?;
                EnvelopeBody::ContentPlusNumeric {
                    content_token: content_token.clone(),
                    numeric_token: active.capability().encode_numeric(value)?,
                }
            }
        };
        let migrated = package.rewrapped(wrapped, body)?;

        debug!(to = %active.version(), "migrated package");
        self.audit_event(KeyEvent::Rewrapped, active.version(), Some(source));
        Ok(migrated)
    }

    // -----------------------------------------------------------------------
    // KEK lifecycle
    // -----------------------------------------------------------------------

    /// Generate a new KEK and capability, install them as active and archive
    /// the previous active KEK. Existing wraps stay valid.
    #[instrument(skip(self))]
    pub fn rotate(&self) -> Result<KeyVersion> {
        // Key generation is slow; keep it outside the write lock.
        let material = FixedLengthKey::generate()?;
        let capability = self.scheme.new_capability()?;

        let mut store = self.store.write();
        let now = self.clock.now();
        let (version, previous) = store.create(material, capability, now)?;
        // Audit under the write guard so the trail follows version order.
        self.audit_event_at(KeyEvent::Created, version, previous, now);
        if let Some(prev) = previous {
            self.audit_event_at(KeyEvent::Archived, prev, Some(version), now);
        }
        drop(store);

        info!(%version, scheme = self.scheme.name(), "installed new active KEK");
        if let Some(prev) = previous {
            info!(version = %prev, "archived KEK");
        }
        Ok(version)
    }

    /// Whether the active KEK is older than `rotation_interval`. True when
    /// there is no active KEK at all.
    pub fn needs_rotation(&self) -> bool {
        match self.active_record() {
            Ok(record) => self.clock.now() - record.created_at() >= self.rotation_interval,
            Err(_) => true,
        }
    }

    /// Rotate only if `needs_rotation` says so.
    pub fn rotate_if_due(&self) -> Result<Option<KeyVersion>> {
        if self.needs_rotation() {
            self.rotate().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Whether `version` has outlived its TTL.
    pub fn expire_check(&self, version: KeyVersion) -> Result<bool> {
        let record = self.record(version)?;
        Ok(self.is_expired(&record))
    }

    /// Permanently remove an archived KEK. Packages wrapped under it become
    /// unopenable.
    pub fn evict(&self, version: KeyVersion) -> Result<()> {
        let mut store = self.store.write();
        store.evict(version)?;
        self.audit_event(KeyEvent::Evicted, version, None);
        drop(store);

        info!(%version, "evicted KEK");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn active_record(&self) -> Result<KekRecord> {
        self.store.read().get_active()
    }

    pub fn active_version(&self) -> Option<KeyVersion> {
        self.store.read().active_version()
    }

    pub fn record(&self, version: KeyVersion) -> Result<KekRecord> {
        self.store.read().get(version)
    }

    /// The homomorphic capability issued with `version`.
    pub fn capability(&self, version: KeyVersion) -> Result<Arc<dyn HomomorphicCapability>> {
        Ok(Arc::clone(self.record(version)?.capability()))
    }

    pub fn versions(&self) -> Vec<VersionInfo> {
        self.store.read().versions()
    }

    /// Number of records currently in the `Active` state.
    pub fn active_count(&self) -> usize {
        self.versions()
            .iter()
            .filter(|v| v.state == KeyState::Active)
            .count()
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.audit.lock().add_forward_sink(sink);
    }

    /// Forward audit records to a JSON-lines file.
    pub fn add_audit_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        self.add_audit_sink(Box::new(FileAuditSink::new(path)?));
        Ok(())
    }

    /// Snapshot of the audit log.
    pub fn audit_log(&self) -> AuditLog {
        self.audit.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn rewrap_onto(&self, wrapped: &WrappedDek, active: &KekRecord) -> Result<WrappedDek> {
        let dek = self.unwrap_dek(wrapped)?;
        self.wrap_dek(&dek, active)
    }

    fn is_expired(&self, record: &KekRecord) -> bool {
        self.clock.now() - record.created_at() > self.ttl
    }

    fn ensure_issuable(&self, record: &KekRecord) -> Result<()> {
        if self.is_expired(record) {
            warn!(version = %record.version(), "refusing to wrap under expired KEK");
            return Err(EnvelopeError::KeyExpired(record.version()));
        }
        Ok(())
    }

    fn audit_event(&self, event: KeyEvent, version: KeyVersion, related: Option<KeyVersion>) {
        self.audit_event_at(event, version, related, self.clock.now());
    }

    fn audit_event_at(
        &self,
        event: KeyEvent,
        version: KeyVersion,
        related: Option<KeyVersion>,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) {
        self.audit.lock().append(AuditRecord {
            event,
            version,
            related,
            timestamp,
        });
    }
}

impl std::fmt::Debug for EnvelopeKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeKeyManager")
            .field("config", &self.config)
            .field("scheme", &self.scheme.name())
            .field("versions", &self.versions())
            .finish_non_exhaustive()
    }
}
