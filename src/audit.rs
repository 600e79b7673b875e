//! Key lifecycle audit logging.
//!
//! Records every KEK creation, archival and eviction, and every DEK that is
//! re-wrapped onto a newer KEK. The log is append-only. Records can be
//! forwarded to pluggable sinks (files, databases, ...).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::KeyVersion;

/// A sink that receives audit records. Implement this to forward records
/// to a file, database or other persistent store.
pub trait AuditSink: Send {
    /// Called once for every record appended to the log.
    fn append(&mut self, record: AuditRecord);
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEvent {
    /// A new KEK was installed as active.
    Created,
    /// A KEK was displaced by a rotation.
    Archived,
    /// An archived KEK was permanently removed.
    Evicted,
    /// A DEK was moved from an older KEK onto the active one.
    Rewrapped,
}

/// A permanent record of a key lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: KeyEvent,
    /// The version the event applies to.
    pub version: KeyVersion,
    /// For `Created`: the version that was archived. For `Archived`: the
    /// version that replaced it. For `Rewrapped`: the source version.
    pub related: Option<KeyVersion>,
    pub timestamp: DateTime<Utc>,
}

/// An append-only log of key lifecycle events.
#[derive(Default, Serialize, Deserialize)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    #[serde(skip)]
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl Clone for AuditLog {
    fn clone(&self) -> Self {
        // Sinks are owned by the original log only.
        Self {
            records: self.records.clone(),
            forward_sinks: Vec::new(),
        }
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink that receives a copy of every subsequent record.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a record and forward it to every attached sink.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    /// Records concerning one version, oldest first.
    pub fn for_version(&self, version: KeyVersion) -> Vec<&AuditRecord> {
        self.records.iter().filter(|r| r.version == version).collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        let written = serde_json::to_string(&record)
            .map_err(std::io::Error::from)
            .and_then(|line| {
                writeln!(self.file, "{line}")?;
                self.file.flush()
            });
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write audit record");
        }
    }
}
