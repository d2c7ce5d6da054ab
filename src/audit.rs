//! Append-only audit trail of validations, runs, timing violations and decisions.
//!
//! Sinks never fail the caller: write errors are logged and dropped.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{DecisionContext, PipelineRun, ValidationResult, Window};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEntry {
    Validation {
        entity_id: String,
        window: Window,
        cutoff: DateTime<Utc>,
        result: ValidationResult,
    },
    TimingViolation {
        entity_id: String,
        window: Window,
        at: DateTime<Utc>,
        reason: String,
    },
    Run(Box<PipelineRun>),
    Decision(Box<DecisionContext>),
}

impl AuditEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEntry::Validation { .. } => "validation",
            AuditEntry::TimingViolation { .. } => "timing_violation",
            AuditEntry::Run(_) => "run",
            AuditEntry::Decision(_) => "decision",
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry);
}

/// Emits each entry as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, entry: &AuditEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => info!(target: "kickoff_backend::audit", kind = entry.kind(), "{}", json),
            Err(e) => warn!(kind = entry.kind(), error = %e, "failed to serialize audit entry"),
        }
    }
}

/// Appends one JSON document per line to a file.
pub struct JsonlAuditSink {
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log at {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, entry: &AuditEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(kind = entry.kind(), error = %e, "failed to serialize audit entry");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", line) {
            warn!(kind = entry.kind(), error = %e, "audit append failed");
        }
    }
}

/// Keeps entries in memory. For tests and inspection tooling.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.entries.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditEntry) {
        self.entries.lock().push(entry.clone());
    }
}
