use super::Phase;
use crate::classify::{Outcome, Signal};
use crate::locator::{AddressCheck, RowHandle, SourceMode};
use serde::Serialize;
use std::collections::BTreeMap;

/// A field value that was not written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRejection {
    pub record: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    /// Every requested field was written.
    Edited,
    /// Some fields were written, some rejected.
    Partial,
    /// Located, but every field was rejected.
    Rejected,
    NotFound,
    Malformed,
}

/// What happened to one requested record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordReport {
    pub name: String,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub partial_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_check: Option<AddressCheck>,
    /// Hidden inputs created for the record.
    pub shadow_inputs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordReport {
    pub(crate) fn located(name: &str, handle: &RowHandle, check: AddressCheck) -> Self {
        Self {
            name: name.to_string(),
            status: RecordStatus::Edited,
            source: Some(handle.source()),
            base_id: Some(handle.base_id()),
            record_index: Some(handle.record_index()),
            partial_match: handle.partial_match(),
            address_check: Some(check),
            shadow_inputs: 0,
            error: None,
        }
    }

    pub(crate) fn missing(name: &str, status: RecordStatus, error: String) -> Self {
        Self {
            name: name.to_string(),
            status,
            source: None,
            base_id: None,
            record_index: None,
            partial_match: false,
            address_check: None,
            shadow_inputs: 0,
            error: Some(error),
        }
    }

    pub fn is_located(&self) -> bool {
        self.base_id.is_some()
    }
}

/// Evidence kept when something went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub phase: Phase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_excerpt: Option<String>,
}

/// Outcome of one transaction, the only thing handed back to callers.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionResult {
    pub outcome: Outcome,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    /// `"record.field"` -> value written.
    pub fields_written: BTreeMap<String, String>,
    pub fields_rejected: Vec<FieldRejection>,
    pub records: Vec<RecordReport>,
    pub phase_reached: Phase,
    pub dry_run: bool,
    /// Form values read back in a dry run, keyed like `fields_written`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshot: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    pub duration_ms: u64,
}

impl TransactionResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn record(&self, name: &str) -> Option<&RecordReport> {
        self.records.iter().find(|r| r.name == name)
    }
}
