//! Ingestion counters surfaced on the diagnostics endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ConnectionError, DecodeError, StoreError};
use crate::models::{truncate_raw, SourceTag};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Decode,
    Connection,
    Store,
}

/// Most recent ingestion failure. Overwritten, never accumulated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub error_kind: &'static str,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
    pub at: DateTime<Utc>,
}

/// Monotonic counters plus the last failure. Reset only by process restart.
#[derive(Debug, Default)]
pub struct Counters {
    // ---
    received: AtomicU64,
    processed: [AtomicU64; 3],
    decode_failures: AtomicU64,
    connection_failures: AtomicU64,
    store_failures: AtomicU64,
    last_failure: Mutex<Option<FailureReport>>,
}

impl Counters {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn inc_processed(&self, source: SourceTag) {
        self.processed[slot(source)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self, source: SourceTag) -> u64 {
        self.processed[slot(source)].load(Ordering::Relaxed)
    }

    pub fn processed_total(&self) -> u64 {
        SourceTag::ALL.iter().map(|s| self.processed(*s)).sum()
    }

    pub fn record_decode_failure(&self, source: SourceTag, err: &DecodeError, raw: &[u8]) {
        // ---
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_failure(FailureReport {
            kind: FailureKind::Decode,
            error_kind: err.kind(),
            error: err.to_string(),
            source: Some(source),
            raw_payload: Some(truncate_raw(raw)),
            at: Utc::now(),
        });
    }

    pub fn record_connection_failure(&self, err: &ConnectionError) {
        // ---
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_failure(FailureReport {
            kind: FailureKind::Connection,
            error_kind: err.kind(),
            error: err.to_string(),
            source: None,
            raw_payload: None,
            at: Utc::now(),
        });
    }

    pub fn record_store_failure(&self, source: SourceTag, err: &StoreError, raw: &[u8]) {
        // ---
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_failure(FailureReport {
            kind: FailureKind::Store,
            error_kind: err.kind(),
            error: err.to_string(),
            source: Some(source),
            raw_payload: Some(truncate_raw(raw)),
            at: Utc::now(),
        });
    }

    pub fn last_failure(&self) -> Option<FailureReport> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        // ---
        CountersSnapshot {
            received: self.received(),
            processed: SourceTag::ALL
                .iter()
                .map(|s| (s.as_str(), self.processed(*s)))
                .collect(),
            processed_total: self.processed_total(),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            last_failure: self.last_failure(),
        }
    }

    fn set_last_failure(&self, report: FailureReport) {
        *self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report);
    }
}

const fn slot(source: SourceTag) -> usize {
    match source {
        SourceTag::Subscription => 0,
        SourceTag::Push => 1,
        SourceTag::Synthetic => 2,
    }
}

/// Point-in-time copy of [`Counters`] for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub received: u64,
    pub processed: BTreeMap<&'static str, u64>,
    pub processed_total: u64,
    pub decode_failures: u64,
    pub connection_failures: u64,
    pub store_failures: u64,
    pub last_failure: Option<FailureReport>,
}
