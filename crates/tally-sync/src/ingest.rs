//! Shared decode-and-validate step for inbound payloads.
//!
//! Both the historical and the live path funnel every raw payload through
//! [`ingest`]. A payload that does not decode, or decodes into a record that
//! fails structural validation, is counted and dropped; it never reaches a
//! buffer or the canonical set.

use std::sync::atomic::{AtomicUsize, Ordering};

use tally_core::{Error as CoreError, Record, Validator, codec};

/// Which path a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPath {
    Historical,
    Live,
}

impl IngestPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Live => "live",
        }
    }
}

/// Counts of payloads seen on one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Payloads received (before decoding or validation).
    pub total_records: usize,

    /// Payloads that became valid records.
    pub valid_records: usize,

    /// Payloads dropped, for either reason below.
    pub invalid_records: usize,

    /// Breakdown of dropped payloads.
    pub validation_errors: usize,
    pub parse_errors: usize,
}

/// Lock-free accumulator behind [`IngestStats`], shared with transport
/// callbacks.
#[derive(Debug, Default)]
pub struct IngestCounters {
    total: AtomicUsize,
    valid: AtomicUsize,
    validation_errors: AtomicUsize,
    parse_errors: AtomicUsize,
}

impl IngestCounters {
    /// Current totals.
    pub fn snapshot(&self) -> IngestStats {
        let validation_errors = self.validation_errors.load(Ordering::Relaxed);
        let parse_errors = self.parse_errors.load(Ordering::Relaxed);
        IngestStats {
            total_records: self.total.load(Ordering::Relaxed),
            valid_records: self.valid.load(Ordering::Relaxed),
            invalid_records: validation_errors + parse_errors,
            validation_errors,
            parse_errors,
        }
    }
}

/// Decode and validate one payload, updating `counters` and metrics.
///
/// Returns `None` when the payload is dropped.
pub fn ingest<R: Record>(
    payload: &[u8],
    validator: &Validator,
    path: IngestPath,
    counters: &IngestCounters,
) -> Option<R> {
    let kind = R::KIND.as_str();
    counters.total.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("sync_records_received_total", "kind" => kind, "path" => path.as_str())
        .increment(1);

    match codec::decode_valid::<R>(payload, validator) {
        Ok(record) => {
            counters.valid.fetch_add(1, Ordering::Relaxed);
            Some(record)
        }
        Err(CoreError::Validation(e)) => {
            counters.validation_errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("sync_records_invalid_total", "kind" => kind, "reason" => e.reason())
                .increment(1);
            tracing::debug!("Dropped invalid {} ({}): {}", kind, path.as_str(), e);
            None
        }
        Err(e) => {
            counters.parse_errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("sync_records_invalid_total", "kind" => kind, "reason" => "decode")
                .increment(1);
            tracing::debug!("Dropped undecodable {} ({}): {}", kind, path.as_str(), e);
            None
        }
    }
}
