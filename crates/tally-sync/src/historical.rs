//! One-shot historical retrieval of a topic.
//!
//! [`HistoricalLoader`] asks the transport to replay everything it has stored
//! for a topic, decodes and validates each payload, and hands back the valid
//! records. It performs no retries.
//!
//! # Outcomes
//!
//! | Transport says | `load_topic` returns |
//! |----------------|----------------------|
//! | replay finished | `Ok` with records, [`HistoryAvailability::Complete`] |
//! | unsupported | `Ok` with no records, [`HistoryAvailability::Unsupported`] |
//! | any other error | `Err` (the caller degrades to empty) |
//! | nothing within the bound | `Err` of kind `Timeout` |

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tally_core::{Record, Validator};

use crate::ingest::{IngestCounters, IngestPath, IngestStats, ingest};
use crate::transport::{MessageHandler, Transport, TransportError};

/// Whether a topic's history was actually available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAvailability {
    /// The transport replayed its store.
    Complete,
    /// The transport has no historical capability; the batch is empty.
    Unsupported,
}

/// Result of loading one topic.
#[derive(Debug, Clone)]
pub struct HistoricalBatch<R> {
    /// Valid records in the order the transport replayed them.
    pub records: Vec<R>,
    pub stats: IngestStats,
    pub availability: HistoryAvailability,
}

impl<R> HistoricalBatch<R> {
    fn unsupported() -> Self {
        Self {
            records: Vec::new(),
            stats: IngestStats::default(),
            availability: HistoryAvailability::Unsupported,
        }
    }
}

/// Loads the stored records of a topic for one record kind.
pub struct HistoricalLoader<R: Record> {
    transport: Arc<dyn Transport>,
    validator: Validator,
    timeout: Duration,
    _kind: PhantomData<fn() -> R>,
}

impl<R: Record> HistoricalLoader<R> {
    /// Create a loader bounded by `timeout` per call.
    pub fn new(transport: Arc<dyn Transport>, validator: Validator, timeout: Duration) -> Self {
        Self {
            transport,
            validator,
            timeout,
            _kind: PhantomData,
        }
    }

    /// Replay `topic` and collect its valid records.
    ///
    /// # Errors
    ///
    /// Returns the transport's error for anything other than "unsupported",
    /// and a `Timeout` error if the replay does not finish within the bound.
    pub async fn load_topic(&self, topic: &str) -> Result<HistoricalBatch<R>, TransportError> {
        let kind = R::KIND.as_str();
        let start = Instant::now();

        let collected: Arc<Mutex<Vec<R>>> = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(IngestCounters::default());

        let handler: MessageHandler = {
            let collected = Arc::clone(&collected);
            let counters = Arc::clone(&counters);
            let validator = self.validator.clone();
            Arc::new(move |payload: &[u8]| {
                if let Some(record) =
                    ingest::<R>(payload, &validator, IngestPath::Historical, &counters)
                {
                    collected.lock().push(record);
                }
            })
        };

        tracing::debug!("Loading {} history from {}", kind, topic);

        let outcome =
            tokio::time::timeout(self.timeout, self.transport.query_historical(topic, handler))
                .await;

        metrics::histogram!("sync_historical_load_seconds", "kind" => kind)
            .record(start.elapsed().as_secs_f64());

        match outcome {
            Err(_) => Err(TransportError::timeout(format!(
                "historical load of {} did not finish within {:?}",
                topic, self.timeout
            ))),
            Ok(Err(e)) if e.is_unsupported() => {
                tracing::info!(
                    "Historical retrieval unavailable for {} ({}); starting from live only",
                    topic,
                    e
                );
                Ok(HistoricalBatch::unsupported())
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                let records = std::mem::take(&mut *collected.lock());
                let stats = counters.snapshot();
                tracing::info!(
                    "Loaded {} {} records from {} ({} received, {} dropped) in {:?}",
                    records.len(),
                    kind,
                    topic,
                    stats.total_records,
                    stats.invalid_records,
                    start.elapsed()
                );
                Ok(HistoricalBatch {
                    records,
                    stats,
                    availability: HistoryAvailability::Complete,
                })
            }
        }
    }
}
