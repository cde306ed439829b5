//! Live subscription with a readiness gate.
//!
//! A [`LiveSubscriber`] starts in `Buffering`: valid records are queued in
//! arrival order instead of being delivered. `set_ready(true)` flips it to
//! `Flowing` exactly once, draining the queue through the record callback
//! before any later record is let through.
//!
//! ```text
//!              subscribe()          set_ready(true)
//!   Buffering ─────────────► queue ───────────────► Flowing ──► on_record
//!       │                                              │
//!       └────────────── unsubscribe() ─────────────────┴──► Closed
//! ```
//!
//! The queue lives inside the `Buffering` state value, so it exists exactly
//! as long as buffering does. The transition and the drain happen under the
//! subscriber's mutex, and flowing deliveries take the same mutex, which is
//! what keeps later records from overtaking buffered ones.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tally_core::{Record, Validator};

use crate::error::{Error, Result};
use crate::ingest::{IngestCounters, IngestPath, IngestStats, ingest};
use crate::transport::{MessageHandler, SubscriptionHandle, Transport};

/// Callback receiving each delivered record.
pub type RecordCallback<R> = Arc<dyn Fn(R) + Send + Sync>;

/// Observable state of a [`LiveSubscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Buffering,
    Flowing,
    Closed,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Buffering => "buffering",
            Self::Flowing => "flowing",
            Self::Closed => "closed",
        })
    }
}

enum Channel<R> {
    Buffering(VecDeque<R>),
    Flowing,
    Closed,
}

struct State<R> {
    channel: Channel<R>,
    on_record: Option<RecordCallback<R>>,
    topic: Option<String>,
    handle: Option<SubscriptionHandle>,
}

struct Inner<R> {
    state: Mutex<State<R>>,
    validator: Validator,
    counters: IngestCounters,
}

impl<R: Record> Inner<R> {
    /// Transport callback: decode, then buffer or deliver.
    fn on_payload(&self, payload: &[u8]) {
        let Some(record) = ingest::<R>(payload, &self.validator, IngestPath::Live, &self.counters)
        else {
            return;
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &mut state.channel {
            Channel::Buffering(queue) => {
                queue.push_back(record);
                metrics::counter!("sync_records_buffered_total", "kind" => R::KIND.as_str())
                    .increment(1);
            }
            Channel::Flowing => {
                if let Some(on_record) = &state.on_record {
                    on_record(record);
                }
            }
            Channel::Closed => {}
        }
    }
}

/// Live subscription to one topic, gated until the caller is ready.
pub struct LiveSubscriber<R: Record> {
    inner: Arc<Inner<R>>,
    transport: Arc<dyn Transport>,
}

impl<R: Record> LiveSubscriber<R> {
    /// Create an unattached subscriber in the `Buffering` state.
    pub fn new(transport: Arc<dyn Transport>, validator: Validator) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    channel: Channel::Buffering(VecDeque::new()),
                    on_record: None,
                    topic: None,
                    handle: None,
                }),
                validator,
                counters: IngestCounters::default(),
            }),
            transport,
        }
    }

    /// Attach to `topic`. Records are buffered until [`Self::set_ready`].
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadySubscribed`] if this subscriber is already attached
    /// - [`Error::Stopped`] if it was unsubscribed
    /// - [`Error::Transport`] if the transport refuses the subscription; the
    ///   subscriber is left unattached
    pub async fn subscribe<F>(&self, topic: &str, on_record: F) -> Result<()>
    where
        F: Fn(R) + Send + Sync + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if matches!(state.channel, Channel::Closed) {
                return Err(Error::Stopped);
            }
            if let Some(existing) = &state.topic {
                return Err(Error::AlreadySubscribed(existing.clone()));
            }
            state.on_record = Some(Arc::new(on_record));
            state.topic = Some(topic.to_string());
        }

        let weak: Weak<Inner<R>> = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_payload(payload);
            }
        });

        match self.transport.subscribe(topic, handler).await {
            Ok(handle) => {
                let closed = {
                    let mut state = self.inner.state.lock();
                    let closed = matches!(state.channel, Channel::Closed);
                    if !closed {
                        state.handle = Some(handle);
                    }
                    closed
                };
                if closed {
                    // Unsubscribed while the transport call was in flight
                    self.transport.unsubscribe(handle).await;
                    return Err(Error::Stopped);
                }
                tracing::debug!("{} subscriber attached to {} ({})", R::KIND, topic, handle);
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                state.on_record = None;
                state.topic = None;
                Err(e.into())
            }
        }
    }

    /// Open (or, before opening, keep closed) the readiness gate.
    ///
    /// `set_ready(true)` moves `Buffering` to `Flowing`, delivering every
    /// queued record in arrival order before returning. Repeating it is a
    /// no-op, as is any call after [`Self::unsubscribe`].
    ///
    /// # Panics
    ///
    /// Panics on `set_ready(false)` once the subscriber is `Flowing`; the gate
    /// only opens.
    pub fn set_ready(&self, ready: bool) {
        let mut state = self.inner.state.lock();
        if !ready {
            if matches!(state.channel, Channel::Flowing) {
                panic!("LiveSubscriber::set_ready(false) called after the subscriber started flowing");
            }
            return;
        }
        if !matches!(state.channel, Channel::Buffering(_)) {
            return;
        }

        let queue = match std::mem::replace(&mut state.channel, Channel::Flowing) {
            Channel::Buffering(queue) => queue,
            Channel::Flowing | Channel::Closed => VecDeque::new(),
        };
        tracing::debug!("{} subscriber flowing, flushing {} buffered", R::KIND, queue.len());
        if let Some(on_record) = &state.on_record {
            for record in queue {
                on_record(record);
            }
        }
    }

    /// Copy of the records currently queued, in arrival order.
    pub fn buffered(&self) -> Vec<R> {
        match &self.inner.state.lock().channel {
            Channel::Buffering(queue) => queue.iter().cloned().collect(),
            Channel::Flowing | Channel::Closed => Vec::new(),
        }
    }

    pub fn state(&self) -> SubscriberState {
        match self.inner.state.lock().channel {
            Channel::Buffering(_) => SubscriberState::Buffering,
            Channel::Flowing => SubscriberState::Flowing,
            Channel::Closed => SubscriberState::Closed,
        }
    }

    /// Topic this subscriber is attached to, if any.
    pub fn topic(&self) -> Option<String> {
        self.inner.state.lock().topic.clone()
    }

    /// Detach from the transport and discard anything still queued.
    ///
    /// Idempotent. The subscriber cannot be reattached afterwards.
    pub async fn unsubscribe(&self) {
        let handle = {
            let mut state = self.inner.state.lock();
            if let Channel::Buffering(queue) = &state.channel
                && !queue.is_empty()
            {
                tracing::debug!("Discarding {} buffered {} records", queue.len(), R::KIND);
            }
            state.channel = Channel::Closed;
            state.on_record = None;
            state.handle.take()
        };

        if let Some(handle) = handle {
            self.transport.unsubscribe(handle).await;
        }
    }

    /// Live-path ingestion counts.
    pub fn stats(&self) -> IngestStats {
        self.inner.counters.snapshot()
    }
}
