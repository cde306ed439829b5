//! In-process transport.
//!
//! [`MemoryTransport`] is a single shared bus: every published payload is
//! retained per topic (the "store") and fanned out to live subscribers.
//! Tests use its knobs to reproduce the network conditions the coordinator
//! must survive: missing or failing history, failing subscriptions, and live
//! traffic arriving while historical replay is still in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{MessageHandler, SubscriptionHandle, Transport, TransportError};

/// How the bus answers historical queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoricalMode {
    /// Replay retained payloads.
    #[default]
    Supported,
    /// Report that historical retrieval is unavailable.
    Unsupported,
    /// Fail the query with a generic transport failure.
    Failing,
}

/// Holds historical replay until released.
///
/// Dropping the gate releases it as well.
#[derive(Debug)]
pub struct HistoryGate {
    tx: watch::Sender<bool>,
}

impl HistoryGate {
    /// Let pending and future historical queries proceed.
    pub fn release(&self) {
        self.tx.send_replace(true);
    }
}

/// Mutable bus state.
#[derive(Default)]
struct BusState {
    /// Retained payloads per topic, in publish order.
    history: HashMap<String, Vec<Vec<u8>>>,
    /// Live subscriptions.
    subscriptions: HashMap<SubscriptionHandle, (String, MessageHandler)>,
    historical_mode: HistoricalMode,
    fail_subscribe: bool,
    fail_publish: bool,
    history_gate: Option<watch::Receiver<bool>>,
    history_delay: Option<Duration>,
}

/// In-process pub/sub bus with retained history.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<BusState>,
    next_handle: AtomicU64,
    publish_count: AtomicUsize,
    query_count: AtomicUsize,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryTransport")
            .field("topics", &state.history.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("historical_mode", &state.historical_mode)
            .finish()
    }
}

impl MemoryTransport {
    /// Create an empty bus with historical retrieval enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bus answering historical queries with `mode`.
    pub fn with_historical_mode(mode: HistoricalMode) -> Self {
        let transport = Self::new();
        transport.set_historical_mode(mode);
        transport
    }

    /// Change how historical queries are answered.
    pub fn set_historical_mode(&self, mode: HistoricalMode) {
        self.state.lock().historical_mode = mode;
    }

    /// Make every subsequent `subscribe` fail with a fatal error.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.state.lock().fail_subscribe = fail;
    }

    /// Make every subsequent `publish` fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    /// Hold historical replay until the returned gate is released.
    pub fn hold_history(&self) -> HistoryGate {
        let (tx, rx) = watch::channel(false);
        self.state.lock().history_gate = Some(rx);
        HistoryGate { tx }
    }

    /// Make historical replay take `delay` before it answers, like a slow
    /// store.
    pub fn delay_history(&self, delay: Duration) {
        self.state.lock().history_delay = Some(delay);
    }

    /// Store a payload in a topic's history without delivering it live.
    pub fn seed_history(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .history
            .entry(topic.to_string())
            .or_default()
            .push(payload.into());
    }

    /// Deliver a payload to live subscribers without storing it.
    pub fn deliver_live(&self, topic: &str, payload: impl AsRef<[u8]>) {
        let handlers = self.live_handlers(topic);
        for handler in handlers {
            handler(payload.as_ref());
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .values()
            .filter(|(t, _)| t == topic)
            .count()
    }

    /// Number of payloads retained for `topic`.
    pub fn history_len(&self, topic: &str) -> usize {
        self.state.lock().history.get(topic).map_or(0, Vec::len)
    }

    /// Number of successful `publish` calls.
    pub fn publish_count(&self) -> usize {
        self.publish_count.load(Ordering::SeqCst)
    }

    /// Number of `query_historical` calls, successful or not.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Snapshot the handlers subscribed to `topic` so they can run unlocked.
    fn live_handlers(&self, topic: &str) -> Vec<MessageHandler> {
        self.state
            .lock()
            .subscriptions
            .values()
            .filter(|(t, _)| t == topic)
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.fail_publish {
                return Err(TransportError::failure("publish rejected by memory bus"));
            }
            state
                .history
                .entry(topic.to_string())
                .or_default()
                .push(payload.clone());
        }
        self.publish_count.fetch_add(1, Ordering::SeqCst);
        self.deliver_live(topic, &payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut state = self.state.lock();
        if state.fail_subscribe {
            return Err(TransportError::fatal("memory bus refused subscription"));
        }
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        state
            .subscriptions
            .insert(handle, (topic.to_string(), on_message));
        tracing::trace!("Memory bus: {} subscribed to {}", handle, topic);
        Ok(handle)
    }

    async fn query_historical(
        &self,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<(), TransportError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);

        let (mode, gate, delay) = {
            let state = self.state.lock();
            (
                state.historical_mode,
                state.history_gate.clone(),
                state.history_delay,
            )
        };

        match mode {
            HistoricalMode::Supported => {}
            HistoricalMode::Unsupported => {
                return Err(TransportError::unsupported("memory bus has no store"));
            }
            HistoricalMode::Failing => {
                return Err(TransportError::failure("memory bus store unavailable"));
            }
        }

        if let Some(mut gate) = gate {
            // A dropped gate counts as released
            let _ = gate.wait_for(|open| *open).await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let payloads = self.state.lock().history.get(topic).cloned().unwrap_or_default();
        for payload in &payloads {
            on_message(payload);
        }
        Ok(())
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.state.lock().subscriptions.remove(&handle).is_some() {
            tracing::trace!("Memory bus: {} unsubscribed", handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportErrorKind;
    use std::sync::Arc;

    fn collector() -> (MessageHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            sink.lock().push(payload.to_vec());
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_history() {
        let bus = MemoryTransport::new();
        let (handler, seen) = collector();
        bus.subscribe("t", handler).await.unwrap();

        bus.publish("t", b"one".to_vec()).await.unwrap();
        bus.publish("other", b"two".to_vec()).await.unwrap();

        assert_eq!(seen.lock().as_slice(), &[b"one".to_vec()]);
        assert_eq!(bus.history_len("t"), 1);
        assert_eq!(bus.publish_count(), 2);
    }

    #[tokio::test]
    async fn test_query_historical_replays_in_order() {
        let bus = MemoryTransport::new();
        bus.seed_history("t", "a");
        bus.seed_history("t", "b");

        let (handler, seen) = collector();
        bus.query_historical("t", handler).await.unwrap();

        assert_eq!(seen.lock().as_slice(), &[b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(bus.query_count(), 1);
    }

    #[tokio::test]
    async fn test_historical_modes() {
        let bus = MemoryTransport::with_historical_mode(HistoricalMode::Unsupported);
        let (handler, _) = collector();
        let err = bus.query_historical("t", handler.clone()).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Unsupported);

        bus.set_historical_mode(HistoricalMode::Failing);
        let err = bus.query_historical("t", handler).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Failure);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = MemoryTransport::new();
        let (handler, seen) = collector();
        let handle = bus.subscribe("t", handler).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);

        bus.unsubscribe(handle).await;
        bus.deliver_live("t", "late");

        assert!(seen.lock().is_empty());
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_failure_knobs() {
        let bus = MemoryTransport::new();
        bus.fail_subscriptions(true);
        let (handler, _) = collector();
        let err = bus.subscribe("t", handler).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Fatal);

        bus.fail_publishes(true);
        assert!(bus.publish("t", Vec::new()).await.is_err());
        assert_eq!(bus.publish_count(), 0);
        assert_eq!(bus.history_len("t"), 0);
    }

    #[tokio::test]
    async fn test_history_gate_holds_replay() {
        let bus = Arc::new(MemoryTransport::new());
        bus.seed_history("t", "a");
        let gate = bus.hold_history();

        let (handler, seen) = collector();
        let query_bus = Arc::clone(&bus);
        let query = tokio::spawn(async move { query_bus.query_historical("t", handler).await });

        tokio::task::yield_now().await;
        assert!(seen.lock().is_empty());

        gate.release();
        query.await.unwrap().unwrap();
        assert_eq!(seen.lock().len(), 1);
    }
}
