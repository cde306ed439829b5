//! Nostr relay-pool transport.
//!
//! Maps the topic abstraction onto Nostr events:
//!
//! ```text
//!   topic "/tally/1/polls/json"
//!        │
//!        ▼
//!   Event { kind: <custom kind>, tags: [["t", topic]], content: <JSON payload> }
//! ```
//!
//! Publishing signs an event with an ephemeral key and sends it to every
//! relay in the pool. Live subscriptions are REQs with a `#t` filter, routed
//! back to their handler by subscription id from a single notification pump.
//! Historical retrieval fetches stored events with the same filter.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{MessageHandler, SubscriptionHandle, Transport, TransportError};

/// Default custom event kind for tally payloads (regular, stored by relays).
pub const DEFAULT_EVENT_KIND: u16 = 7_411;

/// Configuration for [`NostrTransport`].
#[derive(Debug, Clone)]
pub struct NostrTransportConfig {
    /// Relay URLs to connect to.
    pub relays: Vec<String>,

    /// Event kind carrying tally payloads.
    pub kind: u16,

    /// How long to wait after `connect()` for sockets to come up.
    pub connect_grace: Duration,

    /// Per-query bound passed to the relays when fetching stored events.
    ///
    /// Must stay below the coordinator's historical timeout, otherwise the
    /// events already fetched are lost when that bound fires first. See
    /// [`crate::SyncConfig::history_fetch_timeout`].
    pub fetch_timeout: Duration,
}

impl Default for NostrTransportConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            kind: DEFAULT_EVENT_KIND,
            connect_grace: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

type RouteTable = Arc<Mutex<HashMap<SubscriptionId, (SubscriptionHandle, MessageHandler)>>>;

/// [`super::Transport`] over a pool of Nostr relays.
pub struct NostrTransport {
    client: Client,
    kind: Kind,
    fetch_timeout: Duration,
    routes: RouteTable,
    next_handle: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NostrTransport {
    /// Connect to the configured relays and start the notification pump.
    ///
    /// Relays that cannot be added are logged and skipped; the transport is
    /// returned even if none connect, in which case historical queries report
    /// `Unsupported` and publishes fail.
    pub async fn connect(config: NostrTransportConfig) -> Result<Self, TransportError> {
        if config.relays.is_empty() {
            return Err(TransportError::fatal("no relays configured"));
        }

        let client = Client::builder().signer(Keys::generate()).build();

        for relay_url in &config.relays {
            if let Err(e) = client.add_relay(relay_url).await {
                tracing::warn!("Failed to add relay {}: {}", relay_url, e);
            } else {
                tracing::debug!("Added relay: {}", relay_url);
            }
        }

        client.connect().await;
        tokio::time::sleep(config.connect_grace).await;

        let transport = Self {
            client,
            kind: Kind::Custom(config.kind),
            fetch_timeout: config.fetch_timeout,
            routes: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(0),
            pump: Mutex::new(None),
        };

        tracing::info!(
            "Connected to {} of {} relays (kind {})",
            transport.connected_relays().await,
            config.relays.len(),
            config.kind
        );

        let pump = tokio::spawn(pump_notifications(
            transport.client.notifications(),
            Arc::clone(&transport.routes),
        ));
        *transport.pump.lock() = Some(pump);

        Ok(transport)
    }

    /// Number of relays currently connected.
    pub async fn connected_relays(&self) -> usize {
        self.client
            .relays()
            .await
            .values()
            .filter(|relay| relay.status() == RelayStatus::Connected)
            .count()
    }

    /// Stop the notification pump and disconnect from every relay.
    pub async fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.routes.lock().clear();
        self.client.disconnect().await;
        tracing::info!("Disconnected from relays");
    }

    fn filter(&self, topic: &str) -> Filter {
        Filter::new().kind(self.kind).hashtag(topic)
    }
}

/// Dispatch relay notifications to the handler owning each subscription id.
async fn pump_notifications(
    mut notifications: tokio::sync::broadcast::Receiver<RelayPoolNotification>,
    routes: RouteTable,
) {
    loop {
        let notification = match notifications.recv().await {
            Ok(n) => n,
            Err(RecvError::Lagged(count)) => {
                metrics::counter!("nostr_notifications_lagged_total").increment(count);
                tracing::warn!("Notification receiver lagged, dropped {} messages", count);
                continue;
            }
            Err(RecvError::Closed) => {
                tracing::info!("Notification channel closed");
                break;
            }
        };

        match notification {
            RelayPoolNotification::Event {
                subscription_id,
                event,
                ..
            } => {
                let handler = routes
                    .lock()
                    .get(&subscription_id)
                    .map(|(_, handler)| handler.clone());
                if let Some(handler) = handler {
                    handler(event.content.as_bytes());
                }
            }
            RelayPoolNotification::Message { relay_url, message } => {
                if let RelayMessage::Closed {
                    subscription_id,
                    message,
                } = message
                {
                    tracing::warn!(
                        "Relay {} closed subscription {}: {}",
                        relay_url,
                        subscription_id,
                        message
                    );
                }
            }
            RelayPoolNotification::Shutdown => {
                tracing::info!("Relay pool shutdown notification received");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for NostrTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let content = String::from_utf8(payload)
            .map_err(|e| TransportError::failure(format!("payload is not UTF-8: {e}")))?;
        let builder = EventBuilder::new(self.kind, content).tag(Tag::hashtag(topic));

        let output = self
            .client
            .send_event_builder(builder)
            .await
            .map_err(|e| TransportError::failure(e.to_string()))?;

        if output.success.is_empty() {
            let reasons: Vec<String> = output
                .failed
                .iter()
                .map(|(url, reason)| format!("{url}: {reason}"))
                .collect();
            return Err(TransportError::failure(format!(
                "no relay accepted event {}: [{}]",
                output.val,
                reasons.join(", ")
            )));
        }

        tracing::debug!(
            "Published {} to {} ({} relays accepted)",
            output.val,
            topic,
            output.success.len()
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<SubscriptionHandle, TransportError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let id = SubscriptionId::generate();

        // Route first so no event can arrive for an unknown id
        self.routes.lock().insert(id.clone(), (handle, on_message));

        if let Err(e) = self
            .client
            .subscribe_with_id(id.clone(), self.filter(topic), None)
            .await
        {
            self.routes.lock().remove(&id);
            return Err(TransportError::fatal(e.to_string()));
        }

        tracing::info!("Subscribed to {} ({} as {})", topic, handle, id);
        Ok(handle)
    }

    async fn query_historical(
        &self,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<(), TransportError> {
        if self.connected_relays().await == 0 {
            return Err(TransportError::unsupported("no connected relays"));
        }

        let events = self
            .client
            .fetch_events(self.filter(topic), self.fetch_timeout)
            .await
            .map_err(|e| TransportError::failure(e.to_string()))?;

        for event in events.into_iter() {
            on_message(event.content.as_bytes());
        }
        Ok(())
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let id = {
            let mut routes = self.routes.lock();
            let id = routes
                .iter()
                .find(|(_, (h, _))| *h == handle)
                .map(|(id, _)| id.clone());
            if let Some(id) = &id {
                routes.remove(id);
            }
            id
        };

        if let Some(id) = id {
            self.client.unsubscribe(&id).await;
            tracing::debug!("Unsubscribed {} ({})", handle, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NostrTransportConfig::default();
        assert!(config.relays.is_empty());
        assert_eq!(config.kind, DEFAULT_EVENT_KIND);
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_connect_requires_relays() {
        let err = NostrTransport::connect(NostrTransportConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, crate::transport::TransportErrorKind::Fatal);
    }
}
