//! The pub/sub transport seam.
//!
//! The sync engine never talks to a network directly. Everything it needs
//! from the outside world is the four primitives of [`Transport`]:
//!
//! - `publish` a payload to a topic
//! - `subscribe` to live payloads on a topic
//! - `query_historical` to replay a topic's stored payloads once
//! - `unsubscribe` a live subscription
//!
//! # Available Transports
//!
//! - [`MemoryTransport`] - In-process bus with retained history (tests, demos)
//! - `NostrTransport` - Nostr relay pool (feature `nostr`)

mod memory;
#[cfg(feature = "nostr")]
mod nostr;

pub use memory::{HistoricalMode, HistoryGate, MemoryTransport};
#[cfg(feature = "nostr")]
pub use nostr::{DEFAULT_EVENT_KIND, NostrTransport, NostrTransportConfig};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Callback invoked with each raw payload the transport delivers.
///
/// Called from whatever task or thread the transport dispatches on; it must
/// not block.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Opaque identifier of a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The capability is structurally absent (no capable peers, protocol not
    /// offered). Historical retrieval treats this as "nothing to load".
    Unsupported,
    /// The operation did not finish within its bound.
    Timeout,
    /// Any other failure (malformed response, peer error).
    Failure,
    /// The channel cannot be established at all.
    Fatal,
}

impl TransportErrorKind {
    /// Lowercase name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsupported => "unsupported",
            Self::Timeout => "timeout",
            Self::Failure => "failure",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a [`Transport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// What went wrong, coarsely.
    pub kind: TransportErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl TransportError {
    /// Create an error of the given kind.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The capability is absent.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unsupported, message)
    }

    /// The operation timed out.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Generic failure.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Failure, message)
    }

    /// The channel cannot be established.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Fatal, message)
    }

    /// Whether this error means the capability is absent.
    pub fn is_unsupported(&self) -> bool {
        self.kind == TransportErrorKind::Unsupported
    }
}

/// A topic-based pub/sub network with one-shot historical replay.
///
/// Implementations must be safe to call from several tasks at once. Handlers
/// passed to `subscribe` and `query_historical` may be invoked concurrently
/// with each other.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish a payload to `topic`. Resolves once the network acknowledges
    /// or rejects it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Start live delivery of payloads published to `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<SubscriptionHandle, TransportError>;

    /// Replay every stored payload of `topic` through `on_message`, then
    /// resolve. Returns an [`TransportErrorKind::Unsupported`] error when
    /// historical retrieval is not available.
    async fn query_historical(
        &self,
        topic: &str,
        on_message: MessageHandler,
    ) -> Result<(), TransportError>;

    /// Stop delivery for a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        assert_eq!(
            TransportError::unsupported("x").kind,
            TransportErrorKind::Unsupported
        );
        assert_eq!(TransportError::timeout("x").kind, TransportErrorKind::Timeout);
        assert_eq!(TransportError::failure("x").kind, TransportErrorKind::Failure);
        assert_eq!(TransportError::fatal("x").kind, TransportErrorKind::Fatal);
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::unsupported("no store peers");
        assert_eq!(err.to_string(), "unsupported: no store peers");
        assert!(err.is_unsupported());
        assert!(!TransportError::failure("boom").is_unsupported());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(SubscriptionHandle(7).to_string(), "sub#7");
    }
}
