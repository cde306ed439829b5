//! Tally sync engine.
//!
//! Keeps a reconciled, live-updating view of polls and votes exchanged over a
//! pub/sub [`Transport`]. Peers publish records independently, so the same
//! logical record is observed many times and competing records share keys;
//! the engine collapses them deterministically.
//!
//! # Modules
//!
//! - [`coordinator`] - [`SyncCoordinator`], the application-facing surface
//! - [`historical`] - One-shot historical load per topic
//! - [`live`] - Live subscription with a readiness gate
//! - [`dedupe`] - Batch and incremental reconciliation
//! - [`transport`] - The transport seam plus in-memory and Nostr transports
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────┐
//!            │        Transport         │  publish / subscribe / query_historical
//!            └──────┬─────────────┬─────┘
//!        history    │             │   live
//!                   ▼             ▼
//! ┌──────────────────────┐  ┌──────────────────────┐
//! │  HistoricalLoader    │  │   LiveSubscriber     │  decode + validate,
//! │  (bounded, no retry) │  │  Buffering → Flowing │  drop invalid
//! └──────────┬───────────┘  └──────────┬───────────┘
//!            │                         │
//!            ▼                         ▼
//! ┌─────────────────────────────────────────────────┐
//! │                SyncCoordinator                  │
//! │  reconcile (startup)  ·  CanonicalSet (steady)  │──► observers
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Polls resolve update-wins (largest `createdAt`), votes first-vote-wins
//! (smallest `castAt`).

pub mod config;
pub mod coordinator;
pub mod dedupe;
pub mod error;
pub mod historical;
pub mod identity;
pub mod ingest;
pub mod live;
pub mod transport;

pub use error::{Error, Result};

pub use config::{SyncConfig, TopicConfig};
pub use coordinator::{
    DegradedNotice, DegradedReason, SyncCoordinator, SyncCoordinatorBuilder, SyncSnapshot,
    SyncState,
};
pub use dedupe::{ApplyOutcome, CanonicalSet, reconcile, reconcile_polls, reconcile_votes};
pub use historical::{HistoricalBatch, HistoricalLoader, HistoryAvailability};
pub use identity::{IdentityProvider, UnsignedIdentity};
pub use ingest::IngestStats;
pub use live::{LiveSubscriber, SubscriberState};
pub use transport::{
    MemoryTransport, MessageHandler, SubscriptionHandle, Transport, TransportError,
    TransportErrorKind,
};

#[cfg(feature = "nostr")]
pub use transport::{DEFAULT_EVENT_KIND, NostrTransport, NostrTransportConfig};
