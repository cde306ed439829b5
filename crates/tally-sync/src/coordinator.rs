//! The sync coordinator: one reconciled view of polls and votes.
//!
//! # Startup
//!
//! ```text
//!   initialize()
//!     │
//!     ├─ 1. arm live subscribers (Buffering)   ← records published from here on are kept
//!     ├─ 2. load both histories concurrently   ← bounded, degrade to empty on failure
//!     ├─ 3. merge history + buffered, reconcile, install canonical sets
//!     ├─ 4. Ready / DegradedReady
//!     └─ 5. open both gates: buffered records flow through the incremental path
//! ```
//!
//! Arming before loading is what prevents a record published between the
//! historical query and the live subscription from being lost.
//!
//! # Steady State
//!
//! Each live record is folded into its kind's [`CanonicalSet`] in O(1).
//! Observers fire only when the canonical set changes.
//!
//! # State Machine
//!
//! ```text
//!   NotStarted ──► LoadingHistorical ──► Ready ─────────┐
//!       ▲                 │          └─► DegradedReady ─┤
//!       └─ subscribe ─────┘                             ▼
//!          failure                           stop() ──► Stopped
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tally_core::{
    Clock, PollRecord, PollResults, Record, RecordKind, Validator, VoteKey, VoteRecord, codec,
    system_clock,
};
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::dedupe::{CanonicalSet, reconcile_records};
use crate::error::{Error, Result};
use crate::historical::{HistoricalBatch, HistoricalLoader, HistoryAvailability};
use crate::identity::{IdentityProvider, UnsignedIdentity};
use crate::live::LiveSubscriber;
use crate::transport::{Transport, TransportError};

// ═══════════════════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a [`SyncCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NotStarted,
    LoadingHistorical,
    /// History loaded for both topics.
    Ready,
    /// At least one topic started from live records only.
    DegradedReady,
    /// Terminal.
    Stopped,
}

impl SyncState {
    /// Whether the reconciled view is available.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::DegradedReady)
    }

    fn gauge_value(self) -> f64 {
        match self {
            Self::Ready => 1.0,
            Self::DegradedReady => 0.5,
            _ => 0.0,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::LoadingHistorical => "loading historical",
            Self::Ready => "ready",
            Self::DegradedReady => "degraded ready",
            Self::Stopped => "stopped",
        })
    }
}

/// The reconciled view returned by [`SyncCoordinator::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSnapshot {
    /// Canonical polls, newest first.
    pub polls: Vec<PollRecord>,
    /// Canonical votes, one per `(pollId, voterIdentity)`.
    pub votes: Vec<VoteRecord>,
}

/// Why a topic started without history.
#[derive(Debug, Clone, PartialEq)]
pub enum DegradedReason {
    /// The transport has no historical capability.
    Unsupported,
    /// The historical query failed or timed out.
    Failed(TransportError),
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => f.write_str("historical retrieval unsupported"),
            Self::Failed(e) => write!(f, "historical retrieval failed: {e}"),
        }
    }
}

/// Passed to `on_degraded` observers once per degraded topic.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedNotice {
    pub kind: RecordKind,
    pub topic: String,
    pub reason: DegradedReason,
}

type Observer<R> = Arc<dyn Fn(&R) + Send + Sync>;
type DegradedObserver = Arc<dyn Fn(&DegradedNotice) + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════
// Per-topic view
// ═══════════════════════════════════════════════════════════════════════════

/// Everything the coordinator owns for one record kind.
struct TopicView<R: Record> {
    topic: String,
    canonical: Mutex<CanonicalSet<R>>,
    observers: RwLock<Vec<Observer<R>>>,
    subscriber: Mutex<Option<Arc<LiveSubscriber<R>>>>,
}

impl<R: Record> TopicView<R> {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            canonical: Mutex::new(CanonicalSet::new()),
            observers: RwLock::new(Vec::new()),
            subscriber: Mutex::new(None),
        }
    }

    /// Incremental reconcile of one record; notifies observers on change.
    fn apply(&self, record: R) {
        let kind = R::KIND.as_str();
        let (outcome, len) = {
            let mut canonical = self.canonical.lock();
            let outcome = canonical.apply(record.clone());
            (outcome, canonical.len())
        };

        metrics::counter!(
            "sync_records_applied_total",
            "kind" => kind,
            "outcome" => outcome.as_str()
        )
        .increment(1);

        if outcome.changed() {
            metrics::gauge!("sync_canonical_records", "kind" => kind).set(len as f64);
            tracing::trace!("Canonical {} {:?} {}", kind, record.key(), outcome.as_str());
            self.notify(&record);
        }
    }

    /// Replace the canonical set with a reconciled batch.
    fn install(&self, records: Vec<R>) {
        let set = CanonicalSet::from_records(records);
        metrics::gauge!("sync_canonical_records", "kind" => R::KIND.as_str())
            .set(set.len() as f64);
        *self.canonical.lock() = set;
    }

    fn notify(&self, record: &R) {
        // Snapshot so observers may register observers
        let observers: Vec<Observer<R>> = self.observers.read().clone();
        for observer in observers {
            observer(record);
        }
    }

    fn snapshot(&self) -> Vec<R> {
        self.canonical.lock().snapshot()
    }

    fn take_subscriber(&self) -> Option<Arc<LiveSubscriber<R>>> {
        self.subscriber.lock().take()
    }

    fn subscriber(&self) -> Option<Arc<LiveSubscriber<R>>> {
        self.subscriber.lock().clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════

struct Shared {
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    validator: Validator,
    identity: Arc<dyn IdentityProvider>,
    state: Mutex<SyncState>,
    polls: TopicView<PollRecord>,
    votes: TopicView<VoteRecord>,
    degraded_observers: RwLock<Vec<DegradedObserver>>,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    /// The view holding records of kind `R`.
    fn view<R: Record>(&self) -> Option<&TopicView<R>> {
        let view: &dyn Any = match R::KIND {
            RecordKind::Poll => &self.polls,
            RecordKind::Vote => &self.votes,
        };
        view.downcast_ref::<TopicView<R>>()
    }

    fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Unsubscribe and forget every armed subscriber.
    async fn teardown(&self) {
        if let Some(subscriber) = self.polls.take_subscriber() {
            subscriber.unsubscribe().await;
        }
        if let Some(subscriber) = self.votes.take_subscriber() {
            subscriber.unsubscribe().await;
        }
    }

    async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Builder for [`SyncCoordinator`].
pub struct SyncCoordinatorBuilder {
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    identity: Option<Arc<dyn IdentityProvider>>,
    clock: Option<Clock>,
}

impl SyncCoordinatorBuilder {
    /// Use `config` instead of [`SyncConfig::default`].
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sign locally cast votes with `identity` (default: unsigned).
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Use `clock` for timestamps and the future-skew check (default: system
    /// clock).
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> SyncCoordinator {
        let validator = Validator::with_clock(
            self.config.clock_skew_tolerance,
            self.clock.unwrap_or_else(system_clock),
        );
        let (stop_tx, _) = watch::channel(false);

        SyncCoordinator {
            shared: Arc::new(Shared {
                polls: TopicView::new(&self.config.topics.polls),
                votes: TopicView::new(&self.config.topics.votes),
                transport: self.transport,
                config: self.config,
                validator,
                identity: self
                    .identity
                    .unwrap_or_else(|| Arc::new(UnsignedIdentity)),
                state: Mutex::new(SyncState::NotStarted),
                degraded_observers: RwLock::new(Vec::new()),
                stop_tx,
            }),
        }
    }
}

/// Reconciled, live-updating view of polls and votes.
///
/// Cheap to clone; clones share the same view.
#[derive(Clone)]
pub struct SyncCoordinator {
    shared: Arc<Shared>,
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.state())
            .field("polls_topic", &self.shared.polls.topic)
            .field("votes_topic", &self.shared.votes.topic)
            .finish()
    }
}

impl SyncCoordinator {
    /// Start building a coordinator over `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            transport,
            config: SyncConfig::default(),
            identity: None,
            clock: None,
        }
    }

    /// Coordinator with default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn state(&self) -> SyncState {
        self.shared.state()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    // ───────────────────────────────────────────────────────────────────────
    // Startup
    // ───────────────────────────────────────────────────────────────────────

    /// Build the reconciled view and switch to live updates.
    ///
    /// Historical failures never fail this call; they leave the coordinator
    /// `DegradedReady` and are reported to `on_degraded` observers. Observers
    /// registered with `on_poll_added`/`on_vote_added` are not called for the
    /// returned population.
    ///
    /// If [`Self::stop`] runs concurrently, this resolves `Ok` with an empty
    /// snapshot.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInitialized`] unless the coordinator is `NotStarted`
    /// - [`Error::Stopped`] if it was stopped before the call
    /// - [`Error::Transport`] if a live subscription cannot be established;
    ///   anything armed is torn down and the coordinator is `NotStarted` again
    pub async fn initialize(&self) -> Result<SyncSnapshot> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            match *state {
                SyncState::NotStarted => *state = SyncState::LoadingHistorical,
                SyncState::Stopped => return Err(Error::Stopped),
                other => return Err(Error::AlreadyInitialized(other)),
            }
        }
        tracing::info!(
            "Initializing sync (polls: {}, votes: {})",
            shared.polls.topic,
            shared.votes.topic
        );

        // 1. Arm before loading
        let armed = async {
            let polls = self.arm::<PollRecord>().await?;
            let votes = self.arm::<VoteRecord>().await?;
            Ok::<_, Error>((polls, votes))
        };
        let (poll_sub, vote_sub) = match armed.await {
            Ok(subs) => subs,
            Err(Error::Stopped) => return Ok(self.discard_after_stop().await),
            Err(e) => {
                tracing::error!("Live subscription failed: {}", e);
                shared.teardown().await;
                let mut state = shared.state.lock();
                if *state == SyncState::LoadingHistorical {
                    *state = SyncState::NotStarted;
                }
                return Err(e);
            }
        };
        if shared.state() == SyncState::Stopped {
            return Ok(self.discard_after_stop().await);
        }

        // 2. Load both histories concurrently, abandoning them on stop
        let timeout = shared.config.historical_timeout;
        let poll_loader = HistoricalLoader::<PollRecord>::new(
            shared.transport.clone(),
            shared.validator.clone(),
            timeout,
        );
        let vote_loader = HistoricalLoader::<VoteRecord>::new(
            shared.transport.clone(),
            shared.validator.clone(),
            timeout,
        );

        let (poll_result, vote_result) = tokio::select! {
            results = async {
                tokio::join!(
                    poll_loader.load_topic(&shared.polls.topic),
                    vote_loader.load_topic(&shared.votes.topic),
                )
            } => results,
            _ = shared.stopped() => return Ok(self.discard_after_stop().await),
        };

        // 3. Settle, merge with what arrived meanwhile, reconcile
        let mut notices = Vec::new();
        let mut polls = settle(&shared.polls.topic, poll_result, &mut notices);
        let mut votes = settle(&shared.votes.topic, vote_result, &mut notices);

        polls.extend(poll_sub.buffered());
        votes.extend(vote_sub.buffered());
        shared.polls.install(reconcile_records(polls));
        shared.votes.install(reconcile_records(votes));

        // 4. Ready, unless stop() got there first
        let ready_state = if notices.is_empty() {
            SyncState::Ready
        } else {
            SyncState::DegradedReady
        };
        let stopped = {
            let mut state = shared.state.lock();
            let stopped = *state == SyncState::Stopped;
            if !stopped {
                *state = ready_state;
            }
            stopped
        };
        if stopped {
            return Ok(self.discard_after_stop().await);
        }
        metrics::gauge!("sync_ready").set(ready_state.gauge_value());

        // 5. Drain the gates through the incremental path
        poll_sub.set_ready(true);
        vote_sub.set_ready(true);

        let snapshot = SyncSnapshot {
            polls: shared.polls.snapshot(),
            votes: shared.votes.snapshot(),
        };
        tracing::info!(
            "Sync {}: {} polls, {} votes",
            ready_state,
            snapshot.polls.len(),
            snapshot.votes.len()
        );

        if !notices.is_empty() {
            let observers: Vec<DegradedObserver> = shared.degraded_observers.read().clone();
            for notice in &notices {
                for observer in &observers {
                    observer(notice);
                }
            }
        }

        Ok(snapshot)
    }

    /// Create the live subscriber for kind `R` and attach it, buffering.
    async fn arm<R: Record>(&self) -> Result<Arc<LiveSubscriber<R>>> {
        let shared = &self.shared;
        let Some(view) = shared.view::<R>() else {
            return Err(Error::Config(format!("no view for {}", R::KIND)));
        };

        let subscriber = Arc::new(LiveSubscriber::<R>::new(
            shared.transport.clone(),
            shared.validator.clone(),
        ));
        // Visible to stop() before the transport call starts
        *view.subscriber.lock() = Some(Arc::clone(&subscriber));

        let weak = Arc::downgrade(&self.shared);
        subscriber
            .subscribe(&view.topic, move |record: R| {
                if let Some(shared) = weak.upgrade()
                    && let Some(view) = shared.view::<R>()
                {
                    view.apply(record);
                }
            })
            .await?;

        Ok(subscriber)
    }

    /// Cleanup for an `initialize()` overtaken by `stop()`.
    async fn discard_after_stop(&self) -> SyncSnapshot {
        tracing::info!("Initialization abandoned: coordinator stopped");
        self.shared.teardown().await;
        SyncSnapshot::default()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Publishing
    // ───────────────────────────────────────────────────────────────────────

    /// Validate and publish a record.
    ///
    /// An invalid record is rejected before any network call. Once the
    /// coordinator is ready, a published record is also applied locally, so
    /// it is visible immediately; the network echo is then a duplicate.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the record is malformed
    /// - [`Error::Transport`] if the transport rejects it
    /// - [`Error::Stopped`] after [`Self::stop`]
    pub async fn publish<R: Record>(&self, record: &R) -> Result<()> {
        let shared = &self.shared;
        let kind = R::KIND.as_str();

        if shared.state() == SyncState::Stopped {
            return Err(Error::Stopped);
        }

        if let Err(e) = shared.validator.validate(record) {
            metrics::counter!("sync_publish_total", "kind" => kind, "result" => "invalid")
                .increment(1);
            tracing::debug!("Refusing to publish invalid {}: {}", kind, e);
            return Err(e.into());
        }

        let payload = codec::encode(record)?;
        let topic = shared.config.topics.for_kind(R::KIND);

        if let Err(e) = shared.transport.publish(topic, payload).await {
            metrics::counter!("sync_publish_total", "kind" => kind, "result" => "failed")
                .increment(1);
            tracing::warn!("Publishing {} {:?} failed: {}", kind, record.key(), e);
            return Err(e.into());
        }
        metrics::counter!("sync_publish_total", "kind" => kind, "result" => "ok").increment(1);
        tracing::debug!("Published {} {:?} to {}", kind, record.key(), topic);

        if shared.state().is_ready()
            && let Some(view) = shared.view::<R>()
        {
            view.apply(record.clone());
        }

        Ok(())
    }

    /// Create and publish a new poll authored by `creator`.
    ///
    /// The id is a fresh UUID and `createdAt` is the coordinator's clock.
    pub async fn create_poll<I, S>(
        &self,
        question: &str,
        options: I,
        creator: &str,
    ) -> Result<PollRecord>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let poll = PollRecord {
            id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            options: options.into_iter().map(Into::into).collect(),
            created_by: creator.to_string(),
            created_at: self.shared.validator.now_millis(),
        };
        self.publish(&poll).await?;
        tracing::info!("Created poll {} ({} options)", poll.id, poll.options.len());
        Ok(poll)
    }

    /// Cast and publish a vote, signed by the configured identity provider.
    ///
    /// Does not check whether `voter` already voted; use
    /// [`Self::has_voted`] first.
    pub async fn cast_vote(
        &self,
        poll_id: &str,
        option_index: u32,
        voter: &str,
    ) -> Result<VoteRecord> {
        let mut vote = VoteRecord {
            poll_id: poll_id.to_string(),
            option_index,
            voter_identity: voter.to_string(),
            signature_proof: String::new(),
            cast_at: self.shared.validator.now_millis(),
        };
        vote.signature_proof = self.shared.identity.sign(&vote.signing_payload());
        self.publish(&vote).await?;
        tracing::info!("Cast vote on {} for option {}", poll_id, option_index);
        Ok(vote)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Observers
    // ───────────────────────────────────────────────────────────────────────

    /// Call `observer` whenever a poll becomes canonical.
    ///
    /// Observers run on the transport's delivery path and must not block.
    pub fn on_poll_added<F>(&self, observer: F)
    where
        F: Fn(&PollRecord) + Send + Sync + 'static,
    {
        self.shared.polls.observers.write().push(Arc::new(observer));
    }

    /// Call `observer` whenever a vote becomes canonical.
    pub fn on_vote_added<F>(&self, observer: F)
    where
        F: Fn(&VoteRecord) + Send + Sync + 'static,
    {
        self.shared.votes.observers.write().push(Arc::new(observer));
    }

    /// Call `observer` for each topic whose history could not be loaded.
    pub fn on_degraded<F>(&self, observer: F)
    where
        F: Fn(&DegradedNotice) + Send + Sync + 'static,
    {
        self.shared.degraded_observers.write().push(Arc::new(observer));
    }

    // ───────────────────────────────────────────────────────────────────────
    // Shutdown
    // ───────────────────────────────────────────────────────────────────────

    /// Detach every subscription. Idempotent; safe at any point, including
    /// while `initialize()` is in flight.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.shared.state.lock(), SyncState::Stopped);
        if previous == SyncState::Stopped {
            return;
        }
        metrics::gauge!("sync_ready").set(0.0);
        self.shared.stop_tx.send_replace(true);
        self.shared.teardown().await;
        tracing::info!("Sync stopped (was {})", previous);
    }

    // ───────────────────────────────────────────────────────────────────────
    // Reconciled view
    // ───────────────────────────────────────────────────────────────────────

    /// Canonical polls, newest first.
    pub fn polls(&self) -> Vec<PollRecord> {
        self.shared.polls.snapshot()
    }

    /// Canonical votes.
    pub fn votes(&self) -> Vec<VoteRecord> {
        self.shared.votes.snapshot()
    }

    pub fn poll(&self, poll_id: &str) -> Option<PollRecord> {
        self.shared
            .polls
            .canonical
            .lock()
            .get(&poll_id.to_string())
            .cloned()
    }

    /// Canonical votes on `poll_id`, ordered by voter.
    pub fn votes_for(&self, poll_id: &str) -> Vec<VoteRecord> {
        let mut votes: Vec<VoteRecord> = self
            .shared
            .votes
            .canonical
            .lock()
            .iter()
            .filter(|v| v.poll_id == poll_id)
            .cloned()
            .collect();
        votes.sort_by(VoteRecord::presentation_cmp);
        votes
    }

    /// Results of `poll_id`, if the poll is known.
    pub fn results(&self, poll_id: &str) -> Option<PollResults> {
        let poll = self.poll(poll_id)?;
        let votes = self.shared.votes.canonical.lock();
        Some(PollResults::compute(&poll, votes.iter()))
    }

    /// Whether `voter` has a canonical vote on `poll_id`.
    ///
    /// The engine never refuses a second ballot by itself; only the
    /// application knows who the current user is, so it checks this before
    /// [`Self::cast_vote`].
    pub fn has_voted(&self, poll_id: &str, voter: &str) -> bool {
        let key = VoteKey {
            poll_id: poll_id.to_string(),
            voter_identity: voter.to_string(),
        };
        self.shared.votes.canonical.lock().get(&key).is_some()
    }

    /// Records flushed or delivered on the live path so far, per kind.
    pub fn live_stats(&self) -> (Option<crate::IngestStats>, Option<crate::IngestStats>) {
        (
            self.shared.polls.subscriber().map(|s| s.stats()),
            self.shared.votes.subscriber().map(|s| s.stats()),
        )
    }
}

/// Turn a historical outcome into records, recording degradation.
fn settle<R: Record>(
    topic: &str,
    result: std::result::Result<HistoricalBatch<R>, TransportError>,
    notices: &mut Vec<DegradedNotice>,
) -> Vec<R> {
    let kind = R::KIND;
    let reason = match result {
        Ok(batch) if batch.availability == HistoryAvailability::Complete => return batch.records,
        Ok(_) => {
            tracing::info!(
                kind = %kind,
                topic = %topic,
                "No history available; continuing from live records"
            );
            DegradedReason::Unsupported
        }
        Err(e) => {
            tracing::warn!(
                kind = %kind,
                topic = %topic,
                error = %e,
                "Historical load failed, continuing from live records"
            );
            DegradedReason::Failed(e)
        }
    };

    let label = match &reason {
        DegradedReason::Unsupported => "unsupported",
        DegradedReason::Failed(e) => e.kind.as_str(),
    };
    metrics::counter!("sync_historical_degraded_total", "kind" => kind.as_str(), "reason" => label)
        .increment(1);

    notices.push(DegradedNotice {
        kind,
        topic: topic.to_string(),
        reason,
    });
    Vec::new()
}
