//! Reduction of observed records to one canonical record per key.
//!
//! The same logical record is usually observed many times (historical
//! replay, relay rebroadcast, live echo). Two entry points collapse those
//! observations:
//!
//! - [`reconcile`] reduces a whole batch at once (used when the historical
//!   load completes)
//! - [`CanonicalSet::apply`] folds in a single record in O(1) (the
//!   steady-state live path)
//!
//! Both keep the incumbent unless the candidate is strictly better, so a
//! batch and the equivalent sequence of `apply` calls agree.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;

use tally_core::{PollRecord, Record, VoteRecord};

/// Collapse `records` to one winner per key.
///
/// Within each key the first-seen record is the incumbent and is replaced
/// only when `is_better(candidate, incumbent)` holds. Output is in the order
/// keys were first seen.
///
/// # Arguments
///
/// * `records` - Observed records, duplicates and competitors included
/// * `key_fn` - Identity key of a record
/// * `is_better` - Whether the first argument should replace the second
pub fn reconcile<R, K, I, F, B>(records: I, key_fn: F, is_better: B) -> Vec<R>
where
    I: IntoIterator<Item = R>,
    K: Eq + Hash,
    F: Fn(&R) -> K,
    B: Fn(&R, &R) -> bool,
{
    let mut winners: Vec<R> = Vec::new();
    let mut slots: HashMap<K, usize> = HashMap::new();

    for record in records {
        match slots.entry(key_fn(&record)) {
            Entry::Occupied(slot) => {
                let incumbent = &mut winners[*slot.get()];
                if is_better(&record, incumbent) {
                    *incumbent = record;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(winners.len());
                winners.push(record);
            }
        }
    }

    winners
}

/// Reconcile using the record kind's own key and conflict policy, sorted in
/// its presentation order.
pub fn reconcile_records<R: Record>(records: impl IntoIterator<Item = R>) -> Vec<R> {
    let mut winners = reconcile(records, R::key, R::is_better);
    winners.sort_by(R::presentation_cmp);
    winners
}

/// Canonical polls, newest first.
pub fn reconcile_polls(polls: impl IntoIterator<Item = PollRecord>) -> Vec<PollRecord> {
    reconcile_records(polls)
}

/// Canonical votes, one per `(pollId, voterIdentity)`.
pub fn reconcile_votes(votes: impl IntoIterator<Item = VoteRecord>) -> Vec<VoteRecord> {
    reconcile_records(votes)
}

/// What [`CanonicalSet::apply`] did with a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome<R> {
    /// The key was new.
    Inserted,
    /// The record replaced `previous`.
    Superseded { previous: R },
    /// The incumbent stayed canonical; the record was discarded.
    Retained,
}

impl<R> ApplyOutcome<R> {
    /// Whether the canonical set changed.
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Retained)
    }

    /// Label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Superseded { .. } => "superseded",
            Self::Retained => "retained",
        }
    }
}

/// The canonical record for every known key of one record kind.
#[derive(Debug, Clone)]
pub struct CanonicalSet<R: Record> {
    records: HashMap<R::Key, R>,
}

impl<R: Record> Default for CanonicalSet<R> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
        }
    }
}

impl<R: Record> CanonicalSet<R> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from an already reconciled (or raw) batch.
    pub fn from_records(records: impl IntoIterator<Item = R>) -> Self {
        let mut set = Self::new();
        for record in records {
            set.apply(record);
        }
        set
    }

    /// Fold one record into the set.
    pub fn apply(&mut self, record: R) -> ApplyOutcome<R> {
        match self.records.entry(record.key()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                ApplyOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                if record.is_better(slot.get()) {
                    let previous = slot.insert(record);
                    ApplyOutcome::Superseded { previous }
                } else {
                    ApplyOutcome::Retained
                }
            }
        }
    }

    /// Canonical record for `key`.
    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate canonical records in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.values()
    }

    /// Canonical records in presentation order.
    pub fn snapshot(&self) -> Vec<R> {
        let mut records: Vec<R> = self.records.values().cloned().collect();
        records.sort_by(R::presentation_cmp);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(id: &str, question: &str, created_at: i64) -> PollRecord {
        PollRecord {
            id: id.to_string(),
            question: question.to_string(),
            options: vec!["A".to_string(), "B".to_string()],
            created_by: "u1".to_string(),
            created_at,
        }
    }

    fn vote(poll_id: &str, voter: &str, option_index: u32, cast_at: i64) -> VoteRecord {
        VoteRecord {
            poll_id: poll_id.to_string(),
            option_index,
            voter_identity: voter.to_string(),
            signature_proof: String::new(),
            cast_at,
        }
    }

    /// Every permutation of `items` (small inputs only).
    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    // =========================================================================
    // Batch reconcile
    // =========================================================================

    #[test]
    fn test_uniqueness() {
        let polls = vec![
            poll("p1", "Q", 10),
            poll("p2", "Q", 10),
            poll("p1", "Q", 10),
            poll("p1", "Q2", 30),
            poll("p2", "Q", 5),
        ];
        let canonical = reconcile_polls(polls);

        assert_eq!(canonical.len(), 2);
        assert_ne!(canonical[0].id, canonical[1].id);
    }

    #[test]
    fn test_update_wins() {
        let older = poll("p1", "Q", 10);
        let newer = poll("p1", "Q (fixed)", 20);

        for order in [vec![older.clone(), newer.clone()], vec![newer.clone(), older.clone()]] {
            let canonical = reconcile_polls(order);
            assert_eq!(canonical, vec![newer.clone()]);
        }
    }

    #[test]
    fn test_first_vote_wins() {
        let first = vote("p1", "v1", 0, 100);
        let second = vote("p1", "v1", 1, 200);

        for order in [vec![first.clone(), second.clone()], vec![second.clone(), first.clone()]] {
            let canonical = reconcile_votes(order);
            assert_eq!(canonical.len(), 1);
            assert_eq!(canonical[0].cast_at, 100);
        }
    }

    #[test]
    fn test_idempotence() {
        let votes = vec![
            vote("p1", "v1", 0, 100),
            vote("p1", "v1", 1, 50),
            vote("p1", "v2", 1, 70),
            vote("p2", "v1", 0, 10),
        ];
        let once = reconcile_votes(votes);
        let twice = reconcile_votes(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_order_independent_with_ties() {
        // Same key, same timestamp, different content
        let polls = vec![
            poll("p1", "alpha", 10),
            poll("p1", "beta", 10),
            poll("p1", "gamma", 5),
            poll("p2", "Q", 7),
        ];
        let expected = reconcile_polls(polls.clone());
        for permutation in permutations(&polls) {
            assert_eq!(reconcile_polls(permutation), expected);
        }
        assert_eq!(expected[0].question, "beta");

        let votes = vec![
            vote("p1", "v1", 1, 100),
            vote("p1", "v1", 0, 100),
            vote("p1", "v1", 0, 300),
            vote("p1", "v2", 1, 1),
        ];
        let expected = reconcile_votes(votes.clone());
        for permutation in permutations(&votes) {
            assert_eq!(reconcile_votes(permutation), expected);
        }
    }

    #[test]
    fn test_polls_sorted_newest_first() {
        let canonical = reconcile_polls(vec![
            poll("a", "Q", 10),
            poll("b", "Q", 30),
            poll("c", "Q", 20),
        ]);
        let ids: Vec<&str> = canonical.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_generic_reconcile_keeps_first_seen_on_tie() {
        let winners = reconcile(
            vec![(1, "first"), (1, "second"), (2, "other")],
            |r: &(i32, &str)| r.0,
            |_, _| false,
        );
        assert_eq!(winners, vec![(1, "first"), (2, "other")]);
    }

    // =========================================================================
    // Incremental apply
    // =========================================================================

    #[test]
    fn test_apply_outcomes() {
        let mut set = CanonicalSet::new();

        assert_eq!(set.apply(vote("p1", "v1", 0, 100)), ApplyOutcome::Inserted);
        assert_eq!(set.apply(vote("p1", "v1", 1, 200)), ApplyOutcome::Retained);
        assert_eq!(
            set.apply(vote("p1", "v1", 1, 50)),
            ApplyOutcome::Superseded {
                previous: vote("p1", "v1", 0, 100)
            }
        );
        // Exact duplicate of the incumbent
        assert_eq!(set.apply(vote("p1", "v1", 1, 50)), ApplyOutcome::Retained);

        assert_eq!(set.len(), 1);
        assert_eq!(set.snapshot()[0].cast_at, 50);
    }

    #[test]
    fn test_apply_agrees_with_batch() {
        let polls = vec![
            poll("p1", "Q", 10),
            poll("p1", "Q2", 20),
            poll("p2", "Q", 15),
            poll("p1", "Q0", 5),
        ];
        let set = CanonicalSet::from_records(polls.clone());
        assert_eq!(set.snapshot(), reconcile_polls(polls));
        assert!(set.get(&"p1".to_string()).is_some());
        assert!(!set.is_empty());
    }

    #[test]
    fn test_outcome_labels() {
        assert!(ApplyOutcome::<PollRecord>::Inserted.changed());
        assert!(!ApplyOutcome::<PollRecord>::Retained.changed());
        assert_eq!(ApplyOutcome::<PollRecord>::Retained.as_str(), "retained");
    }
}
