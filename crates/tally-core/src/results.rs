//! Poll results over a reconciled vote set.
//!
//! Votes are validated without knowledge of their poll, so a vote may name
//! an option index the poll does not have. This module performs that
//! poll-aware check: out-of-range votes are counted separately and never
//! attributed to an option.

use serde::Serialize;

use crate::record::{PollRecord, VoteRecord};

/// Tally for a single option.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionTally {
    /// Zero-based option index.
    pub index: usize,
    /// Option text.
    pub label: String,
    /// Number of votes for this option.
    pub votes: u64,
    /// Share of counted votes, 0.0 - 100.0.
    pub percentage: f64,
}

/// Results for one poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResults {
    /// The poll these results belong to.
    pub poll_id: String,
    /// One entry per poll option, in option order.
    pub options: Vec<OptionTally>,
    /// Votes attributed to an option.
    pub total_votes: u64,
    /// Votes for this poll whose option index does not exist on the poll.
    pub out_of_range: u64,
}

impl PollResults {
    /// Compute results for `poll` from a canonical vote set.
    ///
    /// Votes for other polls are ignored. The vote set is expected to be
    /// reconciled already (one canonical vote per voter); this function does
    /// not deduplicate.
    pub fn compute<'a, I>(poll: &PollRecord, votes: I) -> Self
    where
        I: IntoIterator<Item = &'a VoteRecord>,
    {
        let mut counts = vec![0u64; poll.options.len()];
        let mut out_of_range = 0u64;

        for vote in votes.into_iter().filter(|v| v.poll_id == poll.id) {
            match counts.get_mut(vote.option_index as usize) {
                Some(count) => *count += 1,
                None => out_of_range += 1,
            }
        }

        let total_votes: u64 = counts.iter().sum();
        let options = poll
            .options
            .iter()
            .zip(counts)
            .enumerate()
            .map(|(index, (label, votes))| OptionTally {
                index,
                label: label.clone(),
                votes,
                percentage: percentage(votes, total_votes),
            })
            .collect();

        if out_of_range > 0 {
            tracing::debug!(
                "Poll {} has {} votes with out-of-range option index",
                poll.id,
                out_of_range
            );
        }

        Self {
            poll_id: poll.id.clone(),
            options,
            total_votes,
            out_of_range,
        }
    }

    /// The option with the most votes. `None` when nobody voted or the top
    /// count is shared.
    pub fn leader(&self) -> Option<&OptionTally> {
        let max = self.options.iter().map(|o| o.votes).max()?;
        if max == 0 {
            return None;
        }
        let mut leaders = self.options.iter().filter(|o| o.votes == max);
        let first = leaders.next()?;
        match leaders.next() {
            Some(_) => None,
            None => Some(first),
        }
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}
