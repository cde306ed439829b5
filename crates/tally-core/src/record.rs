//! Poll and vote records and their conflict policies.
//!
//! Both record kinds are immutable once published. Any "update" is a newer
//! record competing for the same identity key, and the [`Record`] trait
//! decides which competitor is canonical:
//!
//! | Kind | Identity key | Winner |
//! |------|--------------|--------|
//! | [`PollRecord`] | `id` | largest `createdAt` (update wins) |
//! | [`VoteRecord`] | `(pollId, voterIdentity)` | smallest `castAt` (first vote wins) |
//!
//! Equal timestamps fall through to the remaining fields so that the
//! preference is a strict order over distinct records; identical records are
//! never preferred over each other.

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::validate::Validator;

/// The two kinds of records exchanged on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    /// A poll definition.
    Poll,
    /// A vote cast on a poll.
    Vote,
}

impl RecordKind {
    /// Lowercase name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Vote => "vote",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour shared by every record kind the sync engine reconciles.
pub trait Record:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identity key; at most one canonical record exists per key.
    type Key: Clone + fmt::Debug + Eq + Hash + Ord + Send + Sync + 'static;

    /// Which kind of record this is.
    const KIND: RecordKind;

    /// The identity key of this record.
    fn key(&self) -> Self::Key;

    /// Creator-assigned timestamp (Unix millis) the conflict policy compares.
    fn timestamp(&self) -> i64;

    /// Whether `self` should replace `incumbent` as the canonical record for
    /// their shared key.
    fn is_better(&self, incumbent: &Self) -> bool;

    /// Ordering used when presenting a canonical set.
    fn presentation_cmp(&self, other: &Self) -> Ordering;

    /// Run the structural checks for this kind.
    fn validate_with(&self, validator: &Validator) -> Result<(), ValidationError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Polls
// ═══════════════════════════════════════════════════════════════════════════

/// A poll definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRecord {
    /// Creator-assigned identifier, unique per creator.
    pub id: String,
    /// The question being asked.
    pub question: String,
    /// Answer options, in display order.
    pub options: Vec<String>,
    /// Identity of the creator.
    pub created_by: String,
    /// Creation time (Unix millis), assigned by the creator.
    pub created_at: i64,
}

impl Record for PollRecord {
    type Key = String;

    const KIND: RecordKind = RecordKind::Poll;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn timestamp(&self) -> i64 {
        self.created_at
    }

    /// Update wins: a creator may republish a corrected poll under the same id.
    fn is_better(&self, incumbent: &Self) -> bool {
        match self.created_at.cmp(&incumbent.created_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                (&self.question, &self.options, &self.created_by)
                    > (&incumbent.question, &incumbent.options, &incumbent.created_by)
            }
        }
    }

    /// Newest first, then by id.
    fn presentation_cmp(&self, other: &Self) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    fn validate_with(&self, validator: &Validator) -> Result<(), ValidationError> {
        validator.validate_poll(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Votes
// ═══════════════════════════════════════════════════════════════════════════

/// Identity key of a vote: one ballot per voter per poll.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoteKey {
    /// The poll voted on.
    pub poll_id: String,
    /// The voter.
    pub voter_identity: String,
}

impl fmt::Display for VoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.poll_id, self.voter_identity)
    }
}

/// A vote cast on a poll.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    /// The poll this vote refers to. The poll may not have been observed yet.
    pub poll_id: String,
    /// Zero-based option index, only meaningful against the poll's options.
    pub option_index: u32,
    /// Identity of the voter.
    pub voter_identity: String,
    /// Opaque proof produced by the voter's identity provider. Empty in demo
    /// configurations.
    #[serde(default)]
    pub signature_proof: String,
    /// Cast time (Unix millis), assigned by the voter.
    pub cast_at: i64,
}

impl VoteRecord {
    /// Canonical bytes an identity provider signs to produce `signature_proof`.
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}",
            self.poll_id, self.option_index, self.voter_identity, self.cast_at
        )
        .into_bytes()
    }
}

impl Record for VoteRecord {
    type Key = VoteKey;

    const KIND: RecordKind = RecordKind::Vote;

    fn key(&self) -> VoteKey {
        VoteKey {
            poll_id: self.poll_id.clone(),
            voter_identity: self.voter_identity.clone(),
        }
    }

    fn timestamp(&self) -> i64 {
        self.cast_at
    }

    /// First vote wins: a later timestamp must never overwrite a cast ballot.
    fn is_better(&self, incumbent: &Self) -> bool {
        match self.cast_at.cmp(&incumbent.cast_at) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => {
                (self.option_index, &self.signature_proof)
                    < (incumbent.option_index, &incumbent.signature_proof)
            }
        }
    }

    fn presentation_cmp(&self, other: &Self) -> Ordering {
        (&self.poll_id, &self.voter_identity).cmp(&(&other.poll_id, &other.voter_identity))
    }

    fn validate_with(&self, validator: &Validator) -> Result<(), ValidationError> {
        validator.validate_vote(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(id: &str, created_at: i64) -> PollRecord {
        PollRecord {
            id: id.to_string(),
            question: "Q".to_string(),
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

    // =========================================================================
    // Poll policy
    // =========================================================================

    #[test]
    fn test_poll_newer_wins() {
        let old = poll("p1", 10);
        let new = poll("p1", 20);
        assert!(new.is_better(&old));
        assert!(!old.is_better(&new));
    }

    #[test]
    fn test_poll_tie_is_strict() {
        let a = poll("p1", 10);
        let mut b = poll("p1", 10);
        b.question = "R".to_string();

        // Exactly one of two distinct records wins a tie
        assert!(b.is_better(&a) ^ a.is_better(&b));
        // Identical records never replace each other
        assert!(!a.is_better(&a.clone()));
    }

    #[test]
    fn test_poll_presentation_newest_first() {
        let mut polls = vec![poll("a", 10), poll("b", 30), poll("c", 20)];
        polls.sort_by(|x, y| x.presentation_cmp(y));
        let ids: Vec<_> = polls.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    // =========================================================================
    // Vote policy
    // =========================================================================

    #[test]
    fn test_vote_first_wins() {
        let first = vote("p1", "v1", 1, 50);
        let later = vote("p1", "v1", 0, 100);
        assert!(first.is_better(&later));
        assert!(!later.is_better(&first));
    }

    #[test]
    fn test_vote_tie_is_strict() {
        let a = vote("p1", "v1", 0, 100);
        let b = vote("p1", "v1", 1, 100);
        assert!(a.is_better(&b));
        assert!(!b.is_better(&a));
        assert!(!a.is_better(&a.clone()));
    }

    #[test]
    fn test_vote_key() {
        let v = vote("p1", "v1", 0, 100);
        let key = v.key();
        assert_eq!(key.poll_id, "p1");
        assert_eq!(key.voter_identity, "v1");
        assert_eq!(key.to_string(), "p1/v1");
    }

    #[test]
    fn test_signing_payload_covers_ballot() {
        let a = vote("p1", "v1", 0, 100);
        let b = vote("p1", "v1", 1, 100);
        assert_ne!(a.signing_payload(), b.signing_payload());
        assert_eq!(a.signing_payload(), a.clone().signing_payload());
    }

    // =========================================================================
    // Wire shape
    // =========================================================================

    #[test]
    fn test_poll_serializes_camel_case() {
        let json = serde_json::to_value(poll("p1", 10)).unwrap();
        assert_eq!(json["createdBy"], "u1");
        assert_eq!(json["createdAt"], 10);
    }

    #[test]
    fn test_vote_signature_defaults_to_empty() {
        let json = r#"{"pollId":"p1","optionIndex":0,"voterIdentity":"v1","castAt":100}"#;
        let v: VoteRecord = serde_json::from_str(json).unwrap();
        assert!(v.signature_proof.is_empty());
    }

    #[test]
    fn test_record_kind_display() {
        assert_eq!(RecordKind::Poll.to_string(), "poll");
        assert_eq!(RecordKind::Vote.to_string(), "vote");
        assert_eq!(PollRecord::KIND, RecordKind::Poll);
        assert_eq!(VoteRecord::KIND, RecordKind::Vote);
    }
}
