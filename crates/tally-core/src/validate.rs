//! Structural validation of poll and vote records.
//!
//! This is the single place where records are checked before they enter a
//! reconciled view or leave for the network. Checks are pure predicates over
//! one record; anything that needs other records (for example whether a
//! vote's option index exists on its poll) belongs to [`crate::results`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ValidationError;
use crate::record::{PollRecord, Record, VoteRecord};
use crate::{CLOCK_SKEW_TOLERANCE, MIN_POLL_OPTIONS};

/// Source of the current time in Unix milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Record validator.
///
/// Cheap to clone; clones share the same clock.
#[derive(Clone)]
pub struct Validator {
    clock_skew_tolerance: Duration,
    clock: Clock,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("clock_skew_tolerance", &self.clock_skew_tolerance)
            .finish()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(CLOCK_SKEW_TOLERANCE)
    }
}

impl Validator {
    /// Create a validator using the system clock.
    pub fn new(clock_skew_tolerance: Duration) -> Self {
        Self::with_clock(clock_skew_tolerance, system_clock())
    }

    /// Create a validator with an explicit clock.
    pub fn with_clock(clock_skew_tolerance: Duration, clock: Clock) -> Self {
        Self {
            clock_skew_tolerance,
            clock,
        }
    }

    /// Current time according to this validator's clock (Unix millis).
    pub fn now_millis(&self) -> i64 {
        (self.clock)()
    }

    /// How far into the future a vote's `castAt` may lie.
    pub fn clock_skew_tolerance(&self) -> Duration {
        self.clock_skew_tolerance
    }

    /// Validate any record kind.
    pub fn validate<R: Record>(&self, record: &R) -> Result<(), ValidationError> {
        record.validate_with(self)
    }

    /// Boolean form of [`Validator::validate`].
    pub fn is_valid<R: Record>(&self, record: &R) -> bool {
        self.validate(record).is_ok()
    }

    /// Validate a poll.
    ///
    /// A poll is valid iff `id`, `question` and `createdBy` are non-empty,
    /// it has at least [`MIN_POLL_OPTIONS`] options, none of them empty, and
    /// `createdAt` is positive.
    pub fn validate_poll(&self, poll: &PollRecord) -> Result<(), ValidationError> {
        require_non_empty("id", &poll.id)?;
        require_non_empty("question", &poll.question)?;
        require_non_empty("createdBy", &poll.created_by)?;

        if poll.options.len() < MIN_POLL_OPTIONS {
            return Err(ValidationError::TooFewOptions {
                count: poll.options.len(),
                min: MIN_POLL_OPTIONS,
            });
        }
        if let Some(index) = poll.options.iter().position(|o| o.is_empty()) {
            return Err(ValidationError::EmptyOption { index });
        }

        require_positive("createdAt", poll.created_at)
    }

    /// Validate a vote.
    ///
    /// A vote is valid iff `pollId` and `voterIdentity` are non-empty and
    /// `castAt` is positive and no later than now plus the clock skew
    /// tolerance. The option index is unsigned, so it cannot be negative.
    pub fn validate_vote(&self, vote: &VoteRecord) -> Result<(), ValidationError> {
        require_non_empty("pollId", &vote.poll_id)?;
        require_non_empty("voterIdentity", &vote.voter_identity)?;
        require_positive("castAt", vote.cast_at)?;

        let tolerance = i64::try_from(self.clock_skew_tolerance.as_millis()).unwrap_or(i64::MAX);
        let latest = self.now_millis().saturating_add(tolerance);
        if vote.cast_at > latest {
            return Err(ValidationError::FromTheFuture {
                cast_at: vote.cast_at,
                latest,
            });
        }

        Ok(())
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

fn require_positive(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value <= 0 {
        return Err(ValidationError::NonPositiveTimestamp { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn fixed_validator() -> Validator {
        Validator::with_clock(CLOCK_SKEW_TOLERANCE, Arc::new(|| NOW))
    }

    fn poll() -> PollRecord {
        PollRecord {
            id: "p1".to_string(),
            question: "Q".to_string(),
            options: vec!["A".to_string(), "B".to_string()],
            created_by: "u1".to_string(),
            created_at: 10,
        }
    }

    fn vote() -> VoteRecord {
        VoteRecord {
            poll_id: "p1".to_string(),
            option_index: 0,
            voter_identity: "v1".to_string(),
            signature_proof: String::new(),
            cast_at: 100,
        }
    }

    // =========================================================================
    // Polls
    // =========================================================================

    #[test]
    fn test_valid_poll() {
        assert!(fixed_validator().validate_poll(&poll()).is_ok());
        assert!(fixed_validator().is_valid(&poll()));
    }

    #[test]
    fn test_poll_empty_fields() {
        let v = fixed_validator();

        let mut p = poll();
        p.id.clear();
        assert_eq!(
            v.validate_poll(&p),
            Err(ValidationError::EmptyField { field: "id" })
        );

        let mut p = poll();
        p.question.clear();
        assert_eq!(
            v.validate_poll(&p),
            Err(ValidationError::EmptyField { field: "question" })
        );

        let mut p = poll();
        p.created_by.clear();
        assert_eq!(
            v.validate_poll(&p),
            Err(ValidationError::EmptyField { field: "createdBy" })
        );
    }

    #[test]
    fn test_poll_whitespace_is_not_empty() {
        let mut p = poll();
        p.question = "   ".to_string();
        p.options[1] = " ".to_string();
        assert!(fixed_validator().validate_poll(&p).is_ok());

        let mut x = vote();
        x.voter_identity = "\t".to_string();
        assert!(fixed_validator().validate_vote(&x).is_ok());
    }

    #[test]
    fn test_poll_needs_two_options() {
        let mut p = poll();
        p.options.truncate(1);
        assert_eq!(
            fixed_validator().validate_poll(&p),
            Err(ValidationError::TooFewOptions { count: 1, min: 2 })
        );
    }

    #[test]
    fn test_poll_rejects_empty_option() {
        let mut p = poll();
        p.options.push(String::new());
        assert_eq!(
            fixed_validator().validate_poll(&p),
            Err(ValidationError::EmptyOption { index: 2 })
        );
    }

    #[test]
    fn test_poll_rejects_non_positive_created_at() {
        let mut p = poll();
        p.created_at = 0;
        assert!(matches!(
            fixed_validator().validate_poll(&p),
            Err(ValidationError::NonPositiveTimestamp {
                field: "createdAt",
                ..
            })
        ));
    }

    // =========================================================================
    // Votes
    // =========================================================================

    #[test]
    fn test_valid_vote() {
        assert!(fixed_validator().validate_vote(&vote()).is_ok());
    }

    #[test]
    fn test_vote_empty_fields() {
        let v = fixed_validator();

        let mut x = vote();
        x.poll_id.clear();
        assert_eq!(
            v.validate_vote(&x),
            Err(ValidationError::EmptyField { field: "pollId" })
        );

        let mut x = vote();
        x.voter_identity.clear();
        assert_eq!(
            v.validate_vote(&x),
            Err(ValidationError::EmptyField {
                field: "voterIdentity"
            })
        );
    }

    #[test]
    fn test_vote_rejects_non_positive_cast_at() {
        let mut x = vote();
        x.cast_at = -5;
        assert!(!fixed_validator().is_valid(&x));
    }

    #[test]
    fn test_vote_clock_skew_boundary() {
        let v = fixed_validator();
        let tolerance = CLOCK_SKEW_TOLERANCE.as_millis() as i64;

        // Exactly at the limit is accepted
        let mut x = vote();
        x.cast_at = NOW + tolerance;
        assert!(v.validate_vote(&x).is_ok());

        // One millisecond past is rejected
        x.cast_at = NOW + tolerance + 1;
        assert_eq!(
            v.validate_vote(&x),
            Err(ValidationError::FromTheFuture {
                cast_at: NOW + tolerance + 1,
                latest: NOW + tolerance,
            })
        );
    }

    #[test]
    fn test_vote_option_index_is_not_checked_against_poll() {
        // The poll may not be known yet; range checks happen when computing results
        let mut x = vote();
        x.option_index = 99;
        assert!(fixed_validator().validate_vote(&x).is_ok());
    }

    #[test]
    fn test_generic_validate_dispatches_by_kind() {
        let v = fixed_validator();
        assert!(v.validate(&poll()).is_ok());
        assert!(v.validate(&vote()).is_ok());
    }
}
