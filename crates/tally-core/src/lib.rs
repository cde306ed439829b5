//! Core types, validation, and shared utilities for tally.
//!
//! This crate provides:
//! - Poll and vote records with their identity keys and conflict policies
//! - Structural validation of records
//! - The JSON wire codec
//! - Poll-aware result computation
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod codec;
pub mod metrics;
pub mod record;
pub mod results;
pub mod validate;

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// How far in the future a vote's `castAt` may be relative to the local clock.
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// Minimum number of options a poll must offer.
pub const MIN_POLL_OPTIONS: usize = 2;

pub use error::{Error, Result, ValidationError};
pub use record::{PollRecord, Record, RecordKind, VoteKey, VoteRecord};
pub use results::{OptionTally, PollResults};
pub use validate::{Clock, Validator, system_clock};
