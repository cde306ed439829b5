//! Sync engine configuration.

use std::time::Duration;

use tally_core::{CLOCK_SKEW_TOLERANCE, RecordKind};

use crate::{Error, Result};

/// Default topic carrying poll records.
pub const DEFAULT_POLLS_TOPIC: &str = "/tally/1/polls/json";

/// Default topic carrying vote records.
pub const DEFAULT_VOTES_TOPIC: &str = "/tally/1/votes/json";

/// Default bound on a single topic's historical load.
pub const DEFAULT_HISTORICAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Share of `historical_timeout` reserved after a transport's own fetch bound.
const HISTORY_FETCH_MARGIN_DIVISOR: u32 = 10;

/// Topic names, one per record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub polls: String,
    pub votes: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            polls: DEFAULT_POLLS_TOPIC.to_string(),
            votes: DEFAULT_VOTES_TOPIC.to_string(),
        }
    }
}

impl TopicConfig {
    /// Topic carrying records of `kind`.
    pub fn for_kind(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Poll => &self.polls,
            RecordKind::Vote => &self.votes,
        }
    }
}

/// Configuration for [`crate::SyncCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Topic names.
    pub topics: TopicConfig,

    /// Bound on each topic's historical load. When it elapses the topic is
    /// treated as having no history and the coordinator becomes degraded.
    pub historical_timeout: Duration,

    /// How far in the future a vote's `castAt` may lie.
    pub clock_skew_tolerance: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topics: TopicConfig::default(),
            historical_timeout: DEFAULT_HISTORICAL_TIMEOUT,
            clock_skew_tolerance: CLOCK_SKEW_TOLERANCE,
        }
    }
}

impl SyncConfig {
    /// Bound for a transport's own historical fetch.
    ///
    /// Kept strictly below `historical_timeout` so a store that never signals
    /// the end of its replay hands back what it has before the loader gives
    /// up on the whole topic.
    pub fn history_fetch_timeout(&self) -> Duration {
        self.historical_timeout
            .saturating_sub(self.historical_timeout / HISTORY_FETCH_MARGIN_DIVISOR)
    }

    /// Build a configuration from defaults overridden by environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `TALLY_POLLS_TOPIC` | `topics.polls` |
    /// | `TALLY_VOTES_TOPIC` | `topics.votes` |
    /// | `TALLY_HISTORICAL_TIMEOUT_SECS` | `historical_timeout` |
    /// | `TALLY_CLOCK_SKEW_SECS` | `clock_skew_tolerance` |
    pub fn from_env() -> Result<Self> {
        let config = Self::from_lookup(|name| std::env::var(name).ok())?;
        tracing::info!(
            polls_topic = %config.topics.polls,
            votes_topic = %config.topics.votes,
            historical_timeout_secs = config.historical_timeout.as_secs(),
            clock_skew_secs = config.clock_skew_tolerance.as_secs(),
            "Loaded sync configuration"
        );
        Ok(config)
    }

    /// Build a configuration from an arbitrary variable lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(topic) = lookup("TALLY_POLLS_TOPIC").filter(|t| !t.trim().is_empty()) {
            config.topics.polls = topic;
        }
        if let Some(topic) = lookup("TALLY_VOTES_TOPIC").filter(|t| !t.trim().is_empty()) {
            config.topics.votes = topic;
        }
        if let Some(raw) = lookup("TALLY_HISTORICAL_TIMEOUT_SECS") {
            config.historical_timeout = parse_secs("TALLY_HISTORICAL_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("TALLY_CLOCK_SKEW_SECS") {
            config.clock_skew_tolerance = parse_secs("TALLY_CLOCK_SKEW_SECS", &raw)?;
        }

        Ok(config)
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.topics.polls, DEFAULT_POLLS_TOPIC);
        assert_eq!(config.topics.votes, DEFAULT_VOTES_TOPIC);
        assert_eq!(config.historical_timeout, Duration::from_secs(30));
        assert_eq!(config.clock_skew_tolerance, Duration::from_secs(300));
    }

    #[test]
    fn test_history_fetch_timeout_stays_below_loader_bound() {
        let config = SyncConfig::default();
        assert_eq!(config.history_fetch_timeout(), Duration::from_secs(27));

        for secs in [1, 5, 30, 600] {
            let config = SyncConfig {
                historical_timeout: Duration::from_secs(secs),
                ..SyncConfig::default()
            };
            assert!(config.history_fetch_timeout() < config.historical_timeout);
        }
    }

    #[test]
    fn test_for_kind() {
        let topics = TopicConfig::default();
        assert_eq!(topics.for_kind(RecordKind::Poll), DEFAULT_POLLS_TOPIC);
        assert_eq!(topics.for_kind(RecordKind::Vote), DEFAULT_VOTES_TOPIC);
    }

    #[test]
    fn test_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("TALLY_POLLS_TOPIC", "/x/polls"),
            ("TALLY_HISTORICAL_TIMEOUT_SECS", " 5 "),
            ("TALLY_CLOCK_SKEW_SECS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.topics.polls, "/x/polls");
        assert_eq!(config.topics.votes, DEFAULT_VOTES_TOPIC);
        assert_eq!(config.historical_timeout, Duration::from_secs(5));
        assert_eq!(config.clock_skew_tolerance, Duration::ZERO);
    }

    #[test]
    fn test_blank_topic_keeps_default() {
        let config = SyncConfig::from_lookup(lookup(&[("TALLY_VOTES_TOPIC", "  ")])).unwrap();
        assert_eq!(config.topics.votes, DEFAULT_VOTES_TOPIC);
    }

    #[test]
    fn test_malformed_number_is_config_error() {
        let err = SyncConfig::from_lookup(lookup(&[("TALLY_HISTORICAL_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("TALLY_HISTORICAL_TIMEOUT_SECS"));
    }
}
