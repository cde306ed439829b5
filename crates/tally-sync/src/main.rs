//! Tally command-line client.
//!
//! Syncs polls and votes over Nostr relays.
//!
//! # Usage
//!
//! ```bash
//! # Follow every poll and its results until Ctrl+C
//! tally --relays wss://relay.damus.io,wss://nos.lol watch
//!
//! # Create a poll
//! tally --relays wss://nos.lol create-poll --question "Lunch?" --options Pizza,Sushi --creator alice
//!
//! # Vote on it
//! tally --relays wss://nos.lol vote --poll-id <ID> --option 1 --voter bob
//! ```
//!
//! Topic names and timeouts default to `SyncConfig::from_env()` and may be
//! overridden with flags.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tally_core::{PollRecord, PollResults};
use tally_core::metrics::{init_metrics, start_metrics_server};
use tally_sync::transport::DEFAULT_EVENT_KIND;
use tally_sync::{
    NostrTransport, NostrTransportConfig, SyncConfig, SyncCoordinator, SyncSnapshot, Transport,
};
use tracing_subscriber::EnvFilter;

/// Tally poll client.
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Decentralized polls and votes over Nostr relays")]
#[command(version)]
struct Args {
    /// Relay URLs (comma-separated)
    #[arg(long, value_delimiter = ',', env = "TALLY_RELAYS", required = true)]
    relays: Vec<String>,

    /// Nostr event kind carrying tally records
    #[arg(long, default_value_t = DEFAULT_EVENT_KIND)]
    kind: u16,

    /// Topic carrying polls (overrides TALLY_POLLS_TOPIC)
    #[arg(long)]
    polls_topic: Option<String>,

    /// Topic carrying votes (overrides TALLY_VOTES_TOPIC)
    #[arg(long)]
    votes_topic: Option<String>,

    /// Historical load bound in seconds (overrides TALLY_HISTORICAL_TIMEOUT_SECS)
    #[arg(long)]
    historical_timeout: Option<u64>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every poll with its results, then follow changes until Ctrl+C
    Watch {
        /// Print the initial snapshot and poll results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Publish a new poll
    CreatePoll {
        #[arg(long)]
        question: String,

        /// Options (comma-separated, at least two)
        #[arg(long, value_delimiter = ',', required = true)]
        options: Vec<String>,

        /// Creator identity
        #[arg(long)]
        creator: String,
    },

    /// Cast a vote
    Vote {
        #[arg(long)]
        poll_id: String,

        /// Zero-based option index
        #[arg(long)]
        option: u32,

        /// Voter identity
        #[arg(long)]
        voter: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("tally_sync=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = SyncConfig::from_env().context("Invalid TALLY_* environment")?;
    if let Some(topic) = args.polls_topic.clone() {
        config.topics.polls = topic;
    }
    if let Some(topic) = args.votes_topic.clone() {
        config.topics.votes = topic;
    }
    if let Some(secs) = args.historical_timeout {
        config.historical_timeout = Duration::from_secs(secs);
    }

    if args.metrics_port > 0 {
        let handle = init_metrics().context("Metrics recorder already installed")?;
        start_metrics_server(args.metrics_port, handle)
            .await
            .with_context(|| format!("Failed to bind metrics port {}", args.metrics_port))?;
    }

    let transport = Arc::new(
        NostrTransport::connect(NostrTransportConfig {
            relays: args.relays.clone(),
            kind: args.kind,
            fetch_timeout: config.history_fetch_timeout(),
            ..Default::default()
        })
        .await
        .context("Failed to set up relay pool")?,
    );

    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let sync = SyncCoordinator::builder(dyn_transport)
        .config(config)
        .build();

    let outcome = run(&sync, args.command).await;

    sync.stop().await;
    transport.shutdown().await;
    outcome
}

async fn run(sync: &SyncCoordinator, command: Command) -> Result<()> {
    match command {
        Command::Watch { json } => watch(sync, json).await,

        Command::CreatePoll {
            question,
            options,
            creator,
        } => {
            let poll = sync
                .create_poll(&question, options, &creator)
                .await
                .context("Failed to create poll")?;
            println!("{}", poll.id);
            Ok(())
        }

        Command::Vote {
            poll_id,
            option,
            voter,
        } => {
            sync.initialize().await.context("Failed to sync")?;

            if sync.has_voted(&poll_id, &voter) {
                bail!("{} has already voted on {}", voter, poll_id);
            }
            match sync.poll(&poll_id) {
                Some(poll) if option as usize >= poll.options.len() => {
                    bail!(
                        "Poll {} has {} options; option {} does not exist",
                        poll_id,
                        poll.options.len(),
                        option
                    );
                }
                Some(_) => {}
                None => tracing::warn!("Poll {} not seen yet; voting anyway", poll_id),
            }

            sync.cast_vote(&poll_id, option, &voter)
                .await
                .context("Failed to cast vote")?;
            println!("Voted for option {} on {}", option, poll_id);
            Ok(())
        }
    }
}

/// Initial `watch --json` output.
#[derive(Serialize)]
struct WatchReport<'a> {
    #[serde(flatten)]
    snapshot: &'a SyncSnapshot,
    results: Vec<PollResults>,
}

async fn watch(sync: &SyncCoordinator, json: bool) -> Result<()> {
    sync.on_degraded(|notice| {
        tracing::warn!("{} topic {}: {}", notice.kind, notice.topic, notice.reason);
    });

    // Registered before initialize() so records flushed from the live buffer
    // during startup are printed too
    sync.on_poll_added(|poll| {
        println!("poll  {}", describe(poll));
    });
    sync.on_vote_added(|vote| {
        println!(
            "vote  {} chose option {} on {}",
            vote.voter_identity, vote.option_index, vote.poll_id
        );
    });

    let snapshot = sync.initialize().await.context("Failed to sync")?;
    if json {
        let report = WatchReport {
            snapshot: &snapshot,
            results: snapshot
                .polls
                .iter()
                .filter_map(|poll| sync.results(&poll.id))
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_snapshot(sync, &snapshot);
    }

    tracing::info!("Watching for changes (Ctrl+C to stop)");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown signal received, stopping gracefully...");
    Ok(())
}

fn print_snapshot(sync: &SyncCoordinator, snapshot: &SyncSnapshot) {
    println!(
        "{} polls, {} votes ({})",
        snapshot.polls.len(),
        snapshot.votes.len(),
        sync.state()
    );
    for poll in &snapshot.polls {
        println!();
        println!("{}", describe(poll));
        let Some(results) = sync.results(&poll.id) else {
            continue;
        };
        for option in &results.options {
            println!(
                "  [{}] {:<24} {:>4}  {:>5.1}%",
                option.index, option.label, option.votes, option.percentage
            );
        }
        if results.out_of_range > 0 {
            println!("  ({} votes for unknown options)", results.out_of_range);
        }
    }
}

fn describe(poll: &PollRecord) -> String {
    let created = chrono::DateTime::from_timestamp_millis(poll.created_at)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "invalid".to_string());
    format!(
        "{}  \"{}\" by {} at {}",
        poll.id, poll.question, poll.created_by, created
    )
}
