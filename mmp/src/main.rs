//! mmp - operator CLI for the event ingestion client
//!
//! This tool provides commands for:
//! - Queueing events and profile updates from scripts
//! - Flushing queued records to the ingestion API
//! - Inspecting queue depth and identity per token
//! - Toggling opt-out for a token
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/mmp/mmp.db (~/.local/share/mmp/mmp.db)
//! - Config: $XDG_CONFIG_HOME/mmp/config.toml (~/.config/mmp/config.toml)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mmp_core::{Config, Properties, Registry, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mmp")]
#[command(about = "Queue and deliver analytics events")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/mmp/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write a log file to the XDG state directory
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue one event
    Track {
        token: String,
        event: String,

        /// Event property as key=value; values are parsed as JSON when possible
        #[arg(short = 'p', long = "property")]
        properties: Vec<String>,

        /// Identify as this user before tracking
        #[arg(long)]
        distinct_id: Option<String>,
    },

    /// Send everything queued for a token
    Flush {
        token: String,

        /// Seconds to wait for delivery before giving up
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Show configuration and queue depth
    Status {
        /// Also show identity and opt-out state for this token
        token: Option<String>,
    },

    /// Opt a token out of tracking and drop its queued records
    OptOut { token: String },

    /// Opt a token back in
    OptIn {
        token: String,

        #[arg(long)]
        distinct_id: Option<String>,
    },

    /// Set people profile properties for a user
    PeopleSet {
        token: String,
        distinct_id: String,

        #[arg(short = 'p', long = "property")]
        properties: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    // Held until exit so buffered log lines reach the file
    let _log_guard = if args.verbose {
        Some(mmp_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status { token } => cmd_status(config, token.as_deref()),
        Command::Track {
            token,
            event,
            properties,
            distinct_id,
        } => cmd_track(config, &token, &event, &properties, distinct_id.as_deref()),
        Command::Flush {
            token,
            timeout_secs,
        } => cmd_flush(config, &token, Duration::from_secs(timeout_secs)),
        Command::OptOut { token } => cmd_opt_out(config, &token),
        Command::OptIn { token, distinct_id } => cmd_opt_in(config, &token, distinct_id.as_deref()),
        Command::PeopleSet {
            token,
            distinct_id,
            properties,
        } => cmd_people_set(config, &token, &distinct_id, &properties),
    }
}

fn open_registry(config: Config) -> Result<Registry> {
    let path = config.database_path();
    Registry::open(config)
        .with_context(|| format!("failed to open database at {}", path.display()))
}

/// Parse `key=value` pairs. A value that is not valid JSON is kept as a string.
fn parse_properties(pairs: &[String]) -> Result<Properties> {
    let mut properties = Properties::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("property {:?} is not in key=value form", pair);
        };
        if key.is_empty() {
            bail!("property {:?} has an empty key", pair);
        }
        let value = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(json) => Value::from(json),
            Err(_) => Value::from(raw),
        };
        properties.insert(key, value);
    }
    Ok(properties)
}

fn cmd_track(
    config: Config,
    token: &str,
    event: &str,
    pairs: &[String],
    distinct_id: Option<&str>,
) -> Result<()> {
    let properties = parse_properties(pairs)?;
    let registry = open_registry(config)?;
    let tracker = registry.instance(token);

    if tracker.has_opted_out_tracking() {
        println!("Token {} is opted out; nothing queued", token);
        return Ok(());
    }

    if let Some(id) = distinct_id {
        tracker.identify(id);
    }
    tracker.track(event, properties);

    println!(
        "Queued {:?} for {} ({} records pending)",
        event,
        token,
        registry.dispatcher().queue().size(token)
    );
    registry.shutdown();
    Ok(())
}

fn cmd_flush(config: Config, token: &str, timeout: Duration) -> Result<()> {
    let registry = open_registry(config)?;
    let queue = registry.dispatcher().queue().clone();
    let pending = queue.size(token);

    if pending == 0 {
        println!("Nothing queued for {}", token);
        return Ok(());
    }

    println!("Flushing {} records for {}...", pending, token);
    let tracker = registry.instance(token);

    match tracker.flush_blocking(timeout) {
        Some(report) => {
            println!("  Sent:    {}", report.sent);
            println!("  Dropped: {}", report.dropped);
            if report.failed {
                println!(
                    "Delivery failed; {} records stay queued for the next flush",
                    queue.size(token)
                );
            }
        }
        None => {
            println!(
                "Flush did not finish within {}s; {} records stay queued",
                timeout.as_secs(),
                queue.size(token)
            );
        }
    }

    registry.shutdown();
    Ok(())
}

fn cmd_status(config: Config, token: Option<&str>) -> Result<()> {
    println!("Event Ingestion Client");
    println!("======================");
    println!();
    println!("Endpoint:        {}", config.api.endpoint_base());
    println!("Database:        {}", config.database_path().display());
    println!("Batch size:      {}", config.api.batch_size);
    println!("Queue ceiling:   {}", config.api.max_queue_size);
    println!("Flush interval:  {}s", config.api.flush_interval_secs);
    println!(
        "Decide:          {}",
        if config.api.disable_decide {
            "disabled"
        } else {
            "enabled"
        }
    );

    let registry = open_registry(config)?;
    let queue = registry.dispatcher().queue();

    println!();
    let tokens = queue.tokens();
    if tokens.is_empty() {
        println!("Queue is empty.");
    } else {
        println!("{:<32} {:>8}", "TOKEN", "PENDING");
        for t in &tokens {
            println!("{:<32} {:>8}", t, queue.size(t));
        }
    }

    if let Some(token) = token {
        let store = registry.store();
        println!();
        println!("Token {}", token);
        match store.identity(token) {
            Some(identity) => {
                println!("  Distinct ID:   {}", identity.events_distinct_id);
                println!(
                    "  People ID:     {}",
                    identity.people_distinct_id.as_deref().unwrap_or("<not set>")
                );
            }
            None => println!("  No stored identity"),
        }
        println!("  Opted out:     {}", store.opt_out(token));
        println!("  Pending:       {}", queue.size(token));
    }

    registry.shutdown();
    Ok(())
}

fn cmd_opt_out(config: Config, token: &str) -> Result<()> {
    let registry = open_registry(config)?;
    let dropped = registry.dispatcher().queue().size(token);
    registry.instance(token).opt_out_tracking();
    println!("Opted out {}; dropped {} queued records", token, dropped);
    registry.shutdown();
    Ok(())
}

fn cmd_opt_in(config: Config, token: &str, distinct_id: Option<&str>) -> Result<()> {
    let registry = open_registry(config)?;
    registry
        .instance(token)
        .opt_in_tracking(distinct_id, Properties::new());
    println!("Opted in {}", token);
    registry.shutdown();
    Ok(())
}

fn cmd_people_set(config: Config, token: &str, distinct_id: &str, pairs: &[String]) -> Result<()> {
    let properties = parse_properties(pairs)?;
    if properties.is_empty() {
        bail!("people-set needs at least one --property");
    }
    let registry = open_registry(config)?;
    let tracker = registry.instance(token);
    let people = tracker.people();
    people.identify(distinct_id);
    people.set(properties);
    println!(
        "Queued profile update for {} ({} records pending)",
        distinct_id,
        registry.dispatcher().queue().size(token)
    );
    registry.shutdown();
    Ok(())
}
