//! Offline Tracker CLI
//!
//! Queue events locally and deliver them to a collection API when reachable.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use offline_tracker::{
    config::Config,
    flush::{FlushReport, FlushStatus, FlushingMode},
    lifecycle::LifecycleSignal,
    queue::{DurableQueue, LocalQueue},
    record::{CustomerIds, Payload, PropertyValue},
    session::SessionStateMachine,
    transparency::create_shared_log_with_persistence,
    Tracker, VERSION,
};
use std::io::BufRead;
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "offline-tracker")]
#[command(version = VERSION)]
#[command(about = "Offline-first event tracking with deferred delivery", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a custom event
    Track {
        /// Event type, e.g. `purchase`
        event: String,

        /// Event property as key=value (repeatable)
        #[arg(long = "property", short = 'p', value_parser = parse_pair)]
        properties: Vec<(String, String)>,

        /// Flush right after queueing
        #[arg(long)]
        flush: bool,
    },

    /// Queue a customer update
    Identify {
        /// Customer identifier as name=value (repeatable)
        #[arg(long = "id", short = 'i', value_parser = parse_pair)]
        ids: Vec<(String, String)>,

        /// Customer property as key=value (repeatable)
        #[arg(long = "property", short = 'p', value_parser = parse_pair)]
        properties: Vec<(String, String)>,
    },

    /// Upload everything queued now
    Flush,

    /// Show queue, session and delivery status
    Status,

    /// Show or change configuration
    Config {
        #[arg(long)]
        project_token: Option<String>,

        #[arg(long)]
        base_url: Option<String>,

        /// manual, automatic, immediate[:secs] or periodic:secs
        #[arg(long)]
        mode: Option<FlushingMode>,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        session_timeout: Option<f64>,
    },

    /// Run in the foreground, reading lifecycle signals from stdin
    ///
    /// Lines: `fg`, `bg`, `quit`, `flush`, `track <event>`.
    Run {
        /// Override the configured flushing mode
        #[arg(long)]
        mode: Option<FlushingMode>,
    },
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Track {
            event,
            properties,
            flush,
        } => cmd_track(&event, properties, flush),
        Commands::Identify { ids, properties } => cmd_identify(ids, properties),
        Commands::Flush => cmd_flush(),
        Commands::Status => cmd_status(),
        Commands::Config {
            project_token,
            base_url,
            mode,
            max_retries,
            session_timeout,
        } => cmd_config(project_token, base_url, mode, max_retries, session_timeout),
        Commands::Run { mode } => cmd_run(mode),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

fn to_payload(pairs: Vec<(String, String)>) -> Payload {
    pairs
        .into_iter()
        .map(|(k, v)| {
            let value = PropertyValue::parse_literal(&v);
            (k, value)
        })
        .collect()
}

/// Build a persistent tracker for a one-shot command. Triggers are off; the
/// command flushes explicitly when needed.
fn one_shot_tracker(runtime: &Runtime) -> anyhow::Result<(Tracker, bool)> {
    let mut config = Config::load().context("failed to load configuration")?;
    let flush_after = matches!(config.flushing_mode, FlushingMode::Immediate { .. });
    config.flushing_mode = FlushingMode::Manual;

    let tracker = Tracker::builder(config)
        .runtime(runtime.handle().clone())
        .persistent(true)
        .build()?;
    Ok((tracker, flush_after))
}

fn cmd_track(event: &str, properties: Vec<(String, String)>, flush: bool) -> anyhow::Result<()> {
    let runtime = Runtime::new()?;
    let (tracker, flush_after) = one_shot_tracker(&runtime)?;

    if let Some(id) = tracker.track_install()? {
        println!("Queued installation event {id}");
    }
    let id = tracker.track(event, to_payload(properties))?;
    println!("Queued '{event}' as {id}");

    if flush || flush_after {
        let report = runtime.block_on(tracker.request_flush());
        print_report(&report);
    }
    tracker.shutdown();
    Ok(())
}

fn cmd_identify(
    ids: Vec<(String, String)>,
    properties: Vec<(String, String)>,
) -> anyhow::Result<()> {
    if ids.is_empty() {
        bail!("at least one --id name=value is required");
    }

    let runtime = Runtime::new()?;
    let (tracker, flush_after) = one_shot_tracker(&runtime)?;

    let mut customer_ids = CustomerIds::new();
    for (name, value) in ids {
        customer_ids.insert(name, value);
    }
    let id = tracker.identify_customer(customer_ids, to_payload(properties))?;
    println!("Queued customer update {id}");

    if flush_after {
        let report = runtime.block_on(tracker.request_flush());
        print_report(&report);
    }
    tracker.shutdown();
    Ok(())
}

fn cmd_flush() -> anyhow::Result<()> {
    let runtime = Runtime::new()?;
    let (tracker, _) = one_shot_tracker(&runtime)?;

    println!("Pending records: {}", tracker.pending_count()?);
    let report = runtime.block_on(tracker.request_flush());
    print_report(&report);
    println!("Pending records: {}", tracker.pending_count()?);

    tracker.shutdown();
    report.into_result().context("flush did not deliver everything")?;
    Ok(())
}

fn print_report(report: &FlushReport) {
    match report.status {
        FlushStatus::AlreadyInProgress => println!("Flush skipped: another flush is running"),
        FlushStatus::Offline => println!("Flush postponed: collection host unreachable"),
        FlushStatus::QueueUnavailable => println!("Flush aborted: queue could not be read"),
        FlushStatus::Empty => println!("Nothing to flush"),
        FlushStatus::Completed => println!(
            "Flushed {} records: {} uploaded, {} rejected, {} evicted, {} deferred",
            report.dispatched, report.uploaded, report.rejected, report.evicted, report.deferred
        ),
    }
}

fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Offline Tracker Status");
    println!("======================");
    println!();

    println!("Configuration:");
    println!(
        "  Project token: {}",
        config.project_token.as_deref().unwrap_or("(not set)")
    );
    println!("  Base URL: {}", config.base_url);
    println!("  Flushing mode: {}", config.flushing_mode);
    println!("  Max retries: {}", config.max_retries);
    println!("  Session timeout: {}s", config.session_timeout_secs);
    println!();

    let queue_path = config.queue_path();
    if queue_path.exists() {
        let queue = LocalQueue::with_persistence(queue_path)?;
        let events = queue.fetch_pending_events()?;
        let customers = queue.fetch_pending_customer_updates()?;
        let retrying = events
            .iter()
            .chain(customers.iter())
            .filter(|r| r.retry_count > 0)
            .count();

        println!("Queue:");
        println!("  Pending events: {}", events.len());
        println!("  Pending customer updates: {}", customers.len());
        println!("  Records with retries: {retrying}");
        if let Some(cookie) = queue.current_customer_ids()?.get(CustomerIds::COOKIE) {
            println!("  Cookie: {cookie}");
        }
    } else {
        println!("Queue: empty (no queue file yet)");
    }
    println!();

    let session = SessionStateMachine::with_persistence(
        config.session_timeout_secs,
        config.session_path(),
    );
    println!("Session: {:?}", session.phase());
    println!();

    let delivery_path = config.delivery_log_path();
    if delivery_path.exists() {
        let log = create_shared_log_with_persistence(delivery_path);
        println!("{}", log.summary());
    } else {
        println!("No delivery statistics yet.");
    }
    Ok(())
}

fn cmd_config(
    project_token: Option<String>,
    base_url: Option<String>,
    mode: Option<FlushingMode>,
    max_retries: Option<u32>,
    session_timeout: Option<f64>,
) -> anyhow::Result<()> {
    let mut config = Config::load().unwrap_or_default();
    let changing = project_token.is_some()
        || base_url.is_some()
        || mode.is_some()
        || max_retries.is_some()
        || session_timeout.is_some();

    if let Some(token) = project_token {
        config.project_token = Some(token);
    }
    if let Some(url) = base_url {
        config.base_url = url;
    }
    if let Some(mode) = mode {
        config.flushing_mode = mode;
    }
    if let Some(retries) = max_retries {
        config.max_retries = retries;
    }
    if let Some(timeout) = session_timeout {
        config.session_timeout_secs = timeout;
    }

    if changing {
        config.validate()?;
        config.save().context("failed to save configuration")?;
        println!("Configuration saved.");
        println!();
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    let json = serde_json::to_string_pretty(&config)?;
    println!("{json}");
    Ok(())
}

/// Messages on the foreground control channel.
enum Control {
    Signal(LifecycleSignal),
    Track(String),
    Flush,
}

fn cmd_run(mode: Option<FlushingMode>) -> anyhow::Result<()> {
    println!("Offline Tracker v{VERSION}");
    println!();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(mode) = mode {
        config.flushing_mode = mode;
    }
    if config.project_token.is_none() {
        eprintln!("Warning: no project token configured; events will be rejected.");
        eprintln!("Set one with: offline-tracker config --project-token <TOKEN>");
        println!();
    }

    let runtime = Runtime::new()?;
    let tracker = Tracker::builder(config)
        .runtime(runtime.handle().clone())
        .persistent(true)
        .build()?;

    println!("Flushing mode: {}", tracker.flushing_mode());
    println!("Pending records: {}", tracker.pending_count()?);
    println!();
    println!("Type fg, bg, flush, track <event> or quit. Press Ctrl+C to stop.");
    println!();

    let (tx, rx) = unbounded();
    ctrlc_handler(tx.clone())?;
    spawn_stdin_reader(tx);

    if let Err(e) = tracker.track_install() {
        eprintln!("Warning: could not track installation: {e}");
    }
    tracker.handle_lifecycle(LifecycleSignal::ForegroundEntered);

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Control::Signal(signal)) => {
                let emitted = tracker.handle_lifecycle(signal);
                for event in &emitted {
                    println!("Session {:?} queued", event.kind);
                }
                if signal == LifecycleSignal::WillTerminate {
                    break;
                }
            }
            Ok(Control::Track(event)) => match tracker.track(&event, Payload::new()) {
                Ok(id) => println!("Queued '{event}' as {id}"),
                Err(e) => eprintln!("Error: {e}"),
            },
            Ok(Control::Flush) => {
                let report = runtime.block_on(tracker.request_flush());
                print_report(&report);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracker.handle_lifecycle(LifecycleSignal::WillTerminate);
                break;
            }
        }
    }

    println!();
    println!("Stopping...");
    // Stop triggers, then let a running flush finish before the final one.
    tracker.set_flushing_mode(FlushingMode::Manual);
    let report = runtime.block_on(tracker.flush_when_idle());
    print_report(&report);
    tracker.shutdown();

    println!();
    println!("{}", tracker.delivery_log().summary());
    Ok(())
}

fn spawn_stdin_reader(tx: Sender<Control>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let control = if let Some(signal) = LifecycleSignal::from_short(line) {
                Control::Signal(signal)
            } else if line.eq_ignore_ascii_case("flush") {
                Control::Flush
            } else if let Some(event) = line.strip_prefix("track ") {
                Control::Track(event.trim().to_string())
            } else {
                eprintln!("Unknown command: {line}");
                continue;
            };

            if tx.send(control).is_err() {
                return;
            }
        }
        // End of input terminates like Ctrl+C.
        let _ = tx.send(Control::Signal(LifecycleSignal::WillTerminate));
    });
}

fn ctrlc_handler(tx: Sender<Control>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        let _ = tx.send(Control::Signal(LifecycleSignal::WillTerminate));
    })
    .context("error setting Ctrl+C handler")
}
