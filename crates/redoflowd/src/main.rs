//! redoflow daemon.
//!
//! Usage:
//!   # Run against a configuration file
//!   redoflowd --file /etc/redoflow/db1.json
//!
//!   # Name the process instance (shows up in logs)
//!   redoflowd --file db1.json --process db1
//!
//! Signals: SIGINT/SIGTERM/SIGPIPE request a soft shutdown (finish the
//! current group, flush, checkpoint); SIGUSR1 dumps state and continues.
//!
//! Environment: `REDOFLOW_LOG_TIMEZONE` (`±HH:MM`) sets the timezone of
//! redo timestamps; `REDOFLOW_LOCALES=MOCK` pins the clock for
//! deterministic runs.

use anyhow::Context as _;
use clap::Parser;
use redoflow::config::Config;
use redoflow::context::{Ctx, MockClock};
use redoflow::Replicator;
use signal_hook::consts::signal::{SIGINT, SIGPIPE, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "redoflowd", version, about = "redo-log change data capture service")]
struct Cli {
    /// Configuration file
    #[arg(short = 'f', long = "file", default_value = "redoflow.json")]
    file: PathBuf,

    /// Process instance name used in logs
    #[arg(short = 'p', long = "process")]
    process: Option<String>,

    /// Allow running as root
    #[arg(short = 'r', long = "root")]
    allow_root: bool,
}

fn parse_timezone(value: &str) -> anyhow::Result<i32> {
    let (sign, rest) = match value.as_bytes().first() {
        Some(b'+') => (1i32, &value[1..]),
        Some(b'-') => (-1i32, &value[1..]),
        _ => anyhow::bail!("timezone must start with + or -"),
    };
    let (hours, minutes) = rest
        .split_once(':')
        .context("timezone must look like +HH:MM")?;
    let hours: i32 = hours.parse().context("bad timezone hours")?;
    let minutes: i32 = minutes.parse().context("bad timezone minutes")?;
    if hours > 14 || minutes > 59 {
        anyhow::bail!("timezone out of range");
    }
    Ok(sign * (hours * 60 + minutes))
}

fn print_banner(cli: &Cli, config: &Config) {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database,
        process = cli.process.as_deref().unwrap_or(&config.database),
        config = %cli.file.display(),
        "redoflowd starting"
    );
}

fn main() {
    std::process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    });
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Refuse to run as root unless asked to.
    if !cli.allow_root && unsafe { libc::geteuid() } == 0 {
        anyhow::bail!("refusing to run as root; pass --root to override");
    }

    let config = Config::load(&cli.file).context("loading configuration")?;
    print_banner(&cli, &config);

    let mut ctx = Ctx::new(config.database.clone())
        .with_flags(&config.flags)
        .with_disable_checks(&config.disable_checks);

    if let Ok(tz) = std::env::var("REDOFLOW_LOG_TIMEZONE") {
        let minutes = parse_timezone(&tz).context("REDOFLOW_LOG_TIMEZONE")?;
        ctx = ctx.with_log_timezone_min(minutes);
    }
    if std::env::var("REDOFLOW_LOCALES").as_deref() == Ok("MOCK") {
        tracing::warn!("running with a mock clock; timestamps are not real");
        ctx = ctx.with_clock(Arc::new(MockClock::new(1_700_000_000)));
    }
    let ctx = Arc::new(ctx);

    // Signal handling on its own thread.
    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGPIPE, SIGUSR1]).context("installing signal handlers")?;
    {
        let ctx = ctx.clone();
        std::thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        SIGUSR1 => {
                            tracing::info!("state dump requested (SIGUSR1)");
                        }
                        other => {
                            tracing::info!(signal = other, "shutdown signal received");
                            ctx.stop_soft();
                            break;
                        }
                    }
                }
            })
            .context("spawning signal thread")?;
    }

    let mut replicator = Replicator::new(ctx, config).context("initializing pipeline")?;
    replicator.run().context("pipeline failed")?;
    tracing::info!("clean shutdown");
    Ok(())
}
