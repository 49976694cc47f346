// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::error::Error;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logrt::init::args::LogrtArgs;
use logrt::receivers::logrt::{
    Delivery, DeliveryError, LogWatcher, RecordSink, StateFile, StateStore, WatchSlot,
    WatchState,
};

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, clap::Args)]
struct StartArgs {
    #[command(flatten)]
    logrt: LogrtArgs,

    /// Run the cycles of a single tick and exit
    #[arg(long, env = "LOGRT_ONCE", default_value = "false")]
    once: bool,
}

#[derive(Debug, clap::Args)]
struct StateArgs {
    /// Path of the position state file
    #[arg(
        long,
        env = "LOGRT_STATE_PATH",
        default_value = "/var/lib/logrt/state.json"
    )]
    state_path: PathBuf,

    /// Watch to print; without it the saved watch keys are listed
    #[arg(long)]
    key: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Tail the configured log
    Start(Box<StartArgs>),

    /// Show saved positions
    State(StateArgs),

    /// Print the version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logrt", bin_name = "logrt")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    /// Format of diagnostic output on stderr
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGRT_LOG_FORMAT",
        default_value = "text"
    )]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    let result = match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version());
            Ok(())
        }
        Some(Commands::State(args)) => show_state(args),
        Some(Commands::Start(args)) => {
            let _guard = match setup_logging(opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };
            if let Err(e) = run_watch(args) {
                error!(error = %e, "Watch failed.");
                return ExitCode::from(1);
            }
            Ok(())
        }
        // clap enforces the subcommand
        None => return ExitCode::from(2),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::from(1)
        }
    }
}

fn show_state(args: StateArgs) -> Result<(), BoxError> {
    let state_file = StateFile::open(&args.state_path)?;

    let Some(key) = args.key else {
        for key in state_file.keys()? {
            println!("{}", key);
        }
        return Ok(());
    };

    match state_file.watch(key.as_str()).load_watch()? {
        Some(state) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        None => Err(format!("no saved state for {:?}", key).into()),
    }
}

#[tokio::main]
async fn run_watch(args: Box<StartArgs>) -> Result<(), BoxError> {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let config = args.logrt.build_config(&hostname)?;
    let skip_old_data = config.skip_old_data;
    let watcher = Arc::new(LogWatcher::new(config)?);

    let state_file = StateFile::open(&args.logrt.state_path)?;
    let mut slot = state_file.watch(args.logrt.watch_key());
    let mut state = match slot.load_watch()? {
        Some(state) => {
            info!(watch = slot.key(), files = state.files.len(), "Resuming from saved positions");
            state
        }
        None => WatchState::new(skip_old_data),
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            signal_wait().await;
            info!("Shutdown signal received.");
            cancel.cancel();
        }
    });

    let mut refresh = tokio::time::interval(Duration::from_secs(args.logrt.refresh_secs.max(1)));
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        watch = slot.key(),
        state_path = ?args.logrt.state_path,
        "Watching log"
    );

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = refresh.tick() => {},
        }

        state = run_tick(&watcher, state, &mut slot, &cancel).await?;

        if args.once {
            break;
        }
    }

    slot.save_watch(&state)?;
    Ok(())
}

/// Run cycles until no budget-limited work is left, saving after each one.
async fn run_tick(
    watcher: &Arc<LogWatcher>,
    mut state: WatchState,
    slot: &mut WatchSlot,
    cancel: &CancellationToken,
) -> Result<WatchState, BoxError> {
    loop {
        let watcher = watcher.clone();
        let (next, result) = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let result = watcher.process(&mut state, &mut StdoutSink, started);
            (state, result)
        })
        .await?;
        state = next;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Cycle failed, retrying on the next tick");
                return Ok(state);
            }
        };
        debug!(?report, "Cycle finished");
        if !report.stalled.is_empty() {
            warn!(files = ?report.stalled, "Delivery is stalled");
        }

        if let Err(e) = slot.save_watch(&state) {
            error!(error = %e, "Failed to save positions");
        }

        if !report.pending || cancel.is_cancelled() {
            return Ok(state);
        }
    }
}

/// Writes each record to stdout as one JSON line.
struct StdoutSink;

impl RecordSink for StdoutSink {
    fn deliver(&mut self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let line = serde_json::to_string(delivery)
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;

        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)
            .and_then(|_| stdout.flush())
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    // stdout carries the records
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    match log_format {
        LogFormatArg::Json => {
            let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
            let subscriber = Registry::default()
                .with(filter)
                .with(JsonStorageLayer)
                .with(BunyanFormattingLayer::new(app_name, writer));
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormatArg::Text => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(false)
                .with_ansi(io::stderr().is_terminal())
                .compact();
            tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer))?;
        }
    }
    Ok(guard)
}

fn get_version() -> String {
    // BUILD_SHORT_SHA is set by release builds
    let build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");
    format!("{}-{}", env!("CARGO_PKG_VERSION"), build)
}

#[cfg(unix)]
async fn signal_wait() {
    use tokio::signal::unix::{SignalKind, signal};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut int)) => {
            select! {
                _ = term.recv() => {},
                _ = int.recv() => {},
            }
        }
        _ => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn signal_wait() {
    let _ = tokio::signal::ctrl_c().await;
}
