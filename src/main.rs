//! netrt service entry point
//!
//! Loads the configuration, initialises the two log sinks, wires
//! listener → watcher → orchestrator → sender and runs until a
//! termination signal arrives. Exit codes: 0 clean shutdown, 1 fatal
//! startup error, 2 runtime abort (unreliable spool).

use clap::Parser;
use netrt::config::Config;
use netrt::net::listener::Listener;
use netrt::net::sender::Sender;
use netrt::orchestrator::Orchestrator;
use netrt::spool::Spool;
use netrt::watcher::Watcher;
use netrt::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Grace period for open associations during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Size of the watcher-to-pipeline dispatch queue.
const DISPATCH_QUEUE_DEPTH: usize = 64;

/// NETRT - DICOM contour overlay edge service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable the debug visualisation series
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Startup failures may predate the log sinks.
            eprintln!("netrt: {}", e);
            error!("fatal startup error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> netrt::Result<()> {
    let explicit_config = args.config.is_some();
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from("./config.yaml"));
    let config = Config::load(&config_path, explicit_config)?;

    netrt::logging::init(&config)?;
    info!(
        "netrt {} starting, configuration {}",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let spool = Spool::new(
        &config.directories.working,
        &config.directories.quarantine_subdir,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| Error::Config(format!("cannot install signal handler: {}", e)))?;
    }

    let (dispatch_tx, dispatch_rx) = mpsc::sync_channel(DISPATCH_QUEUE_DEPTH);
    let watcher = Watcher::new(
        spool.clone(),
        Duration::from_secs(config.watcher.debounce_interval_seconds),
        config.watcher.min_file_count_for_processing,
        dispatch_tx,
    );

    let sender = Sender::new(
        config.dicom_destination.clone(),
        config.dicom_listener.ae_title.clone(),
    );

    let orchestrator = Orchestrator::start(
        config.clone(),
        spool.clone(),
        Arc::clone(&watcher),
        sender,
        dispatch_rx,
        args.debug,
        Arc::clone(&shutdown),
    );

    let listener = Listener::start(
        config.dicom_listener.clone(),
        spool,
        Arc::clone(&watcher),
        Arc::clone(&shutdown),
    )?;

    // Studies left over from a previous run re-enter the pipeline.
    watcher.recover()?;

    info!("netrt ready");
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }

    info!("termination signal received, shutting down");
    // Order matters: stop ingest, then the watcher (dropping the dispatch
    // sender), then let in-flight pipelines finish.
    listener.shutdown(SHUTDOWN_GRACE);
    watcher.stop();
    drop(watcher);
    orchestrator.shutdown();
    info!("netrt stopped");
    Ok(())
}
