//! Logging bootstrap for the console and file sinks.

use crate::config::{Config, Verbosity};
use crate::error::Result;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global `tracing` subscriber according to the configured
/// verbosities. Idempotent: the first caller wins, later calls are no-ops.
///
/// The file sink writes `weft.log` into `recording_directory` (or the
/// working directory when unset) and is only active when `file_verbosity`
/// is not `quiet`.
///
/// # Errors
/// Returns an error if the log file cannot be created.
pub fn init(config: &Config) -> Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(level_filter(config.console_verbosity));

    let file = if config.file_verbosity == Verbosity::Quiet {
        None
    } else {
        let dir = config.recording_directory.clone().unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let sink = File::create(dir.join("weft.log"))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(sink))
                .with_filter(level_filter(config.file_verbosity)),
        )
    };

    // try_init fails if a subscriber is already installed, e.g. by a test
    // harness. That is fine: logging goes wherever the host routed it.
    let _ = tracing_subscriber::registry().with(console).with(file).try_init();
    Ok(())
}

fn level_filter(verbosity: Verbosity) -> LevelFilter {
    match verbosity {
        Verbosity::Trace => LevelFilter::TRACE,
        Verbosity::Debug => LevelFilter::DEBUG,
        Verbosity::Info => LevelFilter::INFO,
        Verbosity::Warning => LevelFilter::WARN,
        Verbosity::Error => LevelFilter::ERROR,
        Verbosity::Quiet => LevelFilter::OFF,
    }
}
