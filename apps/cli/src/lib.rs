//! The `lockbox` command-line tool.
//!
//! Wraps [`lockbox_storage::Storage`] for shell use: moving values in and out of the store,
//! inspecting lock markers, and running a command under a key lock so cron jobs or
//! deploy scripts on several hosts never work on the same key at once.

pub mod args;
pub mod commands;
pub mod settings;

use crate::args::{Cli, Command};
use crate::settings::Settings;
use anyhow::{Context, Result};
use lockbox_logger::{LevelFilter, Logger};
use lockbox_storage::Storage;
use std::process::ExitCode;
use std::time::Duration;

/// Loads settings, installs logging and dispatches the parsed command.
///
/// # Errors
///
/// Returns configuration, logging and storage failures; the binary prints them and exits
/// with status 1.
pub async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = settings::load(cli.config.as_deref()).context("Configuration is malformed")?;
    let _logger = init_logger(&cli, &settings)?;
    let storage = connect(&cli, &settings).await?;

    match cli.command {
        Command::Store { key, file } => commands::store(&storage, &key, file.as_deref()).await?,
        Command::Load { key } => commands::load(&storage, &key).await?,
        Command::Delete { key } => commands::delete(&storage, &key).await?,
        Command::Exists { key } => return commands::exists(&storage, &key),
        Command::List { prefix, recursive } => commands::list(&storage, &prefix, recursive).await?,
        Command::Stat { key } => commands::stat(&storage, &key).await?,
        Command::Locks => commands::locks(&storage).await?,
        Command::Reap => commands::reap(&storage).await?,
        Command::Run { key, timeout, command } => {
            return commands::run(&storage, &key, timeout.map(Duration::from_secs), &command).await;
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn init_logger(cli: &Cli, settings: &Settings) -> Result<Logger> {
    let level = match cli.verbose {
        0 => settings
            .log
            .level
            .parse::<LevelFilter>()
            .with_context(|| format!("Invalid log level '{}'", settings.log.level))?,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let builder = Logger::builder().name(env!("CARGO_PKG_NAME")).level(level);
    let logger = match cli.log_dir.as_ref().or(settings.log.directory.as_ref()) {
        Some(directory) => builder.directory(directory).json(settings.log.json).init()?,
        None => builder.init()?,
    };
    Ok(logger)
}

async fn connect(cli: &Cli, settings: &Settings) -> Result<Storage> {
    let root = cli
        .root
        .as_ref()
        .or(settings.storage.root.as_ref())
        .context("No storage root configured; pass --root or set storage.root")?;

    let storage = Storage::builder()
        .root(root)
        .compression(settings.storage.compression.into())
        .stale_after(settings.storage.stale_after())
        .poll_interval(settings.storage.poll_interval())
        .connect()
        .await
        .with_context(|| format!("Failed to open storage at {}", root.display()))?;

    Ok(storage)
}
