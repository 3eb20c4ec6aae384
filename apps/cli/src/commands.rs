//! Subcommand handlers. Values and listings go to stdout; diagnostics go through `tracing`.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use lockbox_storage::{LockInfo, Storage, StorageError};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

/// Exit status after an interrupt, following the shell's 128 + SIGINT convention.
const INTERRUPTED: u8 = 130;

pub async fn store(storage: &Storage, key: &str, file: Option<&Path>) -> Result<()> {
    let value = match file {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut value = Vec::new();
            tokio::io::stdin().read_to_end(&mut value).await.context("Failed to read stdin")?;
            value
        },
    };

    storage.store(key, &value).await?;
    info!(key, bytes = value.len(), "Value stored");
    Ok(())
}

pub async fn load(storage: &Storage, key: &str) -> Result<()> {
    let value = storage.load(key).await?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&value).await?;
    stdout.flush().await?;
    Ok(())
}

pub async fn delete(storage: &Storage, key: &str) -> Result<()> {
    storage.delete(key).await?;
    Ok(())
}

pub fn exists(storage: &Storage, key: &str) -> Result<ExitCode> {
    Ok(if storage.exists(key)? { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

pub async fn list(storage: &Storage, prefix: &str, recursive: bool) -> Result<()> {
    let keys = storage.list(prefix, recursive).await?;
    print_lines(keys.iter().map(String::as_str)).await
}

pub async fn stat(storage: &Storage, key: &str) -> Result<()> {
    let info = storage.stat(key).await?;
    let modified: DateTime<Utc> = info.modified.into();

    let lines = [
        format!("key:      {}", info.key),
        format!("kind:     {}", if info.is_terminal { "value" } else { "directory" }),
        format!("size:     {}", info.size),
        format!("modified: {}", modified.to_rfc3339()),
    ];
    print_lines(lines.iter().map(String::as_str)).await
}

pub async fn locks(storage: &Storage) -> Result<()> {
    let locks = storage.locks().await?;
    if locks.is_empty() {
        return print_lines(["No locks held"]).await;
    }

    let mut lines = vec![format!("{:<40} {:>10} {:>8}  STATE", "KEY", "AGE", "PID")];
    lines.extend(locks.iter().map(lock_row));
    print_lines(lines.iter().map(String::as_str)).await
}

fn lock_row(lock: &LockInfo) -> String {
    let age = lock.age().map_or_else(|| "?".to_owned(), |age| format!("{}s", age.as_secs()));
    let pid = lock.body.as_ref().map_or_else(|| "?".to_owned(), |body| body.pid.to_string());
    let state = match (lock.stale, lock.held_here) {
        (true, _) => "STALE",
        (false, true) => "held here",
        (false, false) => "held",
    };
    format!("{:<40} {age:>10} {pid:>8}  {state}", lock.key)
}

pub async fn reap(storage: &Storage) -> Result<()> {
    let reaped = storage.reap_stale_locks().await?;
    print_lines([format!("Removed {reaped} stale lock(s)").as_str()]).await
}

/// Runs `command` while holding the lock for `key` and mirrors its exit status.
///
/// Ctrl-C while waiting abandons the attempt; Ctrl-C while the child runs stops the child
/// and releases every lock this process holds.
pub async fn run(
    storage: &Storage,
    key: &str,
    timeout: Option<Duration>,
    command: &[String],
) -> Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };

    let acquire = async {
        match timeout {
            Some(timeout) => storage.lock_timeout(key, timeout).await,
            None => storage.lock(key).await,
        }
    };

    tokio::select! {
        locked = acquire => match locked {
            Err(StorageError::LockTimeout { .. }) => {
                bail!("Lock '{key}' is still held elsewhere; gave up waiting");
            },
            other => other?,
        },
        _ = tokio::signal::ctrl_c() => {
            warn!(key, "Interrupted while waiting for lock");
            return Ok(ExitCode::from(INTERRUPTED));
        },
    }
    info!(key, program = %program, "Lock obtained, starting command");

    let mut child = match Command::new(program).args(args).spawn() {
        Ok(child) => child,
        Err(err) => {
            storage.unlock(key)?;
            return Err(err).with_context(|| format!("Failed to start '{program}'"));
        },
    };

    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(status) = finished else {
        warn!(key, "Interrupted, stopping command and releasing locks");
        if let Err(err) = child.kill().await {
            warn!(error = %err, "Failed to stop command");
        }
        storage.unlock_all_obtained();
        return Ok(ExitCode::from(INTERRUPTED));
    };

    storage.unlock(key)?;
    let status = status.with_context(|| format!("Failed to wait for '{program}'"))?;
    info!(key, %status, "Command finished, lock released");

    Ok(status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from))
}

async fn print_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }

    let mut stdout = tokio::io::stdout();
    stdout.write_all(out.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
