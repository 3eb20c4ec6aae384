//! # CLI Argument Definitions

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// The main CLI structure parsing command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "lockbox")]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(arg_required_else_help = true)]
#[command(about = "Filesystem key-value store with cross-process key locks")]
pub struct Cli {
    /// Configuration file (defaults to `lockbox.toml` in the working directory, if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Storage root directory, overriding the configuration
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Also write logs to rolling files in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store a value read from a file or stdin
    Store {
        key: String,
        /// Read the value from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print a stored value to stdout
    Load { key: String },
    /// Delete a stored value
    Delete { key: String },
    /// Exit with status 0 if the key exists, 1 otherwise
    Exists { key: String },
    /// List keys below a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(short = 'R', long)]
        recursive: bool,
    },
    /// Show metadata about a key
    Stat { key: String },
    /// Show lock markers in the storage root, from every process
    Locks,
    /// Remove lock markers older than the staleness threshold
    Reap,
    /// Run a command while holding the lock for a key
    Run {
        key: String,
        /// Give up after waiting this many seconds for the lock
        #[arg(short, long)]
        timeout: Option<u64>,
        /// The command and its arguments
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_the_trailing_command() {
        let cli = Cli::try_parse_from([
            "lockbox", "-vv", "--root", "/srv/lockbox", "run", "cert/example.com", "--timeout", "5",
            "--", "renew", "--force",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.root.as_deref(), Some(std::path::Path::new("/srv/lockbox")));
        match cli.command {
            Command::Run { key, timeout, command } => {
                assert_eq!(key, "cert/example.com");
                assert_eq!(timeout, Some(5));
                assert_eq!(command, ["renew", "--force"]);
            },
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["lockbox", "run", "k"]).is_err());
    }
}
