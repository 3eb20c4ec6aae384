use clap::Parser;
use lockbox_cli::args::Cli;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    lockbox_cli::run(Cli::parse()).await
}
