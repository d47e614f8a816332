//! `nwrc-server` binary.

use clap::Parser;
use nwrc_server::cli::{self, Cli, CliError, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let options = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&options.log));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();

    match options.command {
        Command::Serve(args) => cli::serve(args).await,
        Command::Ping(args) => cli::ping(args).await,
    }
}
