//! `vmbackupd`: guest backup daemon and its control client.

mod cli;
mod commands;
mod daemon;
mod error;
mod logging;

use clap::Parser;
use tracing::error;

use crate::cli::Cli;

#[tokio::main(flavor = "current_thread")]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = commands::dispatch(cli).await {
		error!(target = "vmbackup.daemon", error = %err, "command failed");
		std::process::exit(1);
	}
}
