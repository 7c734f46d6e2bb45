mod control;
mod run;

use vmbackup_protocol::ControlRequest;

use crate::cli::{Cli, Commands};
use crate::error::Result;

pub async fn dispatch(cli: Cli) -> Result<()> {
	let socket = cli.socket;
	match cli.command {
		Commands::Run(args) => run::run(&socket, args).await,
		Commands::Start { manifests, volumes } => {
			let request = ControlRequest::Start {
				generate_manifests: manifests,
				volumes,
			};
			control::request(&socket, request).await
		}
		Commands::Abort => control::request(&socket, ControlRequest::Abort).await,
		Commands::SnapshotDone => control::request(&socket, ControlRequest::SnapshotDone).await,
		Commands::Rpc { line } => control::request(&socket, ControlRequest::Rpc { line }).await,
		Commands::Ping => control::request(&socket, ControlRequest::Ping).await,
		Commands::Status => control::status(&socket).await,
		Commands::Shutdown => control::shutdown(&socket).await,
	}
}
