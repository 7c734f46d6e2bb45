use std::path::Path;

use vmbackup::QuiesceSettings;

use crate::cli::RunArgs;
use crate::daemon::Daemon;
use crate::error::Result;

pub async fn run(socket: &Path, args: RunArgs) -> Result<()> {
	let mut settings = match args.settings.as_deref() {
		Some(path) => QuiesceSettings::from_file(path)?,
		None => QuiesceSettings::default(),
	};
	if let Some(dir) = args.config_dir {
		settings = settings.with_config_dir(dir);
	}

	let daemon = Daemon::bind(socket, settings, args.events.as_deref(), args.event_format)?;
	daemon.run().await
}
