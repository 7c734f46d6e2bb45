use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vmbackup_runtime::EventFormat;

pub const DEFAULT_SOCKET: &str = "/run/vmbackupd.sock";

#[derive(Parser, Debug)]
#[command(name = "vmbackupd")]
#[command(about = "Guest backup daemon - quiesces filesystems around host snapshots")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Control socket of the daemon
	#[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_SOCKET)]
	pub socket: PathBuf,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run the daemon in the foreground
	Run(RunArgs),

	/// Start a backup cycle
	Start {
		/// Write a backup manifest once filesystems are quiesced
		#[arg(long)]
		manifests: bool,
		/// Volumes to quiesce (all volumes when omitted)
		volumes: Option<String>,
	},

	/// Abort the running backup cycle
	Abort,

	/// Tell the daemon the host snapshot has been taken
	#[command(name = "snapshot-done")]
	SnapshotDone,

	/// Send a host command in its text form, e.g. `vmbackup.start 1 /`
	Rpc {
		/// Command line, including its arguments
		line: String,
	},

	/// Show the state of the daemon and its backup session
	Status,

	/// Check that the daemon answers
	Ping,

	/// Stop the daemon, ending any running cycle
	Shutdown,
}

#[derive(Args, Debug)]
pub struct RunArgs {
	/// Directory holding vmbackup.conf and backupScripts.d
	#[arg(long, value_name = "DIR")]
	pub config_dir: Option<PathBuf>,

	/// JSON settings file
	#[arg(long, value_name = "FILE")]
	pub settings: Option<PathBuf>,

	/// Append host events to FILE instead of writing them to stdout
	#[arg(long, value_name = "FILE")]
	pub events: Option<PathBuf>,

	/// Encoding of host events: `json` lines or `rpc` (`vmbackup.eventSet ...`) lines
	#[arg(long, value_name = "FORMAT", default_value_t = EventFormat::Json)]
	pub event_format: EventFormat,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_start_with_volumes() {
		let cli = Cli::try_parse_from(["vmbackupd", "--socket", "/tmp/v.sock", "start", "--manifests", "/dev/sda1 /dev/sdb1"]).unwrap();
		assert_eq!(cli.socket, PathBuf::from("/tmp/v.sock"));
		match cli.command {
			Commands::Start { manifests, volumes } => {
				assert!(manifests);
				assert_eq!(volumes.as_deref(), Some("/dev/sda1 /dev/sdb1"));
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn run_accepts_overrides_and_counts_verbosity() {
		let cli = Cli::try_parse_from(["vmbackupd", "-vv", "run", "--config-dir", "/opt/tools", "--events", "/tmp/events"]).unwrap();
		assert_eq!(cli.verbose, 2);
		assert_eq!(cli.socket, PathBuf::from(DEFAULT_SOCKET));
		let Commands::Run(args) = cli.command else {
			panic!("expected run");
		};
		assert_eq!(args.config_dir, Some(PathBuf::from("/opt/tools")));
		assert_eq!(args.events, Some(PathBuf::from("/tmp/events")));
		assert!(args.settings.is_none());
		assert_eq!(args.event_format, EventFormat::Json);
	}

	#[test]
	fn rpc_takes_the_command_line_and_event_format_is_selectable() {
		let cli = Cli::try_parse_from(["vmbackupd", "rpc", "vmbackup.start 1 /"]).unwrap();
		let Commands::Rpc { line } = cli.command else {
			panic!("expected rpc");
		};
		assert_eq!(line, "vmbackup.start 1 /");

		let cli = Cli::try_parse_from(["vmbackupd", "run", "--event-format", "rpc"]).unwrap();
		let Commands::Run(args) = cli.command else {
			panic!("expected run");
		};
		assert_eq!(args.event_format, EventFormat::Rpc);
		assert!(Cli::try_parse_from(["vmbackupd", "run", "--event-format", "xml"]).is_err());
	}
}
