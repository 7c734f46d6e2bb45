//! Foreground daemon: a control socket in front of one [`Quiescer`].
//!
//! The quiescer is single-threaded, so it lives on the main task. Connection
//! tasks forward each request over a channel and wait for the reply, while the
//! main loop sleeps until the quiescer's next timer.

mod client;

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use vmbackup::{NullProvider, QuiesceSettings, Quiescer};
use vmbackup_protocol::{Command, CommandReply, ControlRequest, ControlResponse, StartArgs};
use vmbackup_runtime::{EventFormat, HostTransport, LineTransport, process};

pub use client::send_request;

use crate::error::{CliError, Result};

struct Envelope {
	request: ControlRequest,
	reply: oneshot::Sender<ControlResponse>,
}

pub struct Daemon {
	quiescer: Quiescer,
	listener: UnixListener,
	socket: PathBuf,
	pid_file: PathBuf,
}

impl Daemon {
	/// Claims the control socket and builds the quiescer. Must run inside the tokio runtime.
	pub fn bind(socket: &Path, settings: QuiesceSettings, events: Option<&Path>, format: EventFormat) -> Result<Self> {
		let pid_file = socket.with_extension("pid");
		claim_socket(socket, &pid_file)?;

		let transport = open_events(events, format)?;
		let quiescer = Quiescer::with_script_runner(settings, transport, Box::new(NullProvider));
		let listener = UnixListener::bind(socket)?;
		std::fs::write(&pid_file, std::process::id().to_string())?;

		info!(
			target = "vmbackup.daemon",
			socket = %socket.display(),
			config_dir = %quiescer.settings().config_dir.display(),
			scripts_dir = %quiescer.settings().scripts_dir().display(),
			"daemon listening"
		);
		Ok(Self {
			quiescer,
			listener,
			socket: socket.to_path_buf(),
			pid_file,
		})
	}

	pub async fn run(self) -> Result<()> {
		let Daemon {
			mut quiescer,
			listener,
			socket,
			pid_file,
		} = self;

		let (tx, mut rx) = mpsc::channel::<Envelope>(32);
		let accept = tokio::spawn(accept_loop(listener, tx));
		let interrupt = tokio::signal::ctrl_c();
		tokio::pin!(interrupt);

		loop {
			let deadline = quiescer.next_deadline();
			tokio::select! {
				envelope = rx.recv() => {
					let Some(Envelope { request, reply }) = envelope else {
						break;
					};
					quiescer.advance_clock(Instant::now());
					let stop = matches!(request, ControlRequest::Shutdown);
					let _ = reply.send(handle_request(&mut quiescer, request));
					if stop {
						info!(target = "vmbackup.daemon", "shutdown requested");
						break;
					}
				}
				_ = sleep_until(deadline) => {
					quiescer.tick(Instant::now());
				}
				result = &mut interrupt => {
					if let Err(err) = result {
						warn!(target = "vmbackup.daemon", error = %err, "signal handler failed");
					}
					info!(target = "vmbackup.daemon", "interrupted");
					break;
				}
			}
		}

		accept.abort();
		quiescer.shutdown();
		for path in [&socket, &pid_file] {
			if let Err(err) = std::fs::remove_file(path) {
				debug!(target = "vmbackup.daemon", path = %path.display(), error = %err, "cleanup failed");
			}
		}
		Ok(())
	}
}

fn claim_socket(socket: &Path, pid_file: &Path) -> Result<()> {
	let owner = std::fs::read_to_string(pid_file).ok().and_then(|raw| raw.trim().parse::<u32>().ok());
	if let Some(pid) = owner {
		if pid != std::process::id() && process::pid_is_alive(pid) {
			return Err(CliError::AlreadyRunning(pid));
		}
	}

	match std::fs::remove_file(socket) {
		Ok(()) => debug!(target = "vmbackup.daemon", socket = %socket.display(), "removed stale socket"),
		Err(err) if err.kind() == ErrorKind::NotFound => {}
		Err(err) => return Err(err.into()),
	}
	Ok(())
}

fn open_events(path: Option<&Path>, format: EventFormat) -> Result<Box<dyn HostTransport>> {
	match path {
		Some(path) => {
			let file = OpenOptions::new().create(true).append(true).open(path)?;
			Ok(Box::new(LineTransport::with_format(file, format)))
		}
		None => Ok(Box::new(LineTransport::with_format(std::io::stdout(), format))),
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
		None => std::future::pending().await,
	}
}

fn handle_request(quiescer: &mut Quiescer, request: ControlRequest) -> ControlResponse {
	debug!(target = "vmbackup.daemon", ?request, "control request");
	match request {
		ControlRequest::Ping => ControlResponse::Pong,
		ControlRequest::Start { generate_manifests, volumes } => reply(quiescer.start(StartArgs::new(generate_manifests, volumes))),
		ControlRequest::Abort => reply(quiescer.abort()),
		ControlRequest::SnapshotDone => reply(quiescer.snapshot_done()),
		ControlRequest::Rpc { line } => match Command::parse(&line) {
			Ok(command) => reply(quiescer.dispatch(command)),
			Err(err) => ControlResponse::Error { message: err.to_string() },
		},
		ControlRequest::Status => ControlResponse::Status { session: quiescer.status() },
		ControlRequest::Shutdown => ControlResponse::Ok {
			message: "shutting down".to_string(),
		},
	}
}

fn reply(reply: CommandReply) -> ControlResponse {
	if reply.ok {
		ControlResponse::Ok { message: reply.message }
	} else {
		ControlResponse::Error { message: reply.message }
	}
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<Envelope>) {
	loop {
		match listener.accept().await {
			Ok((stream, _)) => {
				let tx = tx.clone();
				tokio::spawn(async move {
					if let Err(err) = serve_connection(stream, tx).await {
						debug!(target = "vmbackup.daemon", error = %err, "connection closed with error");
					}
				});
			}
			Err(err) => warn!(target = "vmbackup.daemon", error = %err, "accept failed"),
		}
	}
}

async fn serve_connection(stream: UnixStream, tx: mpsc::Sender<Envelope>) -> Result<()> {
	let (read, mut write) = stream.into_split();
	let mut lines = BufReader::new(read).lines();

	while let Some(line) = lines.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let request = match serde_json::from_str::<ControlRequest>(&line) {
			Ok(request) => request,
			Err(err) => {
				let response = ControlResponse::Error {
					message: format!("invalid request: {err}"),
				};
				write_response(&mut write, &response).await?;
				continue;
			}
		};

		// The main loop exits as soon as it sees a shutdown, so acknowledge it first.
		let shutdown = matches!(request, ControlRequest::Shutdown);
		if shutdown {
			let response = ControlResponse::Ok {
				message: "shutting down".to_string(),
			};
			write_response(&mut write, &response).await?;
		}

		let (reply, response) = oneshot::channel();
		if tx.send(Envelope { request, reply }).await.is_err() || shutdown {
			break;
		}
		match response.await {
			Ok(response) => write_response(&mut write, &response).await?,
			Err(_) => break,
		}
	}
	Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &ControlResponse) -> Result<()> {
	let mut payload = serde_json::to_vec(response)?;
	payload.push(b'\n');
	writer.write_all(&payload).await?;
	writer.flush().await?;
	Ok(())
}
