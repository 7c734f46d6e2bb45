use std::path::Path;

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use vmbackup_protocol::{ControlRequest, ControlResponse};

use crate::error::{CliError, Result};

/// Sends one request to the daemon at `socket`. Returns `None` when no daemon is listening.
pub async fn send_request(socket: &Path, request: &ControlRequest) -> Result<Option<ControlResponse>> {
	let stream = match UnixStream::connect(socket).await {
		Ok(stream) => stream,
		Err(err) if is_not_running(&err) => return Ok(None),
		Err(err) => return Err(CliError::Io(err)),
	};

	let response = exchange(stream, request).await?;
	Ok(Some(response))
}

fn is_not_running(err: &std::io::Error) -> bool {
	matches!(err.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused)
}

async fn exchange<S>(mut stream: S, request: &ControlRequest) -> Result<ControlResponse>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let payload = serde_json::to_string(request).context("Failed to serialize daemon request")?;
	stream
		.write_all(format!("{payload}\n").as_bytes())
		.await
		.context("Failed writing daemon request")?;
	stream.flush().await.context("Failed flushing daemon request")?;

	let mut reader = BufReader::new(stream);
	let mut line = String::new();
	let read = reader.read_line(&mut line).await.context("Failed reading daemon response")?;
	if read == 0 {
		return Err(CliError::Anyhow(anyhow!("daemon closed the connection without answering")));
	}
	let response = serde_json::from_str(&line).context("Failed parsing daemon response")?;
	Ok(response)
}
