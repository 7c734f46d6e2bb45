//! Child process and pid helpers shared by the script subsystem and the daemon.

use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

/// Launches a hook script with a single phase argument, detached from our stdio.
pub fn spawn_hook(path: &Path, arg: &str) -> io::Result<Child> {
	Command::new(path).arg(arg).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null()).spawn()
}

/// Kills `child` if it is still running and reaps it.
pub fn terminate(child: &mut Child) {
	match child.try_wait() {
		Ok(Some(_)) => {}
		_ => {
			if let Err(err) = child.kill() {
				tracing::debug!(target = "vmbackup.process", pid = child.id(), error = %err, "kill failed");
			}
			if let Err(err) = child.wait() {
				tracing::debug!(target = "vmbackup.process", pid = child.id(), error = %err, "reap failed");
			}
		}
	}
}

/// Renders an exit status for error messages.
pub fn describe_exit(status: ExitStatus) -> String {
	match status.code() {
		Some(code) => format!("exit code {code}"),
		None => {
			#[cfg(unix)]
			{
				use std::os::unix::process::ExitStatusExt;
				if let Some(signal) = status.signal() {
					return format!("signal {signal}");
				}
			}
			"unknown exit status".to_string()
		}
	}
}

/// Returns `true` when `path` is a regular file the current platform would execute.
pub fn is_executable(path: &Path) -> bool {
	let Ok(metadata) = std::fs::metadata(path) else {
		return false;
	};
	if !metadata.is_file() {
		return false;
	}

	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		metadata.permissions().mode() & 0o111 != 0
	}

	#[cfg(not(unix))]
	{
		path.extension()
			.and_then(|ext| ext.to_str())
			.is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "exe" | "bat" | "cmd"))
	}
}

/// Returns `true` when a process with `pid` appears alive on this platform.
pub fn pid_is_alive(pid: u32) -> bool {
	if pid == 0 {
		return false;
	}
	if pid == std::process::id() {
		return true;
	}

	#[cfg(unix)]
	{
		if Path::new("/proc").join(pid.to_string()).exists() {
			return true;
		}
		Command::new("kill")
			.arg("-0")
			.arg(pid.to_string())
			.stderr(Stdio::null())
			.status()
			.map(|status| status.success())
			.unwrap_or(false)
	}

	#[cfg(not(unix))]
	{
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn current_process_is_alive() {
		assert!(pid_is_alive(std::process::id()));
	}

	#[test]
	fn pid_zero_is_never_alive() {
		assert!(!pid_is_alive(0));
	}

	#[cfg(unix)]
	#[test]
	fn executable_bit_is_required() {
		use std::os::unix::fs::PermissionsExt;

		let dir = std::env::temp_dir().join(format!("vmbackup-process-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let script = dir.join("hook.sh");
		std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();

		std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();
		assert!(!is_executable(&script));
		std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
		assert!(is_executable(&script));
		assert!(!is_executable(&dir));

		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[cfg(unix)]
	#[test]
	fn hook_exit_status_is_observable() {
		let dir = std::env::temp_dir().join(format!("vmbackup-exit-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let script = dir.join("fails.sh");
		std::fs::write(&script, "exit 3\n").unwrap();

		let mut child = spawn_hook(Path::new("/bin/sh"), script.to_str().unwrap()).unwrap();
		let status = child.wait().unwrap();
		assert!(!status.success());
		assert_eq!(describe_exit(status), "exit code 3");

		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[cfg(unix)]
	#[test]
	fn terminate_kills_and_reaps_a_running_child() {
		let dir = std::env::temp_dir().join(format!("vmbackup-terminate-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let script = dir.join("hangs.sh");
		std::fs::write(&script, "exec sleep 30\n").unwrap();

		let mut child = spawn_hook(Path::new("/bin/sh"), script.to_str().unwrap()).unwrap();
		terminate(&mut child);
		let status = child.try_wait().unwrap().expect("child reaped");
		assert_eq!(describe_exit(status), "signal 9");

		// A second call finds the child already reaped.
		terminate(&mut child);
		std::fs::remove_dir_all(&dir).unwrap();
	}
}
