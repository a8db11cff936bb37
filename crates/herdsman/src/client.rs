use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::paths::Paths;
use crate::protocol::{Request, Response};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("daemon not running")]
	NotRunning,
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("serialize error: {0}")]
	Serialize(String),
	#[error("deserialize error: {0}")]
	Deserialize(String),
	#[error("daemon closed the connection")]
	Closed,
}

/// Blocking JSON-lines client for the daemon socket.
pub struct DaemonClient {
	stream: UnixStream,
}

impl DaemonClient {
	/// Connect to an already-running daemon.
	pub fn connect(paths: &Paths) -> Result<Self, ClientError> {
		let stream = UnixStream::connect(paths.socket_path()).map_err(|_| ClientError::NotRunning)?;
		Ok(Self { stream })
	}

	pub fn send(&mut self, request: &Request) -> Result<Response, ClientError> {
		let mut data = serde_json::to_vec(request).map_err(|e| ClientError::Serialize(e.to_string()))?;
		data.push(b'\n');
		self.stream.write_all(&data)?;

		let mut reader = BufReader::new(&self.stream);
		let mut line = String::new();
		if reader.read_line(&mut line)? == 0 {
			return Err(ClientError::Closed);
		}

		serde_json::from_str(&line).map_err(|e| ClientError::Deserialize(e.to_string()))
	}
}

pub fn is_running(paths: &Paths) -> bool {
	UnixStream::connect(paths.socket_path()).is_ok()
}

/// Start `herdsman daemon run` detached from this terminal.
pub fn spawn_daemon(extra_args: &[String]) -> Result<(), ClientError> {
	let mut cmd = Command::new(current_binary());
	cmd.args(["daemon", "run"])
		.args(extra_args)
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null());
	cmd.spawn()?;
	Ok(())
}

/// Connect, starting the daemon first if nothing is listening.
pub fn ensure_daemon(paths: &Paths) -> Result<DaemonClient, ClientError> {
	if let Ok(client) = DaemonClient::connect(paths) {
		return Ok(client);
	}

	spawn_daemon(&[])?;

	for _ in 0..50 {
		std::thread::sleep(Duration::from_millis(100));
		if let Ok(client) = DaemonClient::connect(paths) {
			return Ok(client);
		}
	}

	Err(ClientError::NotRunning)
}

fn current_binary() -> PathBuf {
	std::env::current_exe().unwrap_or_else(|_| PathBuf::from("herdsman"))
}
