use chrono::{Local, NaiveDateTime};
use corral::{SessionEvent, Supervisor};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Weak;
use tokio::sync::broadcast::error::RecvError;

use crate::config::LogsConfig;
use crate::logs;

/// Appends session output and lifecycle markers to per-session log files.
pub struct Transcripts {
	log_dir: PathBuf,
	max_size: u64,
	writers: HashMap<String, LogWriter>,
}

struct LogWriter {
	file: Option<File>,
	dir: PathBuf,
	path: PathBuf,
	name: String,
	bytes_written: u64,
	max_size: u64,
	/// Last write did not end with a newline.
	line_open: bool,
}

impl Transcripts {
	pub fn new(log_dir: PathBuf, max_size: u64) -> Self {
		Self {
			log_dir,
			max_size,
			writers: HashMap::new(),
		}
	}

	/// Write one event to the transcript of the session called `name`.
	pub fn record(&mut self, name: &str, event: &SessionEvent, now: NaiveDateTime) {
		let writer = self
			.writers
			.entry(event.session_id().to_string())
			.or_insert_with(|| LogWriter::open(&self.log_dir, name, self.max_size, now));

		match event {
			SessionEvent::Output { text, .. } => writer.write(text, now),
			SessionEvent::StatusChange { status, .. } => {
				writer.write_marker(&format!("status {}", status), now)
			}
			SessionEvent::Exit { code, .. } => {
				let what = match code {
					Some(code) => format!("exited with code {}", code),
					None => "exited by signal".to_string(),
				};
				writer.write_marker(&what, now);
			}
			SessionEvent::Error { message, .. } => {
				writer.write_marker(&format!("error: {}", message), now)
			}
		}

		if matches!(event, SessionEvent::Exit { .. }) {
			self.writers.remove(event.session_id());
		}
	}
}

impl LogWriter {
	fn open(log_dir: &std::path::Path, name: &str, max_size: u64, now: NaiveDateTime) -> Self {
		let dir = logs::session_log_dir(log_dir, name);
		if let Err(e) = fs::create_dir_all(&dir) {
			tracing::warn!("cannot create log dir {}: {}", dir.display(), e);
		}
		let path = dir.join(logs::current_log_name(name, now.date()));
		let file = open_append(&path);
		let bytes_written = file.as_ref().and_then(|f| f.metadata().ok()).map(|m| m.len()).unwrap_or(0);

		Self {
			file,
			dir,
			path,
			name: name.to_string(),
			bytes_written,
			max_size,
			line_open: false,
		}
	}

	fn write_marker(&mut self, what: &str, now: NaiveDateTime) {
		let lead = if self.line_open { "\n" } else { "" };
		let line = format!("{}--- {} {} ---\n", lead, now.format("%Y-%m-%d %H:%M:%S"), what);
		self.write(&line, now);
	}

	fn write(&mut self, text: &str, now: NaiveDateTime) {
		if text.is_empty() {
			return;
		}
		let data = text.as_bytes();
		let expected = self.dir.join(logs::current_log_name(&self.name, now.date()));
		if expected != self.path {
			// New day, new file.
			self.path = expected;
			self.file = open_append(&self.path);
			self.bytes_written = 0;
		}

		if let Some(ref mut file) = self.file {
			if let Err(e) = file.write_all(data) {
				tracing::warn!("transcript write to {} failed: {}", self.path.display(), e);
				return;
			}
			self.bytes_written += data.len() as u64;
			self.line_open = !text.ends_with('\n');

			if self.max_size > 0 && self.bytes_written >= self.max_size {
				self.rotate(now);
			}
		}
	}

	fn rotate(&mut self, now: NaiveDateTime) {
		self.file = None;

		let rotated_path = self.dir.join(logs::rotated_log_name(&self.dir, &self.name, now));
		if let Err(e) = fs::rename(&self.path, &rotated_path) {
			tracing::warn!("log rotation of {} failed: {}", self.path.display(), e);
		}

		self.file = open_append(&self.path);
		self.bytes_written = 0;
	}
}

fn open_append(path: &std::path::Path) -> Option<File> {
	match OpenOptions::new().create(true).append(true).open(path) {
		Ok(f) => Some(f),
		Err(e) => {
			tracing::warn!("cannot open transcript {}: {}", path.display(), e);
			None
		}
	}
}

/// Follow the supervisor's events and write transcripts until the supervisor
/// is dropped and its event channel closes.
pub async fn run(supervisor: Weak<Supervisor>, log_dir: PathBuf, config: LogsConfig) {
	let Some(mut events) = supervisor.upgrade().map(|sup| sup.subscribe()) else {
		return;
	};
	let mut transcripts = Transcripts::new(log_dir, config.max_size_bytes);
	let mut names: HashMap<String, String> = HashMap::new();

	loop {
		let event = match events.recv().await {
			Ok(event) => event,
			Err(RecvError::Lagged(skipped)) => {
				tracing::warn!("transcript writer fell behind, {} events not logged", skipped);
				continue;
			}
			Err(RecvError::Closed) => return,
		};

		let id = event.session_id().to_string();
		let name = match names.get(&id) {
			Some(name) => name.clone(),
			None => {
				let name = session_name(&supervisor, &id).await.unwrap_or_else(|| id.clone());
				names.insert(id.clone(), name.clone());
				name
			}
		};

		transcripts.record(&name, &event, Local::now().naive_local());

		if matches!(event, SessionEvent::Exit { .. }) && session_name(&supervisor, &id).await.is_none() {
			names.remove(&id);
		}
	}
}

async fn session_name(supervisor: &Weak<Supervisor>, id: &str) -> Option<String> {
	let sup = supervisor.upgrade()?;
	sup.get_session(id).await.map(|s| s.name)
}
