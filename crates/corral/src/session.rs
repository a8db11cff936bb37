use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::ChildStdin;
use tokio::sync::{watch, Mutex};

use crate::output::OutputBuffer;
use crate::types::*;

/// Writable end of a session's stdin, shared so writes can happen without
/// holding the registry lock.
pub type SharedStdin = Arc<Mutex<ChildStdin>>;

/// Instruction to the task that owns a session's child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopRequest {
	Run,
	/// The tree was asked to terminate; force it once the kill grace runs out.
	Escalate,
	/// Kill the direct child now.
	Kill,
}

/// The live OS process behind a session. Owned by its [`SessionRecord`].
pub struct ProcessHandle {
	/// Minted per spawn. Lets late events from a replaced process be told
	/// apart from the current one after a restart reuses the session id.
	pub(crate) token: String,
	pub pid: Option<u32>,
	stdin: Option<SharedStdin>,
	exited: bool,
	exit_code: Option<i32>,
	stop: Option<watch::Sender<StopRequest>>,
	/// Set while a restart is replacing this process.
	restart_ticket: Option<String>,
}

impl ProcessHandle {
	pub(crate) fn new(
		token: String,
		pid: Option<u32>,
		stdin: Option<ChildStdin>,
		stop: watch::Sender<StopRequest>,
	) -> Self {
		Self {
			token,
			pid,
			stdin: stdin.map(|s| Arc::new(Mutex::new(s))),
			exited: false,
			exit_code: None,
			stop: Some(stop),
			restart_ticket: None,
		}
	}

	pub fn stdin(&self) -> Option<SharedStdin> {
		self.stdin.clone()
	}

	pub fn exit_code(&self) -> Option<i32> {
		self.exit_code
	}

	pub fn has_exited(&self) -> bool {
		self.exited || self.exit_code.is_some()
	}

	pub(crate) fn mark_exited(&mut self, code: Option<i32>) {
		self.exited = true;
		self.exit_code = code;
		self.stdin = None;
	}

	pub(crate) fn take_stop(&mut self) -> Option<watch::Sender<StopRequest>> {
		self.stop.take()
	}

	/// Detach this handle from its process ahead of a restart. Events the
	/// process still produces are ignored from here on. Returns the stop
	/// switch for the old process.
	pub(crate) fn retire(&mut self, ticket: String) -> Option<watch::Sender<StopRequest>> {
		self.token.clear();
		self.stdin = None;
		self.restart_ticket = Some(ticket);
		self.stop.take()
	}

	pub(crate) fn is_retired(&self) -> bool {
		self.restart_ticket.is_some()
	}

	/// Whether this handle was retired by the restart holding `ticket`.
	pub(crate) fn retired_by(&self, ticket: &str) -> bool {
		self.restart_ticket.as_deref() == Some(ticket)
	}
}

/// One supervised agent process and everything tracked about it.
pub struct SessionRecord {
	pub id: String,
	pub name: String,
	pub status: SessionStatus,
	pub working_dir: PathBuf,
	pub created_at: DateTime<Utc>,
	pub last_activity_at: DateTime<Utc>,
	pub output: OutputBuffer,
	pub external_session_id: Option<String>,
	pub flags: LaunchFlags,
	pub process: ProcessHandle,
}

impl SessionRecord {
	pub(crate) fn new(
		id: String,
		name: String,
		working_dir: PathBuf,
		flags: LaunchFlags,
		output: OutputBuffer,
		process: ProcessHandle,
	) -> Self {
		let now = Utc::now();
		Self {
			id,
			name,
			status: SessionStatus::Idle,
			working_dir,
			created_at: now,
			last_activity_at: now,
			output,
			external_session_id: None,
			flags,
			process,
		}
	}

	pub fn touch(&mut self) {
		self.last_activity_at = Utc::now();
	}

	/// Set the status; returns whether it actually changed.
	pub fn set_status(&mut self, status: SessionStatus) -> bool {
		if self.status == status {
			return false;
		}
		self.status = status;
		true
	}

	pub fn info(&self) -> SessionInfo {
		SessionInfo {
			id: self.id.clone(),
			name: self.name.clone(),
			status: self.status,
			working_dir: self.working_dir.clone(),
			created_at: self.created_at,
			last_activity_at: self.last_activity_at,
			external_session_id: self.external_session_id.clone(),
			pid: self.process.pid,
			exit_code: self.process.exit_code(),
			output_lines: self.output.len(),
			flags: self.flags,
		}
	}
}
