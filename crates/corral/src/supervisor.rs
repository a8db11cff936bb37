use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SupervisorError};
use crate::events::{EventBus, SessionEvent};
use crate::output::{OutputBuffer, OUTPUT_CAPACITY};
use crate::platform::{InterruptStrategy, Platform, SpawnOptions, INTERRUPT_BYTE};
use crate::registry::SessionRegistry;
use crate::session::{ProcessHandle, SessionRecord, SharedStdin, StopRequest};
use crate::types::*;

/// How long an exited process's pipes get to drain before `exit` is reported.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// Period of the liveness reconciliation loop.
	pub health_interval: Duration,
	/// Output lines retained per session.
	pub output_capacity: usize,
	/// Used when a create request names no working directory.
	pub default_working_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			health_interval: Duration::from_secs(5),
			output_capacity: OUTPUT_CAPACITY,
			default_working_dir: None,
		}
	}
}

/// Owns every agent session: spawns them, routes their I/O, tracks status,
/// and tears them down.
pub struct Supervisor {
	sessions: RwLock<SessionRegistry>,
	platform: Arc<dyn Platform>,
	events: EventBus,
	config: SupervisorConfig,
	name_counter: AtomicUsize,
}

struct Spawned {
	child: Child,
	path: PathBuf,
	args: Vec<String>,
}

/// A registered child's pipes and control channel, not yet being pumped.
struct Wiring {
	child: Child,
	token: String,
	stdout: Option<ChildStdout>,
	stderr: Option<ChildStderr>,
	stop: watch::Receiver<StopRequest>,
}

/// What a process reports back to its session, in arrival order.
enum ProcessSignal {
	Stdout(String),
	Stderr(String),
	Exited(Option<i32>),
	Failed(String),
}

impl Supervisor {
	pub fn new(config: SupervisorConfig, platform: Arc<dyn Platform>) -> Arc<Self> {
		Arc::new(Self {
			sessions: RwLock::new(SessionRegistry::new()),
			platform,
			events: EventBus::new(),
			config,
			name_counter: AtomicUsize::new(0),
		})
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}

	pub fn platform(&self) -> &Arc<dyn Platform> {
		&self.platform
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.config
	}

	/// Snapshots of every session, oldest first.
	pub async fn list_sessions(&self) -> Vec<SessionInfo> {
		let sessions = self.sessions.read().await;
		let mut result: Vec<SessionInfo> = sessions.list().map(SessionRecord::info).collect();
		result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
		result
	}

	pub async fn get_session(&self, id: &str) -> Option<SessionInfo> {
		self.sessions.read().await.get(id).map(SessionRecord::info)
	}

	/// The newest `max_lines` buffered lines (all of them when `None`),
	/// newline-joined. Unknown sessions yield an empty string.
	pub async fn get_output(&self, id: &str, max_lines: Option<usize>) -> String {
		self.sessions
			.read()
			.await
			.get(id)
			.map(|r| r.output.tail(max_lines))
			.unwrap_or_default()
	}

	pub async fn create_session(self: &Arc<Self>, options: CreateOptions) -> Result<SessionInfo> {
		let name = options.name.unwrap_or_else(|| {
			let n = self.name_counter.fetch_add(1, Ordering::SeqCst) + 1;
			format!("session-{}", n)
		});
		let working_dir = options
			.working_dir
			.or_else(|| self.config.default_working_dir.clone())
			.or_else(|| std::env::current_dir().ok())
			.unwrap_or_else(|| PathBuf::from("."));

		let Spawned { child, path, args } = self.spawn_process(&working_dir, options.flags)?;
		let id = Uuid::new_v4().to_string();
		let (record, wiring) = self.new_record(id.clone(), name, working_dir, options.flags, child);
		let info = record.info();

		self.sessions.write().await.put(id.clone(), record);
		self.start_pumping(&id, wiring);
		log_started(&info, &path, &args);
		Ok(info)
	}

	fn spawn_process(&self, working_dir: &Path, flags: LaunchFlags) -> Result<Spawned> {
		let path = self
			.platform
			.resolve_executable()
			.ok_or_else(|| SupervisorError::ExecutableNotFound {
				program: self.platform.program().to_string(),
			})?;

		let spawn_options = SpawnOptions {
			working_dir: working_dir.to_path_buf(),
			search_path: self.platform.extended_search_path(),
		};
		let args = flags.to_args();
		let child = self
			.platform
			.spawn(&path, &args, &spawn_options)
			.map_err(|source| SupervisorError::Spawn {
				path: path.clone(),
				source,
			})?;
		Ok(Spawned { child, path, args })
	}

	/// Build the record for a freshly spawned child. The child's pipes are
	/// handed back untouched until [`start_pumping`](Self::start_pumping).
	fn new_record(
		&self,
		id: String,
		name: String,
		working_dir: PathBuf,
		flags: LaunchFlags,
		mut child: Child,
	) -> (SessionRecord, Wiring) {
		let token = Uuid::new_v4().to_string();
		let pid = child.id();
		let stdin = child.stdin.take();
		let stdout = child.stdout.take();
		let stderr = child.stderr.take();
		let (stop_tx, stop_rx) = watch::channel(StopRequest::Run);

		let record = SessionRecord::new(
			id,
			name,
			working_dir,
			flags,
			OutputBuffer::new(self.config.output_capacity),
			ProcessHandle::new(token.clone(), pid, stdin, stop_tx),
		);
		let wiring = Wiring {
			child,
			token,
			stdout,
			stderr,
			stop: stop_rx,
		};
		(record, wiring)
	}

	fn start_pumping(self: &Arc<Self>, id: &str, wiring: Wiring) {
		let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);

		let mut readers = Vec::new();
		if let Some(stdout) = wiring.stdout {
			let tx = signal_tx.clone();
			readers.push(tokio::spawn(pipe_output(stdout, tx, ProcessSignal::Stdout)));
		}
		if let Some(stderr) = wiring.stderr {
			let tx = signal_tx.clone();
			readers.push(tokio::spawn(pipe_output(stderr, tx, ProcessSignal::Stderr)));
		}
		tokio::spawn(wait_for_exit(
			wiring.child,
			readers,
			wiring.stop,
			Arc::clone(&self.platform),
			signal_tx,
		));
		tokio::spawn(pump_signals(
			Arc::downgrade(self),
			id.to_string(),
			wiring.token,
			signal_rx,
		));
	}

	/// Terminate a child that was spawned but never registered.
	fn discard(&self, id: &str, mut record: SessionRecord, wiring: Wiring) {
		let pid = record.process.pid;
		let stop = record.process.take_stop();
		drop(record);

		// Nobody listens; the task only reaps the child and escalates.
		let (signals, _) = mpsc::channel(1);
		tokio::spawn(wait_for_exit(
			wiring.child,
			Vec::new(),
			wiring.stop,
			Arc::clone(&self.platform),
			signals,
		));
		self.terminate(id, pid, stop);
	}

	/// Write `text` plus a newline to the session's stdin.
	pub async fn send_input(&self, id: &str, text: &str) -> bool {
		let Some((stdin, token)) = self.stdin_for(id).await else {
			return false;
		};

		let mut payload = Vec::with_capacity(text.len() + 1);
		payload.extend_from_slice(text.as_bytes());
		payload.push(b'\n');

		match write_stdin(&stdin, &payload).await {
			Ok(()) => {
				self.touch(id, &token).await;
				true
			}
			Err(e) => {
				debug!("session {}: stdin write failed: {}", id, e);
				false
			}
		}
	}

	/// Ask the session to abandon its current work without exiting.
	pub async fn interrupt(&self, id: &str) -> bool {
		let (pid, token) = {
			let sessions = self.sessions.read().await;
			let Some(record) = sessions.get(id) else {
				return false;
			};
			(record.process.pid, record.process.token.clone())
		};

		let delivered = match self.platform.interrupt_strategy() {
			InterruptStrategy::Signal => match pid {
				Some(pid) => match self.platform.send_interrupt(pid) {
					Ok(()) => true,
					Err(e) => {
						warn!("session {}: interrupt signal failed: {}", id, e);
						false
					}
				},
				None => false,
			},
			InterruptStrategy::ControlByte => match self.stdin_for(id).await {
				Some((stdin, _)) => write_stdin(&stdin, &[INTERRUPT_BYTE]).await.is_ok(),
				None => false,
			},
		};

		if delivered {
			self.touch(id, &token).await;
			debug!("session {}: interrupt delivered", id);
		}
		delivered
	}

	/// Remove the session and terminate its process tree. Returns whether the
	/// session existed. Termination is best effort; the record is gone either way.
	pub async fn kill(&self, id: &str) -> bool {
		let removed = self.sessions.write().await.remove(id);
		let Some(mut record) = removed else {
			return false;
		};

		// Descendants can outlive the group leader, so the tree is signalled
		// even once the leader has exited.
		let stop = record.process.take_stop();
		self.terminate(id, record.process.pid, stop);
		info!("session {} ({}) killed", record.name, id);
		true
	}

	/// Replace the session's process with a fresh one under the same id,
	/// name, working directory and launch flags. `Ok(None)` if no such session,
	/// including one killed while the restart was underway.
	///
	/// The record stays registered while the new process starts. If the new
	/// process cannot be launched the session is removed. A second restart
	/// of the same session fails with [`SupervisorError::RestartInProgress`]
	/// until the first one finishes.
	pub async fn restart(self: &Arc<Self>, id: &str) -> Result<Option<SessionInfo>> {
		let ticket = Uuid::new_v4().to_string();
		let (name, working_dir, flags, status, pid, stop) = {
			let mut sessions = self.sessions.write().await;
			let Some(record) = sessions.get_mut(id) else {
				return Ok(None);
			};
			if record.process.is_retired() {
				return Err(SupervisorError::RestartInProgress { id: id.to_string() });
			}
			let pid = record.process.pid;
			let stop = record.process.retire(ticket.clone());
			(
				record.name.clone(),
				record.working_dir.clone(),
				record.flags,
				record.status,
				pid,
				stop,
			)
		};

		self.terminate(id, pid, stop);

		let child = match self.spawn_process(&working_dir, flags) {
			Ok(spawned) => spawned.child,
			Err(e) => {
				warn!("session {}: restart failed: {}", id, e);
				let mut sessions = self.sessions.write().await;
				if sessions.get(id).is_some_and(|r| r.process.retired_by(&ticket)) {
					sessions.remove(id);
				}
				return Err(e);
			}
		};

		let (record, wiring) = self.new_record(id.to_string(), name, working_dir, flags, child);
		let info = record.info();
		{
			let mut sessions = self.sessions.write().await;
			if !sessions.get(id).is_some_and(|r| r.process.retired_by(&ticket)) {
				drop(sessions);
				info!("session {} was removed while restarting", id);
				self.discard(id, record, wiring);
				return Ok(None);
			}
			sessions.put(id.to_string(), record);
			if status != SessionStatus::Idle {
				self.events.publish(SessionEvent::StatusChange {
					session_id: id.to_string(),
					status: SessionStatus::Idle,
				});
			}
		}
		self.start_pumping(id, wiring);

		info!("session {} ({}) restarted (pid {})", info.name, id, format_pid(info.pid));
		Ok(Some(info))
	}

	/// Ask the tree to terminate and have the task owning the child escalate
	/// after the kill grace. Falls back to killing the direct child.
	fn terminate(&self, id: &str, pid: Option<u32>, stop: Option<watch::Sender<StopRequest>>) {
		let request = match pid {
			Some(pid) => match self.platform.terminate_tree(pid) {
				Ok(()) => StopRequest::Escalate,
				Err(e) => {
					warn!("session {}: terminating pid {} failed: {}", id, pid, e);
					StopRequest::Kill
				}
			},
			None => StopRequest::Kill,
		};
		if let Some(stop) = stop {
			let _ = stop.send(request);
		}
	}

	/// Record a caller-reported status. Returns whether the session exists;
	/// a notification only fires when the status actually changes.
	pub async fn update_status(&self, id: &str, status: SessionStatus) -> bool {
		let mut sessions = self.sessions.write().await;
		let Some(record) = sessions.get_mut(id) else {
			return false;
		};
		if record.set_status(status) {
			self.events.publish(SessionEvent::StatusChange {
				session_id: id.to_string(),
				status,
			});
		}
		true
	}

	pub async fn link_external_session(&self, id: &str, external_id: &str) -> bool {
		let mut sessions = self.sessions.write().await;
		match sessions.get_mut(id) {
			Some(record) => {
				record.external_session_id = Some(external_id.to_string());
				debug!("session {} linked to {}", id, external_id);
				true
			}
			None => false,
		}
	}

	pub async fn find_by_external_session(&self, external_id: &str) -> Option<SessionInfo> {
		self.sessions
			.read()
			.await
			.find_by_external(external_id)
			.map(SessionRecord::info)
	}

	/// Kill every session. Returns how many were removed.
	pub async fn cleanup(&self) -> usize {
		let ids = self.sessions.read().await.ids();
		let mut killed = 0;
		for id in ids {
			if self.kill(&id).await {
				killed += 1;
			}
		}
		if killed > 0 {
			info!("cleaned up {} session(s)", killed);
		}
		killed
	}

	/// Compare every session's status with whether its process is actually
	/// alive and fix divergences. Returns the number of transitions made.
	///
	/// Liveness is probed without holding the registry lock.
	pub async fn reconcile(&self) -> usize {
		let probes: Vec<(String, String, Option<u32>)> = {
			let sessions = self.sessions.read().await;
			sessions
				.list()
				.filter(|r| !r.process.is_retired())
				.map(|r| {
					let pid = r.process.pid.filter(|_| !r.process.has_exited());
					(r.id.clone(), r.process.token.clone(), pid)
				})
				.collect()
		};
		if probes.is_empty() {
			return 0;
		}

		let platform = Arc::clone(&self.platform);
		let probed = tokio::task::spawn_blocking(move || {
			probes
				.into_iter()
				.map(|(id, token, pid)| {
					let alive = pid.map(|pid| platform.is_alive(pid)).unwrap_or(false);
					(id, token, alive)
				})
				.collect::<Vec<_>>()
		})
		.await;
		let probed = match probed {
			Ok(probed) => probed,
			Err(e) => {
				warn!("liveness probe failed: {}", e);
				return 0;
			}
		};

		let mut sessions = self.sessions.write().await;
		let mut transitions = 0;
		for (id, token, alive) in probed {
			// Skip records that were replaced or restarted since the snapshot.
			let Some(record) = sessions.get_mut(&id) else {
				continue;
			};
			if record.process.token != token || record.process.is_retired() {
				continue;
			}
			let alive = alive && !record.process.has_exited();

			let target = match (record.status.is_online(), alive) {
				(true, false) => SessionStatus::Offline,
				(false, true) => SessionStatus::Idle,
				_ => continue,
			};

			if record.set_status(target) {
				info!("session {} ({}): reconciled to {}", record.name, record.id, target);
				self.events.publish(SessionEvent::StatusChange {
					session_id: record.id.clone(),
					status: target,
				});
				transitions += 1;
			}
		}
		transitions
	}

	/// Run [`reconcile`](Self::reconcile) every `health_interval` until the
	/// supervisor is dropped.
	pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
		let supervisor = Arc::downgrade(self);
		let period = self.config.health_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				let Some(sup) = supervisor.upgrade() else {
					debug!("supervisor dropped, health monitor exiting");
					return;
				};
				let transitions = sup.reconcile().await;
				if transitions > 0 {
					debug!("health check applied {} transition(s)", transitions);
				}
			}
		})
	}

	async fn stdin_for(&self, id: &str) -> Option<(SharedStdin, String)> {
		let sessions = self.sessions.read().await;
		let record = sessions.get(id)?;
		Some((record.process.stdin()?, record.process.token.clone()))
	}

	async fn touch(&self, id: &str, token: &str) {
		let mut sessions = self.sessions.write().await;
		if let Some(record) = sessions.get_mut(id) {
			if record.process.token == token {
				record.touch();
			}
		}
	}

	async fn apply_signal(&self, id: &str, token: &str, signal: ProcessSignal) {
		let mut sessions = self.sessions.write().await;
		let record = match sessions.get_mut(id) {
			Some(r) if r.process.token == token => Some(r),
			Some(_) => {
				// Replaced by a restart; the old process no longer speaks for this id.
				return;
			}
			None => None,
		};

		match signal {
			ProcessSignal::Stdout(text) => {
				if let Some(record) = record {
					record.output.push_chunk(&text);
					record.touch();
					self.events.publish(SessionEvent::Output {
						session_id: id.to_string(),
						text,
					});
				}
			}
			ProcessSignal::Stderr(text) => {
				if let Some(record) = record {
					record.output.push_stderr(&text);
					record.touch();
				}
			}
			ProcessSignal::Exited(code) => {
				if let Some(record) = record {
					record.process.mark_exited(code);
					if record.set_status(SessionStatus::Offline) {
						self.events.publish(SessionEvent::StatusChange {
							session_id: id.to_string(),
							status: SessionStatus::Offline,
						});
					}
					info!("session {} ({}) exited with {:?}", record.name, id, code);
				}
				self.events.publish(SessionEvent::Exit {
					session_id: id.to_string(),
					code,
				});
			}
			ProcessSignal::Failed(message) => {
				if let Some(record) = record {
					warn!("session {} ({}) process error: {}", record.name, id, message);
					if record.set_status(SessionStatus::Offline) {
						self.events.publish(SessionEvent::StatusChange {
							session_id: id.to_string(),
							status: SessionStatus::Offline,
						});
					}
					self.events.publish(SessionEvent::Error {
						session_id: id.to_string(),
						message,
					});
				}
			}
		}
	}
}

async fn write_stdin(stdin: &SharedStdin, bytes: &[u8]) -> std::io::Result<()> {
	let mut stdin = stdin.lock().await;
	stdin.write_all(bytes).await?;
	stdin.flush().await
}

async fn pump_signals(
	supervisor: Weak<Supervisor>,
	id: String,
	token: String,
	mut signals: mpsc::Receiver<ProcessSignal>,
) {
	while let Some(signal) = signals.recv().await {
		let Some(sup) = supervisor.upgrade() else {
			return;
		};
		sup.apply_signal(&id, &token, signal).await;
	}
}

async fn pipe_output<R: AsyncRead + Unpin>(
	mut reader: R,
	signals: mpsc::Sender<ProcessSignal>,
	wrap: fn(String) -> ProcessSignal,
) {
	let mut buf = [0u8; 4096];
	let mut pending: Vec<u8> = Vec::new();
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => {
				pending.extend_from_slice(&buf[..n]);
				let text = take_utf8(&mut pending);
				if !text.is_empty() && signals.send(wrap(text)).await.is_err() {
					return;
				}
			}
			Err(e) => {
				let _ = signals
					.send(ProcessSignal::Failed(format!("read failed: {}", e)))
					.await;
				return;
			}
		}
	}
	if !pending.is_empty() {
		let text = String::from_utf8_lossy(&pending).into_owned();
		let _ = signals.send(wrap(text)).await;
	}
}

/// Decode the longest valid UTF-8 prefix of `pending`, leaving an incomplete
/// trailing sequence in place for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
	match std::str::from_utf8(pending) {
		Ok(s) => {
			let text = s.to_string();
			pending.clear();
			text
		}
		Err(e) if e.error_len().is_none() => {
			let valid = e.valid_up_to();
			let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
			pending.drain(..valid);
			text
		}
		Err(_) => {
			let text = String::from_utf8_lossy(pending).into_owned();
			pending.clear();
			text
		}
	}
}

async fn wait_for_exit(
	mut child: Child,
	readers: Vec<JoinHandle<()>>,
	mut stop: watch::Receiver<StopRequest>,
	platform: Arc<dyn Platform>,
	signals: mpsc::Sender<ProcessSignal>,
) {
	let pid = child.id();
	let mut stop_closed = false;
	let mut deadline: Option<Instant> = None;

	let status = loop {
		let pending_deadline = deadline;
		let escalate = async move {
			match pending_deadline {
				Some(at) => tokio::time::sleep_until(at).await,
				None => std::future::pending::<()>().await,
			}
		};
		tokio::select! {
			status = child.wait() => break status,
			changed = stop.changed(), if !stop_closed => {
				match *stop.borrow_and_update() {
					StopRequest::Run => {}
					StopRequest::Escalate => {
						deadline.get_or_insert_with(|| Instant::now() + platform.kill_grace());
					}
					StopRequest::Kill => {
						let _ = child.start_kill();
					}
				}
				if changed.is_err() {
					stop_closed = true;
				}
			}
			_ = escalate => {
				deadline = None;
				// Not reaped yet, so the pid still names this child's group.
				let forced = match pid {
					Some(pid) => platform.force_kill_tree(pid),
					None => Ok(()),
				};
				if let Err(e) = forced {
					debug!("forced kill of pid {:?} failed: {}", pid, e);
				}
				let _ = child.start_kill();
			}
		}
	};

	// Let buffered output land before the exit is reported.
	for reader in readers {
		let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
	}

	let signal = match status {
		Ok(status) => ProcessSignal::Exited(status.code()),
		Err(e) => ProcessSignal::Failed(format!("wait failed: {}", e)),
	};
	let _ = signals.send(signal).await;
}

fn format_pid(pid: Option<u32>) -> String {
	pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
}

fn log_started(info: &SessionInfo, path: &Path, args: &[String]) {
	info!(
		"session {} ({}) started: {} {} (pid {})",
		info.name,
		info.id,
		path.display(),
		args.join(" "),
		format_pid(info.pid)
	);
}
