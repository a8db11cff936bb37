//! OS process primitives the supervisor is built on.
//!
//! Everything platform specific lives behind [`Platform`] so the supervisor
//! never branches on the operating system itself. Tests substitute their own
//! implementation to spawn stand-in programs.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// How a soft interrupt reaches a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptStrategy {
	/// Deliver an OS-level interrupt signal to the process.
	Signal,
	/// Write the ETX control byte (0x03) to the process's stdin.
	ControlByte,
}

/// The byte an interactive CLI reads as ctrl-c.
pub const INTERRUPT_BYTE: u8 = 0x03;

#[derive(Debug, Clone)]
pub struct SpawnOptions {
	pub working_dir: PathBuf,
	/// Value for the child's `PATH`; the rest of the environment is inherited.
	pub search_path: String,
}

pub trait Platform: Send + Sync {
	/// Name of the supervised program, for diagnostics.
	fn program(&self) -> &str;

	/// Absolute location of the supervised program, if it can be found.
	fn resolve_executable(&self) -> Option<PathBuf>;

	/// `PATH` handed to spawned sessions.
	fn extended_search_path(&self) -> String;

	/// Start `path` with piped stdio.
	fn spawn(&self, path: &Path, args: &[String], options: &SpawnOptions) -> io::Result<Child>;

	/// Ask `pid` and every descendant to terminate. A process that is already
	/// gone counts as success.
	fn terminate_tree(&self, pid: u32) -> io::Result<()>;

	/// Forcibly kill what is left of the tree rooted at `pid`. Only called
	/// while the supervisor still owns the unreaped child, so `pid` cannot
	/// have been reused.
	fn force_kill_tree(&self, _pid: u32) -> io::Result<()> {
		Ok(())
	}

	/// How long a tree gets between [`terminate_tree`](Self::terminate_tree)
	/// and [`force_kill_tree`](Self::force_kill_tree).
	fn kill_grace(&self) -> Duration {
		Duration::from_secs(3)
	}

	fn is_alive(&self, pid: u32) -> bool;

	fn send_interrupt(&self, pid: u32) -> io::Result<()>;

	fn is_windows(&self) -> bool {
		cfg!(windows)
	}

	fn interrupt_strategy(&self) -> InterruptStrategy {
		if self.is_windows() {
			InterruptStrategy::ControlByte
		} else {
			InterruptStrategy::Signal
		}
	}
}

/// [`Platform`] backed by the host operating system.
#[derive(Debug, Clone)]
pub struct NativePlatform {
	program: String,
	extra_paths: Vec<PathBuf>,
	kill_grace: Duration,
}

impl NativePlatform {
	pub fn new(program: impl Into<String>) -> Self {
		Self {
			program: program.into(),
			extra_paths: Vec::new(),
			kill_grace: Duration::from_secs(3),
		}
	}

	pub fn with_extra_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
		self.extra_paths.extend(paths);
		self
	}

	/// Time between the polite termination signal and the forced kill.
	pub fn with_kill_grace(mut self, grace: Duration) -> Self {
		self.kill_grace = grace;
		self
	}

	fn search_dirs(&self) -> Vec<PathBuf> {
		let mut search: Vec<PathBuf> = std::env::var_os("PATH")
			.map(|p| std::env::split_paths(&p).collect())
			.unwrap_or_default();

		if let Some(home) = dirs::home_dir() {
			search.push(home.join(".local").join("bin"));
			search.push(home.join(".npm-global").join("bin"));
			search.push(home.join(".bun").join("bin"));
		}
		if !self.is_windows() {
			search.push(PathBuf::from("/usr/local/bin"));
			search.push(PathBuf::from("/opt/homebrew/bin"));
		}
		search.extend(self.extra_paths.iter().cloned());

		let mut seen = std::collections::HashSet::new();
		search.retain(|d| !d.as_os_str().is_empty() && seen.insert(d.clone()));
		search
	}
}

impl Platform for NativePlatform {
	fn program(&self) -> &str {
		&self.program
	}

	fn resolve_executable(&self) -> Option<PathBuf> {
		let program = Path::new(&self.program);
		if program.components().count() > 1 || program.is_absolute() {
			return program.is_file().then(|| program.to_path_buf());
		}

		let candidates: &[&str] = if self.is_windows() {
			&["", ".exe", ".cmd"]
		} else {
			&[""]
		};
		self.search_dirs().into_iter().find_map(|dir| {
			candidates.iter().find_map(|ext| {
				let candidate = dir.join(format!("{}{}", self.program, ext));
				candidate.is_file().then_some(candidate)
			})
		})
	}

	fn extended_search_path(&self) -> String {
		match std::env::join_paths(self.search_dirs()) {
			Ok(joined) => joined.to_string_lossy().into_owned(),
			Err(e) => {
				tracing::warn!("could not build search path: {}", e);
				std::env::var("PATH").unwrap_or_default()
			}
		}
	}

	fn spawn(&self, path: &Path, args: &[String], options: &SpawnOptions) -> io::Result<Child> {
		let mut cmd = Command::new(path);
		cmd.args(args)
			.current_dir(&options.working_dir)
			.env("PATH", &options.search_path)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());

		#[cfg(unix)]
		cmd.process_group(0);

		cmd.spawn()
	}

	#[cfg(unix)]
	fn terminate_tree(&self, pid: u32) -> io::Result<()> {
		use nix::errno::Errno;
		use nix::sys::signal::{killpg, Signal};
		use nix::unistd::Pid;

		match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
			Ok(()) | Err(Errno::ESRCH) => Ok(()),
			Err(e) => Err(io::Error::from(e)),
		}
	}

	#[cfg(unix)]
	fn force_kill_tree(&self, pid: u32) -> io::Result<()> {
		use nix::errno::Errno;
		use nix::sys::signal::{killpg, Signal};
		use nix::unistd::Pid;

		match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
			Ok(()) | Err(Errno::ESRCH) => Ok(()),
			Err(e) => Err(io::Error::from(e)),
		}
	}

	fn kill_grace(&self) -> Duration {
		self.kill_grace
	}

	#[cfg(windows)]
	fn terminate_tree(&self, pid: u32) -> io::Result<()> {
		// A plain kill leaves grandchildren behind on Windows.
		let status = std::process::Command::new("taskkill")
			.args(["/T", "/F", "/PID", &pid.to_string()])
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status()?;
		// 128: no such process
		if status.success() || status.code() == Some(128) {
			Ok(())
		} else {
			Err(io::Error::new(
				io::ErrorKind::Other,
				format!("taskkill exited with {}", status),
			))
		}
	}

	#[cfg(unix)]
	fn is_alive(&self, pid: u32) -> bool {
		use nix::errno::Errno;
		use nix::sys::signal::kill;
		use nix::unistd::Pid;

		match kill(Pid::from_raw(pid as i32), None) {
			Ok(()) => true,
			Err(Errno::EPERM) => true,
			Err(_) => false,
		}
	}

	#[cfg(windows)]
	fn is_alive(&self, pid: u32) -> bool {
		std::process::Command::new("tasklist")
			.args(["/FI", &format!("PID eq {}", pid), "/NH"])
			.output()
			.map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
			.unwrap_or(false)
	}

	#[cfg(unix)]
	fn send_interrupt(&self, pid: u32) -> io::Result<()> {
		use nix::sys::signal::{kill, Signal};
		use nix::unistd::Pid;

		kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(io::Error::from)
	}

	#[cfg(windows)]
	fn send_interrupt(&self, _pid: u32) -> io::Result<()> {
		Err(io::Error::new(
			io::ErrorKind::Unsupported,
			"no interrupt signal on this platform",
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extra_paths_are_searched() {
		let dir = tempfile::tempdir().unwrap();
		let platform = NativePlatform::new("definitely-not-a-real-agent")
			.with_extra_paths([dir.path().to_path_buf()]);
		assert!(platform.resolve_executable().is_none());

		let exe = dir.path().join("definitely-not-a-real-agent");
		std::fs::write(&exe, "#!/bin/sh\n").unwrap();
		assert_eq!(platform.resolve_executable(), Some(exe));
	}

	#[test]
	fn explicit_path_must_exist() {
		let platform = NativePlatform::new("/nonexistent/dir/agent");
		assert!(platform.resolve_executable().is_none());
	}

	#[test]
	fn search_path_contains_extras_once() {
		let extra = PathBuf::from("/opt/corral-test/bin");
		let platform = NativePlatform::new("x").with_extra_paths([extra.clone(), extra.clone()]);
		let joined = platform.extended_search_path();
		let count = std::env::split_paths(&joined).filter(|p| p == &extra).count();
		assert_eq!(count, 1);
	}

	#[cfg(unix)]
	#[test]
	fn unix_interrupts_with_signal() {
		assert_eq!(
			NativePlatform::new("x").interrupt_strategy(),
			InterruptStrategy::Signal
		);
	}

	#[cfg(unix)]
	#[test]
	fn terminating_missing_group_succeeds() {
		// pid far above any realistic pid_max
		let platform = NativePlatform::new("x");
		assert!(platform.terminate_tree(999_999_999).is_ok());
		assert!(platform.force_kill_tree(999_999_999).is_ok());
	}

	#[test]
	fn kill_grace_is_configurable() {
		assert_eq!(NativePlatform::new("x").kill_grace(), Duration::from_secs(3));
		let platform = NativePlatform::new("x").with_kill_grace(Duration::from_millis(250));
		assert_eq!(platform.kill_grace(), Duration::from_millis(250));
	}
}
