use std::path::PathBuf;

const APP_NAME: &str = "herdsman";

/// Filesystem locations shared by the daemon and the CLI.
#[derive(Debug, Clone)]
pub struct Paths {
	state: PathBuf,
	config: PathBuf,
}

impl Paths {
	/// Resolve from `XDG_STATE_HOME` / `XDG_CONFIG_HOME`, falling back to
	/// `~/.local/state` and `~/.config` on every platform.
	pub fn resolve() -> Self {
		let home = dirs::home_dir();
		let state = xdg_or("XDG_STATE_HOME", home.as_ref().map(|h| h.join(".local").join("state")));
		let config = xdg_or("XDG_CONFIG_HOME", home.as_ref().map(|h| h.join(".config")));
		Self {
			state: state.join(APP_NAME),
			config: config.join(APP_NAME),
		}
	}

	#[cfg(test)]
	pub fn at(state: impl Into<PathBuf>, config: impl Into<PathBuf>) -> Self {
		Self {
			state: state.into(),
			config: config.into(),
		}
	}

	pub fn state_dir(&self) -> &PathBuf {
		&self.state
	}

	pub fn config_file(&self) -> PathBuf {
		self.config.join("config.toml")
	}

	pub fn socket_path(&self) -> PathBuf {
		self.state.join("daemon.sock")
	}

	pub fn pid_path(&self) -> PathBuf {
		self.state.join("daemon.pid")
	}

	pub fn log_dir(&self) -> PathBuf {
		self.state.join("logs")
	}

	pub fn read_pid(&self) -> Option<u32> {
		std::fs::read_to_string(self.pid_path())
			.ok()
			.and_then(|s| s.trim().parse().ok())
	}
}

fn xdg_or(var: &str, fallback: Option<PathBuf>) -> PathBuf {
	match std::env::var_os(var) {
		Some(dir) if !dir.is_empty() => PathBuf::from(dir),
		_ => fallback.unwrap_or_else(std::env::temp_dir),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn derived_paths_live_under_state_dir() {
		let paths = Paths::at("/tmp/h/state", "/tmp/h/config");
		assert_eq!(paths.socket_path(), PathBuf::from("/tmp/h/state/daemon.sock"));
		assert_eq!(paths.pid_path(), PathBuf::from("/tmp/h/state/daemon.pid"));
		assert_eq!(paths.log_dir(), PathBuf::from("/tmp/h/state/logs"));
		assert_eq!(paths.config_file(), PathBuf::from("/tmp/h/config/config.toml"));
	}

	#[test]
	fn missing_pid_file_reads_as_none() {
		let dir = tempfile::tempdir().unwrap();
		let paths = Paths::at(dir.path(), dir.path());
		assert_eq!(paths.read_pid(), None);
		std::fs::write(paths.pid_path(), "4242\n").unwrap();
		assert_eq!(paths.read_pid(), Some(4242));
	}
}
