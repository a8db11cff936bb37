use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Global config (~/.config/herdsman/config.toml) ──────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalConfig {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default)]
	pub agent: AgentConfig,
	#[serde(default)]
	pub supervisor: SupervisorSection,
	#[serde(default)]
	pub logs: LogsConfig,
	#[serde(default)]
	pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	#[serde(default = "default_port")]
	pub port: u16,
	/// Serve the HTTP API alongside the socket.
	#[serde(default)]
	pub http: bool,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self { port: default_port(), http: false }
	}
}

fn default_port() -> u16 { 13370 }

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
	#[serde(default = "default_program")]
	pub program: String,
	/// Searched after PATH and the usual user-local bin directories.
	#[serde(default)]
	pub extra_paths: Vec<String>,
}

impl Default for AgentConfig {
	fn default() -> Self {
		Self { program: default_program(), extra_paths: Vec::new() }
	}
}

impl AgentConfig {
	pub fn extra_paths(&self) -> Vec<PathBuf> {
		self.extra_paths.iter().map(|p| expand_tilde(p)).collect()
	}
}

fn default_program() -> String { "claude".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
	#[serde(default = "default_health_interval")]
	pub health_interval_secs: u64,
	#[serde(default = "default_kill_grace")]
	pub kill_grace_secs: u64,
}

impl Default for SupervisorSection {
	fn default() -> Self {
		Self {
			health_interval_secs: default_health_interval(),
			kill_grace_secs: default_kill_grace(),
		}
	}
}

impl SupervisorSection {
	pub fn health_interval(&self) -> Duration {
		Duration::from_secs(self.health_interval_secs.max(1))
	}

	pub fn kill_grace(&self) -> Duration {
		Duration::from_secs(self.kill_grace_secs)
	}
}

fn default_health_interval() -> u64 { 5 }
fn default_kill_grace() -> u64 { 3 }

#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_max_size")]
	pub max_size_bytes: u64,
	#[serde(default = "default_max_age_days")]
	pub max_age_days: u32,
	#[serde(default = "default_max_files")]
	pub max_files: u32,
}

impl Default for LogsConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			max_size_bytes: default_max_size(),
			max_age_days: default_max_age_days(),
			max_files: default_max_files(),
		}
	}
}

fn default_true() -> bool { true }
fn default_max_size() -> u64 { 10 * 1024 * 1024 }
fn default_max_age_days() -> u32 { 7 }
fn default_max_files() -> u32 { 5 }

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifyConfig {
	/// Dashboard endpoint that receives lifecycle events.
	pub url: Option<String>,
}

/// Read the config file. A missing file is the default config; an unreadable
/// or malformed one is reported and then ignored.
pub fn load_global_config(path: &Path) -> GlobalConfig {
	if path.exists() {
		match std::fs::read_to_string(path) {
			Ok(content) => match toml::from_str(&content) {
				Ok(config) => return config,
				Err(e) => eprintln!("warning: failed to parse {}: {}", path.display(), e),
			},
			Err(e) => eprintln!("warning: failed to read {}: {}", path.display(), e),
		}
	}
	GlobalConfig::default()
}

pub fn expand_tilde(path: &str) -> PathBuf {
	if let Some(rest) = path.strip_prefix("~/") {
		if let Some(home) = dirs::home_dir() {
			return home.join(rest);
		}
	}
	PathBuf::from(path)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_gives_defaults() {
		let config: GlobalConfig = toml::from_str("").unwrap();
		assert_eq!(config.daemon.port, 13370);
		assert!(!config.daemon.http);
		assert_eq!(config.agent.program, "claude");
		assert_eq!(config.supervisor.health_interval(), Duration::from_secs(5));
		assert_eq!(config.supervisor.kill_grace(), Duration::from_secs(3));
		assert!(config.logs.enabled);
		assert_eq!(config.logs.max_size_bytes, 10 * 1024 * 1024);
		assert!(config.notify.url.is_none());
	}

	#[test]
	fn partial_sections_keep_other_defaults() {
		let config: GlobalConfig = toml::from_str(
			r#"
			[daemon]
			http = true

			[agent]
			program = "/opt/agent/bin/agent"
			extra_paths = ["/opt/agent/bin"]

			[notify]
			url = "http://127.0.0.1:8080/events"
			"#,
		)
		.unwrap();
		assert!(config.daemon.http);
		assert_eq!(config.daemon.port, 13370);
		assert_eq!(config.agent.extra_paths(), vec![PathBuf::from("/opt/agent/bin")]);
		assert_eq!(config.notify.url.as_deref(), Some("http://127.0.0.1:8080/events"));
		assert_eq!(config.logs.max_files, 5);
	}

	#[test]
	fn zero_health_interval_is_clamped() {
		let config: GlobalConfig = toml::from_str("[supervisor]\nhealth_interval_secs = 0\n").unwrap();
		assert_eq!(config.supervisor.health_interval(), Duration::from_secs(1));
	}

	#[test]
	fn malformed_file_falls_back_to_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		std::fs::write(&path, "[daemon\nport = ").unwrap();
		let config = load_global_config(&path);
		assert_eq!(config.daemon.port, 13370);
	}

	#[test]
	fn missing_file_gives_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let config = load_global_config(&dir.path().join("absent.toml"));
		assert_eq!(config.agent.program, "claude");
	}
}
