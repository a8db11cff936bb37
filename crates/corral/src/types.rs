use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where a session sits in its lifecycle.
///
/// `Idle`, `Working` and `Waiting` are reported by the caller through
/// [`Supervisor::update_status`](crate::Supervisor::update_status). The
/// supervisor itself only ever moves a session into or out of `Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
	Idle,
	Working,
	Waiting,
	Offline,
}

impl SessionStatus {
	pub fn is_online(self) -> bool {
		!matches!(self, SessionStatus::Offline)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			SessionStatus::Idle => "idle",
			SessionStatus::Working => "working",
			SessionStatus::Waiting => "waiting",
			SessionStatus::Offline => "offline",
		}
	}
}

impl fmt::Display for SessionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SessionStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"idle" => Ok(SessionStatus::Idle),
			"working" => Ok(SessionStatus::Working),
			"waiting" => Ok(SessionStatus::Waiting),
			"offline" => Ok(SessionStatus::Offline),
			other => Err(format!("unknown status: {}", other)),
		}
	}
}

/// Launch switches understood by the supervised agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchFlags {
	/// Resume the most recent conversation in the working directory.
	#[serde(default = "default_true")]
	pub continue_session: bool,
	/// Run without interactive permission prompts.
	#[serde(default = "default_true")]
	pub skip_permissions: bool,
	/// Enable the auxiliary browser integration.
	#[serde(default)]
	pub browser: bool,
}

fn default_true() -> bool {
	true
}

impl Default for LaunchFlags {
	fn default() -> Self {
		Self {
			continue_session: true,
			skip_permissions: true,
			browser: false,
		}
	}
}

impl LaunchFlags {
	/// Command-line arguments for these flags, in a stable order.
	pub fn to_args(&self) -> Vec<String> {
		let mut args = Vec::new();
		if self.continue_session {
			args.push("--continue".to_string());
		}
		if self.skip_permissions {
			args.push("--dangerously-skip-permissions".to_string());
		}
		if self.browser {
			args.push("--chrome".to_string());
		}
		args
	}
}

/// Parameters for [`Supervisor::create_session`](crate::Supervisor::create_session).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreateOptions {
	#[serde(default)]
	pub name: Option<String>,
	/// Defaults to the supervisor's own working directory when absent.
	#[serde(default)]
	pub working_dir: Option<PathBuf>,
	#[serde(default)]
	pub flags: LaunchFlags,
}

/// Point-in-time copy of a session record, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
	pub id: String,
	pub name: String,
	pub status: SessionStatus,
	pub working_dir: PathBuf,
	pub created_at: DateTime<Utc>,
	pub last_activity_at: DateTime<Utc>,
	pub external_session_id: Option<String>,
	pub pid: Option<u32>,
	pub exit_code: Option<i32>,
	pub output_lines: usize,
	pub flags: LaunchFlags,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_flags_translate_to_args() {
		let args = LaunchFlags::default().to_args();
		assert_eq!(args, vec!["--continue", "--dangerously-skip-permissions"]);
	}

	#[test]
	fn all_flags_off_yields_no_args() {
		let flags = LaunchFlags {
			continue_session: false,
			skip_permissions: false,
			browser: false,
		};
		assert!(flags.to_args().is_empty());
	}

	#[test]
	fn browser_flag_appends_chrome() {
		let flags = LaunchFlags {
			browser: true,
			..LaunchFlags::default()
		};
		assert_eq!(flags.to_args().last().map(String::as_str), Some("--chrome"));
	}

	#[test]
	fn status_serializes_lowercase() {
		let json = serde_json::to_string(&SessionStatus::Waiting).unwrap();
		assert_eq!(json, "\"waiting\"");
		let back: SessionStatus = serde_json::from_str("\"offline\"").unwrap();
		assert_eq!(back, SessionStatus::Offline);
	}

	#[test]
	fn status_parses_case_insensitively() {
		assert_eq!("Working".parse::<SessionStatus>(), Ok(SessionStatus::Working));
		assert!("busy".parse::<SessionStatus>().is_err());
	}

	#[test]
	fn missing_flags_fall_back_to_defaults() {
		let opts: CreateOptions = serde_json::from_str(r#"{"name":"a","flags":{}}"#).unwrap();
		assert_eq!(opts.flags, LaunchFlags::default());
		assert!(opts.working_dir.is_none());
	}
}
