use std::path::PathBuf;
use thiserror::Error;

/// Failures that stop a session from being created or restarted.
///
/// Everything else (unknown ids, closed stdin, a process that dies after
/// launch) is reported through return values or [`SessionEvent`](crate::SessionEvent)s
/// and never as an error.
#[derive(Debug, Error)]
pub enum SupervisorError {
	#[error("could not locate executable `{program}` on the search path")]
	ExecutableNotFound { program: String },

	#[error("failed to spawn {}: {source}", path.display())]
	Spawn {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("session {id} is already restarting")]
	RestartInProgress { id: String },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
