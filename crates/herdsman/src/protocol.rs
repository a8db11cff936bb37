use corral::{CreateOptions, SessionInfo, SessionStatus};
use serde::{Deserialize, Serialize};

/// One line on the daemon socket, client to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
	List,
	Get { id: String },
	Output {
		id: String,
		#[serde(default)]
		lines: Option<usize>,
	},
	Create {
		#[serde(default)]
		options: CreateOptions,
	},
	Input { id: String, text: String },
	Interrupt { id: String },
	Kill { id: String },
	Restart { id: String },
	SetStatus { id: String, status: SessionStatus },
	Link { id: String, external_id: String },
	FindExternal { external_id: String },
	Cleanup,
	Ping,
	Shutdown,
}

/// One line on the daemon socket, daemon to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
	Ok { message: Option<String> },
	Sessions { sessions: Vec<SessionInfo> },
	Session { session: SessionInfo },
	Output { text: String },
	Cleaned { count: usize },
	NotFound { id: String },
	Error { message: String },
	Pong { pid: u32 },
}

impl Response {
	pub fn ok(message: impl Into<String>) -> Self {
		Response::Ok { message: Some(message.into()) }
	}

	pub fn not_found(id: impl Into<String>) -> Self {
		Response::NotFound { id: id.into() }
	}

	pub fn error(message: impl Into<String>) -> Self {
		Response::Error { message: message.into() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use corral::LaunchFlags;

	#[test]
	fn requests_are_tagged_by_cmd() {
		let json = serde_json::to_string(&Request::Kill { id: "abc".into() }).unwrap();
		assert_eq!(json, r#"{"cmd":"kill","id":"abc"}"#);

		let req: Request = serde_json::from_str(r#"{"cmd":"set_status","id":"a","status":"working"}"#).unwrap();
		assert_eq!(req, Request::SetStatus { id: "a".into(), status: SessionStatus::Working });
	}

	#[test]
	fn create_options_default_when_partial() {
		let req: Request = serde_json::from_str(r#"{"cmd":"create","options":{"name":"api"}}"#).unwrap();
		match req {
			Request::Create { options } => {
				assert_eq!(options.name.as_deref(), Some("api"));
				assert!(options.working_dir.is_none());
				assert_eq!(options.flags, LaunchFlags::default());
			}
			other => panic!("unexpected request: {:?}", other),
		}

		let bare: Request = serde_json::from_str(r#"{"cmd":"create"}"#).unwrap();
		assert!(matches!(bare, Request::Create { ref options } if options.name.is_none()));
	}

	#[test]
	fn output_lines_are_optional() {
		let req: Request = serde_json::from_str(r#"{"cmd":"output","id":"a"}"#).unwrap();
		assert_eq!(req, Request::Output { id: "a".into(), lines: None });
	}

	#[test]
	fn unknown_status_is_rejected() {
		let res = serde_json::from_str::<Request>(r#"{"cmd":"set_status","id":"a","status":"busy"}"#);
		assert!(res.is_err());
	}

	#[test]
	fn responses_are_tagged_by_type() {
		let json = serde_json::to_string(&Response::not_found("x")).unwrap();
		assert_eq!(json, r#"{"type":"not_found","id":"x"}"#);
		let back: Response = serde_json::from_str(r#"{"type":"cleaned","count":2}"#).unwrap();
		assert_eq!(back, Response::Cleaned { count: 2 });
	}
}
