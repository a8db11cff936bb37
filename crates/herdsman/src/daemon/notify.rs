use corral::{SessionEvent, SessionStatus, Supervisor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Body POSTed to the dashboard for each lifecycle event.
#[derive(Debug, Serialize, PartialEq)]
pub struct Notification<'a> {
	pub event: &'static str,
	pub session_id: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<SessionStatus>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<i32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<&'a str>,
}

impl<'a> Notification<'a> {
	/// Output events are too chatty for the dashboard and map to `None`.
	pub fn from_event(event: &'a SessionEvent) -> Option<Self> {
		let base = |name: &'static str| Notification {
			event: name,
			session_id: event.session_id(),
			status: None,
			code: None,
			message: None,
		};
		match event {
			SessionEvent::Output { .. } => None,
			SessionEvent::StatusChange { status, .. } => Some(Notification {
				status: Some(*status),
				..base("status_change")
			}),
			SessionEvent::Exit { code, .. } => Some(Notification {
				code: *code,
				..base("exit")
			}),
			SessionEvent::Error { message, .. } => Some(Notification {
				message: Some(message),
				..base("error")
			}),
		}
	}
}

/// Forward lifecycle events to `url` until the event channel closes.
pub async fn run(supervisor: Arc<Supervisor>, url: String) {
	let mut events = supervisor.subscribe();
	drop(supervisor);

	let client = match reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build() {
		Ok(c) => c,
		Err(e) => {
			tracing::warn!("dashboard notifications disabled: {}", e);
			return;
		}
	};
	tracing::info!("notifying dashboard at {}", url);

	loop {
		let event = match events.recv().await {
			Ok(event) => event,
			Err(RecvError::Lagged(skipped)) => {
				tracing::warn!("dashboard notifier skipped {} events", skipped);
				continue;
			}
			Err(RecvError::Closed) => return,
		};

		let Some(body) = Notification::from_event(&event) else {
			continue;
		};

		match client.post(&url).json(&body).send().await {
			Ok(resp) if !resp.status().is_success() => {
				tracing::warn!("dashboard rejected {} for {}: {}", body.event, body.session_id, resp.status());
			}
			Ok(_) => {}
			Err(e) => tracing::warn!("dashboard notify failed: {}", e),
		}
	}
}
