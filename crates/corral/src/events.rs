use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::SessionStatus;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle notifications published by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
	Output { session_id: String, text: String },
	StatusChange { session_id: String, status: SessionStatus },
	/// `code` is `None` when the process was killed by a signal.
	Exit { session_id: String, code: Option<i32> },
	Error { session_id: String, message: String },
}

impl SessionEvent {
	pub fn session_id(&self) -> &str {
		match self {
			SessionEvent::Output { session_id, .. }
			| SessionEvent::StatusChange { session_id, .. }
			| SessionEvent::Exit { session_id, .. }
			| SessionEvent::Error { session_id, .. } => session_id,
		}
	}
}

/// Fan-out of [`SessionEvent`]s to any number of subscribers.
///
/// Publishing never blocks; a subscriber that falls more than the channel
/// capacity behind sees `RecvError::Lagged` and skips ahead. Dropping the
/// receiver unsubscribes.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		Self { sender }
	}

	pub fn publish(&self, event: SessionEvent) {
		// No receivers is fine.
		let _ = self.sender.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.sender.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}
