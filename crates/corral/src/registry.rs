use std::collections::HashMap;

use crate::session::SessionRecord;

/// Session id → record. The single source of truth for which sessions exist.
///
/// Absence is a normal outcome here, never an error.
#[derive(Default)]
pub struct SessionRegistry {
	sessions: HashMap<String, SessionRecord>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records in no particular order.
	pub fn list(&self) -> impl Iterator<Item = &SessionRecord> {
		self.sessions.values()
	}

	pub fn list_mut(&mut self) -> impl Iterator<Item = &mut SessionRecord> {
		self.sessions.values_mut()
	}

	pub fn get(&self, id: &str) -> Option<&SessionRecord> {
		self.sessions.get(id)
	}

	pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionRecord> {
		self.sessions.get_mut(id)
	}

	/// Insert or replace the record stored under `id`.
	pub fn put(&mut self, id: String, record: SessionRecord) {
		self.sessions.insert(id, record);
	}

	pub fn remove(&mut self, id: &str) -> Option<SessionRecord> {
		self.sessions.remove(id)
	}

	pub fn contains(&self, id: &str) -> bool {
		self.sessions.contains_key(id)
	}

	pub fn ids(&self) -> Vec<String> {
		self.sessions.keys().cloned().collect()
	}

	/// Linear scan; session counts stay in the tens.
	pub fn find_by_external(&self, external_id: &str) -> Option<&SessionRecord> {
		self.sessions
			.values()
			.find(|r| r.external_session_id.as_deref() == Some(external_id))
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::output::OutputBuffer;
	use crate::session::{ProcessHandle, StopRequest};
	use crate::types::LaunchFlags;

	fn record(id: &str) -> SessionRecord {
		let (stop, _) = tokio::sync::watch::channel(StopRequest::Run);
		SessionRecord::new(
			id.to_string(),
			format!("name-{}", id),
			"/tmp".into(),
			LaunchFlags::default(),
			OutputBuffer::default(),
			ProcessHandle::new(id.to_string(), None, None, stop),
		)
	}

	#[test]
	fn put_get_remove() {
		let mut reg = SessionRegistry::new();
		reg.put("a".into(), record("a"));
		assert!(reg.get("a").is_some());
		assert!(reg.get("b").is_none());
		assert!(reg.remove("a").is_some());
		assert!(reg.remove("a").is_none());
		assert!(reg.is_empty());
	}

	#[test]
	fn put_replaces_existing() {
		let mut reg = SessionRegistry::new();
		reg.put("a".into(), record("a"));
		let mut replacement = record("a");
		replacement.name = "renamed".into();
		reg.put("a".into(), replacement);
		assert_eq!(reg.len(), 1);
		assert_eq!(reg.get("a").map(|r| r.name.as_str()), Some("renamed"));
	}

	#[test]
	fn find_by_external_scans_links() {
		let mut reg = SessionRegistry::new();
		let mut linked = record("a");
		linked.external_session_id = Some("ext-1".into());
		reg.put("a".into(), linked);
		reg.put("b".into(), record("b"));
		assert_eq!(reg.find_by_external("ext-1").map(|r| r.id.as_str()), Some("a"));
		assert!(reg.find_by_external("ext-2").is_none());
	}
}
