//! Transcript file naming and retention.
//!
//! Each session writes to `<log dir>/<name>/<name> YY-MMDD.log`. A file that
//! outgrows its size cap is renamed to `<name> YY-MMDD HH.log` (or
//! `HH.MM.log` if that is taken) and a fresh one started.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};

const DATE_FORMAT: &str = "%y-%m%d";

/// Session names come from users; keep them to one path component.
pub fn sanitize_name(name: &str) -> String {
	let cleaned: String = name
		.trim()
		.chars()
		.map(|c| if c == '/' || c == '\\' || c.is_control() { '-' } else { c })
		.collect();
	match cleaned.as_str() {
		"" | "." | ".." => "session".to_string(),
		_ => cleaned,
	}
}

pub fn session_log_dir(log_dir: &Path, name: &str) -> PathBuf {
	log_dir.join(sanitize_name(name))
}

pub fn current_log_name(name: &str, today: NaiveDate) -> String {
	format!("{} {}.log", sanitize_name(name), today.format(DATE_FORMAT))
}

pub fn rotated_log_name(dir: &Path, name: &str, now: NaiveDateTime) -> String {
	let name = sanitize_name(name);
	let date = now.format(DATE_FORMAT);
	let candidate = format!("{} {} {}.log", name, date, now.format("%H"));
	if dir.join(&candidate).exists() {
		format!("{} {} {}.log", name, date, now.format("%H.%M"))
	} else {
		candidate
	}
}

/// The date stamped into a transcript file name, if it has one.
pub fn parse_log_date(filename: &str) -> Option<NaiveDate> {
	let stem = filename.strip_suffix(".log")?;
	stem.split(' ')
		.skip(1)
		.find_map(|part| NaiveDate::parse_from_str(part, DATE_FORMAT).ok())
}

/// Apply retention to every session directory under `log_dir`.
pub fn expire_logs(log_dir: &Path, max_age_days: u32, max_files: u32, today: NaiveDate) -> usize {
	let entries = match std::fs::read_dir(log_dir) {
		Ok(e) => e,
		Err(_) => return 0,
	};

	entries
		.flatten()
		.map(|entry| entry.path())
		.filter(|path| path.is_dir())
		.map(|dir| expire_session_logs(&dir, max_age_days, max_files, today))
		.sum()
}

fn expire_session_logs(dir: &Path, max_age_days: u32, max_files: u32, today: NaiveDate) -> usize {
	let entries = match std::fs::read_dir(dir) {
		Ok(e) => e,
		Err(_) => return 0,
	};

	let mut log_files: Vec<(PathBuf, Option<NaiveDate>)> = entries
		.flatten()
		.map(|entry| entry.path())
		.filter(|path| path.extension().and_then(|e| e.to_str()) == Some("log"))
		.map(|path| {
			let date = path.file_name().and_then(|n| n.to_str()).and_then(parse_log_date);
			(path, date)
		})
		.collect();

	let mut removed = 0;

	if max_age_days > 0 {
		let cutoff = today - Duration::days(i64::from(max_age_days));
		log_files.retain(|(path, date)| match date {
			Some(date) if *date < cutoff => {
				if std::fs::remove_file(path).is_ok() {
					removed += 1;
				}
				false
			}
			_ => true,
		});
	}

	if max_files > 0 && log_files.len() > max_files as usize {
		log_files.sort_by_key(|(path, date)| {
			let modified = path.metadata().and_then(|m| m.modified()).ok();
			(*date, modified)
		});
		let excess = log_files.len() - max_files as usize;
		for (path, _) in log_files.iter().take(excess) {
			if std::fs::remove_file(path).is_ok() {
				removed += 1;
			}
		}
	}

	removed
}

#[cfg(test)]
mod tests {
	use super::*;

	fn date(y: i32, m: u32, d: u32) -> NaiveDate {
		NaiveDate::from_ymd_opt(y, m, d).unwrap()
	}

	#[test]
	fn parse_log_date_handles_rotated_names() {
		assert_eq!(parse_log_date("api 26-0214.log"), Some(date(2026, 2, 14)));
		assert_eq!(parse_log_date("api 26-0214 09.log"), Some(date(2026, 2, 14)));
		assert_eq!(parse_log_date("api 26-0214 09.47.log"), Some(date(2026, 2, 14)));
		assert_eq!(parse_log_date("my agent 26-1031.log"), Some(date(2026, 10, 31)));
		assert_eq!(parse_log_date("invalid"), None);
		assert_eq!(parse_log_date("api.log"), None);
	}

	#[test]
	fn names_are_one_path_component() {
		assert_eq!(sanitize_name("../etc/passwd"), "..-etc-passwd");
		assert_eq!(sanitize_name(".."), "session");
		assert_eq!(sanitize_name("  "), "session");
		assert_eq!(current_log_name("api", date(2026, 3, 5)), "api 26-0305.log");
	}

	#[test]
	fn rotated_name_avoids_collisions() {
		let dir = tempfile::tempdir().unwrap();
		let now = date(2026, 3, 5).and_hms_opt(9, 47, 0).unwrap();
		let first = rotated_log_name(dir.path(), "api", now);
		assert_eq!(first, "api 26-0305 09.log");
		std::fs::write(dir.path().join(&first), "").unwrap();
		assert_eq!(rotated_log_name(dir.path(), "api", now), "api 26-0305 09.47.log");
	}

	#[test]
	fn expiry_drops_old_files_then_caps_count() {
		let root = tempfile::tempdir().unwrap();
		let dir = root.path().join("api");
		std::fs::create_dir_all(&dir).unwrap();
		for name in [
			"api 26-0101.log",
			"api 26-0310.log",
			"api 26-0311.log",
			"api 26-0312.log",
			"notes.txt",
		] {
			std::fs::write(dir.join(name), "x").unwrap();
		}

		let removed = expire_logs(root.path(), 7, 2, date(2026, 3, 12));
		assert_eq!(removed, 2);

		let mut left: Vec<String> = std::fs::read_dir(&dir)
			.unwrap()
			.flatten()
			.map(|e| e.file_name().to_string_lossy().to_string())
			.collect();
		left.sort();
		assert_eq!(left, vec!["api 26-0311.log", "api 26-0312.log", "notes.txt"]);
	}

	#[test]
	fn missing_log_dir_is_not_an_error() {
		let root = tempfile::tempdir().unwrap();
		assert_eq!(expire_logs(&root.path().join("absent"), 7, 5, date(2026, 1, 1)), 0);
	}
}
