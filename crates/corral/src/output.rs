use std::collections::VecDeque;

/// Lines kept per session before the oldest are evicted.
pub const OUTPUT_CAPACITY: usize = 500;

/// Prefix applied to lines read from a session's stderr.
pub const STDERR_PREFIX: &str = "[stderr] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
	Stdout,
	Stderr,
}

/// Bounded FIFO of the most recent output lines of one session.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
	lines: VecDeque<String>,
	capacity: usize,
	/// Stream whose last line has not seen its terminator yet.
	open: Option<Stream>,
}

impl OutputBuffer {
	pub fn new(capacity: usize) -> Self {
		Self {
			lines: VecDeque::with_capacity(capacity.min(OUTPUT_CAPACITY)),
			capacity,
			open: None,
		}
	}

	/// Split `chunk` on line boundaries and append each line.
	///
	/// Text after the last newline stays open and is continued by the next
	/// chunk from the same stream, so reads that split a line do not split
	/// the entry. `\r\n` endings are normalised.
	pub fn push_chunk(&mut self, chunk: &str) {
		self.push_lines(chunk, Stream::Stdout);
	}

	/// Like [`push_chunk`](Self::push_chunk), tagging every line as stderr.
	pub fn push_stderr(&mut self, chunk: &str) {
		self.push_lines(chunk, Stream::Stderr);
	}

	fn push_lines(&mut self, chunk: &str, stream: Stream) {
		if chunk.is_empty() {
			return;
		}
		let prefix = match stream {
			Stream::Stdout => "",
			Stream::Stderr => STDERR_PREFIX,
		};
		let terminated = chunk.ends_with('\n');
		let mut parts: Vec<&str> = chunk.split('\n').collect();
		if terminated {
			parts.pop();
		}
		let last = parts.len().saturating_sub(1);

		for (i, part) in parts.into_iter().enumerate() {
			let continues = i == 0 && self.open == Some(stream) && !self.lines.is_empty();
			if continues {
				if let Some(line) = self.lines.back_mut() {
					line.push_str(part);
				}
			} else {
				self.lines.push_back(format!("{}{}", prefix, part));
			}
			if i < last || terminated {
				if let Some(line) = self.lines.back_mut() {
					if line.ends_with('\r') {
						line.pop();
					}
				}
			}
		}
		self.open = if terminated { None } else { Some(stream) };

		while self.lines.len() > self.capacity {
			self.lines.pop_front();
		}
	}

	/// The last `max_lines` lines (or everything) joined with `\n`.
	pub fn tail(&self, max_lines: Option<usize>) -> String {
		let skip = match max_lines {
			Some(n) => self.lines.len().saturating_sub(n),
			None => 0,
		};
		self.lines
			.iter()
			.skip(skip)
			.map(String::as_str)
			.collect::<Vec<_>>()
			.join("\n")
	}

	pub fn lines(&self) -> impl Iterator<Item = &str> {
		self.lines.iter().map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.lines.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lines.is_empty()
	}
}

impl Default for OutputBuffer {
	fn default() -> Self {
		Self::new(OUTPUT_CAPACITY)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn multi_line_chunk_enqueues_each_line() {
		let mut buf = OutputBuffer::default();
		buf.push_chunk("one\ntwo\r\nthree\n");
		assert_eq!(buf.lines().collect::<Vec<_>>(), vec!["one", "two", "three"]);
	}

	#[test]
	fn evicts_oldest_beyond_capacity() {
		let mut buf = OutputBuffer::default();
		for i in 1..=501 {
			buf.push_chunk(&format!("line {}\n", i));
		}
		assert_eq!(buf.len(), OUTPUT_CAPACITY);
		assert_eq!(buf.lines().next(), Some("line 2"));
		assert_eq!(buf.lines().last(), Some("line 501"));
	}

	#[test]
	fn large_single_chunk_is_capped() {
		let mut buf = OutputBuffer::new(3);
		buf.push_chunk("a\nb\nc\nd\ne");
		assert_eq!(buf.tail(None), "c\nd\ne");
	}

	#[test]
	fn tail_limits_to_most_recent() {
		let mut buf = OutputBuffer::default();
		buf.push_chunk("a\nb\nc");
		assert_eq!(buf.tail(Some(2)), "b\nc");
		assert_eq!(buf.tail(Some(10)), "a\nb\nc");
		assert_eq!(buf.tail(Some(0)), "");
	}

	#[test]
	fn tail_does_not_mutate() {
		let mut buf = OutputBuffer::default();
		buf.push_chunk("x\ny");
		let _ = buf.tail(Some(1));
		assert_eq!(buf.len(), 2);
	}

	#[test]
	fn stderr_lines_are_tagged() {
		let mut buf = OutputBuffer::default();
		buf.push_stderr("boom\n");
		assert_eq!(buf.tail(None), "[stderr] boom");
	}

	#[test]
	fn split_line_is_joined_across_chunks() {
		let mut buf = OutputBuffer::default();
		buf.push_chunk("hel");
		buf.push_chunk("lo\nwor");
		buf.push_chunk("ld\r\n");
		assert_eq!(buf.lines().collect::<Vec<_>>(), vec!["hello", "world"]);
	}

	#[test]
	fn stderr_does_not_continue_open_stdout_line() {
		let mut buf = OutputBuffer::default();
		buf.push_chunk("prompt> ");
		buf.push_stderr("warn\n");
		buf.push_chunk("answer\n");
		assert_eq!(
			buf.lines().collect::<Vec<_>>(),
			vec!["prompt> ", "[stderr] warn", "answer"]
		);
	}

	#[test]
	fn empty_chunk_adds_nothing() {
		let mut buf = OutputBuffer::default();
		buf.push_chunk("");
		assert!(buf.is_empty());
	}
}
