//! Bounded ring of recent output lines

use std::collections::VecDeque;
use std::io::{self, Write};

/// Default number of lines retained per application
pub const DEFAULT_CAPACITY: usize = 1024;

/// Append-only buffer that keeps the most recent `capacity` lines
#[derive(Debug, Clone)]
pub struct LineBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
        }
    }

    /// Append a line, evicting the oldest one once full
    pub fn append(&mut self, line: impl Into<String>) {
        let mut line = line.into();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }

        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Write every retained line, newline-terminated, oldest first
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for line in &self.lines {
            writeln!(writer, "{}", line)?;
        }
        Ok(())
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

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_strips_trailing_newline() {
        let mut buf = LineBuffer::new(4);
        buf.append("hello\n");
        buf.append("world\r\n");

        let lines: Vec<&str> = buf.lines().collect();
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut buf = LineBuffer::new(2);
        buf.append("one");
        buf.append("two");
        buf.append("three");

        assert_eq!(buf.len(), 2);
        let lines: Vec<&str> = buf.lines().collect();
        assert_eq!(lines, vec!["two", "three"]);
    }

    #[test]
    fn test_write_to_renders_lines() {
        let mut buf = LineBuffer::new(8);
        buf.append("web_1  | Listening on 3000");
        buf.append("#event app_ready app=blog");

        let mut out = Vec::new();
        buf.write_to(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "web_1  | Listening on 3000\n#event app_ready app=blog\n"
        );
    }

    #[test]
    fn test_zero_capacity_keeps_one_line() {
        let mut buf = LineBuffer::new(0);
        buf.append("a");
        buf.append("b");
        assert_eq!(buf.len(), 1);
        assert!(!buf.is_empty());
    }
}
