use std::collections::VecDeque;
use std::sync::RwLock;

const DEFAULT_MAX_LINES: usize = 2_000;

/// Ring buffer for captured stdout/stderr lines of the supervised service.
pub struct LogBuffer {
    max_lines: usize,
    lines: RwLock<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: RwLock::new(VecDeque::new()),
        }
    }

    /// Append a line, evicting the oldest when over capacity.
    pub fn push(&self, line: String) {
        let mut lines = match self.lines.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push_back(line);
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = match self.lines.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = lines.len().saturating_sub(n);
        lines.iter().skip(start).cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_last_n_lines() {
        let buf = LogBuffer::new(100);
        for i in 0..10 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.tail(3), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn evicts_oldest() {
        let buf = LogBuffer::new(5);
        for i in 0..10 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(
            buf.tail(100),
            vec!["line 5", "line 6", "line 7", "line 8", "line 9"]
        );
    }
}
