//! Bounded capture of process output

use std::collections::VecDeque;

/// Append-only output capture that keeps the most recent `limit` chunks
#[derive(Debug)]
pub struct OutputBuffer {
    limit: usize,
    chunks: VecDeque<String>,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            chunks: VecDeque::new(),
        }
    }

    pub fn push(&mut self, chunk: String) {
        self.chunks.push_back(chunk);
        while self.chunks.len() > self.limit {
            self.chunks.pop_front();
        }
    }

    /// All retained chunks, oldest first
    pub fn chunks(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_keeps_most_recent() {
        let mut buffer = OutputBuffer::new(2);
        buffer.push("a\n".into());
        buffer.push("b\n".into());
        buffer.push("c\n".into());

        assert_eq!(buffer.chunks(), vec!["b\n".to_string(), "c\n".to_string()]);
    }

    #[test]
    fn test_zero_limit_still_keeps_one() {
        let mut buffer = OutputBuffer::new(0);
        buffer.push("only".into());
        assert_eq!(buffer.chunks(), vec!["only".to_string()]);
    }
}
