use chrono::Utc;
use shellgate_types::{OutputChunk, OutputKind};
use std::collections::VecDeque;

/// Append-only output history for one session, truncated from the front
/// once it holds more than `limit` bytes of text.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
    limit: usize,
    next_seq: u64,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            limit,
            next_seq: 1,
        }
    }

    /// Record a chunk and return it with its sequence number
    pub fn push(&mut self, kind: OutputKind, data: impl Into<String>) -> OutputChunk {
        let chunk = OutputChunk {
            seq: self.next_seq,
            kind,
            data: data.into(),
            timestamp: Utc::now(),
        };
        self.next_seq += 1;
        self.bytes += chunk.data.len();
        self.chunks.push_back(chunk.clone());

        // The newest chunk always survives
        while self.bytes > self.limit && self.chunks.len() > 1 {
            if let Some(dropped) = self.chunks.pop_front() {
                self.bytes -= dropped.data.len();
            }
        }
        chunk
    }

    /// Chunks with `seq` greater than `after`, oldest first
    pub fn since(&self, after: u64) -> Vec<OutputChunk> {
        self.chunks
            .iter()
            .filter(|c| c.seq > after)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }

    /// Sequence number of the most recent chunk, 0 before any output
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_increase() {
        let mut buffer = OutputBuffer::new(1024);
        let a = buffer.push(OutputKind::Stdout, "a");
        let b = buffer.push(OutputKind::Stderr, "b");
        assert_eq!((a.seq, b.seq), (1, 2));
        assert_eq!(buffer.last_seq(), 2);
        assert_eq!(buffer.since(1), vec![b]);
    }

    #[test]
    fn test_truncates_oldest_first() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push(OutputKind::Stdout, "12345");
        buffer.push(OutputKind::Stdout, "67890");
        buffer.push(OutputKind::Stdout, "abc");

        let kept: Vec<String> = buffer.snapshot().into_iter().map(|c| c.data).collect();
        assert_eq!(kept, vec!["67890".to_string(), "abc".to_string()]);
        assert_eq!(buffer.len_bytes(), 8);
        // seq keeps counting across truncation
        assert_eq!(buffer.last_seq(), 3);
    }

    #[test]
    fn test_oversized_chunk_is_kept() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push(OutputKind::Stdout, "ab");
        buffer.push(OutputKind::Stdout, "a long line");
        assert_eq!(buffer.snapshot().len(), 1);
    }
}
