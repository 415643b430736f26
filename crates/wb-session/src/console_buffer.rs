use std::collections::VecDeque;
use wb_core::ConsoleLine;

/// Bounded FIFO of console lines; pushing past capacity drops the oldest.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    lines: VecDeque<ConsoleLine>,
    capacity: usize,
    dropped: u64,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: ConsoleLine) {
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines dropped from the front since the buffer was created.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsoleLine> {
        self.lines.iter()
    }

    pub fn to_vec(&self) -> Vec<ConsoleLine> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wb_core::{ConsoleLevel, ConsoleOrigin};

    fn line(message: &str) -> ConsoleLine {
        ConsoleLine::new(ConsoleLevel::Info, ConsoleOrigin::Run, message, "")
    }

    #[test]
    fn overflow_drops_oldest_lines() {
        let mut buffer = ConsoleBuffer::new(3);
        for message in ["one", "two", "three", "four", "five"] {
            buffer.push(line(message));
        }
        let messages = buffer
            .iter()
            .map(|line| line.message.as_str())
            .collect::<Vec<_>>();
        assert_eq!(messages, ["three", "four", "five"]);
        assert_eq!(buffer.dropped(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 3);
    }
}
