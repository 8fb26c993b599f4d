use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}


/// One captured line of child output. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Collector arrival order. Exact within one stream; stdout and stderr are read by separate
    /// pumps, so their interleaving is best-effort.
    pub seq: u64,
    pub stream: OutputStream,
    pub text: String,
    pub timestamp: DateTime<Local>,
}

impl OutputLine {
    pub fn new(seq: u64, stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            seq,
            stream,
            text: text.into(),
            timestamp: Local::now(),
        }
    }
}



/*
    @@@
    @OutputBuffer;
    . Keeps at most `capacity` lines, evicting from the front when full.
    . Every read hands out an owned copy, never a reference into the deque.
    . The lock is only held for the push/copy itself.
*/
#[derive(Debug)]
pub struct OutputBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<OutputLine>>,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, line: OutputLine) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lock().iter().cloned().collect()
    }

    /// The most recent `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<OutputLine> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutputLine>> {
        // A panic while holding the guard cannot leave the deque half-updated.
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
