use log::warn;
use std::collections::VecDeque;

use super::WriteTicket;
use crate::config::WriteOptions;

/// Lines sent to the store in a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    // Position of the first line among all lines ever pushed.
    pub start: u64,
    pub lines: Vec<String>,
    // Number of failed attempts so far.
    pub attempts: u32,
}

impl Batch {
    pub fn end(&self) -> u64 {
        self.start + self.lines.len() as u64
    }
}

// Holds encoded lines until they are flushed, plus batches that failed
// and are waiting for another attempt.
#[derive(Debug)]
pub struct WriteBuffer {
    pending: Vec<String>,
    // Total number of lines ever pushed.
    pushed: u64,
    retry: VecDeque<Batch>,
    retry_lines: usize,
    batch_size: usize,
    max_retry_lines: usize,
    max_retries: u32,
}

impl WriteBuffer {
    pub fn new(options: &WriteOptions) -> Self {
        Self {
            pending: vec![],
            pushed: 0,
            retry: VecDeque::new(),
            retry_lines: 0,
            batch_size: options.batch_size,
            max_retry_lines: options.max_retry_lines,
            max_retries: options.max_retries,
        }
    }

    /// Appends lines and returns the range they occupy.
    pub fn push(&mut self, lines: Vec<String>) -> WriteTicket {
        let start = self.pushed;
        self.pushed += lines.len() as u64;
        self.pending.extend(lines);
        WriteTicket {
            start,
            end: self.pushed,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn retry_len(&self) -> usize {
        self.retry_lines
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.batch_size
    }

    /// Takes everything out of the buffer: batches waiting for a retry go
    /// first, followed by pending lines split into `batch_size` chunks.
    pub fn drain(&mut self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self.retry.drain(..).collect();
        self.retry_lines = 0;

        let pending = std::mem::take(&mut self.pending);
        let mut start = self.pushed - pending.len() as u64;
        for chunk in pending.chunks(self.batch_size) {
            batches.push(Batch {
                start,
                lines: chunk.to_vec(),
                attempts: 0,
            });
            start += chunk.len() as u64;
        }
        batches
    }

    /// Records a failed attempt of `batch`. Returns true if the batch is held
    /// for another attempt, false if it was dropped.
    pub fn fail(&mut self, mut batch: Batch) -> bool {
        batch.attempts += 1;
        if batch.attempts > self.max_retries {
            if self.max_retries > 0 {
                warn!(
                    "dropping {} lines after {} failed attempts",
                    batch.lines.len(),
                    batch.attempts
                );
            }
            return false;
        }
        self.hold(batch)
    }

    /// Puts back a batch that was never attempted because an earlier batch of
    /// the same flush failed. Without retries it is dropped.
    pub fn requeue(&mut self, batch: Batch) -> bool {
        if self.max_retries == 0 {
            warn!(
                "dropping {} unsent lines after a failed flush",
                batch.lines.len()
            );
            return false;
        }
        self.hold(batch)
    }

    fn hold(&mut self, batch: Batch) -> bool {
        if batch.lines.len() > self.max_retry_lines {
            warn!(
                "dropping {} lines, more than the retry buffer holds ({})",
                batch.lines.len(),
                self.max_retry_lines
            );
            return false;
        }
        self.retry_lines += batch.lines.len();
        self.retry.push_back(batch);

        // Evict the oldest batches until the retry buffer fits again.
        while self.retry_lines > self.max_retry_lines {
            match self.retry.pop_front() {
                Some(evicted) => {
                    self.retry_lines -= evicted.lines.len();
                    warn!("retry buffer full, evicted {} lines", evicted.lines.len());
                }
                None => break,
            }
        }
        true
    }
}
