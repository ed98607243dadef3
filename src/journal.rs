use std::io::Write;
use std::path::PathBuf;

use log::error;
use serde::{Deserialize, Serialize};

use crate::error::SequencerError;

/// One command-execution attempt, as recorded in the session journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub iso8601: String,
    pub source_file: String,
    pub line_number: usize,
    pub action: String,
    pub parameters: Vec<String>,
    pub raw: String,
    pub attempt: usize,
    pub outcome: String,
}

/// Buffered JSONL journal of command attempts.
///
/// Flush trouble must not stop a running batch, so write failures are
/// logged and tolerated up to a limit before they become errors.
pub struct AttemptJournal {
    path: PathBuf,
    buffer: Vec<AttemptRecord>,
    capacity: usize,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl AttemptJournal {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            buffer: Vec::with_capacity(capacity),
            capacity,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn add(&mut self, record: AttemptRecord) -> Result<(), SequencerError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SequencerError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = (|| -> std::io::Result<()> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let mut writer = std::io::BufWriter::new(file);
            for record in &self.buffer {
                let line = serde_json::to_string(record)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                writeln!(writer, "{line}")?;
            }
            writer.flush()
        })();
        match result {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "journal flush failure {}/{}: {e}",
                    self.flush_failures, self.max_flush_failures
                );
                if self.flush_failures >= self.max_flush_failures {
                    return Err(SequencerError::io(
                        e,
                        format!("too many journal flush failures for {:?}", self.path),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl Drop for AttemptJournal {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
