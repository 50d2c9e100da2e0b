//! Progress state read by the UI
//!
//! Holds the two percentages and the operator log. Updates overwrite the
//! previous value (progress may go down as well as up) and never fail.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};

use super::marker::{percentage, MarkerEvent, ProgressValue};

/// A line of the operator log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// When the line was accepted
    pub at: DateTime<Local>,
    pub text: String,
}

impl LogEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            at: Local::now(),
            text: text.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.at.format("%H:%M:%S"), self.text)
    }
}

/// Ordered operator log, optionally capped to the most recent lines
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    /// 0 means unbounded
    max_lines: usize,
    dropped: u64,
}

impl LogBuffer {
    /// Unbounded buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that keeps at most `max_lines` entries (0 = unbounded)
    pub fn with_max_lines(max_lines: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_lines,
            dropped: 0,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.max_lines > 0 && self.entries.len() == self.max_lines {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Entries evicted by the line cap so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dropped = 0;
    }
}

/// A state change the UI has to reflect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressChange {
    Primary(ProgressValue),
    Secondary(ProgressValue),
    Log(LogEntry),
}

/// Read-only view of the model
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot<'a> {
    pub primary: ProgressValue,
    pub secondary: ProgressValue,
    pub log: &'a LogBuffer,
}

/// Current overall/test progress and the accumulated log
#[derive(Debug, Default)]
pub struct ProgressModel {
    primary: ProgressValue,
    secondary: ProgressValue,
    log: LogBuffer,
}

impl ProgressModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_log_lines(max_lines: usize) -> Self {
        Self {
            log: LogBuffer::with_max_lines(max_lines),
            ..Self::default()
        }
    }

    /// Fold one classified line into the model.
    ///
    /// Returns the resulting change, or `None` when nothing visible changed.
    pub fn apply(&mut self, event: MarkerEvent) -> Option<ProgressChange> {
        match event {
            MarkerEvent::PrimaryUpdate { current, total } => {
                let value = percentage(current, total);
                if value == self.primary {
                    return None;
                }
                self.primary = value;
                Some(ProgressChange::Primary(value))
            }
            MarkerEvent::SecondaryUpdate { current, total } => {
                let value = percentage(current, total);
                if value == self.secondary {
                    return None;
                }
                self.secondary = value;
                Some(ProgressChange::Secondary(value))
            }
            MarkerEvent::PlainText(text) => Some(self.note(text)),
            MarkerEvent::Ignored => None,
        }
    }

    /// Append an operator notice (start, stop, failures) to the log
    pub fn note(&mut self, text: impl Into<String>) -> ProgressChange {
        let entry = LogEntry::new(text);
        self.log.push(entry.clone());
        ProgressChange::Log(entry)
    }

    /// Put both percentages back to zero
    pub fn reset_progress(&mut self) -> [ProgressChange; 2] {
        self.primary = ProgressValue::MIN;
        self.secondary = ProgressValue::MIN;
        [
            ProgressChange::Primary(self.primary),
            ProgressChange::Secondary(self.secondary),
        ]
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn primary(&self) -> ProgressValue {
        self.primary
    }

    pub fn secondary(&self) -> ProgressValue {
        self.secondary
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn snapshot(&self) -> ProgressSnapshot<'_> {
        ProgressSnapshot {
            primary: self.primary,
            secondary: self.secondary,
            log: &self.log,
        }
    }
}
