use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;

/// How lines are grouped into records. Chosen once when the configuration is
/// built.
#[derive(Clone, Debug)]
pub enum SplitMode {
    /// Every line is a record.
    Newline,
    /// A line matching the pattern begins a new record; every other line is
    /// appended to the record in progress.
    LineStart(Regex),
    /// Lines accumulate until one matches the pattern; that line ends the
    /// record and is part of it.
    LineEnd(Regex),
}

/// Specifies the records to emit in response to a single input line.
#[derive(Debug, PartialEq, Eq)]
pub enum Emit {
    One(Bytes),
    /// Emit two records, in the order they're specified.
    Two(Bytes, Bytes),
}

impl IntoIterator for Emit {
    type Item = Bytes;
    type IntoIter = std::iter::Flatten<std::array::IntoIter<Option<Bytes>, 2>>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            Emit::One(a) => [Some(a), None],
            Emit::Two(a, b) => [Some(a), Some(b)],
        }
        .into_iter()
        .flatten()
    }
}

/// Per-file record boundary state machine.
///
/// Lines come in with their delimiter already stripped. The splitter is idle
/// while nothing is buffered and accumulating while a multiline record is in
/// progress. A buffered record that sees no new data for the force flush
/// period is reported stale so the reader can emit it anyway.
#[derive(Clone, Debug)]
pub struct Splitter {
    mode: SplitMode,
    newline: &'static [u8],
    max_size: usize,
    force_flush_period: Option<Duration>,
    buffered: BytesMut,
    last_data: Instant,
}

impl Splitter {
    pub fn new(
        mode: SplitMode,
        newline: &'static [u8],
        max_size: usize,
        force_flush_period: Option<Duration>,
    ) -> Self {
        Self {
            mode,
            newline,
            max_size,
            force_flush_period,
            buffered: BytesMut::new(),
            last_data: Instant::now(),
        }
    }

    /// Nothing is buffered.
    pub fn is_idle(&self) -> bool {
        self.buffered.is_empty()
    }

    /// Record that new bytes arrived from the file.
    pub fn touch(&mut self, now: Instant) {
        self.last_data = now;
    }

    /// Whether data has been pending for longer than the force flush period.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.force_flush_period
            .is_some_and(|period| now.saturating_duration_since(self.last_data) >= period)
    }

    /// Handle a line, if we have something to output - return it.
    pub fn handle_line(&mut self, line: Bytes) -> Option<Emit> {
        match &self.mode {
            SplitMode::Newline => Some(Emit::One(line)),
            SplitMode::LineStart(pattern) => {
                let starts_record = pattern.is_match(&line);
                if self.buffered.is_empty() {
                    // Lines ahead of the first start match form a record of
                    // their own.
                    self.buffered.extend_from_slice(&line);
                    None
                } else if starts_record || self.would_overflow(&line) {
                    let flushed = self.take_buffered();
                    self.buffered.extend_from_slice(&line);
                    Some(Emit::One(flushed))
                } else {
                    self.add_next_line(&line);
                    None
                }
            }
            SplitMode::LineEnd(pattern) => {
                let ends_record = pattern.is_match(&line);
                let overflowed = if !self.buffered.is_empty() && self.would_overflow(&line) {
                    Some(self.take_buffered())
                } else {
                    None
                };
                self.add_next_line(&line);
                match (overflowed, ends_record) {
                    (None, false) => None,
                    (None, true) => Some(Emit::One(self.take_buffered())),
                    (Some(previous), false) => Some(Emit::One(previous)),
                    (Some(previous), true) => Some(Emit::Two(previous, self.take_buffered())),
                }
            }
        }
    }

    /// Emit whatever is buffered, complete or not.
    pub fn flush(&mut self) -> Option<Bytes> {
        (!self.buffered.is_empty()).then(|| self.take_buffered())
    }

    /// Drop all buffered data, for when the file it came from was truncated.
    pub fn reset(&mut self) {
        self.buffered.clear();
        self.last_data = Instant::now();
    }

    fn would_overflow(&self, line: &[u8]) -> bool {
        self.buffered.len() + self.newline.len() + line.len() > self.max_size
    }

    fn add_next_line(&mut self, line: &[u8]) {
        if !self.buffered.is_empty() {
            self.buffered.extend_from_slice(self.newline);
        }
        self.buffered.extend_from_slice(line);
    }

    fn take_buffered(&mut self) -> Bytes {
        self.buffered.split().freeze()
    }
}
