//! Plain terminal output
//!
//! Log lines scroll normally; the two percentages live on a status line that
//! is redrawn in place below the last log line.

use std::io::{self, Write};

use crossterm::{
    cursor::MoveToColumn,
    queue,
    style::{Print, Stylize},
    terminal::{Clear, ClearType},
};
use tracing::warn;

use super::ProgressSink;
use crate::progress::{LogEntry, ProgressValue};

const BAR_WIDTH: usize = 20;

/// Writes progress to any [`Write`] using crossterm commands
pub struct ConsoleSink<W: Write> {
    out: W,
    primary: ProgressValue,
    secondary: ProgressValue,
    line_ending: &'static str,
    failed: bool,
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            primary: ProgressValue::MIN,
            secondary: ProgressValue::MIN,
            line_ending: "\n",
            failed: false,
        }
    }

    /// Raw mode does not translate `\n`, so lines need an explicit `\r\n`
    pub fn raw_mode(mut self) -> Self {
        self.line_ending = "\r\n";
        self
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Drop the status line and move to a fresh line
    pub fn finish(&mut self) -> io::Result<()> {
        queue!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(status_text(self.primary, self.secondary)),
            Print(self.line_ending)
        )?;
        self.out.flush()
    }

    fn draw_status(&mut self) -> io::Result<()> {
        queue!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(status_text(self.primary, self.secondary).bold())
        )?;
        self.out.flush()
    }

    fn write_log(&mut self, entry: &LogEntry) -> io::Result<()> {
        queue!(
            self.out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(entry),
            Print(self.line_ending)
        )?;
        self.draw_status()
    }

    fn report(&mut self, result: io::Result<()>) {
        if let Err(err) = result {
            if !self.failed {
                warn!("Failed to write progress to the terminal: {}", err);
                self.failed = true;
            }
        }
    }
}

impl<W: Write> ProgressSink for ConsoleSink<W> {
    fn set_primary_progress(&mut self, value: ProgressValue) {
        self.primary = value;
        let result = self.draw_status();
        self.report(result);
    }

    fn set_secondary_progress(&mut self, value: ProgressValue) {
        self.secondary = value;
        let result = self.draw_status();
        self.report(result);
    }

    fn append_log(&mut self, entry: &LogEntry) {
        let result = self.write_log(entry);
        self.report(result);
    }
}

fn bar(value: ProgressValue) -> String {
    let filled = usize::from(value.get()) * BAR_WIDTH / 100;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

/// `overall [####....]  20%  test [##......]  10%`
pub fn status_text(primary: ProgressValue, secondary: ProgressValue) -> String {
    format!(
        "overall {} {:>4}  test {} {:>4}",
        bar(primary),
        primary.to_string(),
        bar(secondary),
        secondary.to_string()
    )
}
