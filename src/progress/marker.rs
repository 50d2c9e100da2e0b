//! Progress marker classification
//!
//! The test tool interleaves two kinds of marker lines with free-form text:
//!
//! - `*<curr>/<total><suffix>` reports overall progress of the test suite
//! - `|<curr>/<total><suffix>` reports progress of the current test
//!
//! The suffix is a single closing character that is discarded. Everything
//! else at least [`MIN_LINE_LEN`] characters long is informational text.

use std::fmt;

use tracing::debug;

use super::ParseError;

/// Lines shorter than this are noise
pub const MIN_LINE_LEN: usize = 5;

pub const PRIMARY_PREFIX: char = '*';
pub const SECONDARY_PREFIX: char = '|';

/// Percentage in `0..=100`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProgressValue(u8);

impl ProgressValue {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(100);

    /// Clamp any integer into range
    pub fn new(percent: i64) -> Self {
        Self(percent.clamp(0, 100) as u8)
    }

    fn from_f64(percent: f64) -> Self {
        if percent.is_nan() {
            return Self::MIN;
        }
        Self(percent.clamp(0.0, 100.0) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ProgressValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// `floor(100 * current / total)`, clamped to `0..=100`.
///
/// `current > total` is possible with a misbehaving tool and saturates at 100.
pub fn percentage(current: u64, total: u64) -> ProgressValue {
    if total == 0 {
        return ProgressValue::MIN;
    }
    ProgressValue::from_f64((100.0 * current as f64 / total as f64).trunc())
}

/// Result of classifying one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerEvent {
    /// `*` marker: overall suite progress
    PrimaryUpdate { current: u64, total: u64 },
    /// `|` marker: progress of the running test
    SecondaryUpdate { current: u64, total: u64 },
    /// Informational text, kept verbatim
    PlainText(String),
    /// Noise or a malformed marker
    Ignored,
}

impl MarkerEvent {
    /// Percentage carried by a marker event
    pub fn progress(&self) -> Option<ProgressValue> {
        match self {
            MarkerEvent::PrimaryUpdate { current, total }
            | MarkerEvent::SecondaryUpdate { current, total } => {
                Some(percentage(*current, *total))
            }
            MarkerEvent::PlainText(_) | MarkerEvent::Ignored => None,
        }
    }
}

/// Classifies complete output lines
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerParser;

impl MarkerParser {
    pub fn new() -> Self {
        Self
    }

    /// Classify a line, reporting malformed markers as errors
    pub fn parse(&self, line: &[u8]) -> Result<MarkerEvent, ParseError> {
        let text = String::from_utf8_lossy(line);
        if text.chars().count() < MIN_LINE_LEN {
            return Ok(MarkerEvent::Ignored);
        }

        let mut chars = text.chars();
        match chars.next() {
            Some(PRIMARY_PREFIX) => {
                let (current, total) = parse_fraction(chars.as_str(), &text)?;
                Ok(MarkerEvent::PrimaryUpdate { current, total })
            }
            Some(SECONDARY_PREFIX) => {
                let (current, total) = parse_fraction(chars.as_str(), &text)?;
                Ok(MarkerEvent::SecondaryUpdate { current, total })
            }
            _ => Ok(MarkerEvent::PlainText(text.into_owned())),
        }
    }

    /// Classify a line; malformed markers become [`MarkerEvent::Ignored`]
    pub fn classify(&self, line: &[u8]) -> MarkerEvent {
        match self.parse(line) {
            Ok(event) => event,
            Err(err) => {
                debug!("Dropping line: {}", err);
                MarkerEvent::Ignored
            }
        }
    }
}

/// Split `<curr>/<total><suffix>` into its two numbers
fn parse_fraction(body: &str, line: &str) -> Result<(u64, u64), ParseError> {
    let malformed = || ParseError::MalformedMarker(line.to_string());

    let (current, rest) = body.split_once('/').ok_or_else(malformed)?;
    let mut total = rest.chars();
    total.next_back().ok_or_else(malformed)?;

    let current = parse_count(current).ok_or_else(malformed)?;
    let total = parse_count(total.as_str()).ok_or_else(malformed)?;
    if total == 0 {
        return Err(malformed());
    }
    Ok((current, total))
}

/// Plain ASCII digits only; `u64::from_str` would also take a leading `+`
fn parse_count(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
