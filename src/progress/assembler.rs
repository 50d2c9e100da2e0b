//! Line assembly for non-blocking output reads
//!
//! A non-blocking read hands back whatever the pipe holds at that moment, so
//! a single marker can arrive split across several chunks. The assembler keeps
//! the unterminated tail between calls and only emits complete lines.

use super::ParseError;

/// Default cap for a single line. The test tool only prints short lines.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// One complete output line, without its `\n` terminator
pub type RawLine = Vec<u8>;

/// Buffers output chunks and splits them into lines
#[derive(Debug)]
pub struct LineAssembler {
    buffer: Vec<u8>,
    max_line_len: usize,
    /// Set after an overflow until the terminator of the offending line shows up
    discarding: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Create an assembler that rejects lines longer than `max_line_len` bytes
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_len: max_line_len.max(1),
            discarding: false,
        }
    }

    /// Append a chunk and iterate over the lines it completes.
    ///
    /// The returned iterator is lazy: lines it does not reach stay buffered
    /// and come out of the next call. A line longer than the cap yields a
    /// single [`ParseError::LineTooLong`] and the rest of it is skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.buffer.extend_from_slice(chunk);
        Lines {
            assembler: self,
            pos: 0,
        }
    }

    /// Bytes still waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }

    /// Drop everything buffered, including a partial line
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Lines completed by one [`LineAssembler::feed`] call
#[must_use = "lines are only split off the buffer while iterating"]
pub struct Lines<'a> {
    assembler: &'a mut LineAssembler,
    pos: usize,
}

impl Iterator for Lines<'_> {
    type Item = Result<RawLine, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let limit = self.assembler.max_line_len;
        loop {
            let found = self.assembler.buffer[self.pos..]
                .iter()
                .position(|&b| b == b'\n');
            let remaining = self.assembler.buffer.len() - self.pos;

            match found {
                Some(len) => {
                    let start = self.pos;
                    self.pos += len + 1;

                    if self.assembler.discarding {
                        // tail of an overflowed line
                        self.assembler.discarding = false;
                        continue;
                    }
                    if len > limit {
                        return Some(Err(ParseError::LineTooLong { limit }));
                    }
                    return Some(Ok(self.assembler.buffer[start..start + len].to_vec()));
                }
                None => {
                    if self.assembler.discarding {
                        self.pos += remaining;
                        return None;
                    }
                    if remaining > limit {
                        self.pos += remaining;
                        self.assembler.discarding = true;
                        return Some(Err(ParseError::LineTooLong { limit }));
                    }
                    return None;
                }
            }
        }
    }
}

impl Drop for Lines<'_> {
    fn drop(&mut self) {
        self.assembler.buffer.drain(..self.pos);
    }
}
