//! Byte-stream helpers shared by the supervisor and terminal sessions.

use std::collections::VecDeque;

/// Keeps only the most recent `capacity` bytes of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingBuffer {
    capacity: usize,
    text: String,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            text: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() <= self.capacity {
            return;
        }
        let mut cut = self.text.len() - self.capacity;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Decodes a byte stream as UTF-8 without splitting a code point that
/// straddles two reads. Invalid sequences decode lossily.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_tail_len(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, possibly valid but unfinished UTF-8 sequence.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for index in (start..bytes.len()).rev() {
        let byte = bytes[index];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let expected = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return 0,
        };
        let available = bytes.len() - index;
        return if available < expected { available } else { 0 };
    }
    0
}

const DEFAULT_MAX_LINE_BYTES: usize = 10 * 1024;

/// Joins partial lines across chunks so every emitted line is whole. A line
/// longer than `max_line_bytes` is cut and emitted in pieces.
#[derive(Debug)]
pub struct LineAssembler {
    partial: String,
    max_line_bytes: usize,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineAssembler {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            partial: String::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Complete, non-empty lines ending inside `chunk`, plus forced pieces
    /// of an overlong unterminated line.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        if let Some(last_newline) = self.partial.rfind('\n') {
            let rest = self.partial.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.partial, rest);
            lines.extend(complete.lines().filter_map(clean_line));
        }
        while self.partial.len() > self.max_line_bytes {
            let cut = split_point(&self.partial, self.max_line_bytes);
            let rest = self.partial.split_off(cut);
            let forced = std::mem::replace(&mut self.partial, rest);
            lines.extend(clean_line(&forced));
        }
        lines
    }

    /// Whatever is left once the stream closes.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.trim_end_matches(['\r', '\n']);
        (!rest.trim().is_empty()).then(|| rest.to_string())
    }
}

fn clean_line(line: &str) -> Option<String> {
    let line = line.trim_end_matches('\r');
    (!line.trim().is_empty()).then(|| line.to_string())
}

/// Largest char boundary at or below `max`, but never zero.
fn split_point(text: &str, max: usize) -> usize {
    let mut cut = max.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut > 0 {
        cut
    } else {
        text.chars().next().map_or(text.len(), char::len_utf8)
    }
}

/// Bounded byte buffer for terminal scrollback replay.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    capacity: usize,
    bytes: VecDeque<u8>,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: VecDeque::new(),
        }
    }

    pub fn with_contents(capacity: usize, contents: &str) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.extend(contents.as_bytes());
        buffer
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend(data);
        if self.bytes.len() > self.capacity {
            let drain = self.bytes.len() - self.capacity;
            self.bytes.drain(..drain);
        }
    }

    pub fn to_text(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut joined = Vec::with_capacity(self.bytes.len());
        joined.extend_from_slice(front);
        joined.extend_from_slice(back);
        String::from_utf8_lossy(&joined).into_owned()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
