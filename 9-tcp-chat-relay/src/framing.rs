use std::borrow::Cow;

use clap::ValueEnum;

/// Upper bound on a buffered partial line before it is flushed as-is.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// How raw reads from a socket are turned into delivery units.
///
/// The wire carries no length prefix. `Chunk` keeps best-effort delivery where every
/// successful read is one message, so a single write may arrive split or coalesced.
/// `Line` reassembles newline-terminated lines before handing them on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Framing {
    #[default]
    Chunk,
    Line,
}

/// Appends a `'\n'` unless the text already ends with one.
pub fn terminate_line(text: &str) -> Cow<'_, str> {
    if text.ends_with('\n') {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{text}\n"))
    }
}

/// Splits a byte stream into complete `'\n'`-terminated lines, holding back the tail.
#[derive(Debug)]
pub struct LineAssembler {
    pending: Vec<u8>,
    max_line: usize,
}

impl LineAssembler {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line: max_line.max(1),
        }
    }

    /// Feeds freshly read bytes and returns every line they complete, terminator included.
    ///
    /// A line longer than the limit is cut early, on a character boundary when possible.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &byte in bytes {
            self.pending.push(byte);
            if byte == b'\n' {
                lines.push(std::mem::take(&mut self.pending));
            } else if self.pending.len() >= self.max_line {
                let cut = match utf8_boundary(&self.pending) {
                    0 => self.pending.len(),
                    cut => cut,
                };
                let rest = self.pending.split_off(cut);
                lines.push(std::mem::replace(&mut self.pending, rest));
            }
        }
        lines
    }

    /// Returns whatever unterminated tail is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        take_nonempty(&mut self.pending)
    }
}

#[derive(Debug)]
pub enum Deframer {
    /// Holds back an incomplete trailing UTF-8 sequence until the next read.
    Chunk { carry: Vec<u8> },
    Line(LineAssembler),
}

impl Deframer {
    pub fn new(framing: Framing) -> Self {
        match framing {
            Framing::Chunk => Deframer::Chunk { carry: Vec::new() },
            Framing::Line => Deframer::Line(LineAssembler::new(MAX_LINE_BYTES)),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        match self {
            Deframer::Chunk { carry } => {
                let mut chunk = std::mem::take(carry);
                chunk.extend_from_slice(bytes);
                *carry = chunk.split_off(utf8_boundary(&chunk));
                if chunk.is_empty() {
                    Vec::new()
                } else {
                    vec![chunk]
                }
            }
            Deframer::Line(assembler) => assembler.push(bytes),
        }
    }

    pub fn finish(&mut self) -> Option<Vec<u8>> {
        match self {
            Deframer::Chunk { carry } => take_nonempty(carry),
            Deframer::Line(assembler) => assembler.finish(),
        }
    }
}

/// Length of the prefix of `bytes` that does not end inside a multi-byte UTF-8 sequence.
///
/// Only the last three bytes are inspected; anything that is not the start of an
/// unfinished sequence counts as complete, so arbitrary binary data passes through.
pub fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

fn take_nonempty(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buffer.is_empty() {
        None
    } else {
        Some(std::mem::take(buffer))
    }
}
