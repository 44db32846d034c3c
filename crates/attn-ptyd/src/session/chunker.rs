//! Boundary-safe chunking of raw PTY output.
//!
//! A PTY read can end anywhere: in the middle of a multi-byte UTF-8 code
//! point or halfway through an escape sequence. Delivering such a fragment
//! to a terminal widget as its own message corrupts rendering, so the
//! chunker withholds the incomplete tail and prepends it to the next read.

/// Default cap on withheld bytes before a forced flush.
pub const DEFAULT_MAX_WITHHOLD: usize = 4096;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const CAN: u8 = 0x18;
const SUB: u8 = 0x1a;

/// Escape-sequence scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Ground,
    /// Saw ESC.
    Esc,
    /// ESC followed by intermediate bytes (e.g. `ESC ( B`).
    EscIntermediate,
    /// Control Sequence Introducer, `ESC [`.
    Csi,
    /// Operating System Command, `ESC ]`; ends with BEL or ST.
    Osc,
    /// DCS / SOS / PM / APC; ends with ST only.
    Str,
    /// Saw ESC inside an OSC or string sequence; `\` completes ST.
    StrEsc,
}

fn utf8_len(lead: u8) -> usize {
    match lead {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => 1,
    }
}

fn is_continuation(b: u8) -> bool {
    b & 0xc0 == 0x80
}

/// Ground-state byte: tracks how many continuation bytes the current code
/// point still needs.
fn ground_step(b: u8, utf8_pending: &mut usize) -> Scan {
    if b == ESC {
        *utf8_pending = 0;
        return Scan::Esc;
    }
    if is_continuation(b) {
        *utf8_pending = utf8_pending.saturating_sub(1);
    } else {
        *utf8_pending = utf8_len(b) - 1;
    }
    Scan::Ground
}

/// Byte after ESC. Anything that is not an introducer ends the escape and
/// counts as ground text, including the lead byte of a code point.
fn escape_step(b: u8, utf8_pending: &mut usize) -> Scan {
    match b {
        b'[' => Scan::Csi,
        b']' => Scan::Osc,
        b'P' | b'X' | b'^' | b'_' => Scan::Str,
        0x20..=0x2f => Scan::EscIntermediate,
        _ => ground_step(b, utf8_pending),
    }
}

/// Length of the longest prefix of `data` that ends outside any escape
/// sequence and on a UTF-8 code point boundary, scanning from ground state.
pub fn safe_boundary(data: &[u8]) -> usize {
    let mut state = Scan::Ground;
    let mut utf8_pending = 0usize;
    let mut safe = 0usize;

    for (i, &b) in data.iter().enumerate() {
        state = match state {
            Scan::Ground => ground_step(b, &mut utf8_pending),
            Scan::Esc => escape_step(b, &mut utf8_pending),
            Scan::EscIntermediate => match b {
                0x20..=0x2f => Scan::EscIntermediate,
                _ => ground_step(b, &mut utf8_pending),
            },
            Scan::Csi => match b {
                0x40..=0x7e | CAN | SUB => Scan::Ground,
                ESC => Scan::Esc,
                _ => Scan::Csi,
            },
            Scan::Osc => match b {
                BEL | CAN | SUB => Scan::Ground,
                ESC => Scan::StrEsc,
                _ => Scan::Osc,
            },
            Scan::Str => match b {
                CAN | SUB => Scan::Ground,
                ESC => Scan::StrEsc,
                _ => Scan::Str,
            },
            Scan::StrEsc => match b {
                b'\\' => Scan::Ground,
                // Not ST: the string was abandoned for a new escape.
                _ => escape_step(b, &mut utf8_pending),
            },
        };

        if state == Scan::Ground && utf8_pending == 0 {
            safe = i + 1;
        }
    }

    safe
}

/// Largest prefix that does not end inside a UTF-8 code point, ignoring
/// escape sequences. Used when a forced flush must still avoid splitting
/// a character.
fn utf8_boundary(data: &[u8]) -> usize {
    let n = data.len();
    let start = n.saturating_sub(4);
    for i in (start..n).rev() {
        if !is_continuation(data[i]) {
            return if n - i < utf8_len(data[i]) { i } else { n };
        }
    }
    n
}

/// Stateful splitter turning arbitrary reads into self-contained chunks.
#[derive(Debug)]
pub struct Chunker {
    pending: Vec<u8>,
    max_withhold: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WITHHOLD)
    }
}

impl Chunker {
    pub fn new(max_withhold: usize) -> Self {
        Self {
            pending: Vec::with_capacity(64),
            max_withhold: max_withhold.max(4),
        }
    }

    /// Feed one read. Returns the bytes that are safe to emit now, if any.
    pub fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.is_empty() {
            return None;
        }
        let mut combined = std::mem::take(&mut self.pending);
        combined.extend_from_slice(data);

        let mut boundary = safe_boundary(&combined);
        if combined.len() - boundary > self.max_withhold {
            // Never stall delivery on a sequence that does not terminate.
            boundary = utf8_boundary(&combined);
        }

        self.pending = combined.split_off(boundary);
        if combined.is_empty() {
            None
        } else {
            Some(combined)
        }
    }

    /// Emit whatever is withheld (end of stream).
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Number of bytes currently withheld.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
