// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The persisted line table encoding.
//!
//! A table is a stream of unsigned LEB128 integers: the entry count `n`,
//! followed by `n` pairs of `(past_offset, line)`. Nothing else may follow
//! the last pair.

use scroll::Uleb128;
use tracing::trace;

/// One entry of a persisted line table.
///
/// Every bytecode offset below `past_offset` (and at or above the previous
/// entry's `past_offset`) belongs to `line`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineTableEntry {
    pub past_offset: u32,
    pub line: u32,
}

/// The raw result of decoding a persisted line table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedLineTable {
    /// The entry count declared at the start of the buffer.
    pub count: u64,
    /// The entries that could be decoded, in buffer order.
    pub entries: Vec<LineTableEntry>,
    /// Whether exactly `count` entries were decoded and the buffer was
    /// consumed to its last byte.
    pub consumed_fully: bool,
}

/// A cursor over a buffer of variable-length integers.
#[derive(Debug)]
pub struct LineTableDecoder<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> LineTableDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> LineTableDecoder<'a> {
        LineTableDecoder { buf, offset: 0 }
    }

    /// Decode the next integer, or `None` if the buffer is exhausted or
    /// the integer is malformed.
    pub fn decode(&mut self) -> Option<u64> {
        let mut offset = self.offset;
        let value = Uleb128::read(self.buf, &mut offset).ok()?;
        self.offset = offset;
        Some(value)
    }

    /// Decode the next integer, requiring it to fit in 32 bits.
    pub fn decode_u32(&mut self) -> Option<u32> {
        self.decode().and_then(|v| u32::try_from(v).ok())
    }

    /// Whether the whole buffer has been consumed.
    pub fn finished(&self) -> bool {
        self.offset == self.buf.len()
    }

    /// How many bytes have been consumed.
    pub fn position(&self) -> usize {
        self.offset
    }
}

/// Decode a persisted line table.
///
/// This never fails outright: a truncated, malformed or overlong buffer
/// produces whatever entries could be read, with `consumed_fully` unset.
pub fn decode_line_table(buf: &[u8]) -> DecodedLineTable {
    let mut decoder = LineTableDecoder::new(buf);
    let count = match decoder.decode() {
        Some(count) => count,
        None => {
            return DecodedLineTable {
                count: 0,
                entries: vec![],
                consumed_fully: false,
            }
        }
    };

    // Every entry takes at least two bytes, don't trust `count` any further.
    let capacity = std::cmp::min(count, (buf.len() / 2) as u64) as usize;
    let mut entries = Vec::with_capacity(capacity);
    let mut complete = true;
    for _ in 0..count {
        let past_offset = decoder.decode_u32();
        let line = decoder.decode_u32();
        match (past_offset, line) {
            (Some(past_offset), Some(line)) => entries.push(LineTableEntry { past_offset, line }),
            _ => {
                trace!(
                    "line table ended after {} of {} entries (byte {})",
                    entries.len(),
                    count,
                    decoder.position()
                );
                complete = false;
                break;
            }
        }
    }

    DecodedLineTable {
        count,
        entries,
        consumed_fully: complete && decoder.finished(),
    }
}

/// Append `value` to `out` as unsigned LEB128.
pub fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Encode `entries` in the persisted line table format.
pub fn encode_line_table(entries: &[LineTableEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + entries.len() * 4);
    write_uleb128(&mut out, entries.len() as u64);
    for entry in entries {
        write_uleb128(&mut out, entry.past_offset as u64);
        write_uleb128(&mut out, entry.line as u64);
    }
    out
}
