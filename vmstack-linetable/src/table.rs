// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::iter::FromIterator;

use crate::decoder::{decode_line_table, DecodedLineTable, LineTableEntry};

/// Why a persisted line table was rejected.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum LineTableError {
    #[error("decoded {decoded} of {count} entries without consuming the buffer exactly")]
    NotConsumed { count: u64, decoded: usize },
    #[error("entry {index} has a smaller past offset than its predecessor")]
    Unsorted { index: usize },
}

/// A validated persisted line table, ordered by past offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineTable {
    entries: Vec<LineTableEntry>,
}

impl LineTable {
    /// Decode and validate a persisted table.
    pub fn parse(buf: &[u8]) -> Result<LineTable, LineTableError> {
        LineTable::from_decoded(decode_line_table(buf))
    }

    /// Validate the result of [`decode_line_table`].
    ///
    /// A partially decoded table is discarded as a whole, as is one whose
    /// offsets go backwards.
    pub fn from_decoded(decoded: DecodedLineTable) -> Result<LineTable, LineTableError> {
        if !decoded.consumed_fully {
            return Err(LineTableError::NotConsumed {
                count: decoded.count,
                decoded: decoded.entries.len(),
            });
        }
        if let Some(index) = decoded
            .entries
            .windows(2)
            .position(|pair| pair[1].past_offset < pair[0].past_offset)
        {
            return Err(LineTableError::Unsorted { index: index + 1 });
        }
        Ok(LineTable {
            entries: decoded.entries,
        })
    }

    pub fn entries(&self) -> &[LineTableEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the first entry whose past offset is strictly greater than `pc`.
    ///
    /// Equal to `len()` if there is no such entry.
    pub fn upper_bound(&self, pc: u32) -> usize {
        self.entries.partition_point(|entry| entry.past_offset <= pc)
    }

    /// The line covering bytecode offset `pc`, if any.
    pub fn line_for_offset(&self, pc: u32) -> Option<u32> {
        self.entries.get(self.upper_bound(pc)).map(|entry| entry.line)
    }
}

/// A half-open range of bytecode offsets mapped to a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRange {
    pub base: u32,
    pub past: u32,
    pub line: u32,
}

impl LineRange {
    pub fn contains(&self, pc: u32) -> bool {
        self.base <= pc && pc < self.past
    }
}

/// The in-memory line map attached to a loaded unit.
///
/// Ranges are kept in insertion order and searched linearly; the first
/// range containing an offset wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineMap {
    ranges: Vec<LineRange>,
}

impl LineMap {
    pub fn new() -> LineMap {
        Default::default()
    }

    pub fn push(&mut self, range: LineRange) {
        self.ranges.push(range);
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn lookup(&self, pc: u32) -> Option<u32> {
        self.ranges
            .iter()
            .find(|range| range.contains(pc))
            .map(|range| range.line)
    }
}

impl FromIterator<LineRange> for LineMap {
    fn from_iter<I: IntoIterator<Item = LineRange>>(iter: I) -> LineMap {
        LineMap {
            ranges: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decoder::encode_line_table;
    use proptest::prelude::*;

    fn table(pairs: &[(u32, u32)]) -> LineTable {
        let entries: Vec<_> = pairs
            .iter()
            .map(|&(past_offset, line)| LineTableEntry { past_offset, line })
            .collect();
        LineTable::parse(&encode_line_table(&entries)).unwrap()
    }

    #[test]
    fn test_upper_bound_lookup() {
        let t = table(&[(10, 1), (20, 2), (35, 3)]);
        assert_eq!(t.line_for_offset(0), Some(1));
        assert_eq!(t.line_for_offset(5), Some(1));
        assert_eq!(t.line_for_offset(10), Some(2));
        assert_eq!(t.line_for_offset(34), Some(3));
        assert_eq!(t.line_for_offset(35), None);
        assert_eq!(t.line_for_offset(u32::MAX), None);
    }

    #[test]
    fn test_duplicate_offsets() {
        // Ties resolve past every entry with an equal offset.
        let t = table(&[(10, 1), (10, 2), (20, 3)]);
        assert_eq!(t.line_for_offset(9), Some(1));
        assert_eq!(t.line_for_offset(10), Some(3));
    }

    #[test]
    fn test_empty_table_has_no_lines() {
        let t = table(&[]);
        assert!(t.is_empty());
        assert_eq!(t.line_for_offset(0), None);
    }

    #[test]
    fn test_reject_partial() {
        let mut buf = encode_line_table(&[LineTableEntry {
            past_offset: 4,
            line: 1,
        }]);
        buf.push(7);
        assert_eq!(
            LineTable::parse(&buf),
            Err(LineTableError::NotConsumed {
                count: 1,
                decoded: 1
            })
        );
    }

    #[test]
    fn test_reject_unsorted() {
        let buf = encode_line_table(&[
            LineTableEntry {
                past_offset: 20,
                line: 1,
            },
            LineTableEntry {
                past_offset: 10,
                line: 2,
            },
        ]);
        assert_eq!(
            LineTable::parse(&buf),
            Err(LineTableError::Unsorted { index: 1 })
        );
    }

    #[test]
    fn test_line_map_first_match_wins() {
        let map: LineMap = vec![
            LineRange {
                base: 0,
                past: 10,
                line: 7,
            },
            LineRange {
                base: 5,
                past: 20,
                line: 8,
            },
        ]
        .into_iter()
        .collect();
        assert_eq!(map.len(), 2);
        assert_eq!(map.lookup(0), Some(7));
        assert_eq!(map.lookup(9), Some(7));
        assert_eq!(map.lookup(10), Some(8));
        assert_eq!(map.lookup(19), Some(8));
        assert_eq!(map.lookup(20), None);
        assert_eq!(LineMap::new().lookup(0), None);
    }

    proptest! {
        #[test]
        fn lookup_matches_linear_upper_bound(
            mut offsets in proptest::collection::vec(0u32..1000, 0..40),
            pc in 0u32..1100,
        ) {
            offsets.sort_unstable();
            let pairs: Vec<_> = offsets.iter().enumerate().map(|(i, &o)| (o, i as u32 + 1)).collect();
            let t = table(&pairs);
            let expected = pairs.iter().find(|&&(o, _)| o > pc).map(|&(_, l)| l);
            prop_assert_eq!(t.line_for_offset(pc), expected);
        }
    }
}
