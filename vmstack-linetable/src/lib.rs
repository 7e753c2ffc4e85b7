// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Line tables map bytecode offsets within a compilation unit to source lines.
//!
//! A loaded unit may carry a small [`LineMap`] of offset ranges in the
//! target's memory. Units loaded from a repository instead have a compact
//! encoded table persisted alongside them, which [`decode_line_table`]
//! unpacks and [`LineTable`] searches by upper bound.

mod decoder;
mod table;

pub use crate::decoder::{
    decode_line_table, encode_line_table, write_uleb128, DecodedLineTable, LineTableDecoder,
    LineTableEntry,
};
pub use crate::table::{LineMap, LineRange, LineTable, LineTableError};
