// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The seams between the stack walker and the outside world.
//!
//! * [`MemoryView`] - read access into a (momentarily) frozen target process.
//! * [`LineTableStore`] - persisted line tables, keyed by compilation unit.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::mem;

use scroll::{Pread, LE};

/// Errors produced while reading target memory.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
    #[error("{len} bytes at {address:#x} are not mapped")]
    Unmapped { address: u64, len: usize },
    #[error("null pointer")]
    NullPointer,
    #[error("address {base:#x} + {offset:#x} overflows")]
    Overflow { base: u64, offset: u64 },
    #[error("string of {0} bytes is too long to read")]
    StringTooLong(u32),
}

impl ReadError {
    /// Returns just the name of the error, for terse logging.
    pub fn name(&self) -> &'static str {
        match self {
            ReadError::UnknownSymbol(_) => "UnknownSymbol",
            ReadError::Unmapped { .. } => "Unmapped",
            ReadError::NullPointer => "NullPointer",
            ReadError::Overflow { .. } => "Overflow",
            ReadError::StringTooLong(_) => "StringTooLong",
        }
    }
}

/// Compute `base + offset` in the target's address space.
pub fn field_address(base: u64, offset: u64) -> Result<u64, ReadError> {
    base.checked_add(offset)
        .ok_or(ReadError::Overflow { base, offset })
}

macro_rules! read_scalar {
    ($(#[$attr:meta])* $name:ident, $ty:ty) => {
        $(#[$attr])*
        fn $name(&self, address: u64) -> Result<$ty, ReadError> {
            let len = mem::size_of::<$ty>();
            let bytes = self.read_bytes(address, len)?;
            bytes
                .pread_with::<$ty>(0, LE)
                .map_err(|_| ReadError::Unmapped { address, len })
        }
    };
}

/// Typed, read-only access into a target process.
///
/// Implementors only need to provide symbol lookup and raw byte access;
/// scalar reads are layered on top. All multi-byte values are little-endian.
pub trait MemoryView {
    /// The address of the global (or current thread's thread-local) `name`.
    fn symbol_address(&self, name: &str) -> Result<u64, ReadError>;

    /// Exactly `len` bytes starting at `address`.
    fn read_bytes(&self, address: u64, len: usize) -> Result<Cow<'_, [u8]>, ReadError>;

    read_scalar!(read_u8, u8);
    read_scalar!(read_u32, u32);
    read_scalar!(read_i8, i8);
    read_scalar!(read_u64, u64);
    read_scalar!(read_i64, i64);

    /// Read a 32-bit value that the live target may be mutating.
    ///
    /// Snapshots are quiescent so the default is a plain read. Views over a
    /// running process must perform this as a single aligned load.
    fn read_u32_atomic(&self, address: u64) -> Result<u32, ReadError> {
        self.read_u32(address)
    }

    /// Read a pointer-sized value.
    fn read_pointer(&self, address: u64) -> Result<u64, ReadError> {
        self.read_u64(address)
    }

    /// Read a pointer stored at `base + offset`.
    fn read_pointer_field(&self, base: u64, offset: u64) -> Result<u64, ReadError> {
        self.read_pointer(field_address(base, offset)?)
    }

    /// Like [`read_pointer_field`](Self::read_pointer_field), but a null
    /// result is an error.
    fn follow_pointer(&self, base: u64, offset: u64) -> Result<u64, ReadError> {
        match self.read_pointer_field(base, offset)? {
            0 => Err(ReadError::NullPointer),
            ptr => Ok(ptr),
        }
    }

    /// Read the pointer-sized value stored in the global `name`.
    fn read_global(&self, name: &str) -> Result<u64, ReadError> {
        let address = self.symbol_address(name)?;
        self.read_u64(address)
    }
}

impl<'a, M: MemoryView + ?Sized> MemoryView for &'a M {
    fn symbol_address(&self, name: &str) -> Result<u64, ReadError> {
        (**self).symbol_address(name)
    }
    fn read_bytes(&self, address: u64, len: usize) -> Result<Cow<'_, [u8]>, ReadError> {
        (**self).read_bytes(address, len)
    }
    fn read_u32_atomic(&self, address: u64) -> Result<u32, ReadError> {
        (**self).read_u32_atomic(address)
    }
}

/// Identity of a compilation unit in a persisted repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId {
    /// Which repository the unit was loaded from.
    pub repo_id: i8,
    /// The unit's serial number within that repository.
    pub serial_number: i64,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "repo {} unit #{}", self.repo_id, self.serial_number)
    }
}

/// Errors produced by a [`LineTableStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("couldn't open repository {repo_id}: {reason}")]
    Open { repo_id: i8, reason: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error("invalid schema suffix `{0}`")]
    InvalidSchema(String),
}

impl StoreError {
    /// Returns just the name of the error, for terse logging.
    pub fn name(&self) -> &'static str {
        match self {
            StoreError::Open { .. } => "Open",
            StoreError::Query(_) => "Query",
            StoreError::InvalidSchema(_) => "InvalidSchema",
        }
    }
}

/// A source of persisted, encoded line tables.
///
/// `Ok(None)` means the store has no table for the unit, which is an
/// expected outcome and not an error.
pub trait LineTableStore {
    fn line_table(&self, unit: UnitId) -> Result<Option<Vec<u8>>, StoreError>;
}

/// A store that never has anything.
impl LineTableStore for () {
    fn line_table(&self, _unit: UnitId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }
}

/// Implement LineTableStore for in-memory maps for convenience in tests.
impl LineTableStore for HashMap<UnitId, Vec<u8>> {
    fn line_table(&self, unit: UnitId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(&unit).cloned())
    }
}

impl<'a, S: LineTableStore + ?Sized> LineTableStore for &'a S {
    fn line_table(&self, unit: UnitId) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).line_table(unit)
    }
}
