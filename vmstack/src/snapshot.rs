// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use range_map::{Range, RangeMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vmstack_common::traits::{MemoryView, ReadError};

/// Errors encountered while reading a [`MemorySnapshot`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("File not found")]
    FileNotFound,
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Malformed snapshot: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Memory region at {0:#x} is empty or wraps the address space")]
    BadRegion(u64),
    #[error("Memory regions at {first:#x} and {second:#x} overlap")]
    OverlappingRegions { first: u64, second: u64 },
}

impl Error {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            Error::FileNotFound => "FileNotFound",
            Error::IoError(_) => "IoError",
            Error::ParseError(_) => "ParseError",
            Error::BadRegion(_) => "BadRegion",
            Error::OverlappingRegions { .. } => "OverlappingRegions",
        }
    }
}

/// A contiguous block of the target's memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// The address of the first byte.
    pub base_address: u64,
    /// The contents.
    pub bytes: Vec<u8>,
}

impl MemoryRegion {
    pub fn new(base_address: u64, bytes: Vec<u8>) -> MemoryRegion {
        MemoryRegion {
            base_address,
            bytes,
        }
    }

    /// The inclusive range of addresses covered, or `None` if empty.
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(Range::new(
            self.base_address,
            self.base_address
                .checked_add(self.bytes.len() as u64 - 1)?,
        ))
    }

    /// Get `len` bytes at `address`, if they all lie in this region.
    pub fn get_bytes_at_address(&self, address: u64, len: usize) -> Option<&[u8]> {
        let start = address.checked_sub(self.base_address)? as usize;
        let end = start.checked_add(len)?;
        self.bytes.get(start..end)
    }
}

/// A native frame as reported by the controlling debugger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeFrameRecord {
    /// The frame pointer.
    pub fp: u64,
    /// The instruction pointer (return address for outer frames).
    pub ip: u64,
    /// The native symbol, if the debugger could resolve one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Per-thread state in a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Addresses of this thread's thread-local symbols.
    #[serde(default)]
    pub thread_locals: BTreeMap<String, u64>,
    /// Frame pointer of the innermost interpreted frame, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_fp: Option<u64>,
    /// Native frames, innermost first.
    #[serde(default)]
    pub native_frames: Vec<NativeFrameRecord>,
    /// Suspended resumables owned by this thread.
    #[serde(default)]
    pub resumables: Vec<u64>,
}

/// The on-disk form of a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    #[serde(default)]
    pub symbols: BTreeMap<String, u64>,
    #[serde(default)]
    pub regions: Vec<MemoryRegion>,
    #[serde(default)]
    pub threads: Vec<ThreadSnapshot>,
}

/// A frozen image of a target process.
///
/// # Examples
///
/// ```
/// use vmstack::{MemoryRegion, MemorySnapshot, SnapshotFile};
/// use vmstack_common::traits::MemoryView;
///
/// let mut file = SnapshotFile::default();
/// file.symbols.insert("answer".to_string(), 0x1000);
/// file.regions.push(MemoryRegion::new(0x1000, 42u64.to_le_bytes().to_vec()));
/// let snapshot = MemorySnapshot::from_file(file).unwrap();
/// assert_eq!(snapshot.read_global("answer"), Ok(42));
/// ```
#[derive(Debug)]
pub struct MemorySnapshot {
    symbols: BTreeMap<String, u64>,
    regions: Vec<MemoryRegion>,
    threads: Vec<ThreadSnapshot>,
    regions_by_addr: RangeMap<u64, usize>,
}

/// Describe the lowest pair of overlapping regions in `ranges`.
fn first_overlap(mut ranges: Vec<(Range<u64>, usize)>) -> Error {
    ranges.sort_by_key(|(range, _)| range.start);
    ranges
        .windows(2)
        .find(|pair| pair[1].0.start <= pair[0].0.end)
        .map_or(Error::OverlappingRegions { first: 0, second: 0 }, |pair| {
            Error::OverlappingRegions {
                first: pair[0].0.start,
                second: pair[1].0.start,
            }
        })
}

impl MemorySnapshot {
    /// Index the contents of a snapshot file.
    ///
    /// Regions may be listed in any order but must not be empty or overlap.
    pub fn from_file(file: SnapshotFile) -> Result<MemorySnapshot, Error> {
        let mut ranges = Vec::with_capacity(file.regions.len());
        for (i, region) in file.regions.iter().enumerate() {
            let range = region
                .memory_range()
                .ok_or(Error::BadRegion(region.base_address))?;
            ranges.push((range, i));
        }
        let regions_by_addr = RangeMap::try_from_iter(ranges.iter().cloned())
            .map_err(|_| first_overlap(ranges))?;
        debug!(
            "snapshot has {} regions, {} symbols, {} threads",
            file.regions.len(),
            file.symbols.len(),
            file.threads.len()
        );
        Ok(MemorySnapshot {
            symbols: file.symbols,
            regions: file.regions,
            threads: file.threads,
            regions_by_addr,
        })
    }

    /// Read a snapshot from the JSON file at `path`.
    pub fn read_path<P: AsRef<Path>>(path: P) -> Result<MemorySnapshot, Error> {
        let f = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound,
            _ => Error::IoError(e),
        })?;
        let file: SnapshotFile = serde_json::from_reader(BufReader::new(f))?;
        MemorySnapshot::from_file(file)
    }

    /// Parse a snapshot from a JSON string.
    pub fn from_json_str(json: &str) -> Result<MemorySnapshot, Error> {
        MemorySnapshot::from_file(serde_json::from_str(json)?)
    }

    /// The on-disk form of this snapshot.
    pub fn to_file(&self) -> SnapshotFile {
        SnapshotFile {
            symbols: self.symbols.clone(),
            regions: self.regions.clone(),
            threads: self.threads.clone(),
        }
    }

    /// Write this snapshot as JSON.
    pub fn write_json<T: Write>(&self, f: &mut T) -> Result<(), Error> {
        serde_json::to_writer(&mut *f, &self.to_file())?;
        f.flush()?;
        Ok(())
    }

    /// Write this snapshot as JSON to the file at `path`.
    pub fn write_path<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let mut f = BufWriter::new(File::create(path)?);
        self.write_json(&mut f)
    }

    /// The region containing `address`, if any.
    pub fn region_at_address(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions_by_addr
            .get(address)
            .map(|&index| &self.regions[index])
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn symbols(&self) -> &BTreeMap<String, u64> {
        &self.symbols
    }

    pub fn threads(&self) -> &[ThreadSnapshot] {
        &self.threads
    }

    /// A view of memory as seen from thread `index`, which resolves that
    /// thread's thread-locals.
    pub fn thread(&self, index: usize) -> Option<ThreadMemory<'_>> {
        self.threads.get(index).map(|thread| ThreadMemory {
            snapshot: self,
            thread,
        })
    }
}

impl MemoryView for MemorySnapshot {
    fn symbol_address(&self, name: &str) -> Result<u64, ReadError> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| ReadError::UnknownSymbol(name.to_string()))
    }

    fn read_bytes(&self, address: u64, len: usize) -> Result<Cow<'_, [u8]>, ReadError> {
        self.region_at_address(address)
            .and_then(|region| region.get_bytes_at_address(address, len))
            .map(Cow::Borrowed)
            .ok_or(ReadError::Unmapped { address, len })
    }
}

/// Memory as seen from one thread of a [`MemorySnapshot`].
#[derive(Clone, Copy, Debug)]
pub struct ThreadMemory<'a> {
    snapshot: &'a MemorySnapshot,
    thread: &'a ThreadSnapshot,
}

impl<'a> ThreadMemory<'a> {
    pub fn info(&self) -> &'a ThreadSnapshot {
        self.thread
    }

    pub fn snapshot(&self) -> &'a MemorySnapshot {
        self.snapshot
    }
}

impl<'a> MemoryView for ThreadMemory<'a> {
    fn symbol_address(&self, name: &str) -> Result<u64, ReadError> {
        match self.thread.thread_locals.get(name) {
            Some(&address) => Ok(address),
            None => self.snapshot.symbol_address(name),
        }
    }

    fn read_bytes(&self, address: u64, len: usize) -> Result<Cow<'_, [u8]>, ReadError> {
        self.snapshot.read_bytes(address, len)
    }
}

/// Check a snapshot for problems that don't prevent loading it.
pub fn lint(snapshot: &MemorySnapshot) {
    for (name, &address) in snapshot.symbols() {
        if snapshot.region_at_address(address).is_none() {
            warn!("symbol {} at {:#x} is not backed by any region", name, address);
        }
    }
}
