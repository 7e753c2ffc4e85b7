// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use tracing::{debug, trace, warn};
use vmstack_common::format::VmLayout;
use vmstack_common::traits::{field_address, LineTableStore, MemoryView, ReadError, UnitId};
use vmstack_linetable::{LineMap, LineRange, LineTable};

/// Resolves bytecode offsets within a unit to source lines.
///
/// The unit's in-memory line map is consulted first. Units without one, or
/// whose map doesn't cover the offset, fall back to the line table persisted
/// in the unit's repository.
pub struct LineTableResolver<'a, M, S> {
    memory: &'a M,
    layout: &'a VmLayout,
    store: &'a S,
}

impl<'a, M, S> LineTableResolver<'a, M, S>
where
    M: MemoryView,
    S: LineTableStore,
{
    pub fn new(memory: &'a M, layout: &'a VmLayout, store: &'a S) -> Self {
        LineTableResolver {
            memory,
            layout,
            store,
        }
    }

    /// Read the in-memory line map of `unit`, if it has one.
    ///
    /// Entries are read in order until the first unreadable one.
    pub fn line_map(&self, unit: u64) -> Result<Option<LineMap>, ReadError> {
        let lm = &self.layout.line_map;
        let vec = self
            .memory
            .read_pointer_field(unit, self.layout.unit.line_map)?;
        if vec == 0 {
            return Ok(None);
        }
        let len = self.memory.read_u32(field_address(vec, lm.len)?)?;
        let entries = field_address(vec, lm.entries)?;

        let mut map = LineMap::new();
        for i in 0..len as u64 {
            let entry = match i
                .checked_mul(lm.entry_size)
                .and_then(|off| entries.checked_add(off))
            {
                Some(entry) => entry,
                None => break,
            };
            match self.read_line_range(entry) {
                Ok(range) => map.push(range),
                Err(e) => {
                    debug!(
                        "line map of unit {:#x} unreadable after {} of {} entries: {}",
                        unit, i, len, e
                    );
                    break;
                }
            }
        }
        Ok(Some(map))
    }

    fn read_line_range(&self, entry: u64) -> Result<LineRange, ReadError> {
        let lm = &self.layout.line_map;
        Ok(LineRange {
            base: self.memory.read_u32(field_address(entry, lm.base)?)?,
            past: self.memory.read_u32(field_address(entry, lm.past)?)?,
            line: self.memory.read_u32(field_address(entry, lm.line)?)?,
        })
    }

    /// The repository identity of `unit`.
    pub fn unit_id(&self, unit: u64) -> Result<UnitId, ReadError> {
        let ul = &self.layout.unit;
        Ok(UnitId {
            repo_id: self.memory.read_i8(field_address(unit, ul.repo_id)?)?,
            serial_number: self.memory.read_i64(field_address(unit, ul.serial_number)?)?,
        })
    }

    /// Look `pc` up in the persisted line table of `unit`.
    pub fn persisted_line(&self, unit: UnitId, pc: u32) -> Option<u32> {
        if unit.repo_id < 0 {
            return None;
        }
        let buf = match self.store.line_table(unit) {
            Ok(Some(buf)) => buf,
            Ok(None) => {
                trace!("no persisted line table for {}", unit);
                return None;
            }
            Err(e) => {
                warn!("line table lookup for {} failed: {}", unit, e);
                return None;
            }
        };
        match LineTable::parse(&buf) {
            Ok(table) => table.line_for_offset(pc),
            Err(e) => {
                warn!("discarding corrupt line table for {}: {}", unit, e);
                None
            }
        }
    }

    /// The line of bytecode offset `pc` in `unit`.
    pub fn resolve_line(&self, unit: u64, pc: u64) -> Option<u32> {
        // Offsets are 32-bit, nothing covers a larger pc.
        let pc = u32::try_from(pc).ok()?;

        match self.line_map(unit) {
            Ok(Some(map)) => {
                if let Some(line) = map.lookup(pc) {
                    return Some(line);
                }
            }
            Ok(None) => {}
            Err(e) => debug!("couldn't read line map of unit {:#x}: {}", unit, e),
        }

        match self.unit_id(unit) {
            Ok(id) => self.persisted_line(id, pc),
            Err(e) => {
                debug!("couldn't read identity of unit {:#x}: {}", unit, e);
                None
            }
        }
    }
}
