// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use tracing::{debug, trace};
use vmstack::NativeFrameRecord;
use vmstack_common::format::VmLayout;
use vmstack_common::traits::{field_address, LineTableStore, MemoryView, ReadError};

use crate::call_stack::{Frame, FrameKind, ReturnAddress, SourceLocation};
use crate::lines::LineTableResolver;

/// Name given to file-scope code, which has no declared name.
pub const PSEUDOMAIN: &str = "<pseudomain>";
/// Name given to functions that couldn't be identified.
pub const UNKNOWN_FUNCTION: &str = "<unknown>";

/// Where an interpreted frame's bytecode offset comes from.
#[derive(Clone, Copy, Debug)]
enum Pc {
    /// The call offset saved in the activation record.
    FromActRec,
    Explicit(u64),
    /// Known to be unavailable.
    Unknown,
}

/// Turns raw frame addresses into [`Frame`]s.
pub struct FrameBuilder<'a, M, S> {
    memory: &'a M,
    layout: &'a VmLayout,
    lines: LineTableResolver<'a, M, S>,
}

impl<'a, M, S> FrameBuilder<'a, M, S>
where
    M: MemoryView,
    S: LineTableStore,
{
    pub fn new(memory: &'a M, layout: &'a VmLayout, store: &'a S) -> Self {
        FrameBuilder {
            memory,
            layout,
            lines: LineTableResolver::new(memory, layout, store),
        }
    }

    pub fn lines(&self) -> &LineTableResolver<'a, M, S> {
        &self.lines
    }

    /// Read the `StringData` at `ptr`.
    pub fn read_string(&self, ptr: u64) -> Result<String, ReadError> {
        let sl = &self.layout.string;
        let len = self.memory.read_u32(field_address(ptr, sl.len)?)?;
        if len > sl.max_len {
            return Err(ReadError::StringTooLong(len));
        }
        let bytes = self
            .memory
            .read_bytes(field_address(ptr, sl.data)?, len as usize)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// The qualified name of `func`, unmangled for closure bodies.
    ///
    /// Closure classes are named `<Class>;<id>`, only the part before the
    /// first `;` is kept. The result may be empty.
    pub fn function_name(&self, func: u64) -> Result<String, ReadError> {
        let fl = &self.layout.func;
        let shared = self.memory.follow_pointer(func, fl.shared)?;
        let closure_bit = &self.layout.shared.is_closure_body;
        let flags = self
            .memory
            .read_u8(field_address(shared, closure_bit.offset)?)?;

        if flags & closure_bit.mask == 0 {
            let name = self.memory.follow_pointer(func, fl.full_name)?;
            return self.read_string(name);
        }

        let cls = self.memory.follow_pointer(func, fl.base_cls)?;
        let name = self.memory.follow_pointer(cls, self.layout.class.name)?;
        let mut name = self.read_string(name)?;
        if let Some(end) = name.find(';') {
            name.truncate(end);
        }
        Ok(name)
    }

    /// Whether `func` is implemented natively.
    pub fn is_builtin(&self, func: u64) -> Result<bool, ReadError> {
        let attrs = self
            .memory
            .read_u32_atomic(field_address(func, self.layout.func.attrs)?)?;
        Ok(attrs & self.layout.attr_builtin != 0)
    }

    /// The bytecode offset `ar` is executing in `func`.
    ///
    /// `None` if the layout's call offset shift doesn't fit in 32 bits.
    pub fn act_rec_pc(&self, ar: u64, func: u64) -> Result<Option<u64>, ReadError> {
        let shared = self.memory.follow_pointer(func, self.layout.func.shared)?;
        let base = self
            .memory
            .read_u32(field_address(shared, self.layout.shared.base)?)?;
        let call_off_and_flags = self
            .memory
            .read_u32(field_address(ar, self.layout.act_rec.call_off_and_flags)?)?;
        Ok(call_off_and_flags
            .checked_shr(self.layout.act_rec.call_off_shift)
            .map(|call_off| base as u64 + call_off as u64))
    }

    /// The source file of `func`: its original filename if it was given one,
    /// else its unit's path.
    pub fn filename(&self, func: u64) -> Result<String, ReadError> {
        let fl = &self.layout.func;
        let shared = self.memory.follow_pointer(func, fl.shared)?;
        let original = self
            .memory
            .read_pointer_field(shared, self.layout.shared.original_filename)?;
        if original != 0 {
            return self.read_string(original);
        }
        let unit = self.memory.follow_pointer(func, fl.unit)?;
        let path = self
            .memory
            .follow_pointer(unit, self.layout.unit.filepath)?;
        self.read_string(path)
    }

    /// Build a native frame from the debugger's record of it.
    ///
    /// The label is `name()` for a symbolized frame, else `fallback_name`,
    /// else `<unknown>`.
    pub fn native_frame(
        &self,
        index: usize,
        record: &NativeFrameRecord,
        fallback_name: Option<&str>,
    ) -> Frame {
        let function = match (&record.function, fallback_name) {
            (Some(name), _) => format!("{}()", name),
            (None, Some(fallback)) => fallback.to_string(),
            (None, None) => UNKNOWN_FUNCTION.to_string(),
        };
        let source = record.file.as_ref().map(|file| SourceLocation {
            file: file.clone(),
            line: record.line,
        });
        Frame {
            index,
            frame_pointer: record.fp,
            return_address: ReturnAddress::Address(record.ip),
            function,
            source,
            kind: FrameKind::Native,
        }
    }

    /// Build the frame of the interpreted activation record at `ar`.
    ///
    /// `pc` overrides the bytecode offset, which is otherwise derived from
    /// the record's saved call offset.
    pub fn interpreted_frame(
        &self,
        index: usize,
        ar: u64,
        return_address: ReturnAddress,
        pc: Option<u64>,
    ) -> Frame {
        let pc = pc.map_or(Pc::FromActRec, Pc::Explicit);
        self.build_interpreted(index, ar, return_address, pc)
    }

    /// Build the frame of the suspended resumable at `resumable`.
    pub fn resumable_frame(&self, index: usize, resumable: u64) -> Frame {
        let rl = &self.layout.resumable;
        let ar = resumable.wrapping_add(rl.act_rec);
        let pc = match field_address(resumable, rl.resume_offset)
            .and_then(|addr| self.memory.read_u32(addr))
        {
            Ok(offset) => Pc::Explicit(offset as u64),
            Err(e) => {
                debug!("couldn't read resume offset of {:#x}: {}", resumable, e);
                Pc::Unknown
            }
        };
        self.build_interpreted(index, ar, ReturnAddress::Suspended, pc)
    }

    fn build_interpreted(
        &self,
        index: usize,
        ar: u64,
        return_address: ReturnAddress,
        pc: Pc,
    ) -> Frame {
        let mut frame = Frame {
            index,
            frame_pointer: ar,
            return_address,
            function: format!("[PHP] {}()", UNKNOWN_FUNCTION),
            source: None,
            kind: FrameKind::Interpreted,
        };

        let func = match self.memory.follow_pointer(ar, self.layout.act_rec.func) {
            Ok(func) => func,
            Err(e) => {
                debug!("couldn't read function of frame {:#x}: {}", ar, e);
                return frame;
            }
        };

        match self.function_name(func) {
            Ok(name) if name.is_empty() => frame.function = format!("[PHP] {}()", PSEUDOMAIN),
            Ok(name) => frame.function = format!("[PHP] {}()", name),
            Err(e) => debug!("couldn't read name of function {:#x}: {}", func, e),
        }

        match self.is_builtin(func) {
            Ok(true) => {
                trace!("frame {:#x} is a builtin", ar);
                return frame;
            }
            Ok(false) => {}
            Err(e) => debug!("couldn't read attributes of function {:#x}: {}", func, e),
        }

        let pc = match pc {
            Pc::Explicit(pc) => Some(pc),
            Pc::Unknown => None,
            Pc::FromActRec => match self.act_rec_pc(ar, func) {
                Ok(Some(pc)) => Some(pc),
                Ok(None) => {
                    debug!(
                        "call offset shift {} is out of range",
                        self.layout.act_rec.call_off_shift
                    );
                    None
                }
                Err(e) => {
                    debug!("couldn't compute pc of frame {:#x}: {}", ar, e);
                    None
                }
            },
        };

        let file = match self.filename(func) {
            Ok(file) => file,
            Err(e) => {
                debug!("couldn't read filename of function {:#x}: {}", func, e);
                return frame;
            }
        };

        let line = pc.and_then(|pc| {
            let unit = self.memory.follow_pointer(func, self.layout.func.unit).ok()?;
            self.lines.resolve_line(unit, pc)
        });
        frame.source = Some(SourceLocation { file, line });
        frame
    }
}
