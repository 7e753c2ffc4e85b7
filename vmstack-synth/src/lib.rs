// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic VM process snapshots for testing.
//!
//! This intentionally doesn't use vmstack-common's layouts, so that we can
//! catch incorrect changes to the layouts themselves: every object is laid
//! out by hand at the offsets of the reference build.
//!
//! Basic usage is to create a [`SynthProcess`], use its methods to build up
//! the heap, the VM stack and the threads, and then `finish()` to get a
//! [`MemorySnapshot`]. Objects refer to each other through test_assembler
//! [`Label`]s, so they can be added in any order.

// Some test_assembler types do not have Debug, so be a bit more lenient here.
#![allow(missing_debug_implementations)]

use std::collections::BTreeMap;

use test_assembler::*;
use vmstack::{MemoryRegion, MemorySnapshot, NativeFrameRecord, SnapshotFile, ThreadSnapshot};
use vmstack_common::format::{CODE_CACHE_SYMBOL, STACK_LIMIT_SYMBOL, STACK_SIZE_SYMBOL};

/// Where process-wide and thread-local variables live.
pub const GLOBALS_BASE: u64 = 0x0060_0000;
/// Where heap objects live.
pub const HEAP_BASE: u64 = 0x0100_0000;
/// The lowest address of every thread's VM stack.
pub const STACK_BASE: u64 = 0x7ffd_0000_0000;
/// The size of every thread's VM stack, unless overridden.
pub const STACK_SIZE: u64 = 0x10000;
/// Where the code cache lives, for tests that want one.
pub const CODE_BASE: u64 = 0x4000_0000;
pub const CODE_SIZE: u64 = 0x1000_0000;

/// A label with a fixed value.
pub fn const_label(value: u64) -> Label {
    let label = Label::new();
    label.set_const(value);
    label
}

fn pad8(section: Section) -> Section {
    let pad = (8 - section.size() % 8) % 8;
    section.append_repeated(0, pad as usize)
}

/// A `Func`.
pub struct Func {
    pub name: Label,
    pub unit: Label,
    pub shared: Label,
    /// The closure class, for closure bodies.
    pub base_cls: Option<Label>,
    pub attrs: u32,
}

/// A `Func::SharedData`.
pub struct Shared {
    /// Offset of the first bytecode of the function in its unit.
    pub base: u32,
    pub original_filename: Option<Label>,
    pub is_closure_body: bool,
}

/// A `Unit`.
pub struct Unit {
    pub filepath: Label,
    pub line_map: Option<Label>,
    pub repo_id: i8,
    pub serial_number: i64,
}

/// An `ActRec`.
pub struct ActRec {
    pub saved_fp: Label,
    pub saved_rip: u64,
    pub func: Label,
    /// The call offset, before being shifted past the flag bits.
    pub call_off: u32,
    /// The flag bits below the call offset.
    pub flags: u32,
}

impl ActRec {
    pub fn new(saved_fp: &Label, saved_rip: u64, func: &Label, call_off: u32) -> ActRec {
        ActRec {
            saved_fp: saved_fp.clone(),
            saved_rip,
            func: func.clone(),
            call_off,
            flags: 0,
        }
    }

    fn cite_in(&self, section: Section) -> Section {
        section
            .D64(&self.saved_fp)
            .D64(self.saved_rip)
            .D64(&self.func)
            .D32((self.call_off << 2) | (self.flags & 0x3))
            .D32(0)
    }
}

/// A native frame reported by the debugger.
pub struct NativeFrame {
    pub fp: Label,
    pub ip: u64,
    pub function: Option<String>,
}

/// A thread of the synthetic process.
#[derive(Default)]
pub struct SynthThread {
    name: Option<String>,
    stack_bounds: Option<(u64, u64)>,
    leaf_fp: Option<Label>,
    native_frames: Vec<NativeFrame>,
    resumables: Vec<Label>,
}

impl SynthThread {
    /// A thread whose VM stack covers `[STACK_BASE, STACK_BASE + STACK_SIZE)`.
    pub fn new() -> SynthThread {
        SynthThread {
            stack_bounds: Some((STACK_BASE, STACK_SIZE)),
            ..Default::default()
        }
    }

    /// A thread without readable VM stack bounds.
    pub fn without_stack_bounds() -> SynthThread {
        Default::default()
    }

    pub fn name(mut self, name: &str) -> SynthThread {
        self.name = Some(name.to_string());
        self
    }

    pub fn stack_bounds(mut self, limit: u64, size: u64) -> SynthThread {
        self.stack_bounds = Some((limit, size));
        self
    }

    pub fn leaf_fp(mut self, fp: &Label) -> SynthThread {
        self.leaf_fp = Some(fp.clone());
        self
    }

    /// Add a native frame below (outside of) those already added.
    pub fn native_frame(mut self, fp: &Label, ip: u64, function: Option<&str>) -> SynthThread {
        self.native_frames.push(NativeFrame {
            fp: fp.clone(),
            ip,
            function: function.map(str::to_string),
        });
        self
    }

    pub fn resumable(mut self, resumable: &Label) -> SynthThread {
        self.resumables.push(resumable.clone());
        self
    }
}

struct ThreadEntry {
    thread: SynthThread,
    bounds: Option<(Label, Label)>,
}

/// A writer of synthetic process snapshots.
pub struct SynthProcess {
    /// Globals and thread-locals.
    globals: Section,
    /// Heap objects.
    heap: Section,
    /// The (shared) VM stack.
    stack: Section,
    /// Symbols pointing into any of the sections.
    symbols: Vec<(String, Label)>,
    threads: Vec<ThreadEntry>,
}

impl Default for SynthProcess {
    fn default() -> Self {
        SynthProcess::new()
    }
}

impl SynthProcess {
    pub fn new() -> SynthProcess {
        let globals = Section::with_endian(Endian::Little);
        globals.start().set_const(GLOBALS_BASE);
        let heap = Section::with_endian(Endian::Little);
        heap.start().set_const(HEAP_BASE);
        let stack = Section::with_endian(Endian::Little);
        stack.start().set_const(STACK_BASE);
        SynthProcess {
            globals,
            heap,
            stack,
            symbols: vec![],
            threads: vec![],
        }
    }

    /// Point symbol `name` at `address`, which need not be mapped.
    pub fn symbol(mut self, name: &str, address: u64) -> SynthProcess {
        self.symbols.push((name.to_string(), const_label(address)));
        self
    }

    /// Add the global code cache.
    pub fn code_cache(mut self, base: u64, size: u64) -> SynthProcess {
        let label = Label::new();
        self.globals = self.globals.mark(&label).D64(base).D64(size);
        self.symbols.push((CODE_CACHE_SYMBOL.to_string(), label));
        self
    }

    /// Add a `StringData` holding `s`.
    pub fn string(mut self, label: &Label, s: &str) -> SynthProcess {
        self.heap = pad8(
            self.heap
                .mark(label)
                .D64(1) // refcount
                .D32(s.len() as u32)
                .D32(0) // hash
                .append_bytes(s.as_bytes()),
        );
        self
    }

    /// Add a line map of `(base, past, line)` ranges.
    pub fn line_map(mut self, label: &Label, ranges: &[(u32, u32, u32)]) -> SynthProcess {
        let mut heap = self.heap.mark(label).D32(ranges.len() as u32).D32(0);
        for &(base, past, line) in ranges {
            heap = heap.D32(base).D32(past).D32(line);
        }
        self.heap = pad8(heap);
        self
    }

    pub fn unit(mut self, label: &Label, unit: Unit) -> SynthProcess {
        let heap = self
            .heap
            .mark(label)
            .D64(&unit.filepath)
            .D64(unit.line_map.as_ref().unwrap_or(&const_label(0)))
            .D8(unit.repo_id as u8)
            .append_repeated(0, 7)
            .D64(unit.serial_number as u64);
        self.heap = heap;
        self
    }

    pub fn shared(mut self, label: &Label, shared: Shared) -> SynthProcess {
        self.heap = self
            .heap
            .mark(label)
            .D32(shared.base)
            .D32(0)
            .D64(shared.original_filename.as_ref().unwrap_or(&const_label(0)))
            .D8(shared.is_closure_body as u8)
            .append_repeated(0, 7);
        self
    }

    pub fn class(mut self, label: &Label, name: &Label) -> SynthProcess {
        self.heap = self.heap.mark(label).D64(0).D64(name);
        self
    }

    pub fn func(mut self, label: &Label, func: Func) -> SynthProcess {
        self.heap = self
            .heap
            .mark(label)
            .D64(&func.name)
            .D64(&func.unit)
            .D64(&func.shared)
            .D64(func.base_cls.as_ref().unwrap_or(&const_label(0)))
            .D32(func.attrs)
            .D32(0);
        self
    }

    /// Push an activation record onto the VM stack.
    pub fn act_rec(mut self, label: &Label, act_rec: ActRec) -> SynthProcess {
        self.stack = act_rec.cite_in(self.stack.mark(label));
        self
    }

    /// Place `label` at the current top of the VM stack without adding data.
    pub fn mark_stack(mut self, label: &Label) -> SynthProcess {
        self.stack = self.stack.mark(label);
        self
    }

    /// Push `len` bytes of filler onto the VM stack.
    pub fn stack_filler(mut self, len: usize) -> SynthProcess {
        self.stack = pad8(self.stack.append_repeated(0, len));
        self
    }

    /// Add a suspended resumable whose embedded activation record is `act_rec`.
    pub fn resumable(mut self, label: &Label, act_rec: ActRec, resume_offset: u32) -> SynthProcess {
        self.heap = act_rec
            .cite_in(self.heap.mark(label))
            .D32(resume_offset)
            .D32(0);
        self
    }

    pub fn thread(mut self, thread: SynthThread) -> SynthProcess {
        let bounds = match thread.stack_bounds {
            Some((limit, size)) => {
                let limit_label = Label::new();
                let size_label = Label::new();
                self.globals = self
                    .globals
                    .mark(&limit_label)
                    .D64(limit)
                    .mark(&size_label)
                    .D64(size);
                Some((limit_label, size_label))
            }
            None => None,
        };
        self.threads.push(ThreadEntry { thread, bounds });
        self
    }

    /// Lay everything out and produce the snapshot.
    ///
    /// Returns `None` if a label was used but never placed.
    pub fn finish(self) -> Option<MemorySnapshot> {
        let mut file = SnapshotFile::default();
        for (name, label) in &self.symbols {
            file.symbols.insert(name.clone(), label.value()?);
        }
        for entry in &self.threads {
            let thread = &entry.thread;
            let mut thread_locals = BTreeMap::new();
            if let Some((limit, size)) = &entry.bounds {
                thread_locals.insert(STACK_LIMIT_SYMBOL.to_string(), limit.value()?);
                thread_locals.insert(STACK_SIZE_SYMBOL.to_string(), size.value()?);
            }
            let leaf_fp = match &thread.leaf_fp {
                Some(fp) => Some(fp.value()?),
                None => None,
            };
            let mut native_frames = Vec::with_capacity(thread.native_frames.len());
            for frame in &thread.native_frames {
                native_frames.push(NativeFrameRecord {
                    fp: frame.fp.value()?,
                    ip: frame.ip,
                    function: frame.function.clone(),
                    file: None,
                    line: None,
                });
            }
            let mut resumables = Vec::with_capacity(thread.resumables.len());
            for resumable in &thread.resumables {
                resumables.push(resumable.value()?);
            }
            file.threads.push(ThreadSnapshot {
                name: thread.name.clone(),
                thread_locals,
                leaf_fp,
                native_frames,
                resumables,
            });
        }
        for section in [self.globals, self.heap, self.stack] {
            if section.size() == 0 {
                continue;
            }
            let base = section.start().value()?;
            let bytes = section.get_contents()?;
            file.regions.push(MemoryRegion::new(base, bytes));
        }
        MemorySnapshot::from_file(file).ok()
    }
}
