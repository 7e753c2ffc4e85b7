// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Layouts of the target VM's runtime structures.
//!
//! The stack walker never links against the target VM, so everything it
//! knows about the shape of an activation record, a function, a unit and so
//! on lives here as plain byte offsets. [`VmLayout::default`] describes the
//! reference 64-bit little-endian build; any other build can be described by
//! a (partial) JSON file loaded with [`VmLayout::from_json_path`], where
//! omitted fields keep their default values.
//!
//! All pointers in the target are 8 bytes wide.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Name of the global holding the code cache (translation cache) bounds.
pub const CODE_CACHE_SYMBOL: &str = "HPHP::jit::tc::g_code";
/// Name of the thread-local holding the lowest address of the VM stack.
pub const STACK_LIMIT_SYMBOL: &str = "HPHP::s_stackLimit";
/// Name of the thread-local holding the size of the VM stack.
pub const STACK_SIZE_SYMBOL: &str = "HPHP::s_stackSize";

/// Upper bound of the code cache when its bounds can't be read.
///
/// The translation cache is normally mapped in low memory, right above the
/// data section, so this bounds the degraded guess to the low 4GiB.
pub const DEFAULT_FALLBACK_CODE_END: u64 = 0x1_0000_0000;

/// `Func` attribute bit marking functions implemented natively.
pub const ATTR_BUILTIN: u32 = 1 << 26;

/// Width of a target pointer.
pub const POINTER_WIDTH: u64 = 8;

/// A single bit (or set of bits) in a byte-sized bitfield.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    /// Offset of the byte holding the bits.
    pub offset: u64,
    /// Mask selecting the bits within that byte.
    pub mask: u8,
}

/// The global `CodeCache` object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeCacheLayout {
    /// `m_base`: first address of the cache.
    pub base: u64,
    /// `m_codeSize`: size in bytes.
    pub code_size: u64,
}

impl Default for CodeCacheLayout {
    fn default() -> Self {
        CodeCacheLayout {
            base: 0x00,
            code_size: 0x08,
        }
    }
}

/// An interpreted activation record (`ActRec`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActRecLayout {
    /// `m_sfp`: the caller's activation record.
    pub saved_fp: u64,
    /// `m_savedRip`: native return address.
    pub saved_rip: u64,
    /// `m_func`: the executing `Func`.
    pub func: u64,
    /// `m_callOffAndFlags`: 32-bit call offset, shifted left past the flags.
    pub call_off_and_flags: u64,
    /// Number of flag bits below the call offset.
    pub call_off_shift: u32,
}

impl Default for ActRecLayout {
    fn default() -> Self {
        ActRecLayout {
            saved_fp: 0x00,
            saved_rip: 0x08,
            func: 0x10,
            call_off_and_flags: 0x18,
            call_off_shift: 2,
        }
    }
}

/// A function (`Func`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuncLayout {
    /// `m_fullName`: qualified name, a `StringData*`.
    pub full_name: u64,
    /// `m_unit`: the owning `Unit*`.
    pub unit: u64,
    /// `m_shared`: the `SharedData*`.
    pub shared: u64,
    /// `m_baseCls`: for closure bodies, the closure class.
    pub base_cls: u64,
    /// `m_attrs.m_attrs`: 32-bit attribute mask, mutated concurrently.
    pub attrs: u64,
}

impl Default for FuncLayout {
    fn default() -> Self {
        FuncLayout {
            full_name: 0x00,
            unit: 0x08,
            shared: 0x10,
            base_cls: 0x18,
            attrs: 0x20,
        }
    }
}

/// Data shared between clones of a function (`Func::SharedData`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedDataLayout {
    /// `m_base`: 32-bit offset of the function's first bytecode.
    pub base: u64,
    /// `m_originalFilename`: `StringData*`, null unless overridden.
    pub original_filename: u64,
    /// `m_isClosureBody` bit.
    pub is_closure_body: BitField,
}

impl Default for SharedDataLayout {
    fn default() -> Self {
        SharedDataLayout {
            base: 0x00,
            original_filename: 0x08,
            is_closure_body: BitField {
                offset: 0x10,
                mask: 0x01,
            },
        }
    }
}

/// A class (`Class`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassLayout {
    /// Qualified class name, a `StringData*`.
    pub name: u64,
}

impl Default for ClassLayout {
    fn default() -> Self {
        ClassLayout { name: 0x08 }
    }
}

/// A compilation unit (`Unit`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitLayout {
    /// `m_filepath`: `StringData*`.
    pub filepath: u64,
    /// `m_lineMap.val`: pointer to the compact line map, null if absent.
    pub line_map: u64,
    /// `m_repoId`: signed 8-bit repository id, negative if not from a repo.
    pub repo_id: u64,
    /// `m_sn`: signed 64-bit serial number within the repository.
    pub serial_number: u64,
}

impl Default for UnitLayout {
    fn default() -> Self {
        UnitLayout {
            filepath: 0x00,
            line_map: 0x08,
            repo_id: 0x10,
            serial_number: 0x18,
        }
    }
}

/// The compact vector of `((base, past), line)` entries hanging off a unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineMapLayout {
    /// 32-bit element count in the vector header.
    pub len: u64,
    /// Offset of the first element from the header.
    pub entries: u64,
    /// Size of one element.
    pub entry_size: u64,
    /// 32-bit range start within an element.
    pub base: u64,
    /// 32-bit range end (exclusive) within an element.
    pub past: u64,
    /// 32-bit line within an element.
    pub line: u64,
}

impl Default for LineMapLayout {
    fn default() -> Self {
        LineMapLayout {
            len: 0x00,
            entries: 0x08,
            entry_size: 0x0c,
            base: 0x00,
            past: 0x04,
            line: 0x08,
        }
    }
}

/// A string (`StringData`), stored inline after its header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringLayout {
    /// 32-bit length in bytes.
    pub len: u64,
    /// Offset of the first character.
    pub data: u64,
    /// Longest string we're willing to read.
    pub max_len: u32,
}

impl Default for StringLayout {
    fn default() -> Self {
        StringLayout {
            len: 0x08,
            data: 0x10,
            max_len: 64 * 1024,
        }
    }
}

/// A suspended generator or async function (`Resumable`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumableLayout {
    /// The embedded activation record.
    pub act_rec: u64,
    /// `m_resumeOffset`: 32-bit bytecode offset to resume at.
    pub resume_offset: u64,
}

impl Default for ResumableLayout {
    fn default() -> Self {
        ResumableLayout {
            act_rec: 0x00,
            resume_offset: 0x20,
        }
    }
}

/// Names of the process-wide and thread-local symbols the walker reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolNames {
    pub code_cache: String,
    pub stack_limit: String,
    pub stack_size: String,
}

impl Default for SymbolNames {
    fn default() -> Self {
        SymbolNames {
            code_cache: CODE_CACHE_SYMBOL.to_string(),
            stack_limit: STACK_LIMIT_SYMBOL.to_string(),
            stack_size: STACK_SIZE_SYMBOL.to_string(),
        }
    }
}

/// Everything the stack walker needs to know about the target's build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmLayout {
    pub symbols: SymbolNames,
    pub code_cache: CodeCacheLayout,
    pub act_rec: ActRecLayout,
    pub func: FuncLayout,
    pub shared: SharedDataLayout,
    pub class: ClassLayout,
    pub unit: UnitLayout,
    pub line_map: LineMapLayout,
    pub string: StringLayout,
    pub resumable: ResumableLayout,
    /// Attribute bit(s) marking builtin functions.
    pub attr_builtin: u32,
    /// Exclusive upper bound of the code cache when its bounds are unreadable.
    pub fallback_code_end: u64,
}

impl Default for VmLayout {
    fn default() -> Self {
        VmLayout {
            symbols: SymbolNames::default(),
            code_cache: CodeCacheLayout::default(),
            act_rec: ActRecLayout::default(),
            func: FuncLayout::default(),
            shared: SharedDataLayout::default(),
            class: ClassLayout::default(),
            unit: UnitLayout::default(),
            line_map: LineMapLayout::default(),
            string: StringLayout::default(),
            resumable: ResumableLayout::default(),
            attr_builtin: ATTR_BUILTIN,
            fallback_code_end: DEFAULT_FALLBACK_CODE_END,
        }
    }
}

/// Errors encountered while loading a [`VmLayout`].
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("couldn't open layout file: {0}")]
    Io(#[from] std::io::Error),
    #[error("couldn't parse layout file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("call offset shift {0} must be less than 32")]
    CallOffShift(u32),
}

impl LayoutError {
    /// Returns just the name of the error, for terse logging.
    pub fn name(&self) -> &'static str {
        match self {
            LayoutError::Io(_) => "Io",
            LayoutError::Parse(_) => "Parse",
            LayoutError::CallOffShift(_) => "CallOffShift",
        }
    }
}

impl VmLayout {
    /// Read a layout from a JSON file. Missing fields keep their defaults.
    pub fn from_json_path<P: AsRef<Path>>(path: P) -> Result<VmLayout, LayoutError> {
        let file = File::open(path)?;
        let layout: VmLayout = serde_json::from_reader(BufReader::new(file))?;
        layout.validate()
    }

    /// Parse a layout from a JSON string. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<VmLayout, LayoutError> {
        let layout: VmLayout = serde_json::from_str(json)?;
        layout.validate()
    }

    fn validate(self) -> Result<VmLayout, LayoutError> {
        if self.act_rec.call_off_shift >= u32::BITS {
            return Err(LayoutError::CallOffShift(self.act_rec.call_off_shift));
        }
        Ok(self)
    }
}
