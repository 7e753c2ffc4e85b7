// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The result of a stack walk and its textual rendering.

use std::fmt;
use std::io::{self, Write};

use serde::{Serialize, Serializer};

/// What a frame's return-address column shows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnAddress {
    Address(u64),
    /// The frame belongs to a suspended resumable and has no live caller.
    Suspended,
    /// The return address couldn't be determined.
    Unknown,
}

impl fmt::Display for ReturnAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReturnAddress::Address(addr) => write!(f, "0x{:08x}", addr),
            ReturnAddress::Suspended => f.write_str("{suspended}"),
            ReturnAddress::Unknown => f.write_str("0x????????"),
        }
    }
}

impl Serialize for ReturnAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn serialize_hex<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{:#x}", value))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Native,
    Interpreted,
}

/// A source file and, if known, a line in it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// A single frame of a walked stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Position in the stack, innermost frame first.
    pub index: usize,
    #[serde(serialize_with = "serialize_hex")]
    pub frame_pointer: u64,
    pub return_address: ReturnAddress,
    /// The function label, e.g. `[PHP] foo()` or `main()`.
    pub function: String,
    /// Absent for builtins and for frames whose source couldn't be resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLocation>,
    pub kind: FrameKind,
}

impl Frame {
    /// The frame pointer as it appears in the rendered stack.
    pub fn frame_pointer_string(&self) -> String {
        format!("{:#x}", self.frame_pointer)
    }

    /// Render this frame as one line, padding the frame pointer to `fp_width`.
    pub fn stringify(&self, fp_width: usize) -> String {
        let mut out = format!(
            "#{:<2} {:<width$} @ {}: {}",
            self.index,
            self.frame_pointer_string(),
            self.return_address,
            self.function,
            width = fp_width
        );
        if let Some(ref source) = self.source {
            out.push_str(" at ");
            out.push_str(&source.file);
            if let Some(line) = source.line {
                out.push_str(&format!(":{}", line));
            }
        }
        out
    }
}

/// Render `frames` as aligned lines, one per frame.
pub fn stringify_stack(frames: &[Frame]) -> Vec<String> {
    let fp_width = frames
        .iter()
        .map(|frame| frame.frame_pointer_string().len())
        .max()
        .unwrap_or(0);
    frames.iter().map(|frame| frame.stringify(fp_width)).collect()
}

/// How a stack walk ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CallStackInfo {
    /// Everything went great.
    Ok,
    /// The thread's stack bounds couldn't be read, so nothing was walked.
    MissingStackBounds,
    /// The walk was cut short by the frame limit.
    FrameLimit,
    /// The walk was cut short by unreadable memory.
    ReadFailure,
    /// There was nothing to walk.
    NoFrames,
}

/// A stack of [`Frame`]s produced by walking a thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallStack {
    /// The frames, innermost first.
    pub frames: Vec<Frame>,
    pub info: CallStackInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
}

impl CallStack {
    pub fn with_info(info: CallStackInfo) -> CallStack {
        CallStack {
            frames: vec![],
            info,
            thread_name: None,
        }
    }

    pub fn stringify(&self) -> Vec<String> {
        stringify_stack(&self.frames)
    }

    /// Write a human-readable rendering of the stack to `f`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        if let Some(ref name) = self.thread_name {
            writeln!(f, "Thread {}", name)?;
        }
        if self.frames.is_empty() {
            writeln!(f, "<no frames>")?;
        }
        for line in self.stringify() {
            writeln!(f, "{}", line)?;
        }
        match self.info {
            CallStackInfo::Ok | CallStackInfo::NoFrames => {}
            CallStackInfo::MissingStackBounds => writeln!(f, "(stack bounds unavailable)")?,
            CallStackInfo::FrameLimit => writeln!(f, "(truncated at frame limit)")?,
            CallStackInfo::ReadFailure => writeln!(f, "(truncated by unreadable memory)")?,
        }
        Ok(())
    }

    /// Write the stack to `f` as JSON.
    pub fn print_json<T: Write>(&self, f: &mut T, pretty: bool) -> Result<(), serde_json::Error> {
        if pretty {
            serde_json::to_writer_pretty(&mut *f, self)?;
        } else {
            serde_json::to_writer(&mut *f, self)?;
        }
        writeln!(f).map_err(serde_json::Error::io)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(index: usize, fp: u64, source: Option<(&str, Option<u32>)>) -> Frame {
        Frame {
            index,
            frame_pointer: fp,
            return_address: ReturnAddress::Address(0x1234),
            function: "[PHP] foo()".to_string(),
            source: source.map(|(file, line)| SourceLocation {
                file: file.to_string(),
                line,
            }),
            kind: FrameKind::Interpreted,
        }
    }

    #[test]
    fn test_return_address_rendering() {
        assert_eq!(ReturnAddress::Address(0x1234).to_string(), "0x00001234");
        assert_eq!(
            ReturnAddress::Address(0x7fff_0000_1234).to_string(),
            "0x7fff00001234"
        );
        assert_eq!(ReturnAddress::Suspended.to_string(), "{suspended}");
        assert_eq!(ReturnAddress::Unknown.to_string(), "0x????????");
    }

    #[test]
    fn test_source_suffix() {
        let with_line = frame(0, 0x10, Some(("a.php", Some(7)))).stringify(0);
        assert_eq!(with_line, "#0  0x10 @ 0x00001234: [PHP] foo() at a.php:7");
        let without_line = frame(0, 0x10, Some(("a.php", None))).stringify(0);
        assert!(without_line.ends_with(" at a.php"));
        let without_file = frame(0, 0x10, None).stringify(0);
        assert!(!without_file.contains(" at "));
    }

    #[test]
    fn test_alignment() {
        let frames = vec![
            frame(0, 0x10, None),
            frame(1, 0x7ffd00000020, None),
            frame(10, 0x100, None),
        ];
        assert_eq!(
            stringify_stack(&frames),
            vec![
                "#0  0x10           @ 0x00001234: [PHP] foo()",
                "#1  0x7ffd00000020 @ 0x00001234: [PHP] foo()",
                "#10 0x100          @ 0x00001234: [PHP] foo()",
            ]
        );
    }

    #[test]
    fn test_empty_stack() {
        assert!(stringify_stack(&[]).is_empty());
        let mut out = vec![];
        CallStack::with_info(CallStackInfo::NoFrames)
            .print(&mut out)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "<no frames>\n");
    }

    #[test]
    fn test_json() {
        let stack = CallStack {
            frames: vec![frame(0, 0x10, Some(("a.php", None)))],
            info: CallStackInfo::Ok,
            thread_name: None,
        };
        let mut out = vec![];
        stack.print_json(&mut out, false).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["info"], "Ok");
        let f = &value["frames"][0];
        assert_eq!(f["frame_pointer"], "0x10");
        assert_eq!(f["return_address"], "0x00001234");
        assert_eq!(f["kind"], "interpreted");
        assert_eq!(f["source"]["file"], "a.php");
        assert!(f["source"].get("line").is_none());
    }
}
