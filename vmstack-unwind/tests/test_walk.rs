// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use test_assembler::*;
use vmstack::MemorySnapshot;
use vmstack_common::format::VmLayout;
use vmstack_linetable::{encode_line_table, LineTableEntry};
use vmstack_repo::{write_line_tables, RepoStore};
use vmstack_synth::*;
use vmstack_unwind::*;

/// Labels for one interpreted function and its unit.
struct FuncLabels {
    func: Label,
    name: Label,
    shared: Label,
    unit: Label,
    path: Label,
}

impl FuncLabels {
    fn new() -> FuncLabels {
        FuncLabels {
            func: Label::new(),
            name: Label::new(),
            shared: Label::new(),
            unit: Label::new(),
            path: Label::new(),
        }
    }
}

/// Add a function `name` in `file`, at bytecode base 0 of a repository unit.
fn add_func(
    p: SynthProcess,
    labels: &FuncLabels,
    name: &str,
    file: &str,
    serial_number: i64,
) -> SynthProcess {
    p.string(&labels.name, name)
        .string(&labels.path, file)
        .unit(
            &labels.unit,
            Unit {
                filepath: labels.path.clone(),
                line_map: None,
                repo_id: 0,
                serial_number,
            },
        )
        .shared(
            &labels.shared,
            Shared {
                base: 0,
                original_filename: None,
                is_closure_body: false,
            },
        )
        .func(
            &labels.func,
            Func {
                name: labels.name.clone(),
                unit: labels.unit.clone(),
                shared: labels.shared.clone(),
                base_cls: None,
                attrs: 0,
            },
        )
}

fn repo(dir: &tempfile::TempDir) -> RepoStore {
    let path = dir.path().join("repo.hhbc");
    let main_table = encode_line_table(&[
        LineTableEntry {
            past_offset: 8,
            line: 3,
        },
        LineTableEntry {
            past_offset: 16,
            line: 4,
        },
    ]);
    let helper_table = encode_line_table(&[LineTableEntry {
        past_offset: 100,
        line: 20,
    }]);
    write_line_tables(&path, None, vec![(1, &main_table[..]), (2, &helper_table[..])]).unwrap();
    let mut store = RepoStore::new();
    store.add_repo(0, &path);
    store
}

/// `main` (call offset 10) calls `helper` (call offset 2) through native
/// code, plus one suspended generator.
struct Fixture {
    process: MemorySnapshot,
    leaf: u64,
    outer: u64,
    resumable: u64,
}

fn fixture() -> Fixture {
    let main = FuncLabels::new();
    let helper = FuncLabels::new();
    let leaf = Label::new();
    let outer = Label::new();
    let resumable = Label::new();

    let mut p = SynthProcess::new()
        .code_cache(CODE_BASE, CODE_SIZE)
        .act_rec(&leaf, ActRec::new(&outer, CODE_BASE + 0x40, &helper.func, 2))
        .stack_filler(0x30)
        .act_rec(&outer, ActRec::new(&const_label(0), 0x40_2000, &main.func, 10))
        .resumable(&resumable, ActRec::new(&const_label(0), 0, &main.func, 0), 12);
    p = add_func(p, &main, "main", "/src/main.php", 1);
    p = add_func(p, &helper, "helper", "/src/helper.php", 2);

    let inner_native = Label::new();
    inner_native.set_const(0x7fff_5000);
    let process = p
        .thread(
            SynthThread::new()
                .name("request")
                .leaf_fp(&leaf)
                .native_frame(&inner_native, 0x40_1000, Some("HPHP::f_sleep"))
                .native_frame(&leaf, CODE_BASE + 0x10, None)
                .native_frame(&outer, CODE_BASE + 0x40, None)
                .resumable(&resumable),
        )
        .finish()
        .unwrap();

    Fixture {
        process,
        leaf: leaf.value().unwrap(),
        outer: outer.value().unwrap(),
        resumable: resumable.value().unwrap(),
    }
}

#[test]
fn test_interpreted_walk() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let store = repo(&dir);
    let layout = VmLayout::default();
    let options = WalkOptions::default();
    let thread = f.process.thread(0).unwrap();
    let walker = StackWalker::new(&thread, &layout, &store, &options);

    let stack = walker.walk_interpreted(f.leaf);
    assert_eq!(stack.info, CallStackInfo::Ok);
    assert_eq!(stack.frames.len(), 2);
    let width = format!("{:#x}", f.leaf).len();
    assert_eq!(
        stack.stringify(),
        vec![
            format!(
                "#0  {:<w$} @ 0x{:08x}: [PHP] helper() at /src/helper.php:20",
                format!("{:#x}", f.leaf),
                CODE_BASE + 0x40,
                w = width
            ),
            format!(
                "#1  {:<w$} @ 0x00402000: [PHP] main() at /src/main.php:4",
                format!("{:#x}", f.outer),
                w = width
            ),
        ]
    );
}

#[test]
fn test_mixed_walk_with_resumables() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    let store = repo(&dir);
    let layout = VmLayout::default();
    let options = WalkOptions::default();
    let thread = f.process.thread(0).unwrap();

    let stack = walk_thread(&thread, &layout, &store, &options, WalkMode::Mixed);
    assert_eq!(stack.thread_name.as_deref(), Some("request"));
    assert_eq!(stack.info, CallStackInfo::Ok);
    let kinds: Vec<FrameKind> = stack.frames.iter().map(|frame| frame.kind).collect();
    assert_eq!(
        kinds,
        vec![
            FrameKind::Native,
            FrameKind::Interpreted,
            FrameKind::Interpreted,
            FrameKind::Interpreted,
        ]
    );
    let indices: Vec<usize> = stack.frames.iter().map(|frame| frame.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    assert_eq!(stack.frames[0].function, "HPHP::f_sleep()");
    assert_eq!(stack.frames[1].frame_pointer, f.leaf);
    assert_eq!(
        stack.frames[1].return_address,
        ReturnAddress::Address(CODE_BASE + 0x10)
    );
    assert_eq!(stack.frames[2].function, "[PHP] main()");

    let suspended = &stack.frames[3];
    assert_eq!(suspended.frame_pointer, f.resumable);
    assert_eq!(suspended.return_address, ReturnAddress::Suspended);
    // Resumed at offset 12, inside the second entry of main's table.
    assert_eq!(
        suspended.source,
        Some(SourceLocation {
            file: "/src/main.php".to_string(),
            line: Some(4),
        })
    );
    assert!(stack.stringify()[3].contains("@ {suspended}: [PHP] main() at /src/main.php:4"));
}

#[test]
fn test_mixed_walk_without_code_cache_symbol() {
    // With no code cache every frame is native.
    let leaf = Label::new();
    let process = SynthProcess::new()
        .act_rec(&leaf, ActRec::new(&const_label(0), 0, &const_label(0), 0))
        .thread(SynthThread::new().native_frame(&leaf, CODE_BASE, Some("jitted")))
        .finish()
        .unwrap();
    let layout = VmLayout::default();
    let thread = process.thread(0).unwrap();
    let stack = walk_thread(&thread, &layout, &(), &WalkOptions::default(), WalkMode::Mixed);
    assert_eq!(stack.frames.len(), 1);
    assert_eq!(stack.frames[0].kind, FrameKind::Native);
    assert_eq!(stack.frames[0].function, "jitted()");
}

#[test]
fn test_frame_limit() {
    let f = fixture();
    let layout = VmLayout::default();
    let options = WalkOptions::default().max_frames(1);
    let thread = f.process.thread(0).unwrap();

    let stack = walk_thread(&thread, &layout, &(), &options, WalkMode::Interpreted);
    assert_eq!(stack.info, CallStackInfo::FrameLimit);
    // One walked frame, then the resumable.
    assert_eq!(stack.frames.len(), 2);
    assert_eq!(stack.frames[1].index, 1);

    let stack = walk_thread(&thread, &layout, &(), &options, WalkMode::Mixed);
    assert_eq!(stack.info, CallStackInfo::FrameLimit);
    assert_eq!(stack.frames.len(), 2);
}

#[test]
fn test_missing_stack_bounds() {
    let leaf = Label::new();
    let process = SynthProcess::new()
        .act_rec(&leaf, ActRec::new(&const_label(0), 0, &const_label(0), 0))
        .thread(SynthThread::without_stack_bounds().leaf_fp(&leaf))
        .finish()
        .unwrap();
    let layout = VmLayout::default();
    let thread = process.thread(0).unwrap();
    let stack = walk_thread(&thread, &layout, &(), &WalkOptions::default(), WalkMode::Interpreted);
    assert_eq!(stack.info, CallStackInfo::MissingStackBounds);
    assert!(stack.frames.is_empty());
    let mut out = vec![];
    stack.print(&mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("<no frames>"));
}

#[test]
fn test_no_leaf_frame() {
    let process = SynthProcess::new()
        .thread(SynthThread::new())
        .finish()
        .unwrap();
    let layout = VmLayout::default();
    let thread = process.thread(0).unwrap();
    let stack = walk_thread(&thread, &layout, &(), &WalkOptions::default(), WalkMode::Interpreted);
    assert_eq!(stack.info, CallStackInfo::NoFrames);
    assert!(stack.stringify().is_empty());
}

#[test]
fn test_unreadable_code_cache_falls_back() {
    // The code cache symbol is known but points at unmapped memory, so
    // anything from the symbol up to 4GiB counts as jitted.
    let leaf = Label::new();
    let process = SynthProcess::new()
        .symbol(vmstack_common::format::CODE_CACHE_SYMBOL, 0x1000_0000)
        .act_rec(&leaf, ActRec::new(&const_label(0), 0, &const_label(0), 0))
        .thread(
            SynthThread::new()
                .native_frame(&leaf, 0x2000_0000, None)
                .native_frame(&leaf, 0x1_2000_0000, Some("high")),
        )
        .finish()
        .unwrap();
    let layout = VmLayout::default();
    let thread = process.thread(0).unwrap();
    let stack = walk_thread(&thread, &layout, &(), &WalkOptions::default(), WalkMode::Mixed);
    assert_eq!(stack.frames[0].kind, FrameKind::Interpreted);
    assert_eq!(stack.frames[1].kind, FrameKind::Native);
}

#[test]
fn test_unreadable_frame_truncates_walk() {
    // The second record lies at the very end of the captured stack, so its
    // saved frame pointer and return address can't be read.
    let leaf = Label::new();
    let outer = Label::new();
    let process = SynthProcess::new()
        .act_rec(&leaf, ActRec::new(&outer, 0x40_1000, &const_label(0), 0))
        .mark_stack(&outer)
        .thread(SynthThread::new().leaf_fp(&leaf))
        .finish()
        .unwrap();
    let layout = VmLayout::default();
    let thread = process.thread(0).unwrap();

    let stack = walk_thread(&thread, &layout, &(), &WalkOptions::default(), WalkMode::Interpreted);
    assert_eq!(stack.info, CallStackInfo::ReadFailure);
    assert_eq!(stack.frames.len(), 2);
    assert_eq!(stack.frames[0].return_address, ReturnAddress::Address(0x40_1000));
    assert_eq!(stack.frames[1].frame_pointer, outer.value().unwrap());
    assert_eq!(stack.frames[1].return_address, ReturnAddress::Unknown);
    assert_eq!(stack.frames[1].function, "[PHP] <unknown>()");

    let mut out = vec![];
    stack.print(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].ends_with("@ 0x00401000: [PHP] <unknown>()"));
    assert!(lines[1].ends_with("@ 0x????????: [PHP] <unknown>()"));
    assert_eq!(lines[2], "(truncated by unreadable memory)");
}

#[test]
fn test_frame_limit_footer() {
    let f = fixture();
    let layout = VmLayout::default();
    let options = WalkOptions::default().max_frames(1);
    let thread = f.process.thread(0).unwrap();

    let stack = walk_thread(&thread, &layout, &(), &options, WalkMode::Interpreted);
    let mut out = vec![];
    stack.print(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("Thread request\n#0  "));
    assert!(text.ends_with("(truncated at frame limit)\n"));
}
