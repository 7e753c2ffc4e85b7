// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use tracing::{debug, trace, warn};
use vmstack::{NativeFrameRecord, ThreadMemory};
use vmstack_common::format::VmLayout;
use vmstack_common::traits::{LineTableStore, MemoryView};

use crate::call_stack::{CallStack, CallStackInfo, ReturnAddress};
use crate::classify::CodeRegionClassifier;
use crate::frames::FrameBuilder;
use crate::walker::{FrameWalker, StackBounds, WalkStop};

/// Options controlling a stack walk.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct WalkOptions {
    /// The most frames a single walk will produce, which keeps corrupted
    /// (for instance, cyclic) frame chains from walking forever.
    pub max_frames: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        WalkOptions { max_frames: 4096 }
    }
}

impl WalkOptions {
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }
}

/// Which frames of a thread to walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkMode {
    /// Follow the interpreted frame chain from the thread's leaf frame.
    Interpreted,
    /// Walk the debugger's native frames, showing jitted ones as the
    /// interpreted frames they execute.
    Mixed,
}

/// Walks the stacks of one view of a target process.
pub struct StackWalker<'a, M, S> {
    memory: &'a M,
    layout: &'a VmLayout,
    options: &'a WalkOptions,
    builder: FrameBuilder<'a, M, S>,
}

impl<'a, M, S> StackWalker<'a, M, S>
where
    M: MemoryView,
    S: LineTableStore,
{
    pub fn new(memory: &'a M, layout: &'a VmLayout, store: &'a S, options: &'a WalkOptions) -> Self {
        StackWalker {
            memory,
            layout,
            options,
            builder: FrameBuilder::new(memory, layout, store),
        }
    }

    pub fn builder(&self) -> &FrameBuilder<'a, M, S> {
        &self.builder
    }

    pub fn classifier(&self) -> CodeRegionClassifier<'a, M> {
        CodeRegionClassifier::new(self.memory, self.layout)
    }

    /// Walk the interpreted frames starting at the record at `leaf_fp`.
    pub fn walk_interpreted(&self, leaf_fp: u64) -> CallStack {
        let bounds = match StackBounds::read(self.memory, self.layout) {
            Ok(bounds) => bounds,
            Err(e) => {
                warn!("couldn't read VM stack bounds: {}", e);
                return CallStack::with_info(CallStackInfo::MissingStackBounds);
            }
        };
        let mut walker = FrameWalker::new(
            self.memory,
            self.layout,
            bounds,
            leaf_fp,
            self.options.max_frames,
        );

        let mut stack = CallStack::with_info(CallStackInfo::Ok);
        for (index, ar) in walker.by_ref().enumerate() {
            let return_address = match self
                .memory
                .read_pointer_field(ar, self.layout.act_rec.saved_rip)
            {
                Ok(rip) => ReturnAddress::Address(rip),
                Err(_) => ReturnAddress::Unknown,
            };
            let frame = self
                .builder
                .interpreted_frame(index, ar, return_address, None);
            trace!("{}", frame.stringify(0));
            stack.frames.push(frame);
        }

        stack.info = match walker.stop_reason() {
            Some(WalkStop::FrameLimit) => CallStackInfo::FrameLimit,
            Some(WalkStop::ReadFailure(_)) => CallStackInfo::ReadFailure,
            _ if stack.frames.is_empty() => CallStackInfo::NoFrames,
            _ => CallStackInfo::Ok,
        };
        debug!(
            "walked {} interpreted frames ({:?})",
            stack.frames.len(),
            stack.info
        );
        stack
    }

    /// Walk the debugger-supplied native frames, innermost first.
    ///
    /// Frames executing in the code cache are built as interpreted frames
    /// from the activation record their frame pointer points at.
    pub fn walk_mixed(&self, native_frames: &[NativeFrameRecord]) -> CallStack {
        if native_frames.is_empty() {
            return CallStack::with_info(CallStackInfo::NoFrames);
        }
        let classifier = self.classifier();
        let mut stack = CallStack::with_info(CallStackInfo::Ok);
        for (index, native) in native_frames.iter().enumerate() {
            if index >= self.options.max_frames {
                debug!("frame limit reached after {} native frames", index);
                stack.info = CallStackInfo::FrameLimit;
                break;
            }
            let frame = if classifier.is_jitted(native.ip) {
                self.builder.interpreted_frame(
                    index,
                    native.fp,
                    ReturnAddress::Address(native.ip),
                    None,
                )
            } else {
                self.builder.native_frame(index, native, None)
            };
            trace!("{}", frame.stringify(0));
            stack.frames.push(frame);
        }
        stack
    }

    /// Append a suspended frame for each of `resumables` to `stack`.
    pub fn append_resumables(&self, stack: &mut CallStack, resumables: &[u64]) {
        for &resumable in resumables {
            let index = stack.frames.len();
            stack
                .frames
                .push(self.builder.resumable_frame(index, resumable));
        }
        if stack.info == CallStackInfo::NoFrames && !stack.frames.is_empty() {
            stack.info = CallStackInfo::Ok;
        }
    }
}

/// Walk one thread of a snapshot, then list its suspended resumables.
pub fn walk_thread<S: LineTableStore>(
    thread: &ThreadMemory<'_>,
    layout: &VmLayout,
    store: &S,
    options: &WalkOptions,
    mode: WalkMode,
) -> CallStack {
    let info = thread.info();
    let walker = StackWalker::new(thread, layout, store, options);
    let mut stack = match mode {
        WalkMode::Interpreted => match info.leaf_fp {
            Some(leaf_fp) => walker.walk_interpreted(leaf_fp),
            None => {
                debug!("thread has no interpreted leaf frame");
                CallStack::with_info(CallStackInfo::NoFrames)
            }
        },
        WalkMode::Mixed => walker.walk_mixed(&info.native_frames),
    };
    walker.append_resumables(&mut stack, &info.resumables);
    stack.thread_name = info.name.clone();
    stack
}
