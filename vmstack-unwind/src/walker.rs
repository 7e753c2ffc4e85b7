// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use tracing::{debug, trace};
use vmstack_common::format::VmLayout;
use vmstack_common::traits::{MemoryView, ReadError};

/// The region of a thread's VM stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    /// The lowest address of the stack.
    pub limit: u64,
    pub size: u64,
}

impl StackBounds {
    /// Read the current thread's stack bounds from the target.
    pub fn read<M: MemoryView>(memory: &M, layout: &VmLayout) -> Result<StackBounds, ReadError> {
        let limit = memory.read_global(&layout.symbols.stack_limit)?;
        let size = memory.read_global(&layout.symbols.stack_size)?;
        Ok(StackBounds { limit, size })
    }

    /// Whether `fp` is inside the stack.
    ///
    /// Addresses below `limit` wrap around and compare as out of bounds.
    pub fn contains(&self, fp: u64) -> bool {
        fp.wrapping_sub(self.limit) < self.size
    }
}

/// Why a [`FrameWalker`] stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalkStop {
    /// The chain left the stack. This is how well-formed walks end.
    OutOfBounds,
    /// A saved frame pointer couldn't be read.
    ReadFailure(ReadError),
    /// The walk hit its frame limit.
    FrameLimit,
}

/// Follows the saved-frame-pointer chain of interpreted activation records.
///
/// Yields the address of each record, innermost first, for as long as the
/// chain stays within the stack bounds it was created with. A record whose
/// saved frame pointer can't be read is still yielded, and ends the walk.
pub struct FrameWalker<'a, M> {
    memory: &'a M,
    saved_fp_offset: u64,
    bounds: StackBounds,
    next: Option<u64>,
    remaining: usize,
    stop: Option<WalkStop>,
}

impl<'a, M: MemoryView> FrameWalker<'a, M> {
    pub fn new(
        memory: &'a M,
        layout: &VmLayout,
        bounds: StackBounds,
        leaf_fp: u64,
        max_frames: usize,
    ) -> Self {
        FrameWalker {
            memory,
            saved_fp_offset: layout.act_rec.saved_fp,
            bounds,
            next: Some(leaf_fp),
            remaining: max_frames,
            stop: None,
        }
    }

    /// Read the stack bounds once and start walking from `leaf_fp`.
    pub fn start(
        memory: &'a M,
        layout: &VmLayout,
        leaf_fp: u64,
        max_frames: usize,
    ) -> Result<Self, ReadError> {
        let bounds = StackBounds::read(memory, layout)?;
        debug!(
            "walking from {:#x}, stack is [{:#x}, +{:#x})",
            leaf_fp, bounds.limit, bounds.size
        );
        Ok(FrameWalker::new(memory, layout, bounds, leaf_fp, max_frames))
    }

    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }

    /// Why the walk ended, once it has.
    pub fn stop_reason(&self) -> Option<&WalkStop> {
        self.stop.as_ref()
    }
}

impl<'a, M: MemoryView> Iterator for FrameWalker<'a, M> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let fp = self.next.take()?;
        if !self.bounds.contains(fp) {
            trace!("frame {:#x} is outside the stack", fp);
            self.stop = Some(WalkStop::OutOfBounds);
            return None;
        }
        if self.remaining == 0 {
            debug!("frame limit reached at {:#x}", fp);
            self.stop = Some(WalkStop::FrameLimit);
            return None;
        }
        self.remaining -= 1;

        match self.memory.read_pointer_field(fp, self.saved_fp_offset) {
            Ok(saved_fp) => self.next = Some(saved_fp),
            Err(e) => {
                debug!("couldn't read saved frame pointer of {:#x}: {}", fp, e);
                self.stop = Some(WalkStop::ReadFailure(e));
            }
        }
        Some(fp)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_assembler::*;
    use vmstack_synth::*;

    fn walk(process: &vmstack::MemorySnapshot, leaf: u64, max_frames: usize) -> (Vec<u64>, Option<WalkStop>) {
        let layout = VmLayout::default();
        let thread = process.thread(0).unwrap();
        let mut walker = FrameWalker::start(&thread, &layout, leaf, max_frames).unwrap();
        let frames: Vec<u64> = walker.by_ref().collect();
        (frames, walker.stop_reason().cloned())
    }

    fn act_rec(saved_fp: &Label) -> ActRec {
        ActRec::new(saved_fp, 0, &const_label(0), 0)
    }

    #[test]
    fn test_follows_chain_until_out_of_bounds() {
        let f0 = Label::new();
        let f1 = Label::new();
        let f2 = Label::new();
        let process = SynthProcess::new()
            .act_rec(&f0, act_rec(&f1))
            .stack_filler(0x40)
            .act_rec(&f1, act_rec(&f2))
            .act_rec(&f2, act_rec(&const_label(0)))
            .thread(SynthThread::new())
            .finish()
            .unwrap();
        let (frames, stop) = walk(&process, f0.value().unwrap(), 100);
        assert_eq!(
            frames,
            vec![f0.value().unwrap(), f1.value().unwrap(), f2.value().unwrap()]
        );
        assert_eq!(stop, Some(WalkStop::OutOfBounds));
    }

    #[test]
    fn test_leaf_out_of_bounds() {
        let process = SynthProcess::new()
            .thread(SynthThread::new())
            .finish()
            .unwrap();
        let (frames, stop) = walk(&process, STACK_BASE - 8, 100);
        assert!(frames.is_empty());
        assert_eq!(stop, Some(WalkStop::OutOfBounds));
        let (frames, _) = walk(&process, STACK_BASE + STACK_SIZE, 100);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_frame_above_stack_not_yielded() {
        let f0 = Label::new();
        let process = SynthProcess::new()
            .act_rec(&f0, act_rec(&const_label(STACK_BASE + STACK_SIZE)))
            .thread(SynthThread::new())
            .finish()
            .unwrap();
        let (frames, stop) = walk(&process, f0.value().unwrap(), 100);
        assert_eq!(frames, vec![STACK_BASE]);
        assert_eq!(stop, Some(WalkStop::OutOfBounds));
    }

    #[test]
    fn test_cycle_hits_frame_limit() {
        let f0 = Label::new();
        let f1 = Label::new();
        let process = SynthProcess::new()
            .act_rec(&f0, act_rec(&f1))
            .act_rec(&f1, act_rec(&f0))
            .thread(SynthThread::new())
            .finish()
            .unwrap();
        let (frames, stop) = walk(&process, f0.value().unwrap(), 5);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], frames[2]);
        assert_eq!(stop, Some(WalkStop::FrameLimit));
    }

    #[test]
    fn test_read_failure_ends_walk() {
        // The stack bounds claim more than the snapshot actually has, so the
        // second record's saved frame pointer is unreadable.
        let f0 = Label::new();
        let f1 = Label::new();
        let process = SynthProcess::new()
            .act_rec(&f0, act_rec(&f1))
            .mark_stack(&f1)
            .thread(SynthThread::new())
            .finish()
            .unwrap();
        let (frames, stop) = walk(&process, f0.value().unwrap(), 100);
        assert_eq!(frames, vec![f0.value().unwrap(), f1.value().unwrap()]);
        match stop {
            Some(WalkStop::ReadFailure(ReadError::Unmapped { address, .. })) => {
                assert_eq!(address, f1.value().unwrap())
            }
            other => panic!("unexpected stop {:?}", other),
        }
    }

    #[test]
    fn test_missing_bounds() {
        let process = SynthProcess::new()
            .thread(SynthThread::without_stack_bounds())
            .finish()
            .unwrap();
        let thread = process.thread(0).unwrap();
        let layout = VmLayout::default();
        assert!(FrameWalker::start(&thread, &layout, STACK_BASE, 10).is_err());
    }
}
