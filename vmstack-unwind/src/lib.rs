// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Walking and symbolicating the stacks of a virtual-machine process.
//!
//! The walk is driven by a [`StackWalker`] over any
//! [`MemoryView`](vmstack_common::traits::MemoryView) of the target:
//!
//! * [`CodeRegionClassifier`] tells jitted instruction pointers from native ones.
//! * [`FrameWalker`] follows the chain of interpreted activation records.
//! * [`FrameBuilder`] turns each record into a [`Frame`], resolving lines
//!   through a [`LineTableResolver`].
//!
//! The resulting [`CallStack`] renders as aligned text lines or as JSON.
//!
//! Nothing in a walk is fatal: unreadable memory and missing or corrupt
//! line tables produce frames with less information, or fewer frames.

mod call_stack;
mod classify;
mod frames;
mod lines;
mod stackwalker;
mod walker;

pub use crate::call_stack::*;
pub use crate::classify::*;
pub use crate::frames::*;
pub use crate::lines::*;
pub use crate::stackwalker::*;
pub use crate::walker::*;
