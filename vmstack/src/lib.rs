// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Frozen snapshots of a virtual-machine process.
//!
//! A [`MemorySnapshot`] holds the bytes of every memory region a stack walk
//! may need, the addresses of global symbols, and per-thread state: the
//! addresses of thread-local symbols, the native frames reported by the
//! debugger and any suspended resumables. Snapshots are stored as JSON.
//!
//! Both [`MemorySnapshot`] and [`ThreadMemory`] implement
//! [`MemoryView`](vmstack_common::traits::MemoryView), so everything in
//! `vmstack-unwind` can run against them.

mod snapshot;

pub use crate::snapshot::*;
