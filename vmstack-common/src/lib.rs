//! This crate defines [the layouts of the target VM's runtime structures](format/index.html)
//! as well as [the traits](traits/index.html) the stack walker uses to read a target process
//! and its persisted line tables.
//!
//! You probably don't want to use this crate directly, the [vmstack-unwind][unwind] crate
//! provides the actual stack walking on top of these definitions.
//!
//! [unwind]: ../vmstack_unwind/index.html

pub mod format;
pub mod traits;
