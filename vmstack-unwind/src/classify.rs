// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use serde::Serialize;
use tracing::{trace, warn};
use vmstack_common::format::VmLayout;
use vmstack_common::traits::{field_address, MemoryView, ReadError};

/// The half-open range `[base, base + size)` of JIT-generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CodeCacheBounds {
    pub base: u64,
    pub size: u64,
}

impl CodeCacheBounds {
    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.base && ip - self.base < self.size
    }
}

/// Decides whether instruction pointers fall in the code cache.
///
/// The bounds are read from the target on every call, since the code cache
/// may grow between two inspections of a live process.
pub struct CodeRegionClassifier<'a, M> {
    memory: &'a M,
    layout: &'a VmLayout,
}

impl<'a, M: MemoryView> CodeRegionClassifier<'a, M> {
    pub fn new(memory: &'a M, layout: &'a VmLayout) -> Self {
        CodeRegionClassifier { memory, layout }
    }

    fn read_exact_bounds(&self, cache: u64) -> Result<CodeCacheBounds, ReadError> {
        let base = self
            .memory
            .read_u64(field_address(cache, self.layout.code_cache.base)?)?;
        let size = self
            .memory
            .read_u64(field_address(cache, self.layout.code_cache.code_size)?)?;
        Ok(CodeCacheBounds { base, size })
    }

    /// The code cache bounds as currently recorded in the target.
    ///
    /// If the cache object can't be read, the range from the object itself
    /// up to the layout's `fallback_code_end` is assumed instead. Returns
    /// `None` only if the target doesn't have the cache symbol at all.
    pub fn bounds(&self) -> Option<CodeCacheBounds> {
        let cache = match self.memory.symbol_address(&self.layout.symbols.code_cache) {
            Ok(cache) => cache,
            Err(e) => {
                trace!("no code cache symbol: {}", e);
                return None;
            }
        };
        match self.read_exact_bounds(cache) {
            Ok(bounds) => Some(bounds),
            Err(e) => {
                let end = self.layout.fallback_code_end;
                warn!(
                    "couldn't read code cache bounds ({}), assuming [{:#x}, {:#x})",
                    e.name(),
                    cache,
                    end
                );
                Some(CodeCacheBounds {
                    base: cache,
                    size: end.saturating_sub(cache),
                })
            }
        }
    }

    /// Whether `ip` points into JIT-generated code.
    pub fn is_jitted(&self, ip: u64) -> bool {
        self.bounds().map_or(false, |bounds| bounds.contains(ip))
    }
}
