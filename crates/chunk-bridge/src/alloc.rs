//! Allocator adapter: the engine's single memory-management entry point.
//!
//! Engine memory is handed around as owned [`Block`]s instead of raw
//! pointers. Every allocation, growth and release issued by the engine (and
//! the reader bridge's read buffer) goes through [`Allocator::realloc`], which
//! forwards to a host-supplied [`HostMemory`] and keeps no state of its own.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// An owned region of engine memory. Its length is the block size.
pub struct Block {
    bytes: Vec<u8>,
}

impl Block {
    /// Allocate a zero-filled block, or `None` if the system refuses.
    #[must_use]
    pub fn zeroed(size: usize) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).ok()?;
        bytes.resize(size, 0);
        Some(Self { bytes })
    }

    /// Grow or shrink in place. On failure the untouched block is returned.
    pub fn try_resize(mut self, new_size: usize) -> Result<Self, Self> {
        let len = self.bytes.len();
        if new_size > len {
            if self.bytes.try_reserve_exact(new_size - len).is_err() {
                return Err(self);
            }
            self.bytes.resize(new_size, 0);
        } else {
            self.bytes.truncate(new_size);
            self.bytes.shrink_to_fit();
        }
        Ok(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("len", &self.len()).finish()
    }
}

/// Host-visible memory primitives backing the allocator adapter.
pub trait HostMemory {
    fn allocate(&mut self, size: usize) -> Option<Block>;

    /// Resize `block` to `new_size`; hand the original back on failure.
    fn resize(&mut self, block: Block, new_size: usize) -> Result<Block, Block>;

    fn release(&mut self, block: Block);
}

/// Plain process memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl HostMemory for SystemMemory {
    fn allocate(&mut self, size: usize) -> Option<Block> {
        Block::zeroed(size)
    }

    fn resize(&mut self, block: Block, new_size: usize) -> Result<Block, Block> {
        block.try_resize(new_size)
    }

    fn release(&mut self, block: Block) {
        drop(block);
    }
}

#[derive(Debug, Default)]
struct UsageCounters {
    outstanding: Cell<usize>,
    peak: Cell<usize>,
    allocations: Cell<usize>,
    resizes: Cell<usize>,
    frees: Cell<usize>,
    failures: Cell<usize>,
}

/// Shared view of the statistics recorded by a [`TrackedMemory`].
///
/// Clones observe the same counters, so the host can keep one after the
/// memory has been moved into a state.
#[derive(Debug, Default, Clone)]
pub struct MemoryUsage(Rc<UsageCounters>);

impl MemoryUsage {
    /// Bytes currently allocated and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.0.outstanding.get()
    }

    #[must_use]
    pub fn peak(&self) -> usize {
        self.0.peak.get()
    }

    #[must_use]
    pub fn allocations(&self) -> usize {
        self.0.allocations.get()
    }

    #[must_use]
    pub fn resizes(&self) -> usize {
        self.0.resizes.get()
    }

    #[must_use]
    pub fn frees(&self) -> usize {
        self.0.frees.get()
    }

    /// Requests refused because of the limit or the underlying memory.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.0.failures.get()
    }

    /// Memory in use, in kilobytes.
    #[must_use]
    pub fn kilobytes(&self) -> usize {
        self.outstanding() / 1024
    }

    /// Remainder of [`Self::outstanding`] divided by 1024.
    #[must_use]
    pub fn kilobytes_remainder(&self) -> usize {
        self.outstanding() % 1024
    }

    fn set_outstanding(&self, bytes: usize) {
        self.0.outstanding.set(bytes);
        if bytes > self.0.peak.get() {
            self.0.peak.set(bytes);
        }
    }

    fn bump(counter: &Cell<usize>) {
        counter.set(counter.get() + 1);
    }
}

/// [`HostMemory`] wrapper that counts every request and can enforce a limit.
#[derive(Debug)]
pub struct TrackedMemory<M = SystemMemory> {
    inner: M,
    usage: MemoryUsage,
    limit: Option<usize>,
}

impl TrackedMemory<SystemMemory> {
    #[must_use]
    pub fn new() -> Self {
        Self::wrap(SystemMemory)
    }
}

impl Default for TrackedMemory<SystemMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: HostMemory> TrackedMemory<M> {
    #[must_use]
    pub fn wrap(inner: M) -> Self {
        Self {
            inner,
            usage: MemoryUsage::default(),
            limit: None,
        }
    }

    /// Refuse any request that would push outstanding bytes above `bytes`.
    #[must_use]
    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    #[must_use]
    pub fn usage(&self) -> MemoryUsage {
        self.usage.clone()
    }

    fn within_limit(&self, outstanding: usize) -> bool {
        self.limit.is_none_or(|limit| outstanding <= limit)
    }
}

impl<M: HostMemory> HostMemory for TrackedMemory<M> {
    fn allocate(&mut self, size: usize) -> Option<Block> {
        let after = self.usage.outstanding().saturating_add(size);
        let block = if self.within_limit(after) {
            self.inner.allocate(size)
        } else {
            None
        };
        match block {
            Some(block) => {
                MemoryUsage::bump(&self.usage.0.allocations);
                self.usage.set_outstanding(after);
                Some(block)
            }
            None => {
                MemoryUsage::bump(&self.usage.0.failures);
                None
            }
        }
    }

    fn resize(&mut self, block: Block, new_size: usize) -> Result<Block, Block> {
        let after = (self.usage.outstanding() - block.len()).saturating_add(new_size);
        if new_size > block.len() && !self.within_limit(after) {
            MemoryUsage::bump(&self.usage.0.failures);
            return Err(block);
        }
        match self.inner.resize(block, new_size) {
            Ok(block) => {
                MemoryUsage::bump(&self.usage.0.resizes);
                self.usage.set_outstanding(after);
                Ok(block)
            }
            Err(block) => {
                MemoryUsage::bump(&self.usage.0.failures);
                Err(block)
            }
        }
    }

    fn release(&mut self, block: Block) {
        MemoryUsage::bump(&self.usage.0.frees);
        self.usage
            .set_outstanding(self.usage.outstanding() - block.len());
        self.inner.release(block);
    }
}

/// The allocator refused a request. Carries the original block, which is
/// still valid, when the request was a resize.
#[derive(Debug, thiserror::Error)]
#[error("allocation of {requested} bytes failed")]
pub struct OutOfMemory {
    requested: usize,
    original: Option<Block>,
}

impl OutOfMemory {
    #[must_use]
    pub fn requested(&self) -> usize {
        self.requested
    }

    #[must_use]
    pub fn into_original(self) -> Option<Block> {
        self.original
    }
}

impl From<OutOfMemory> for crate::Error {
    fn from(_: OutOfMemory) -> Self {
        crate::Error::OutOfMemory
    }
}

/// The engine-facing allocation function, wired into a state at creation.
pub struct Allocator {
    memory: RefCell<Box<dyn HostMemory>>,
}

impl Allocator {
    pub fn new(memory: impl HostMemory + 'static) -> Self {
        Self {
            memory: RefCell::new(Box::new(memory)),
        }
    }

    /// `realloc(ptr, old_size, new_size)`:
    /// - `new_size == 0` releases `block` (if any) and returns `Ok(None)`.
    /// - otherwise resizes `block`, or allocates when `block` is `None`.
    ///
    /// Failure is reported once, without retrying.
    pub fn realloc(
        &self,
        block: Option<Block>,
        old_size: usize,
        new_size: usize,
    ) -> Result<Option<Block>, OutOfMemory> {
        debug_assert!(block.as_ref().is_none_or(|b| b.len() == old_size));
        tracing::trace!(old_size, new_size, fresh = block.is_none(), "realloc");

        let mut memory = self.memory.borrow_mut();
        if new_size == 0 {
            if let Some(block) = block {
                memory.release(block);
            }
            return Ok(None);
        }

        match block {
            None => memory.allocate(new_size).map(Some).ok_or(OutOfMemory {
                requested: new_size,
                original: None,
            }),
            Some(block) => memory
                .resize(block, new_size)
                .map(Some)
                .map_err(|original| OutOfMemory {
                    requested: new_size,
                    original: Some(original),
                }),
        }
    }

    /// Allocate a fresh block of `size` (> 0) bytes.
    pub fn allocate(&self, size: usize) -> Result<Block, OutOfMemory> {
        self.realloc(None, 0, size)?.ok_or(OutOfMemory {
            requested: size,
            original: None,
        })
    }

    pub fn release(&self, block: Block) {
        let old_size = block.len();
        let freed = self.realloc(Some(block), old_size, 0);
        debug_assert!(matches!(freed, Ok(None)));
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(limit: Option<usize>) -> (Allocator, MemoryUsage) {
        let mut memory = TrackedMemory::new();
        if let Some(limit) = limit {
            memory = memory.with_limit(limit);
        }
        let usage = memory.usage();
        (Allocator::new(memory), usage)
    }

    #[test]
    fn test_release_null_is_noop() {
        let (alloc, usage) = tracked(None);
        let result = alloc.realloc(None, 0, 0).expect("release never fails");
        assert!(result.is_none());
        assert_eq!(usage.frees(), 0);
        assert_eq!(usage.outstanding(), 0);
    }

    #[test]
    fn test_allocate_resize_release() {
        let (alloc, usage) = tracked(None);

        let block = alloc.realloc(None, 0, 16).unwrap().unwrap();
        assert_eq!(block.len(), 16);
        assert_eq!(usage.outstanding(), 16);

        let block = alloc.realloc(Some(block), 16, 100).unwrap().unwrap();
        assert_eq!(block.len(), 100);
        assert_eq!(usage.outstanding(), 100);

        let block = alloc.realloc(Some(block), 100, 8).unwrap().unwrap();
        assert_eq!(usage.outstanding(), 8);
        assert_eq!(usage.peak(), 100);

        assert!(alloc.realloc(Some(block), 8, 0).unwrap().is_none());
        assert_eq!(usage.outstanding(), 0);
        assert_eq!(usage.allocations(), 1);
        assert_eq!(usage.resizes(), 2);
        assert_eq!(usage.frees(), 1);
    }

    #[test]
    fn test_resize_preserves_contents() {
        let (alloc, _) = tracked(None);
        let mut block = alloc.allocate(4).unwrap();
        block.as_mut_slice().copy_from_slice(b"abcd");
        let block = alloc.realloc(Some(block), 4, 6).unwrap().unwrap();
        assert_eq!(block.as_slice(), b"abcd\0\0");
        alloc.release(block);
    }

    #[test]
    fn test_limit_refuses_fresh_allocation() {
        let (alloc, usage) = tracked(Some(32));
        let err = alloc.realloc(None, 0, 33).unwrap_err();
        assert_eq!(err.requested(), 33);
        assert!(err.into_original().is_none());
        assert_eq!(usage.failures(), 1);
        assert_eq!(usage.outstanding(), 0);
    }

    #[test]
    fn test_failed_growth_returns_original_block() {
        let (alloc, usage) = tracked(Some(32));
        let mut block = alloc.allocate(16).unwrap();
        block.as_mut_slice()[0] = 0xAA;

        let err = alloc.realloc(Some(block), 16, 64).unwrap_err();
        let block = err.into_original().expect("original block handed back");
        assert_eq!(block.len(), 16);
        assert_eq!(block.as_slice()[0], 0xAA);
        assert_eq!(usage.outstanding(), 16);

        alloc.release(block);
        assert_eq!(usage.outstanding(), 0);
    }

    #[test]
    fn test_shrink_allowed_at_limit() {
        let (alloc, usage) = tracked(Some(16));
        let block = alloc.allocate(16).unwrap();
        let block = alloc.realloc(Some(block), 16, 4).unwrap().unwrap();
        assert_eq!(usage.outstanding(), 4);
        alloc.release(block);
    }

    #[test]
    fn test_kilobyte_counters() {
        let (alloc, usage) = tracked(None);
        let block = alloc.allocate(2048 + 100).unwrap();
        assert_eq!(usage.kilobytes(), 2);
        assert_eq!(usage.kilobytes_remainder(), 100);
        alloc.release(block);
        assert_eq!(usage.kilobytes(), 0);
    }

    #[test]
    fn test_out_of_memory_converts_to_error() {
        let (alloc, _) = tracked(Some(0));
        let err: crate::Error = alloc.allocate(1).unwrap_err().into();
        assert!(matches!(err, crate::Error::OutOfMemory));
    }
}
