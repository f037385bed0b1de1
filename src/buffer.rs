//! Block-sized buffer allocation and defense-in-depth read-only marking: buffers are allocated
//! one block at a time, since blocks come and go under eviction rather than living in one fixed
//! backing array, and `nix::sys::mman::mprotect` marks a buffer read-only at the OS level once a
//! full read has filled it, so the only legitimate mutator afterward is the allocator freeing it.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use nix::sys::mman::{mprotect, ProtFlags};

use crate::config::defaults::BLOCK_SIZE;

/// A heap-allocated, page-aligned, block-sized buffer.
///
/// Owned by a [`crate::slot::LazySlot`] once published; freed by the pager after a successful
/// `reset()`.
pub struct BlockBuf {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

// SAFETY: the buffer is exclusively owned until shared (read-only) across borrowers; once shared
// it is never mutated (see `mark_read_only`), so concurrent reads are sound.
unsafe impl Send for BlockBuf {}
unsafe impl Sync for BlockBuf {}

fn layout(len: usize) -> Layout {
    // Page-aligned so `mprotect` (which operates on whole pages) can cover exactly this
    // allocation without touching neighboring heap memory.
    Layout::from_size_align(len, 4096).expect("block size must be a valid, page-aligned layout")
}

impl BlockBuf {
    /// Allocate a new, zeroed buffer of `len` bytes (normally [`BLOCK_SIZE`], but the disjoint
    /// path allocates arbitrary page-aligned lengths).
    pub fn alloc(len: usize) -> Self {
        debug_assert!(len > 0);
        // SAFETY: `layout` has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout(len)) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout(len)));
        BlockBuf {
            ptr,
            len,
            writable: true,
        }
    }

    pub fn alloc_block() -> Self {
        Self::alloc(BLOCK_SIZE as usize)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The buffer contents, valid for as long as `self` lives.
    ///
    /// # Safety
    /// The caller must not hold this alongside a `&mut` view (mutation after
    /// [`Self::mark_read_only`] is both a logic bug and, on platforms where the `mprotect` below
    /// actually took effect, a `SIGSEGV`).
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// The buffer contents as mutable, for the reader's fill path before the buffer is published.
    ///
    /// # Safety
    /// Must not be called after [`Self::mark_read_only`], and must not alias a concurrently live
    /// `&[u8]` view.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }

    /// Hand ownership to the caller as a raw pointer, the way the slot's packed word stores a
    /// loaded buffer. Pairs with [`Self::from_raw`].
    pub fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }

    /// Reclaim a buffer previously released via [`Self::into_raw`], to free it.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by `into_raw` on a `BlockBuf` of the same
    /// `len`, not yet reclaimed.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        BlockBuf {
            // SAFETY: caller guarantees `ptr` came from a live `into_raw` call.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
            // The reader always marks a fully-delivered buffer read-only before publishing it,
            // so every pointer that reaches a slot is already protected.
            writable: false,
        }
    }

    /// Mark the buffer read-only at the OS level once a full, successful read has filled it. The
    /// only legitimate mutator before this point is the ring itself.
    pub fn mark_read_only(&mut self) {
        if !self.writable {
            return;
        }
        // SAFETY: `ptr` is a live allocation of `len` bytes with page alignment, obtained from
        // this same allocator; `mprotect` only narrows permissions.
        let result = unsafe {
            mprotect(
                self.ptr.cast(),
                self.len,
                ProtFlags::PROT_READ,
            )
        };
        if result.is_ok() {
            self.writable = false;
        }
        // A failure here is defense-in-depth that didn't take; the buffer is still logically
        // read-only by convention, so we don't treat this as fatal.
    }
}

impl Drop for BlockBuf {
    fn drop(&mut self) {
        if !self.writable {
            // Restore write permission before deallocating; freeing a read-only mapping through
            // the allocator is legal on Linux but this keeps behavior uniform across allocators.
            // SAFETY: same justification as `mark_read_only`.
            let _ = unsafe {
                mprotect(self.ptr.cast(), self.len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
            };
        }
        // SAFETY: `ptr`/`len` describe the allocation made in `alloc`, with the same layout.
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), layout(self.len));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed() {
        let buf = BlockBuf::alloc(8192);
        // SAFETY: exclusive access, no other views exist yet.
        let slice = unsafe { buf.as_slice() };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn mark_read_only_is_idempotent() {
        let mut buf = BlockBuf::alloc(4096);
        buf.mark_read_only();
        buf.mark_read_only();
        assert!(!buf.writable);
    }

    #[test]
    fn into_raw_then_from_raw_round_trips() {
        let buf = BlockBuf::alloc(4096);
        let ptr = buf.into_raw();
        let buf = unsafe { BlockBuf::from_raw(ptr, 4096) };
        assert_eq!(buf.len(), 4096);
    }
}
