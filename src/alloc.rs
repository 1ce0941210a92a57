//! Allocator capability used for every node below the root.

use std::alloc::{handle_alloc_error, Layout};
use std::ptr::NonNull;

use allocator_api2::alloc::Allocator;

/// Storage provider for shadow nodes.
///
/// `acquire` never reports failure: an implementation that cannot satisfy a
/// request must diverge (the stock implementations call
/// [`handle_alloc_error`], which aborts). The map never passes a
/// zero-sized layout.
///
/// # Safety
///
/// `acquire` must return memory valid for reads and writes of
/// `layout.size()` bytes aligned to `layout.align()`, and that memory must
/// stay valid until it is handed back to `release`.
pub unsafe trait ShadowAlloc {
    fn acquire(&self, layout: Layout) -> NonNull<u8>;

    /// # Safety
    ///
    /// `ptr` must come from `acquire` on this allocator with the same
    /// `layout`, and is released exactly once.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process-wide allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Global;

unsafe impl ShadowAlloc for Global {
    #[inline]
    fn acquire(&self, layout: Layout) -> NonNull<u8> {
        debug_assert!(layout.size() != 0);
        // SAFETY: the map never requests zero-sized layouts.
        let ptr = unsafe { std::alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        }
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees `ptr` came from `acquire(layout)`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Adapter turning any [`allocator_api2`] allocator into a [`ShadowAlloc`].
///
/// Allocation errors are escalated to [`handle_alloc_error`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ApiAlloc<A>(pub A);

impl<A> ApiAlloc<A> {
    pub fn into_inner(self) -> A {
        self.0
    }
}

unsafe impl<A: Allocator> ShadowAlloc for ApiAlloc<A> {
    #[inline]
    fn acquire(&self, layout: Layout) -> NonNull<u8> {
        self.0
            .allocate(layout)
            .map(NonNull::cast)
            .unwrap_or_else(|_| handle_alloc_error(layout))
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded contract.
        unsafe { self.0.deallocate(ptr, layout) }
    }
}

unsafe impl<M: ShadowAlloc + ?Sized> ShadowAlloc for &M {
    #[inline]
    fn acquire(&self, layout: Layout) -> NonNull<u8> {
        (**self).acquire(layout)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded contract.
        unsafe { (**self).release(ptr, layout) }
    }
}
