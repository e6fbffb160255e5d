//! Process-wide allocator surface.
//!
//! One static two-tier instance behind `page_*`/`slab_*` entry points,
//! plus a [`GlobalAlloc`] adapter. There is no internal locking: every
//! entry point assumes single-threaded use, and concurrent entry from
//! multiple threads is undefined behavior — multi-threaded callers must
//! serialize with an external mutex.
//!
//! With the `static-buffer` feature a page-aligned zeroed arena is
//! embedded in the image and mounted automatically on first use;
//! without it the caller must call [`slab_reinit`] (or [`page_reinit`])
//! before anything else.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};

#[cfg(all(feature = "log", not(feature = "static-buffer")))]
use log::error;

use crate::linear::LinearAllocator;
use crate::slab::SlabAllocator;
use crate::{AllocResult, Hint};

#[cfg(feature = "static-buffer")]
use crate::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE, PAGE_SIZE};

struct Arena {
    slab: SlabAllocator<LinearAllocator>,
    mounted: bool,
}

struct ArenaCell(UnsafeCell<Arena>);

// SAFETY: single-threaded use is the documented caller contract for
// every entry point in this module.
unsafe impl Sync for ArenaCell {}

static ARENA: ArenaCell = ArenaCell(UnsafeCell::new(Arena {
    slab: SlabAllocator::new(),
    mounted: false,
}));

#[cfg(feature = "static-buffer")]
mod static_arena {
    use super::*;

    /// Size of the embedded arena.
    pub const STATIC_BUFFER_SIZE: usize = 640 * 1024;

    const _: () = assert!(
        STATIC_BUFFER_SIZE % PAGE_SIZE == 0,
        "static arena size must be page aligned"
    );
    const _: () = assert!(
        STATIC_BUFFER_SIZE >= MIN_BUFFER_SIZE && STATIC_BUFFER_SIZE < MAX_BUFFER_SIZE,
        "static arena size outside the supported window"
    );

    #[repr(align(4096))]
    pub struct StaticArena(pub UnsafeCell<[u8; STATIC_BUFFER_SIZE]>);

    // SAFETY: handed to the allocator exactly once, under the module's
    // single-threaded contract.
    unsafe impl Sync for StaticArena {}

    pub static BUFFER: StaticArena = StaticArena(UnsafeCell::new([0; STATIC_BUFFER_SIZE]));
}

#[cfg(feature = "static-buffer")]
pub use static_arena::STATIC_BUFFER_SIZE;

/// The process-wide arena, mounted on first use in static-buffer mode.
unsafe fn arena() -> &'static mut Arena {
    let arena = &mut *ARENA.0.get();
    #[cfg(feature = "static-buffer")]
    if !arena.mounted {
        // The arena is in zeroed static storage.
        let buffer = static_arena::BUFFER.0.get() as *mut u8;
        let _ = arena
            .slab
            .reinit(buffer, static_arena::STATIC_BUFFER_SIZE, true);
        arena.mounted = true;
    }
    #[cfg(not(feature = "static-buffer"))]
    if !arena.mounted {
        error!("global allocator: not initialized, call reinit first");
    }
    arena
}

/// Mount `buffer` as the process-wide arena and reset both tiers.
///
/// # Safety
/// `buffer` must be valid for `size` bytes and handed over exclusively
/// until the next reinit; single-threaded contract as per the module.
pub unsafe fn slab_reinit(buffer: *mut u8, size: usize, zero_filled: bool) -> AllocResult {
    let arena = &mut *ARENA.0.get();
    arena.slab.reinit(buffer, size, zero_filled)?;
    arena.mounted = true;
    Ok(())
}

/// Allocate `size` bytes from the slab tier. Null on exhaustion.
///
/// # Safety
/// Single-threaded contract as per the module.
pub unsafe fn slab_malloc(size: usize) -> *mut u8 {
    match arena().slab.malloc(size) {
        Ok(ptr) => ptr.as_ptr(),
        Err(_) => ptr::null_mut(),
    }
}

/// Free a slab-tier allocation. Null is ignored.
///
/// # Safety
/// `ptr` must be null or a live allocation from [`slab_malloc`] /
/// [`slab_realloc`]; single-threaded contract as per the module.
pub unsafe fn slab_free(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        arena().slab.free(ptr);
    }
}

/// Resize a slab-tier allocation. Null `ptr` allocates; null return
/// means exhaustion with the original allocation left intact.
///
/// # Safety
/// Same contract as [`slab_free`].
pub unsafe fn slab_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    match arena().slab.realloc(ptr, size) {
        Ok(ptr) => ptr.as_ptr(),
        Err(_) => ptr::null_mut(),
    }
}

/// Mount `buffer` for page-tier-only use.
///
/// Does not touch the slab class lists; callers mixing in the slab
/// surface must use [`slab_reinit`] instead.
///
/// # Safety
/// Same contract as [`slab_reinit`].
pub unsafe fn page_reinit(buffer: *mut u8, size: usize, zero_filled: bool) -> AllocResult {
    let arena = &mut *ARENA.0.get();
    arena.slab.pages_mut().reinit(buffer, size, zero_filled)?;
    arena.mounted = true;
    Ok(())
}

/// Allocate whole pages from the page tier. Null on exhaustion.
///
/// # Safety
/// Single-threaded contract as per the module.
pub unsafe fn page_malloc(size: usize, hint: Hint) -> *mut u8 {
    match arena().slab.pages_mut().malloc(size, hint) {
        Ok(ptr) => ptr.as_ptr(),
        Err(_) => ptr::null_mut(),
    }
}

/// Free a page-tier run. Null is ignored.
///
/// # Safety
/// `ptr` must be null or a live run base from [`page_malloc`] /
/// [`page_realloc`]; single-threaded contract as per the module.
pub unsafe fn page_free(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        arena().slab.pages_mut().free(ptr);
    }
}

/// Resize a page-tier run. Null `ptr` allocates; null return means
/// exhaustion with the original run left intact.
///
/// # Safety
/// Same contract as [`page_free`].
pub unsafe fn page_realloc(ptr: *mut u8, size: usize, hint: Hint) -> *mut u8 {
    match arena().slab.pages_mut().realloc(ptr, size, hint) {
        Ok(ptr) => ptr.as_ptr(),
        Err(_) => ptr::null_mut(),
    }
}

/// `GlobalAlloc` adapter over the process-wide arena.
///
/// Cells are at least 16-byte aligned and page runs page aligned;
/// layouts demanding more alignment than their size class provides are
/// not supported. Single-threaded contract as per the module.
pub struct FixedAlloc;

impl FixedAlloc {
    /// Use the embedded static arena, mounted on first allocation.
    #[cfg(feature = "static-buffer")]
    pub const fn new_static() -> Self {
        Self
    }

    /// Mount `buffer` and use it as the arena.
    ///
    /// # Safety
    /// Same contract as [`slab_reinit`].
    pub unsafe fn new(buffer: *mut u8, len: usize, zero_filled: bool) -> Self {
        let ret = slab_reinit(buffer, len, zero_filled);
        debug_assert!(ret.is_ok());
        Self
    }
}

unsafe impl GlobalAlloc for FixedAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        slab_malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        slab_free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        slab_realloc(ptr, new_size)
    }
}
