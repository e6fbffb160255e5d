//! Page allocator over a caller-supplied fixed buffer.
//!
//! The first page of the buffer is reserved for the per-page run-length
//! table; pages `1..=N` are allocatable. Free space is tracked by
//! region records that live at the base of their own first page,
//! linked in a circular list sorted by `start_page` with no two
//! neighbors abutting. Transient allocations carve from the low end of
//! the first fitting region, persistent ones from the high end of the
//! last, so the two lifetimes grow toward each other.
//!
//! `free` is O(1): it writes a region record over the freed memory and
//! appends it to a pending list. The pending list is drained back into
//! the sorted free list only when an allocation misses, which amortizes
//! coalescing across many frees.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};

#[cfg(feature = "log")]
use log::{debug, error};

use super::page_table::{PageTable, PAGE_TABLE_ENTRIES};
use super::region::{FreeRegion, Region};
use crate::list::{self, ListNode};
use crate::{
    is_aligned, AllocError, AllocResult, Hint, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE, PAGE_SHIFT,
    PAGE_SIZE,
};

/// Linear page allocator.
///
/// Unmounted until [`reinit`](Self::reinit); every allocation before
/// that fails with [`AllocError::NoMemory`].
pub struct LinearAllocator {
    buffer: *mut u8,
    size: usize,
    table: PageTable,
    free_list: ListNode,
    pending_list: ListNode,
}

// SAFETY: the caller serializes all entry points; concurrent use is
// documented as undefined.
unsafe impl Send for LinearAllocator {}

impl LinearAllocator {
    pub const fn new() -> Self {
        Self {
            buffer: ptr::null_mut(),
            size: 0,
            table: PageTable::null(),
            free_list: ListNode::null(),
            pending_list: ListNode::null(),
        }
    }

    /// Mount `buffer` and reset all allocator state.
    ///
    /// Validates that `buffer` is page aligned and `size` is a page
    /// multiple inside the supported window; violations are fatal. The
    /// metadata page is cleared unless the caller asserts the buffer is
    /// already zero filled. Installs a single free region covering pages
    /// `1..=N` and empties the pending list. Returns `Ok(())`; non-zero
    /// statuses are reserved.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `size` bytes and
    /// uniquely owned by this allocator until the next `reinit`. In-buffer
    /// records link back to list heads embedded in `self`, so the
    /// allocator value must not be moved between `reinit` and its last
    /// use.
    pub unsafe fn reinit(
        &mut self,
        buffer: *mut u8,
        size: usize,
        zero_filled: bool,
    ) -> AllocResult {
        if !is_aligned(buffer as usize, PAGE_SIZE) {
            error!("page allocator: buffer {:p} is not aligned to a page boundary", buffer);
            panic!("buffer must be page aligned");
        }
        if !is_aligned(size, PAGE_SIZE) {
            error!("page allocator: size {:#x} is not a page multiple", size);
            panic!("size must be a page multiple");
        }
        if size < MIN_BUFFER_SIZE || size >= MAX_BUFFER_SIZE {
            error!(
                "page allocator: size {:#x} outside window [{:#x}, {:#x})",
                size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            );
            panic!("size outside the supported window");
        }
        debug_assert!(size / PAGE_SIZE <= PAGE_TABLE_ENTRIES);

        self.buffer = buffer;
        self.size = size;
        self.table = PageTable::new(buffer);
        if !zero_filled {
            ptr::write_bytes(buffer, 0, PAGE_SIZE);
        }

        // One region covering everything after the metadata page.
        let region = FreeRegion::write_at(
            buffer.add(PAGE_SIZE),
            1,
            (size >> PAGE_SHIFT) as u64 - 1,
        );
        list::init(&mut self.free_list);
        list::link_after(&mut self.free_list, &mut (*region).link);
        list::init(&mut self.pending_list);
        Ok(())
    }

    /// Allocate `size` bytes rounded up to whole pages.
    ///
    /// The hint picks the carving direction: transient runs come from
    /// the low end of the address space, persistent runs from the high
    /// end. On a miss the pending list is flushed and the search retried
    /// once before giving up.
    pub fn malloc(&mut self, size: usize, hint: Hint) -> AllocResult<NonNull<u8>> {
        if self.buffer.is_null() {
            return Err(AllocError::NoMemory);
        }
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        let pages = size.div_ceil(PAGE_SIZE);

        unsafe {
            let mut page = self.carve(pages, hint);
            if page.is_none() {
                self.flush_pending();
                page = self.carve(pages, hint);
            }
            let Some(page) = page else {
                debug!(
                    "page allocator: allocation failure: {} pages, hint {:?}",
                    pages, hint
                );
                return Err(AllocError::NoMemory);
            };
            self.table.mark_run(page, pages);
            Ok(NonNull::new_unchecked(self.page_to_ptr(page)))
        }
    }

    /// Return a run to the allocator.
    ///
    /// O(1): reads the run length from the page table, writes a region
    /// record over the first bytes of the freed memory and appends it to
    /// the pending list. The freed run is merged into the free-region
    /// list lazily, on the next allocation miss.
    ///
    /// # Safety
    /// `ptr` must be a page-base address previously returned by
    /// [`malloc`](Self::malloc) or [`realloc`](Self::realloc) on this
    /// mount and not freed since. The memory must no longer be accessed.
    /// Double free is undefined.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        #[cfg(feature = "guards")]
        if !is_aligned(ptr.as_ptr() as usize, PAGE_SIZE) {
            error!(
                "page allocator: free of unaligned pointer {:p}, possibly tampered with",
                ptr
            );
            panic!("freed pointer is not page aligned");
        }

        let first_page = self.ptr_to_page(ptr.as_ptr());
        let pages = self.table.run_pages(first_page);
        let region = FreeRegion::write_at(ptr.as_ptr(), first_page as u64, pages as u64);
        list::link_before(&mut self.pending_list, &mut (*region).link);
    }

    /// Resize a run.
    ///
    /// A null `ptr` behaves as `malloc`. Shrinking is a no-op that
    /// returns `ptr` unchanged. Growth first tries to claim the free
    /// region immediately after the run; failing that it allocates
    /// elsewhere, copies the old run and frees it. On error the original
    /// run is left intact and still owned by the caller.
    ///
    /// # Safety
    /// `ptr` must be null or a live run base from this mount, and must
    /// not be used again if a different address is returned.
    pub unsafe fn realloc(
        &mut self,
        ptr: *mut u8,
        size: usize,
        hint: Hint,
    ) -> AllocResult<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.malloc(size, hint);
        };
        #[cfg(feature = "guards")]
        if !is_aligned(ptr as usize, PAGE_SIZE) {
            error!(
                "page allocator: realloc of unaligned pointer {:p}, possibly tampered with",
                ptr
            );
            panic!("reallocated pointer is not page aligned");
        }

        let new_pages = size.div_ceil(PAGE_SIZE);
        let first_page = self.ptr_to_page(ptr);
        let pages = self.table.run_pages(first_page);
        if new_pages <= pages {
            return Ok(old);
        }

        if self.carve_at(first_page + pages, new_pages - pages).is_some() {
            // Grew in place; the run-length entry must cover the
            // extension so the next free returns all of it.
            self.table.mark_run(first_page, new_pages);
            return Ok(old);
        }

        let dst = self.malloc(size, hint)?;
        ptr::copy_nonoverlapping(ptr as *const u8, dst.as_ptr(), pages << PAGE_SHIFT);
        self.free(old);
        Ok(dst)
    }

    #[inline]
    fn ptr_to_page(&self, ptr: *const u8) -> usize {
        (ptr as usize - self.buffer as usize) >> PAGE_SHIFT
    }

    #[inline]
    fn page_to_ptr(&self, page: usize) -> *mut u8 {
        unsafe { self.buffer.add(page << PAGE_SHIFT) }
    }

    unsafe fn carve(&mut self, pages: usize, hint: Hint) -> Option<usize> {
        match hint {
            Hint::Transient => self.carve_forward(pages),
            Hint::Persistent => self.carve_reverse(pages),
        }
    }

    /// Carve `pages` off the low end of the first fitting region.
    unsafe fn carve_forward(&mut self, pages: usize) -> Option<usize> {
        for node in list::iter(&self.free_list) {
            let region = FreeRegion::from_node(node);
            if (*region).pages as usize >= pages {
                let result = (*region).start_page as usize;
                (*region).start_page += pages as u64;
                (*region).pages -= pages as u64;
                if (*region).pages == 0 {
                    list::unlink(node);
                } else {
                    // The old base was just handed out; the record must
                    // follow its region to the new base.
                    FreeRegion::move_to_base(region, self.buffer);
                }
                return Some(result);
            }
        }
        None
    }

    /// Carve `pages` off the high end of the last fitting region. The
    /// region's base is untouched, so the record stays put.
    unsafe fn carve_reverse(&mut self, pages: usize) -> Option<usize> {
        let head = &mut self.free_list as *mut ListNode;
        let mut node = (*head).prev;
        while node != head {
            let region = FreeRegion::from_node(node);
            if (*region).pages as usize >= pages {
                (*region).pages -= pages as u64;
                let result = ((*region).start_page + (*region).pages) as usize;
                if (*region).pages == 0 {
                    list::unlink(node);
                }
                return Some(result);
            }
            node = (*node).prev;
        }
        None
    }

    /// Carve `pages` off the region starting exactly at `start_page`,
    /// if one exists. Used by the in-place growth path of `realloc`.
    unsafe fn carve_at(&mut self, start_page: usize, pages: usize) -> Option<usize> {
        for node in list::iter(&self.free_list) {
            let region = FreeRegion::from_node(node);
            if (*region).start_page as usize == start_page && (*region).pages as usize >= pages {
                let result = (*region).start_page as usize;
                (*region).start_page += pages as u64;
                (*region).pages -= pages as u64;
                if (*region).pages == 0 {
                    list::unlink(node);
                } else {
                    FreeRegion::move_to_base(region, self.buffer);
                }
                return Some(result);
            }
        }
        None
    }

    /// Drain the pending list into the sorted free list, coalescing.
    unsafe fn flush_pending(&mut self) {
        // The restore may overwrite or relink the record just yielded,
        // so the successor is read before each step.
        for node in list::iter_safe(&self.pending_list) {
            self.restore(FreeRegion::from_node(node));
        }
        list::init(&mut self.pending_list);
    }

    /// Merge one freed region back into the sorted free list.
    ///
    /// Attaches to the abutting predecessor or successor where one
    /// exists, then runs the global merge sweep in case the attachment
    /// bridged two previously separate regions; a region abutting
    /// neither is linked as a new record.
    unsafe fn restore(&mut self, free_region: *mut FreeRegion) {
        let head = &mut self.free_list as *mut ListNode;
        let mut prev_node = head;
        let mut node = (*head).next;
        while node != head {
            let region = FreeRegion::from_node(node);
            if (*free_region).start_page < (*region).start_page {
                let mut attached = false;
                if prev_node != head {
                    let prev_region = FreeRegion::from_node(prev_node);
                    if (*prev_region).start_page + (*prev_region).pages
                        == (*free_region).start_page
                    {
                        (*prev_region).pages += (*free_region).pages;
                        attached = true;
                    }
                }
                if !attached
                    && (*free_region).start_page + (*free_region).pages == (*region).start_page
                {
                    // Rebase the successor over the freed run; its
                    // record has to move down to the new base.
                    (*region).start_page = (*free_region).start_page;
                    (*region).pages += (*free_region).pages;
                    FreeRegion::move_to_base(region, self.buffer);
                    attached = true;
                }
                if attached {
                    self.merge_adjacent();
                } else {
                    list::link_before(node, &mut (*free_region).link);
                }
                return;
            }
            prev_node = node;
            node = (*node).next;
        }
        // Highest start_page seen so far: append at the tail.
        list::link_before(head, &mut (*free_region).link);
        self.merge_adjacent();
    }

    /// One pass over the sorted list merging every abutting pair.
    unsafe fn merge_adjacent(&mut self) {
        let head = &mut self.free_list as *mut ListNode;
        let mut prev_node = (*head).next;
        if prev_node == head {
            return;
        }
        let mut node = (*prev_node).next;
        while node != head {
            let prev_region = FreeRegion::from_node(prev_node);
            let region = FreeRegion::from_node(node);
            if (*prev_region).start_page + (*prev_region).pages == (*region).start_page {
                (*prev_region).pages += (*region).pages;
                list::unlink(node);
                node = (*prev_node).next;
            } else {
                prev_node = node;
                node = (*node).next;
            }
        }
    }

    /// Start of the mounted buffer; null before the first `reinit`.
    pub fn buffer_ptr(&self) -> *mut u8 {
        self.buffer
    }

    /// Size of the mounted buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Number of allocatable pages (the metadata page excluded).
    pub fn total_pages(&self) -> usize {
        if self.buffer.is_null() {
            0
        } else {
            (self.size >> PAGE_SHIFT) - 1
        }
    }

    /// Pages currently free, counting both coalesced and pending runs.
    pub fn available_pages(&self) -> usize {
        self.free_regions().map(|r| r.pages).sum::<usize>()
            + self.pending_regions().map(|r| r.pages).sum::<usize>()
    }

    /// Pages currently handed out.
    pub fn used_pages(&self) -> usize {
        self.total_pages() - self.available_pages()
    }

    /// Snapshot iterator over the sorted free-region list.
    pub fn free_regions(&self) -> RegionIter<'_> {
        RegionIter::new(&self.free_list, self.buffer.is_null())
    }

    /// Snapshot iterator over the pending (freed, not yet merged) list.
    pub fn pending_regions(&self) -> RegionIter<'_> {
        RegionIter::new(&self.pending_list, self.buffer.is_null())
    }

    /// Log both region lists, one line per record.
    pub fn debug_dump(&self) {
        debug!("page allocator: free regions:");
        for _r in self.free_regions() {
            debug!("  start {} pages {}", _r.start_page, _r.pages);
        }
        debug!("page allocator: pending regions:");
        for _r in self.pending_regions() {
            debug!("  start {} pages {}", _r.start_page, _r.pages);
        }
    }
}

impl Default for LinearAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::slab::PageProvider for LinearAllocator {
    fn malloc(&mut self, size: usize, hint: Hint) -> AllocResult<NonNull<u8>> {
        LinearAllocator::malloc(self, size, hint)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        LinearAllocator::free(self, ptr)
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, hint: Hint) -> AllocResult<NonNull<u8>> {
        LinearAllocator::realloc(self, ptr, size, hint)
    }
}

/// Iterator yielding [`Region`] snapshots of one region list.
pub struct RegionIter<'a> {
    cur: *mut ListNode,
    head: *const ListNode,
    _marker: PhantomData<&'a LinearAllocator>,
}

impl<'a> RegionIter<'a> {
    fn new(head: &'a ListNode, unmounted: bool) -> Self {
        let head_ptr = head as *const ListNode;
        Self {
            // Before the first reinit the heads are not yet self-linked.
            cur: if unmounted {
                head_ptr as *mut ListNode
            } else {
                head.next
            },
            head: head_ptr,
            _marker: PhantomData,
        }
    }
}

impl Iterator for RegionIter<'_> {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        if self.cur as *const ListNode == self.head {
            return None;
        }
        unsafe {
            let region = FreeRegion::from_node(self.cur);
            self.cur = (*self.cur).next;
            Some(Region {
                start_page: (*region).start_page as usize,
                pages: (*region).pages as usize,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc_zeroed, dealloc};
    use alloc::vec::Vec;
    use core::alloc::Layout;

    const TEST_ARENA_SIZE: usize = 128 * 1024; // 31 usable pages

    fn alloc_test_arena(size: usize) -> (*mut u8, Layout) {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        (ptr, layout)
    }

    fn dealloc_test_arena(ptr: *mut u8, layout: Layout) {
        unsafe { dealloc(ptr, layout) };
    }

    // Boxed so the allocator (and the list heads inside it) never moves
    // after reinit links in-buffer records to it.
    fn mounted(size: usize) -> (alloc::boxed::Box<LinearAllocator>, *mut u8, Layout) {
        let (buf, layout) = alloc_test_arena(size);
        let mut la = alloc::boxed::Box::new(LinearAllocator::new());
        unsafe { la.reinit(buf, size, true).unwrap() };
        (la, buf, layout)
    }

    /// Walk the raw free list checking the sorted, non-abutting and
    /// record-placement invariants.
    unsafe fn assert_free_list_invariants(la: &LinearAllocator) {
        let mut last_end = 0usize;
        for node in list::iter(&la.free_list) {
            let region = FreeRegion::from_node(node);
            let start = (*region).start_page as usize;
            let pages = (*region).pages as usize;
            assert!(pages > 0, "empty region linked");
            assert!(
                last_end == 0 || last_end < start,
                "free list unsorted or abutting: prev end {} next start {}",
                last_end,
                start
            );
            assert_eq!(
                region as usize,
                la.buffer as usize + (start << PAGE_SHIFT),
                "record not at its region base"
            );
            last_end = start + pages;
        }
    }

    #[test]
    fn test_reinit_installs_initial_region() {
        let (la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let regions: Vec<Region> = la.free_regions().collect();
        assert_eq!(
            regions,
            [Region {
                start_page: 1,
                pages: 31
            }]
        );
        assert_eq!(la.total_pages(), 31);
        assert_eq!(la.used_pages(), 0);
        assert_eq!(la.buffer_ptr(), buf);
        assert_eq!(la.buffer_size(), TEST_ARENA_SIZE);
        unsafe { assert_free_list_invariants(&la) };
        la.debug_dump();

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_hint_wire_values() {
        assert_eq!(Hint::Transient as usize, 1);
        assert_eq!(Hint::Persistent as usize, 2);
    }

    #[test]
    #[should_panic(expected = "page aligned")]
    fn test_reinit_rejects_unaligned_buffer() {
        let (buf, _layout) = alloc_test_arena(TEST_ARENA_SIZE + PAGE_SIZE);
        let mut la = LinearAllocator::new();
        unsafe {
            let _ = la.reinit(buf.add(64), TEST_ARENA_SIZE, true);
        }
    }

    #[test]
    #[should_panic(expected = "window")]
    fn test_reinit_rejects_small_buffer() {
        let (buf, _layout) = alloc_test_arena(64 * 1024);
        let mut la = LinearAllocator::new();
        unsafe {
            let _ = la.reinit(buf, 64 * 1024, true);
        }
    }

    // Validation runs before the buffer is touched, so a dangling
    // aligned pointer is enough for the rejection paths.
    #[test]
    #[should_panic(expected = "window")]
    fn test_reinit_rejects_oversized_buffer() {
        let mut la = LinearAllocator::new();
        unsafe {
            let _ = la.reinit(PAGE_SIZE as *mut u8, MAX_BUFFER_SIZE, true);
        }
    }

    #[test]
    #[should_panic(expected = "page multiple")]
    fn test_reinit_rejects_unrounded_size() {
        let mut la = LinearAllocator::new();
        unsafe {
            let _ = la.reinit(PAGE_SIZE as *mut u8, TEST_ARENA_SIZE + 1, true);
        }
    }

    #[cfg(feature = "guards")]
    #[test]
    #[should_panic(expected = "not page aligned")]
    fn test_guard_catches_unaligned_free() {
        let (mut la, _buf, _layout) = mounted(TEST_ARENA_SIZE);
        let p = la.malloc(PAGE_SIZE, Hint::Transient).unwrap();
        unsafe {
            la.free(NonNull::new_unchecked(p.as_ptr().add(8)));
        }
    }

    #[test]
    fn test_transient_carves_from_low_end() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let p = la.malloc(PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(p.as_ptr() as usize, buf as usize + PAGE_SIZE);
        let regions: Vec<Region> = la.free_regions().collect();
        assert_eq!(
            regions,
            [Region {
                start_page: 2,
                pages: 30
            }]
        );
        unsafe { assert_free_list_invariants(&la) };

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_persistent_carves_from_high_end() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let t = la.malloc(PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(t.as_ptr() as usize, buf as usize + PAGE_SIZE);

        let p = la.malloc(PAGE_SIZE, Hint::Persistent).unwrap();
        assert_eq!(p.as_ptr() as usize, buf as usize + 31 * PAGE_SIZE);
        let regions: Vec<Region> = la.free_regions().collect();
        assert_eq!(
            regions,
            [Region {
                start_page: 2,
                pages: 29
            }]
        );

        let t2 = la.malloc(PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(t2.as_ptr() as usize, buf as usize + 2 * PAGE_SIZE);
        unsafe { assert_free_list_invariants(&la) };

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_rounding_and_page_table() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        // 5000 bytes rounds to two pages.
        let p = la.malloc(5000, Hint::Transient).unwrap();
        unsafe {
            assert_eq!(la.table.run_pages(la.ptr_to_page(p.as_ptr())), 2);
        }
        assert_eq!(la.used_pages(), 2);

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_zero_size_rejected() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);
        assert_eq!(la.malloc(0, Hint::Transient), Err(AllocError::InvalidParam));
        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_unmounted_allocator_has_no_memory() {
        let mut la = LinearAllocator::new();
        assert_eq!(la.malloc(PAGE_SIZE, Hint::Transient), Err(AllocError::NoMemory));
        assert_eq!(la.free_regions().count(), 0);
        assert_eq!(la.total_pages(), 0);
    }

    #[test]
    fn test_free_is_deferred_until_miss() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let t = la.malloc(10 * PAGE_SIZE, Hint::Transient).unwrap();
        let _p = la.malloc(10 * PAGE_SIZE, Hint::Persistent).unwrap();
        unsafe { la.free(t) };

        // The freed run sits on the pending list, not the free list.
        assert_eq!(la.pending_regions().count(), 1);
        assert_eq!(
            la.pending_regions().next(),
            Some(Region {
                start_page: 1,
                pages: 10
            })
        );

        // A 10-page transient request is served from the untouched
        // middle region on the first pass.
        let t2 = la.malloc(10 * PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(t2.as_ptr() as usize, buf as usize + 11 * PAGE_SIZE);
        unsafe { assert_free_list_invariants(&la) };

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_miss_flushes_pending_and_coalesces() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let a = la.malloc(10 * PAGE_SIZE, Hint::Transient).unwrap();
        let b = la.malloc(10 * PAGE_SIZE, Hint::Transient).unwrap();
        unsafe {
            la.free(a);
            la.free(b);
        }

        // 20 pages only exist once the two pending runs merge with each
        // other; the remaining untouched region is 11 pages.
        let big = la.malloc(20 * PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(big.as_ptr() as usize, buf as usize + PAGE_SIZE);
        assert_eq!(la.pending_regions().count(), 0);
        unsafe { assert_free_list_invariants(&la) };

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_exhaustion_returns_no_memory() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let all = la.malloc(31 * PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(
            la.malloc(PAGE_SIZE, Hint::Transient),
            Err(AllocError::NoMemory)
        );

        unsafe { la.free(all) };
        // The miss path reclaims everything.
        let again = la.malloc(31 * PAGE_SIZE, Hint::Persistent).unwrap();
        assert_eq!(again.as_ptr() as usize, buf as usize + PAGE_SIZE);

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_realloc_shrink_is_noop() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let p = la.malloc(4 * PAGE_SIZE, Hint::Transient).unwrap();
        unsafe {
            let same = la.realloc(p.as_ptr(), 2 * PAGE_SIZE, Hint::Transient).unwrap();
            assert_eq!(same, p);
            let same = la.realloc(p.as_ptr(), 1, Hint::Transient).unwrap();
            assert_eq!(same, p);
            // The run length is untouched.
            assert_eq!(la.table.run_pages(1), 4);
        }

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_realloc_grows_in_place_and_updates_run_length() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let p = la.malloc(PAGE_SIZE, Hint::Transient).unwrap();
        unsafe {
            let grown = la.realloc(p.as_ptr(), 3 * PAGE_SIZE, Hint::Transient).unwrap();
            assert_eq!(grown, p);
            assert_eq!(la.table.run_pages(1), 3);

            // Freeing must return all three pages: the whole arena is
            // allocatable again afterwards.
            la.free(p);
        }
        let all = la.malloc(31 * PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(all.as_ptr() as usize, buf as usize + PAGE_SIZE);

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_realloc_relocates_and_copies() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let p = la.malloc(2 * PAGE_SIZE, Hint::Transient).unwrap();
        // Blocker right after the run forces the relocation path.
        let _blocker = la.malloc(PAGE_SIZE, Hint::Transient).unwrap();

        unsafe {
            for i in 0..2 * PAGE_SIZE {
                p.as_ptr().add(i).write((i % 251) as u8);
            }
            let q = la.realloc(p.as_ptr(), 4 * PAGE_SIZE, Hint::Transient).unwrap();
            assert_ne!(q, p);
            for i in 0..2 * PAGE_SIZE {
                assert_eq!(q.as_ptr().add(i).read(), (i % 251) as u8);
            }
            // The old run went onto the pending list.
            assert_eq!(
                la.pending_regions().next(),
                Some(Region {
                    start_page: 1,
                    pages: 2
                })
            );
        }

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_realloc_null_behaves_as_malloc() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);
        unsafe {
            let p = la.realloc(ptr::null_mut(), PAGE_SIZE, Hint::Transient).unwrap();
            assert_eq!(p.as_ptr() as usize, buf as usize + PAGE_SIZE);
        }
        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_realloc_failure_keeps_original_run() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let p = la.malloc(20 * PAGE_SIZE, Hint::Transient).unwrap();
        unsafe {
            p.as_ptr().write(0xAB);
            assert_eq!(
                la.realloc(p.as_ptr(), 40 * PAGE_SIZE, Hint::Transient),
                Err(AllocError::NoMemory)
            );
            assert_eq!(p.as_ptr().read(), 0xAB);
            assert_eq!(la.table.run_pages(1), 20);
        }

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_long_run_length_encoding() {
        // 300-page runs need the 0xFF overflow encoding; use a 2 MiB
        // arena (511 usable pages).
        let size = 2 * 1024 * 1024;
        let (mut la, buf, layout) = mounted(size);

        let p = la.malloc(300 * PAGE_SIZE, Hint::Transient).unwrap();
        unsafe {
            assert_eq!(la.table.run_pages(1), 300);
            la.free(p);
        }
        let again = la.malloc(511 * PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(again.as_ptr() as usize, buf as usize + PAGE_SIZE);

        dealloc_test_arena(buf, layout);
    }

    #[test]
    fn test_churn_preserves_invariants() {
        let (mut la, buf, layout) = mounted(TEST_ARENA_SIZE);

        let mut live: Vec<NonNull<u8>> = Vec::new();
        for round in 0..8 {
            for i in 1..=4 {
                let hint = if i % 2 == 0 {
                    Hint::Persistent
                } else {
                    Hint::Transient
                };
                if let Ok(p) = la.malloc(i * PAGE_SIZE, hint) {
                    live.push(p);
                }
            }
            // Free every other allocation, oldest first.
            let mut idx = 0;
            live.retain(|p| {
                idx += 1;
                if idx % 2 == round % 2 {
                    unsafe { la.free(*p) };
                    false
                } else {
                    true
                }
            });
            unsafe { assert_free_list_invariants(&la) };
        }

        for p in live.drain(..) {
            unsafe { la.free(p) };
        }
        let all = la.malloc(31 * PAGE_SIZE, Hint::Transient).unwrap();
        assert_eq!(all.as_ptr() as usize, buf as usize + PAGE_SIZE);

        dealloc_test_arena(buf, layout);
    }
}
