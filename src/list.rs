//! Circular intrusive doubly-linked list.
//!
//! List entries embed a [`ListNode`] that provides the next/prev links;
//! the enclosing record is recovered from a node pointer by a fixed byte
//! offset. The list is circular with a sentinel head that is itself
//! linked, so link and unlink never need a special empty/first/last
//! case and both run in O(1) without allocating.
//!
//! Records here relocate: the page allocator bit-copies a free-region
//! record to a new base address and patches its neighbors' links, so
//! nodes and records must be co-located by address. Everything operates
//! on raw pointers for that reason.

use core::ptr;

/// Entry of a circular doubly-linked list.
///
/// Embed one of these in every record that participates in a list. A
/// list head is a plain `ListNode` that is linked in the circle like any
/// entry and serves as the iteration sentinel.
#[repr(C)]
#[derive(Debug)]
pub struct ListNode {
    pub next: *mut ListNode,
    pub prev: *mut ListNode,
}

impl ListNode {
    /// A node with null links, suitable for const contexts.
    ///
    /// Must be initialized with [`init`] before any list operation; the
    /// self-link cannot be formed at const time.
    pub const fn null() -> Self {
        Self {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }
}

/// Initialize `node` as an empty list (self-linked).
///
/// # Safety
/// `node` must point to valid, writable `ListNode` storage.
#[inline]
pub unsafe fn init(node: *mut ListNode) {
    (*node).next = node;
    (*node).prev = node;
}

/// Whether `head` has no entries besides itself.
///
/// # Safety
/// `head` must be an initialized node.
#[inline]
pub unsafe fn is_empty(head: *const ListNode) -> bool {
    (*head).next as *const ListNode == head
}

/// Whether `node` is currently a member of some list.
///
/// Only meaningful for nodes that were unlinked with [`unlink_init`] or
/// never linked after [`init`].
///
/// # Safety
/// `node` must be an initialized node.
#[inline]
pub unsafe fn is_linked(node: *const ListNode) -> bool {
    (*node).next as *const ListNode != node
}

/// Link `node` immediately before `anchor`.
///
/// With a list head as `anchor` this appends at the tail.
///
/// # Safety
/// `anchor` must be linked into an initialized list; `node` must be
/// valid storage not currently linked anywhere.
#[inline]
pub unsafe fn link_before(anchor: *mut ListNode, node: *mut ListNode) {
    let prev = (*anchor).prev;
    (*node).next = anchor;
    (*node).prev = prev;
    (*prev).next = node;
    (*anchor).prev = node;
}

/// Link `node` immediately after `anchor`.
///
/// With a list head as `anchor` this prepends at the front.
///
/// # Safety
/// Same contract as [`link_before`].
#[inline]
pub unsafe fn link_after(anchor: *mut ListNode, node: *mut ListNode) {
    let next = (*anchor).next;
    (*node).next = next;
    (*node).prev = anchor;
    (*next).prev = node;
    (*anchor).next = node;
}

/// Remove `node` from its list, restoring its neighbors' links.
///
/// The node itself keeps stale pointers; use [`unlink_init`] if it may
/// be tested or unlinked again.
///
/// # Safety
/// `node` must be linked into an initialized list.
#[inline]
pub unsafe fn unlink(node: *mut ListNode) {
    let next = (*node).next;
    let prev = (*node).prev;
    (*prev).next = next;
    (*next).prev = prev;
}

/// Remove `node` from its list and re-initialize it as empty.
///
/// A no-op on a node that is already self-linked, so it is safe to call
/// twice.
///
/// # Safety
/// `node` must be either linked or self-linked.
#[inline]
pub unsafe fn unlink_init(node: *mut ListNode) {
    unlink(node);
    init(node);
}

/// Move every entry of `source` to the position before `target`,
/// leaving `source` empty.
///
/// With list heads for both, this appends all of `source`'s entries at
/// `target`'s tail.
///
/// # Safety
/// Both must be initialized; `source` must not be an entry of the list
/// containing `target`.
pub unsafe fn splice(target: *mut ListNode, source: *mut ListNode) {
    if is_empty(source) {
        return;
    }
    let first = (*source).next;
    let last = (*source).prev;
    let at = (*target).prev;

    (*first).prev = at;
    (*at).next = first;
    (*last).next = target;
    (*target).prev = last;

    init(source);
}

/// Move the entries of `source` from `anchor` (inclusive) to the tail
/// into `target`, which must be an empty initialized head.
///
/// # Safety
/// `anchor` must be an entry of `source`; `target` must be an empty
/// initialized head.
pub unsafe fn split(source: *mut ListNode, anchor: *mut ListNode, target: *mut ListNode) {
    debug_assert!(is_empty(target));
    let last = (*source).prev;
    let before = (*anchor).prev;

    (*target).next = anchor;
    (*anchor).prev = target;
    (*target).prev = last;
    (*last).next = target;

    (*source).prev = before;
    (*before).next = source;
}

/// Exchange the entries of two lists.
///
/// # Safety
/// Both must be initialized heads of disjoint lists.
pub unsafe fn swap(a: *mut ListNode, b: *mut ListNode) {
    let a_next = (*a).next;
    let a_prev = (*a).prev;
    let b_next = (*b).next;
    let b_prev = (*b).prev;

    if b_next as *const ListNode == b {
        init(a);
    } else {
        (*a).next = b_next;
        (*a).prev = b_prev;
        (*b_next).prev = a;
        (*b_prev).next = a;
    }
    if a_next as *const ListNode == a {
        init(b);
    } else {
        (*b).next = a_next;
        (*b).prev = a_prev;
        (*a_next).prev = b;
        (*a_prev).next = b;
    }
}

/// Recover the enclosing record from a pointer to its embedded node.
///
/// `offset` is the byte offset of the node field within the record
/// (`core::mem::offset_of!`).
///
/// # Safety
/// `node` must actually be embedded in a `T` at `offset`.
#[inline]
pub unsafe fn entry<T>(node: *mut ListNode, offset: usize) -> *mut T {
    (node as *mut u8).sub(offset) as *mut T
}

/// Iterator over the entry nodes of a list, head excluded.
///
/// Advances by reading the successor of the last yielded node, so the
/// yielded node must still be linked when the next step runs. Use
/// [`iter_safe`] when the loop body unlinks the current node and keeps
/// iterating; unlinking the current node and then stopping is fine.
pub struct Iter {
    head: *const ListNode,
    last: *const ListNode,
}

/// Iterate the entries of the list at `head`.
///
/// # Safety
/// `head` must be an initialized head, and the list must stay intact for
/// the iterator's lifetime (the node just yielded excepted, if iteration
/// stops there).
#[inline]
pub unsafe fn iter(head: *const ListNode) -> Iter {
    Iter { head, last: head }
}

impl Iterator for Iter {
    type Item = *mut ListNode;

    fn next(&mut self) -> Option<*mut ListNode> {
        let node = unsafe { (*self.last).next };
        if node as *const ListNode == self.head {
            return None;
        }
        self.last = node;
        Some(node)
    }
}

/// Iterator that reads the successor before yielding each node, so the
/// loop body may unlink (or overwrite) the current node.
pub struct IterSafe {
    head: *const ListNode,
    cur: *mut ListNode,
}

/// Iterate like [`iter`], tolerating unlink of the yielded node.
///
/// # Safety
/// `head` must be an initialized head; nodes other than the one just
/// yielded must stay linked while iterating.
#[inline]
pub unsafe fn iter_safe(head: *const ListNode) -> IterSafe {
    IterSafe {
        head,
        cur: (*head).next,
    }
}

impl Iterator for IterSafe {
    type Item = *mut ListNode;

    fn next(&mut self) -> Option<*mut ListNode> {
        if self.cur as *const ListNode == self.head {
            return None;
        }
        let node = self.cur;
        self.cur = unsafe { (*node).next };
        Some(node)
    }
}
