use std::{cmp, mem, ptr::NonNull};

use crate::{
    header::{Header, ALIGNMENT, ALLOC_HEADER_SIZE},
    platform, Pointer,
};

/// Number of size classes. Lists `0..N_LISTS - 1` each hold free blocks of
/// one exact payload size (`(i + 1) * 8` bytes for list `i`), the final
/// list holds everything larger in no particular order.
pub(crate) const N_LISTS: usize = 59;

/// Bytes needed for the whole sentinel table. See [`SegregatedLists::init`].
const TABLE_SIZE: usize = N_LISTS * mem::size_of::<FreeListNode>();

/// See [`Header`] first. When a block is free we use the first bytes of its
/// payload to store a pair of links, that is, membership in a doubly linked
/// list of _only_ free blocks. This is how a free block looks in memory:
///
/// ```text
/// +----------------------------+ <--+
/// | block size | state bits    |    | Header
/// | size of left neighbor      |    |
/// +----------------------------+ <--+
/// | pointer to next free block | <--+
/// +----------------------------+    | FreeListNode
/// | pointer to prev free block | <--+
/// +----------------------------+
/// |    Rest of the payload     | <--+
/// |            ...             |    | Could be 0 bytes.
/// |            ...             | <--+
/// +----------------------------+
/// ```
///
/// Nothing else is associated with a free block, the size and state already
/// live in the header right above the links. Reusing payload bytes this way
/// is safe because the user dropped all their pointers into this block when
/// they freed it. If they didn't, that's a use after free and they were
/// going to have a bad time anyway.
///
/// Each list is circular and anchored by a sentinel node, which is a bare
/// `FreeListNode` without any header in front of it. The sentinel trick
/// means insertion and removal never have to special-case the ends of the
/// list: there's always a previous and a next node. An empty list is simply
/// a sentinel pointing at itself in both directions. The only thing to keep
/// in mind is that a walk must compare against the sentinel address to know
/// when to stop, and must never try to turn the sentinel into a block
/// header with [`Header::from_free_list_node`].
#[repr(C)]
pub(crate) struct FreeListNode {
    pub next: NonNull<FreeListNode>,
    pub prev: NonNull<FreeListNode>,
}

/// The segregated free lists: an array of [`N_LISTS`] sentinels, one per
/// size class. Blocks whose payload is `(i + 1) * 8` bytes live in list
/// `i`, everything too large for an exact class lives in the last list:
///
/// ```text
///                 +--------+     +-------+     +-------+
/// sentinels[1] -> |        | <-> | 16 B  | <-> | 16 B  |
///                 |        |     +-------+     +-------+
///                 +--------+
///                 +--------+     +-------+
/// sentinels[2] -> |        | <-> | 24 B  |
///                 |        |     +-------+
///                 +--------+
/// ..................................................................
///                 +--------+     +-------+     +-------+     +-----+
/// sentinels[58] -> |       | <-> | 2 KiB | <-> | 640 B | <-> | ... |
///                 |        |     +-------+     +-------+     +-----+
///                 +--------+
/// ```
///
/// Since the sentinels are linked to by nodes that live in heap memory, the
/// sentinels themselves must never move. We can't promise that for a field
/// of an ordinary Rust value, so the table is carved out of its own little
/// heap extension during [`SegregatedLists::init`] and this struct only
/// stores a pointer to it. Heap memory never moves, problem solved, and the
/// allocator state stays a plain movable value.
pub(crate) struct SegregatedLists {
    /// Base of the sentinel table, `None` until [`SegregatedLists::init`].
    table: Pointer<FreeListNode>,
}

impl SegregatedLists {
    pub const fn new() -> Self {
        Self { table: None }
    }

    /// Index of the list where a free block of `block_size` total bytes
    /// belongs. The last list catches everything too big for an exact
    /// class.
    #[inline]
    pub fn index_for(block_size: usize) -> usize {
        debug_assert!(block_size > ALLOC_HEADER_SIZE);
        cmp::min(N_LISTS - 1, (block_size - ALLOC_HEADER_SIZE) / ALIGNMENT - 1)
    }

    /// Obtains the sentinel table from the platform and links every list
    /// into its empty state. Returns false if the platform refuses, in
    /// which case nothing was modified and a later retry is fine.
    pub unsafe fn init(&mut self) -> bool {
        if self.table.is_some() {
            return true;
        }

        let Some(address) = platform::extend_heap(TABLE_SIZE) else {
            return false;
        };

        let table = address.cast::<FreeListNode>();
        for i in 0..N_LISTS {
            let sentinel = NonNull::new_unchecked(table.as_ptr().add(i));
            sentinel.as_ptr().write(FreeListNode {
                next: sentinel,
                prev: sentinel,
            });
        }

        self.table = Some(table);
        true
    }

    /// Sentinel of list `index`. Must not be called before [`Self::init`].
    #[inline]
    pub unsafe fn sentinel(&self, index: usize) -> NonNull<FreeListNode> {
        debug_assert!(index < N_LISTS);
        NonNull::new_unchecked(self.table.unwrap().as_ptr().add(index))
    }

    #[inline]
    pub unsafe fn is_empty(&self, index: usize) -> bool {
        let sentinel = self.sentinel(index);
        sentinel.as_ref().next == sentinel
    }

    /// Pushes `block` onto the head of the list matching its size class.
    #[inline]
    pub unsafe fn push(&mut self, block: NonNull<Header>) {
        self.push_into(Self::index_for(block.as_ref().block_size()), block);
    }

    /// Pushes `block` onto the head of list `index`, writing the links into
    /// the block payload.
    pub unsafe fn push_into(&mut self, index: usize, block: NonNull<Header>) {
        debug_assert!(block.as_ref().state() == crate::header::State::Unallocated);

        let sentinel = self.sentinel(index);
        let mut node = Header::free_list_node_of(block);
        let mut first = sentinel.as_ref().next;

        node.as_mut().prev = sentinel;
        node.as_mut().next = first;
        first.as_mut().prev = node;
        (*sentinel.as_ptr()).next = node;
    }

    /// Unlinks `node` from whatever list it is on. The node's own links are
    /// left untouched so the caller can remember the position and
    /// [`Self::splice`] something back into it later.
    pub unsafe fn unlink(node: NonNull<FreeListNode>) {
        let mut prev = node.as_ref().prev;
        let mut next = node.as_ref().next;
        prev.as_mut().next = next;
        next.as_mut().prev = prev;
    }

    /// Links `node` between `prev` and `next`, which must be adjacent
    /// members of the same list. Together with [`Self::unlink`] this lets a
    /// grown block take over the exact list position of a block it
    /// absorbed, skipping a class computation we know wouldn't change.
    pub unsafe fn splice(
        mut node: NonNull<FreeListNode>,
        mut prev: NonNull<FreeListNode>,
        mut next: NonNull<FreeListNode>,
    ) {
        node.as_mut().prev = prev;
        node.as_mut().next = next;
        prev.as_mut().next = node;
        next.as_mut().prev = node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{State, MIN_BLOCK_SIZE};

    #[test]
    fn size_class_indexes() {
        // Smallest legal block: 16 byte payload.
        assert_eq!(SegregatedLists::index_for(MIN_BLOCK_SIZE), 1);
        assert_eq!(SegregatedLists::index_for(ALLOC_HEADER_SIZE + 8), 0);
        assert_eq!(SegregatedLists::index_for(ALLOC_HEADER_SIZE + 24), 2);

        // Last exact class holds payloads of (N_LISTS - 1) * 8 bytes.
        let last_exact = ALLOC_HEADER_SIZE + (N_LISTS - 1) * 8;
        assert_eq!(SegregatedLists::index_for(last_exact), N_LISTS - 2);

        // Anything bigger falls into the final list.
        assert_eq!(SegregatedLists::index_for(last_exact + 8), N_LISTS - 1);
        assert_eq!(SegregatedLists::index_for(1 << 20), N_LISTS - 1);
    }

    #[repr(align(8))]
    struct Scratch([u8; 512]);

    #[test]
    fn push_unlink_splice() {
        let mut scratch = Scratch([0; 512]);
        let mut lists = SegregatedLists::new();

        unsafe {
            assert!(lists.init());

            let base = NonNull::new_unchecked(scratch.0.as_mut_ptr());
            let first = Header::write_at(base, MIN_BLOCK_SIZE, 0, State::Unallocated);
            let second = Header::write_at(
                NonNull::new_unchecked(base.as_ptr().add(MIN_BLOCK_SIZE)),
                MIN_BLOCK_SIZE,
                MIN_BLOCK_SIZE,
                State::Unallocated,
            );

            let index = SegregatedLists::index_for(MIN_BLOCK_SIZE);
            assert!(lists.is_empty(index));

            lists.push(first);
            lists.push(second);
            assert!(!lists.is_empty(index));

            // Head insertion: the most recently pushed block comes first.
            let sentinel = lists.sentinel(index);
            let head = sentinel.as_ref().next;
            assert_eq!(Header::from_free_list_node(head), second);
            assert_eq!(head.as_ref().next, Header::free_list_node_of(first));

            // Unlinking the head leaves the older block alone in the list.
            SegregatedLists::unlink(head);
            assert_eq!(sentinel.as_ref().next, Header::free_list_node_of(first));
            assert_eq!(sentinel.as_ref().prev, Header::free_list_node_of(first));

            // The unlinked node still remembers its neighbors, so it can be
            // spliced back exactly where it was.
            let (prev, next) = (head.as_ref().prev, head.as_ref().next);
            SegregatedLists::splice(head, prev, next);
            assert_eq!(sentinel.as_ref().next, head);
            assert_eq!(head.as_ref().next, Header::free_list_node_of(first));

            SegregatedLists::unlink(head);
            SegregatedLists::unlink(Header::free_list_node_of(first));
            assert!(lists.is_empty(index));
        }
    }
}
