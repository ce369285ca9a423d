use std::{mem, ptr::NonNull};

use crate::freelist::FreeListNode;

/// Alignment of every address we hand out. Block sizes are always kept as
/// multiples of this value, which conveniently leaves the low bits of the
/// size word free to store the block state. See [`Header`].
pub(crate) const ALIGNMENT: usize = 8;

/// Block header size in bytes. See [`Header`].
pub(crate) const ALLOC_HEADER_SIZE: usize = mem::size_of::<Header>();

/// Minimum payload size in bytes. When a block is free its payload stores
/// the free list links, so the payload can never be smaller than
/// [`FreeListNode`]. See [`crate::freelist`] for the full story.
pub(crate) const MIN_PAYLOAD_SIZE: usize = mem::size_of::<FreeListNode>();

/// Minimum total block size including [`ALLOC_HEADER_SIZE`]. A block below
/// this size could not be freed again, because the links wouldn't fit.
pub(crate) const MIN_BLOCK_SIZE: usize = ALLOC_HEADER_SIZE + MIN_PAYLOAD_SIZE;

/// Low bits of the size word reserved for [`State`].
const STATE_MASK: usize = 0b111;

/// Every region of memory managed by this allocator begins with one of
/// these. Here's a graphical representation of an allocated block:
///
/// ```text
/// +--------------------------+          <--------+
/// | block size | state bits  |                   |
/// +--------------------------+                   | Header
/// | size of left neighbor    |                   |
/// +--------------------------+          <--------+
/// |         Payload          |   <------+
/// |           ...            |          |
/// |           ...            |          | This is where the user writes.
/// |           ...            |          |
/// |           ...            |   <------+
/// +--------------------------+
/// ```
///
/// The size word stores the total size of the block in bytes, header
/// included. Sizes are always multiples of [`ALIGNMENT`], so the low bits
/// would otherwise be wasted and we pack the block state into them instead.
///
/// `left_size` is the boundary tag: it holds the total size of whatever
/// block sits immediately to the left in address order, which lets us reach
/// the left neighbor in O(1) without walking the heap. The right neighbor
/// is even easier, it starts exactly `block_size` bytes after this header.
///
/// Note what's missing: there are no list links in here. Free list links
/// live in the payload of free blocks (see [`FreeListNode`]), because an
/// allocated block doesn't need them and we'd rather not pay 16 bytes of
/// overhead per allocation for pointers that are meaningless most of the
/// time.
///
/// Fenceposts use this exact struct as well, with `block_size` equal to
/// [`ALLOC_HEADER_SIZE`] and no payload at all.
#[repr(C)]
pub(crate) struct Header {
    /// Total block size in bytes with the state packed in the low bits.
    size_state: usize,
    /// Total size of the block immediately to the left in address order.
    left_size: usize,
}

/// What a block is currently being used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// The block is free and linked into exactly one free list.
    Unallocated = 0,
    /// The block payload belongs to the user.
    Allocated = 1,
    /// Chunk boundary sentinel. Never owned by a user, never on a list.
    Fencepost = 2,
}

impl Header {
    /// Total size of this block in bytes, including the header.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.size_state & !STATE_MASK
    }

    /// Current state of this block.
    #[inline]
    pub fn state(&self) -> State {
        match self.size_state & STATE_MASK {
            0 => State::Unallocated,
            1 => State::Allocated,
            2 => State::Fencepost,
            _ => unreachable!("corrupted block state"),
        }
    }

    /// Updates the size word without touching the state bits.
    #[inline]
    pub fn set_block_size(&mut self, size: usize) {
        debug_assert!(size % ALIGNMENT == 0);
        self.size_state = size | (self.size_state & STATE_MASK);
    }

    /// Updates the state bits without touching the size.
    #[inline]
    pub fn set_state(&mut self, state: State) {
        self.size_state = (self.size_state & !STATE_MASK) | state as usize;
    }

    /// Total size of the left neighbor in bytes.
    #[inline]
    pub fn left_size(&self) -> usize {
        self.left_size
    }

    #[inline]
    pub fn set_left_size(&mut self, left_size: usize) {
        self.left_size = left_size;
    }

    /// Writes a fresh header at `address` and returns it typed. This is how
    /// blocks are born: during chunk formatting and when splitting.
    ///
    /// # Safety
    ///
    /// `address` must be valid for [`ALLOC_HEADER_SIZE`] bytes and aligned
    /// to [`ALIGNMENT`].
    #[inline]
    pub unsafe fn write_at(
        address: NonNull<u8>,
        size: usize,
        left_size: usize,
        state: State,
    ) -> NonNull<Self> {
        debug_assert!(size % ALIGNMENT == 0);
        let header = address.cast::<Self>();
        header.as_ptr().write(Header {
            size_state: size | state as usize,
            left_size,
        });
        header
    }

    /// Returns a pointer to a [`Header`] given an address that points right
    /// after a valid [`Header`].
    ///
    /// ```text
    /// +-------------+
    /// |   Header    | <- Returned address points here.
    /// +-------------+
    /// |   Payload   | <- Given address should point here.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// Caller must guarantee that the given address points exactly to the
    /// first memory cell after a [`Header`]. This is mostly used when the
    /// user hands us back a pointer we previously returned from an
    /// allocation. As long as that's true, this is safe, otherwise it's
    /// undefined behaviour.
    #[inline]
    pub unsafe fn from_content_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the address right after the header, which is where the
    /// payload starts.
    ///
    /// # Notes
    ///
    /// We are using this as `Header::content_address_of(header)` instead of
    /// `header.content_address()` because we want to avoid creating
    /// intermediary references to `self` to keep Miri happy. Same goes for
    /// the rest of the navigation helpers below.
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Returns the block header that owns the given free list node. See
    /// [`FreeListNode`], the links are stored at the payload address.
    #[inline]
    pub unsafe fn from_free_list_node(node: NonNull<FreeListNode>) -> NonNull<Self> {
        Self::from_content_address(node.cast())
    }

    /// Returns the free list node of `header`. Only meaningful while the
    /// block is [`State::Unallocated`].
    #[inline]
    pub unsafe fn free_list_node_of(header: NonNull<Self>) -> NonNull<FreeListNode> {
        Self::content_address_of(header).cast()
    }

    /// Header of the block that starts where this one ends.
    ///
    /// # Safety
    ///
    /// Within a chunk every walk is stopped by a fencepost before it can
    /// run off the end, so as long as `header` points into a properly
    /// formatted chunk the result is a valid header.
    #[inline]
    pub unsafe fn right_neighbor(header: NonNull<Self>) -> NonNull<Self> {
        let offset = header.as_ref().block_size();
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(offset)).cast()
    }

    /// Header of the block that ends where this one starts, found through
    /// the boundary tag.
    #[inline]
    pub unsafe fn left_neighbor(header: NonNull<Self>) -> NonNull<Self> {
        let offset = header.as_ref().left_size();
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().sub(offset)).cast()
    }
}

/// Rounds `size` up to the next multiple of [`ALIGNMENT`].
#[inline]
pub(crate) fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scratch space aligned like the real heap.
    #[repr(align(8))]
    struct Scratch([u8; 256]);

    #[test]
    fn size_and_state_are_independent() {
        let mut scratch = Scratch([0; 256]);

        unsafe {
            let address = NonNull::new_unchecked(scratch.0.as_mut_ptr());
            let mut header = Header::write_at(address, 64, 32, State::Unallocated);

            assert_eq!(header.as_ref().block_size(), 64);
            assert_eq!(header.as_ref().left_size(), 32);
            assert_eq!(header.as_ref().state(), State::Unallocated);

            header.as_mut().set_state(State::Allocated);
            assert_eq!(header.as_ref().block_size(), 64);
            assert_eq!(header.as_ref().state(), State::Allocated);

            header.as_mut().set_block_size(128);
            assert_eq!(header.as_ref().block_size(), 128);
            assert_eq!(header.as_ref().state(), State::Allocated);

            header.as_mut().set_state(State::Fencepost);
            assert_eq!(header.as_ref().state(), State::Fencepost);
            assert_eq!(header.as_ref().block_size(), 128);
        }
    }

    #[test]
    fn neighbor_navigation() {
        let mut scratch = Scratch([0; 256]);

        unsafe {
            let base = NonNull::new_unchecked(scratch.0.as_mut_ptr());
            let first = Header::write_at(base, 32, ALLOC_HEADER_SIZE, State::Allocated);
            let second = Header::write_at(
                NonNull::new_unchecked(base.as_ptr().add(32)),
                48,
                32,
                State::Unallocated,
            );
            let third = Header::write_at(
                NonNull::new_unchecked(base.as_ptr().add(32 + 48)),
                32,
                48,
                State::Allocated,
            );

            assert_eq!(Header::right_neighbor(first), second);
            assert_eq!(Header::right_neighbor(second), third);
            assert_eq!(Header::left_neighbor(third), second);
            assert_eq!(Header::left_neighbor(second), first);
        }
    }

    #[test]
    fn content_address_round_trip() {
        let mut scratch = Scratch([0; 256]);

        unsafe {
            let base = NonNull::new_unchecked(scratch.0.as_mut_ptr());
            let header = Header::write_at(base, 32, 0, State::Allocated);
            let content = Header::content_address_of(header);

            assert_eq!(
                content.as_ptr() as usize - header.as_ptr() as usize,
                ALLOC_HEADER_SIZE
            );
            assert_eq!(Header::from_content_address(content), header);
        }
    }

    #[test]
    fn alignment_round_up() {
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
        assert_eq!(align_up(24), 24);
        assert_eq!(align_up(25), 32);
    }
}
