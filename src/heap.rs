use std::{cmp, fmt, ptr::NonNull};

use crate::{
    arena::{self, ChunkRegistry, ARENA_SIZE},
    freelist::{FreeListNode, SegregatedLists, N_LISTS},
    header::{align_up, Header, State, ALLOC_HEADER_SIZE, MIN_BLOCK_SIZE, MIN_PAYLOAD_SIZE},
    Pointer,
};

/// The allocator core: the whole process-wide state bundle in one movable
/// value. This struct is not thread safe and all its operations are unsafe
/// raw pointer surgery, so it has to be wrapped in a [`std::sync::Mutex`]
/// to be of any use to the outside world. See [`crate::allocator::Segalloc`]
/// for the public API.
///
/// The high level picture, once a couple of chunks exist:
///
/// ```text
///             +-------+-----------------------------------+-------+
/// chunk 1 ->  | fence | blocks, some free, some allocated  | fence |
///             +-------+-----------------------------------+-------+
///             +-------+-----------------------------------+-------+
/// chunk 2 ->  | fence | blocks ...                         | fence |
///             +-------+-----------------------------------+-------+
///                                                             ^
///                                        last_fencepost ------+
/// ```
///
/// Free blocks are additionally linked into the segregated lists, see
/// [`SegregatedLists`]. When a new chunk happens to start exactly where
/// `last_fencepost` ends, the two chunks are fused into one and the pair of
/// fenceposts between them becomes ordinary free space.
pub(crate) struct Heap {
    /// Segregated free lists over all chunks.
    pub(crate) free_lists: SegregatedLists,
    /// Left fenceposts of the chunks acquired so far, for the verifier.
    pub(crate) chunks: ChunkRegistry,
    /// Right fencepost of the most recently acquired chunk. Used to detect
    /// that the next chunk is adjacent and can be fused.
    last_fencepost: Pointer<Header>,
    /// Left fencepost of the very first chunk. Only used to print block
    /// offsets in the [`fmt::Debug`] rendering.
    base: Pointer<Header>,
    /// Set once [`Heap::init`] has succeeded.
    pub(crate) initialized: bool,
}

impl Heap {
    /// Constructs the core without touching the OS. The first allocation
    /// pays for the setup.
    pub const fn new() -> Self {
        Self {
            free_lists: SegregatedLists::new(),
            chunks: ChunkRegistry::new(),
            last_fencepost: None,
            base: None,
            initialized: false,
        }
    }

    /// One-time setup: sentinel table plus the first chunk. Runs under the
    /// public mutex on the first entry point call. Returns false when the
    /// OS refuses to give us memory; nothing is committed in that case and
    /// the next call simply tries again.
    unsafe fn init(&mut self) -> bool {
        if self.initialized {
            return true;
        }

        if !self.free_lists.init() {
            return false;
        }

        let Some(block) = arena::allocate_chunk(ARENA_SIZE) else {
            return false;
        };

        let left_post = Header::left_neighbor(block);
        self.chunks.record(left_post);
        self.base = Some(left_post);
        self.last_fencepost = Some(Header::right_neighbor(block));
        self.free_lists.push_into(N_LISTS - 1, block);

        self.initialized = true;
        true
    }

    /// Services one allocation request of `raw_size` user bytes. Returns
    /// the payload address, 8-byte aligned, or `None` for a zero-sized or
    /// unsatisfiable request.
    pub unsafe fn allocate_block(&mut self, raw_size: usize) -> Pointer<u8> {
        if raw_size == 0 || raw_size > usize::MAX - MIN_BLOCK_SIZE {
            return None;
        }

        if !self.init() {
            return None;
        }

        let payload = align_up(cmp::max(raw_size, MIN_PAYLOAD_SIZE));
        let needed = payload + ALLOC_HEADER_SIZE;

        // Every trip around this loop grows the heap by one chunk, and an
        // adjacent chunk fuses with the previous one, so the free block at
        // the head of the last list keeps growing until it fits.
        loop {
            if let Some(node) = self.find_free_block(needed) {
                return Some(self.place(node, needed));
            }

            if !self.acquire_chunk() {
                return None;
            }
        }
    }

    /// Scans the segregated lists for a block of at least `needed` total
    /// bytes and returns its free list node, still linked. Exact classes
    /// can take their head blindly; the last class mixes sizes and is
    /// searched first fit.
    unsafe fn find_free_block(&self, needed: usize) -> Pointer<FreeListNode> {
        for index in SegregatedLists::index_for(needed)..N_LISTS {
            if self.free_lists.is_empty(index) {
                continue;
            }

            let sentinel = self.free_lists.sentinel(index);
            if index < N_LISTS - 1 {
                return Some(sentinel.as_ref().next);
            }

            let mut node = sentinel.as_ref().next;
            while node != sentinel {
                if Header::from_free_list_node(node).as_ref().block_size() >= needed {
                    return Some(node);
                }
                node = node.as_ref().next;
            }
        }

        None
    }

    /// Unlinks the chosen block, splits off the low end if the leftover is
    /// a legal block on its own, and returns the payload address of the
    /// allocated high end.
    ///
    /// **Before**:
    ///
    /// ```text
    /// +--------+--------------------------------------+
    /// | Header |             free payload             |
    /// +--------+--------------------------------------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    /// +--------+---------------------+--------+-------+
    /// | Header |     free payload    | Header | alloc |
    /// +--------+---------------------+--------+-------+
    /// ```
    ///
    /// Carving from the high end keeps the remainder at its old address,
    /// which has a nice consequence: when the remainder still belongs to
    /// the last size class, its links are still valid and it can be spliced
    /// back into the exact position it came from instead of being reinserted
    /// at the head.
    unsafe fn place(&mut self, node: NonNull<FreeListNode>, needed: usize) -> NonNull<u8> {
        let old_prev = node.as_ref().prev;
        let old_next = node.as_ref().next;
        SegregatedLists::unlink(node);

        let mut block = Header::from_free_list_node(node);
        let extra = block.as_ref().block_size() - needed;

        if extra >= MIN_BLOCK_SIZE {
            block.as_mut().set_block_size(extra);

            let raw = NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(extra));
            let allocated = Header::write_at(raw, needed, extra, State::Allocated);
            Header::right_neighbor(allocated)
                .as_mut()
                .set_left_size(needed);

            if SegregatedLists::index_for(extra) == N_LISTS - 1 {
                SegregatedLists::splice(node, old_prev, old_next);
            } else {
                self.free_lists.push(block);
            }

            return Header::content_address_of(allocated);
        }

        // Too small to split, the caller gets the whole block.
        block.as_mut().set_state(State::Allocated);
        Header::right_neighbor(block)
            .as_mut()
            .set_left_size(block.as_ref().block_size());
        Header::content_address_of(block)
    }

    /// Grows the heap by one chunk because the free lists came up empty.
    /// If the chunk lands right after the previous one the two are fused:
    /// either the previous chunk's trailing free block swallows both
    /// fenceposts and the new inner block, or the old right fencepost
    /// itself is converted into the new free block. Non-adjacent chunks are
    /// recorded for the verifier. Either way the resulting free block ends
    /// up at the head of the last list.
    unsafe fn acquire_chunk(&mut self) -> bool {
        let Some(mut block) = arena::allocate_chunk(ARENA_SIZE) else {
            return false;
        };

        let left_post = Header::left_neighbor(block);
        let mut right_post = Header::right_neighbor(block);

        // Initialization always places one chunk before anything else runs.
        let last = self.last_fencepost.unwrap();

        if last.as_ptr() as usize + ALLOC_HEADER_SIZE == left_post.as_ptr() as usize {
            let mut neighbor = Header::left_neighbor(last);

            if neighbor.as_ref().state() == State::Unallocated {
                SegregatedLists::unlink(Header::free_list_node_of(neighbor));
                let grown = neighbor.as_ref().block_size()
                    + 2 * ALLOC_HEADER_SIZE
                    + block.as_ref().block_size();
                neighbor.as_mut().set_block_size(grown);
                block = neighbor;
            } else {
                let grown = block.as_ref().block_size() + 2 * ALLOC_HEADER_SIZE;
                let mut fused = last;
                fused.as_mut().set_state(State::Unallocated);
                fused.as_mut().set_block_size(grown);
                block = fused;
            }

            right_post.as_mut().set_left_size(block.as_ref().block_size());
        } else {
            self.chunks.record(left_post);
        }

        self.free_lists.push_into(N_LISTS - 1, block);
        self.last_fencepost = Some(right_post);
        true
    }

    /// Returns a previously allocated block to the free lists, coalescing
    /// with both neighbors where possible so that no two adjacent free
    /// blocks ever exist inside a chunk.
    ///
    /// Freeing an already free block is a double free and terminates the
    /// process. Freeing a fencepost is ignored; a fencepost address can
    /// only reach us through a wild pointer and there's nothing sensible to
    /// do with it.
    pub unsafe fn deallocate_block(&mut self, address: NonNull<u8>) {
        let mut block = Header::from_content_address(address);

        match block.as_ref().state() {
            State::Unallocated => report_double_free(),
            State::Fencepost => return,
            State::Allocated => {}
        }

        block.as_mut().set_state(State::Unallocated);

        // When an absorbed neighbor lived in the last list, the grown block
        // still belongs there, so we remember the neighbor's position and
        // splice the result into it instead of recomputing a class that
        // cannot have changed. Small-class neighbors get no such treatment,
        // growing moves them to a different class anyway.
        let mut reuse_left: Option<(NonNull<FreeListNode>, NonNull<FreeListNode>)> = None;
        let mut reuse_right: Option<(NonNull<FreeListNode>, NonNull<FreeListNode>)> = None;

        let right = Header::right_neighbor(block);
        if right.as_ref().state() == State::Unallocated {
            let node = Header::free_list_node_of(right);
            if SegregatedLists::index_for(right.as_ref().block_size()) == N_LISTS - 1 {
                reuse_right = Some((node.as_ref().prev, node.as_ref().next));
            }
            SegregatedLists::unlink(node);

            let merged = block.as_ref().block_size() + right.as_ref().block_size();
            block.as_mut().set_block_size(merged);
            Header::right_neighbor(block).as_mut().set_left_size(merged);
        }

        let mut left = Header::left_neighbor(block);
        if left.as_ref().state() == State::Unallocated {
            let node = Header::free_list_node_of(left);
            if SegregatedLists::index_for(left.as_ref().block_size()) == N_LISTS - 1 {
                reuse_left = Some((node.as_ref().prev, node.as_ref().next));
            }
            SegregatedLists::unlink(node);

            let merged = left.as_ref().block_size() + block.as_ref().block_size();
            left.as_mut().set_block_size(merged);
            block = left;
            Header::right_neighbor(block).as_mut().set_left_size(merged);
        }

        let node = Header::free_list_node_of(block);
        if let Some((prev, next)) = reuse_left {
            SegregatedLists::splice(node, prev, next);
        } else if let Some((prev, next)) = reuse_right {
            SegregatedLists::splice(node, prev, next);
        } else {
            self.free_lists.push(block);
        }
    }

    /// Payload capacity of a live allocation. Used by the resize wrapper to
    /// bound the copy to what the old block actually holds.
    ///
    /// # Safety
    ///
    /// `address` must come from [`Heap::allocate_block`] and must not have
    /// been freed.
    pub unsafe fn allocated_payload_size(&self, address: NonNull<u8>) -> usize {
        let block = Header::from_content_address(address);
        debug_assert!(block.as_ref().state() == State::Allocated);
        block.as_ref().block_size() - ALLOC_HEADER_SIZE
    }
}

/// Writes a diagnostic and aborts. Raw `write` because the error path must
/// not allocate, we may well *be* the global allocator when this fires.
#[cfg(not(test))]
fn report_double_free() -> ! {
    let message = b"free(): double free detected\n";
    unsafe {
        libc::write(2, message.as_ptr().cast(), message.len());
    }
    std::process::abort()
}

/// Deterministic stand-in for the aborting version so the behavior stays
/// testable in process.
#[cfg(test)]
fn report_double_free() -> ! {
    panic!("double free detected")
}

impl fmt::Debug for Heap {
    /// Renders every chunk block by block, with offsets relative to the
    /// start of the heap.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(base) = self.base else {
            return f.write_str("Heap (uninitialized)");
        };

        let base = base.as_ptr() as usize;
        writeln!(f, "Heap")?;

        for chunk in self.chunks.iter() {
            writeln!(f, "  chunk at offset {}", chunk.as_ptr() as usize - base)?;

            unsafe {
                let mut current = Header::right_neighbor(chunk);
                while current.as_ref().state() != State::Fencepost {
                    writeln!(
                        f,
                        "    [{:>7}] size {:>6} {:?}",
                        current.as_ptr() as usize - base,
                        current.as_ref().block_size(),
                        current.as_ref().state(),
                    )?;
                    current = Header::right_neighbor(current);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
impl Heap {
    /// Size and state of every block in the chunk anchored at `chunk`,
    /// fenceposts excluded, in address order.
    pub unsafe fn chunk_blocks(&self, chunk: NonNull<Header>) -> Vec<(usize, State)> {
        let mut blocks = Vec::new();
        let mut current = Header::right_neighbor(chunk);

        while current.as_ref().state() != State::Fencepost {
            blocks.push((current.as_ref().block_size(), current.as_ref().state()));
            current = Header::right_neighbor(current);
        }

        blocks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn first_chunk(&self) -> NonNull<Header> {
        self.chunks.iter().next().unwrap()
    }

    /// Number of blocks currently linked into list `index`.
    pub unsafe fn list_len(&self, index: usize) -> usize {
        let sentinel = self.free_lists.sentinel(index);
        let mut len = 0;
        let mut node = sentinel.as_ref().next;
        while node != sentinel {
            len += 1;
            node = node.as_ref().next;
        }
        len
    }
}
