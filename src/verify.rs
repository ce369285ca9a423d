//! Structural verification of the heap. Nothing in here mutates anything,
//! the checks exist so that stress tests (and worried users) can ask the
//! allocator whether its invariants still hold after every operation.

use std::ptr::NonNull;

use crate::{
    freelist::{FreeListNode, SegregatedLists, N_LISTS},
    header::{Header, State, ALIGNMENT, MIN_BLOCK_SIZE},
    heap::Heap,
};

impl Heap {
    /// True iff the heap is structurally sound: every free list is an
    /// honest cycle through its sentinel with mutually consistent links and
    /// correctly classed members, and every chunk walks cleanly from
    /// fencepost to fencepost with agreeing boundary tags and no adjacent
    /// free blocks. Failures print a one-line diagnostic to stderr.
    pub(crate) unsafe fn verify(&self) -> bool {
        if !self.initialized {
            return true;
        }

        self.verify_free_lists() && self.verify_boundary_tags()
    }

    unsafe fn verify_free_lists(&self) -> bool {
        if let Some(node) = self.detect_cycles() {
            eprintln!("verify: cycle detected at {:?}", node.as_ptr());
            return false;
        }

        if let Some(node) = self.find_invalid_node() {
            eprintln!("verify: invalid free list node at {:?}", node.as_ptr());
            return false;
        }

        true
    }

    /// Floyd's tortoise and hare over every list. The hare moves two nodes
    /// per step; in a healthy circular list it comes back around to the
    /// sentinel, while a rogue cycle that skips the sentinel traps both
    /// runners until they collide.
    unsafe fn detect_cycles(&self) -> Option<NonNull<FreeListNode>> {
        for index in 0..N_LISTS {
            let sentinel = self.free_lists.sentinel(index);
            let mut slow = sentinel.as_ref().next;
            let mut fast = slow.as_ref().next;

            while fast != sentinel {
                if slow == fast {
                    return Some(slow);
                }
                slow = slow.as_ref().next;
                fast = fast.as_ref().next.as_ref().next;
            }
        }

        None
    }

    /// Walks every list once, checking that each node's neighbors point
    /// back at it, that the block behind the node believes it is free, and
    /// that it sits in the list matching its size class.
    unsafe fn find_invalid_node(&self) -> Option<NonNull<FreeListNode>> {
        for index in 0..N_LISTS {
            let sentinel = self.free_lists.sentinel(index);
            let mut node = sentinel.as_ref().next;

            while node != sentinel {
                if node.as_ref().next.as_ref().prev != node
                    || node.as_ref().prev.as_ref().next != node
                {
                    return Some(node);
                }

                let block = Header::from_free_list_node(node);
                if block.as_ref().state() != State::Unallocated
                    || SegregatedLists::index_for(block.as_ref().block_size()) != index
                {
                    return Some(node);
                }

                node = node.as_ref().next;
            }
        }

        None
    }

    /// Walks every recorded chunk left to right, from the block after the
    /// left fencepost up to the terminating fencepost, checking the
    /// boundary tags along the way. A chunk that was fused into its
    /// neighbor is covered by the neighbor's walk.
    unsafe fn verify_boundary_tags(&self) -> bool {
        for chunk in self.chunks.iter() {
            if chunk.as_ref().state() != State::Fencepost {
                eprintln!("verify: chunk at {:?} lost its fencepost", chunk.as_ptr());
                return false;
            }

            let mut previous_free = false;
            let mut current = Header::right_neighbor(chunk);

            while current.as_ref().state() != State::Fencepost {
                let size = current.as_ref().block_size();

                if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
                    eprintln!("verify: illegal block size {size} at {:?}", current.as_ptr());
                    return false;
                }

                if Header::right_neighbor(current).as_ref().left_size() != size {
                    eprintln!("verify: boundary tag mismatch at {:?}", current.as_ptr());
                    return false;
                }

                let free = current.as_ref().state() == State::Unallocated;
                if free && previous_free {
                    eprintln!("verify: adjacent free blocks at {:?}", current.as_ptr());
                    return false;
                }

                previous_free = free;
                current = Header::right_neighbor(current);
            }
        }

        true
    }
}
