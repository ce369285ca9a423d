use std::{
    alloc::{GlobalAlloc, Layout},
    cmp,
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    header::ALIGNMENT,
    heap::Heap,
};

/// The public face of the allocator. All the real work happens in the
/// internal heap core, which needs mutable access and is not thread safe, so this
/// struct wraps it in a global [`Mutex`]: every entry point takes the lock,
/// does its work synchronously and releases the lock before returning.
/// Nothing ever blocks or yields while holding it, so all operations are
/// linearizable and callers observe them in real-time order.
///
/// The compound operations [`Segalloc::zero_allocate`] and
/// [`Segalloc::resize`] are built on top of the primitive entry points and
/// take the lock once per primitive instead of holding it across the whole
/// operation. The mutex is not recursive, composing entry points under the
/// lock would deadlock immediately.
///
/// # Examples
///
/// ## Standalone
///
/// ```rust
/// use segalloc::Segalloc;
///
/// let allocator = Segalloc::new();
///
/// let address = allocator.allocate(97);
/// assert!(!address.is_null());
/// assert_eq!(address as usize % 8, 0);
///
/// unsafe {
///     address.write_bytes(0xAB, 97);
///     allocator.free(address);
/// }
///
/// assert!(allocator.verify());
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use segalloc::Segalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Segalloc = Segalloc::new();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
pub struct Segalloc {
    heap: Mutex<Heap>,
}

// The inner heap is full of raw pointers, which makes the compiler refuse
// to share this struct across threads on its own. Every access goes through
// the mutex and the heap memory the pointers target is owned by this very
// allocator, so sharing is fine.
unsafe impl Sync for Segalloc {}

impl Segalloc {
    /// Builds a new allocator. No memory is requested from the OS until the
    /// first allocation, so this is `const` and can initialize a `static`.
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Returns a pointer to at least `size` bytes of uninitialized memory,
    /// aligned to 8 bytes, or null when `size` is zero or the OS refuses to
    /// grow the heap.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate_block(size) }
                .map_or(ptr::null_mut(), |address| address.as_ptr()),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Releases an allocation. Null is a no-op. Freeing the same pointer
    /// twice is detected and terminates the process with a diagnostic on
    /// stderr.
    ///
    /// # Safety
    ///
    /// `address` must be null or a pointer obtained from this allocator
    /// that has not been freed since.
    pub unsafe fn free(&self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        if let Ok(mut heap) = self.heap.lock() {
            heap.deallocate_block(address);
        }
    }

    /// Allocates room for `count` elements of `size` bytes each and zeroes
    /// it. Returns null when the total overflows, is zero, or cannot be
    /// allocated.
    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };

        let address = self.allocate(total);
        if !address.is_null() {
            // Zeroing happens outside the lock; nobody else can hold this
            // pointer yet.
            unsafe { address.write_bytes(0, total) };
        }

        address
    }

    /// Moves an allocation to a new block of `size` bytes, copying as much
    /// of the old content as fits. A null `address` behaves like
    /// [`Segalloc::allocate`]; a zero `size` frees the allocation and
    /// returns null. When the new block cannot be allocated the old one is
    /// left untouched and null is returned.
    ///
    /// # Safety
    ///
    /// `address` must be null or a pointer obtained from this allocator
    /// that has not been freed since.
    pub unsafe fn resize(&self, address: *mut u8, size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(address) else {
            return self.allocate(size);
        };

        if size == 0 {
            self.free(address);
            return ptr::null_mut();
        }

        // Only the copy bound needs the lock; the block itself cannot move
        // or disappear under us, it still belongs to the caller.
        let old_payload = match self.heap.lock() {
            Ok(heap) => heap.allocated_payload_size(old),
            Err(_) => return ptr::null_mut(),
        };

        let new_address = self.allocate(size);
        if !new_address.is_null() {
            ptr::copy_nonoverlapping(old.as_ptr(), new_address, cmp::min(old_payload, size));
            self.free(address);
        }

        new_address
    }

    /// Checks every structural invariant of the heap: free list cycle
    /// freedom and link consistency, boundary tag agreement across every
    /// chunk, total coalescing, and fencepost integrity.
    pub fn verify(&self) -> bool {
        match self.heap.lock() {
            Ok(heap) => unsafe { heap.verify() },
            Err(_) => false,
        }
    }
}

impl Default for Segalloc {
    fn default() -> Self {
        Segalloc::new()
    }
}

unsafe impl GlobalAlloc for Segalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Blocks are naturally aligned to 8 bytes and nothing more; rather
        // than over-allocate and shim pointers around, refuse the rare
        // stricter request. Returning null is a valid failure mode for
        // this trait.
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.zero_allocate(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.resize(ptr, new_size)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;

    #[test]
    fn allocate_and_free_round_trip() {
        let allocator = Segalloc::new();

        unsafe {
            let address = allocator.allocate(128);
            assert!(!address.is_null());
            assert_eq!(address as usize % ALIGNMENT, 0);

            for i in 0..128 {
                *address.add(i) = (i % 256) as u8;
            }
            for i in 0..128 {
                assert_eq!(*address.add(i), (i % 256) as u8);
            }

            allocator.free(address);
            assert!(allocator.verify());
        }
    }

    #[test]
    fn free_null_is_noop() {
        let allocator = Segalloc::new();
        unsafe {
            allocator.free(ptr::null_mut());
        }
        assert!(allocator.verify());
    }

    #[test]
    fn zero_allocate_zeroes() {
        let allocator = Segalloc::new();

        unsafe {
            // Dirty some memory first so a zeroed result means something.
            let dirty = allocator.allocate(256);
            dirty.write_bytes(0xFF, 256);
            allocator.free(dirty);

            let address = allocator.zero_allocate(8, 32);
            assert!(!address.is_null());
            for i in 0..256 {
                assert_eq!(*address.add(i), 0);
            }

            allocator.free(address);
        }
    }

    #[test]
    fn zero_allocate_rejects_overflow() {
        let allocator = Segalloc::new();
        assert!(allocator.zero_allocate(usize::MAX, 2).is_null());
        assert!(allocator.zero_allocate(0, 16).is_null());
    }

    #[test]
    fn resize_copies_what_fits() {
        let allocator = Segalloc::new();

        unsafe {
            let address = allocator.allocate(32);
            for i in 0..32 {
                *address.add(i) = i as u8;
            }

            // Growing preserves all old bytes.
            let grown = allocator.resize(address, 64);
            assert!(!grown.is_null());
            for i in 0..32 {
                assert_eq!(*grown.add(i), i as u8);
            }

            // Shrinking preserves the prefix that fits.
            let shrunk = allocator.resize(grown, 8);
            assert!(!shrunk.is_null());
            for i in 0..8 {
                assert_eq!(*shrunk.add(i), i as u8);
            }

            allocator.free(shrunk);
            assert!(allocator.verify());
        }
    }

    #[test]
    fn resize_null_allocates() {
        let allocator = Segalloc::new();

        unsafe {
            let address = allocator.resize(ptr::null_mut(), 40);
            assert!(!address.is_null());
            allocator.free(address);
        }
    }

    #[test]
    fn resize_to_zero_frees() {
        let allocator = Segalloc::new();

        unsafe {
            let address = allocator.allocate(40);
            assert!(allocator.resize(address, 0).is_null());
            assert!(allocator.verify());

            // The address can be handed out again, proving it was freed.
            let again = allocator.allocate(40);
            assert_eq!(again, address);
            allocator.free(again);
        }
    }

    #[test]
    fn global_alloc_refuses_large_alignments() {
        let allocator = Segalloc::new();

        unsafe {
            let layout = Layout::from_size_align(64, 64).unwrap();
            assert!(allocator.alloc(layout).is_null());

            let layout = Layout::from_size_align(64, 8).unwrap();
            let address = allocator.alloc(layout);
            assert!(!address.is_null());
            allocator.dealloc(address, layout);
        }
    }

    /// All threads allocate at the same time, then all free at the same
    /// time, maximizing contention on each phase.
    #[test]
    fn multiple_threads_synchronized_allocs_and_deallocs() {
        let allocator = Segalloc::new();

        let num_threads = 8;
        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for t in 0..num_threads {
                let allocator = &allocator;
                let barrier = &barrier;
                scope.spawn(move || unsafe {
                    let len = 1024;
                    let address = allocator.allocate(len);
                    assert!(!address.is_null());

                    let fill = t as u8;
                    for i in 0..len {
                        *address.add(i) = fill;
                    }

                    barrier.wait();

                    // Check for memory corruption from the other threads.
                    for i in 0..len {
                        assert_eq!(*address.add(i), fill);
                    }

                    allocator.free(address);
                });
            }
        });

        assert!(allocator.verify());
    }

    /// Threads allocate and free interchangeably with different sizes, so
    /// contention hits splits, coalesces and chunk acquisition at once.
    #[test]
    fn multiple_threads_unsynchronized_allocs_and_deallocs() {
        let allocator = Segalloc::new();

        let num_threads = 8;
        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                let allocator = &allocator;
                let barrier = &barrier;
                scope.spawn(move || unsafe {
                    let sizes = [16, 256, 1024, 2048, 4096];
                    let num_allocs = if cfg!(miri) { 10 } else { 200 };

                    for size in sizes {
                        barrier.wait();
                        for round in 0..num_allocs {
                            let address = allocator.allocate(size);
                            assert!(!address.is_null());

                            let fill = (round % 256) as u8;
                            *address = fill;
                            *address.add(size / 2) = fill;
                            *address.add(size - 1) = fill;

                            assert_eq!(*address, fill);
                            assert_eq!(*address.add(size / 2), fill);
                            assert_eq!(*address.add(size - 1), fill);

                            allocator.free(address);
                        }
                    }
                });
            }
        });

        assert!(allocator.verify());
    }
}
