use crate::Pointer;

/// Abstraction for the only thing we ever ask of the host: grow the process
/// heap. The allocator doesn't care which API the underlying kernel or libc
/// offers, it only relies on the returned regions being contiguous with the
/// previous extension as long as nobody else extends the heap in between.
trait PlatformSpecificMemory {
    /// Extends the heap by `increment` bytes and returns the address of the
    /// new area, or `None` if the host refuses.
    unsafe fn extend_heap(increment: usize) -> Pointer<u8>;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each
/// supported environment.
pub(crate) struct Platform;

/// Convinience wrapper for [`PlatformSpecificMemory::extend_heap`].
#[inline]
pub(crate) unsafe fn extend_heap(increment: usize) -> Pointer<u8> {
    Platform::extend_heap(increment)
}

#[cfg(all(unix, not(any(miri, test))))]
mod unix {
    use std::ptr::NonNull;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn extend_heap(increment: usize) -> Pointer<u8> {
            // On success sbrk returns the previous program break, which is
            // exactly the start of the new area. On failure it returns -1
            // cast to a pointer and sets errno, which we don't need. See
            // https://man7.org/linux/man-pages/man2/sbrk.2.html
            let previous = libc::sbrk(increment as libc::intptr_t);

            if previous as isize == -1 {
                return None;
            }

            Some(NonNull::new_unchecked(previous).cast())
        }
    }
}

#[cfg(any(miri, test))]
mod mock {
    //! The real data segment is process global state, which makes it
    //! useless for tests: the harness runs tests on many threads at once
    //! and Miri has no FFI at all. Instead, every test thread gets its own
    //! slab obtained once from the global allocator, and extensions are
    //! carved from it with a bump cursor. That preserves the one property
    //! the allocator depends on, consecutive extensions from the same
    //! thread are contiguous, while keeping tests isolated from each
    //! other. Running out of slab behaves like the OS refusing to grow the
    //! heap. The slab is deliberately leaked when the thread dies, blocks
    //! handed out from it may be referenced by leaked test state and 64 MiB
    //! per test thread is nothing to lose sleep over.

    use std::{alloc, cell::Cell, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    #[cfg(not(miri))]
    const SLAB_SIZE: usize = 64 * 1024 * 1024;
    #[cfg(miri)]
    const SLAB_SIZE: usize = 8 * 1024 * 1024;

    thread_local! {
        static SLAB: Cell<*mut u8> = const { Cell::new(std::ptr::null_mut()) };
        static CURSOR: Cell<usize> = const { Cell::new(0) };
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn extend_heap(increment: usize) -> Pointer<u8> {
            let base = SLAB.with(|slab| {
                if slab.get().is_null() {
                    let layout = alloc::Layout::from_size_align(SLAB_SIZE, 4096).unwrap();
                    slab.set(alloc::alloc(layout));
                }
                slab.get()
            });

            if base.is_null() {
                return None;
            }

            CURSOR.with(|cursor| {
                let offset = cursor.get();
                if increment > SLAB_SIZE - offset {
                    return None;
                }
                cursor.set(offset + increment);
                Some(NonNull::new_unchecked(base.add(offset)))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_contiguous() {
        unsafe {
            let first = extend_heap(4096).unwrap();
            let second = extend_heap(4096).unwrap();
            assert_eq!(first.as_ptr().add(4096), second.as_ptr());
        }
    }
}
