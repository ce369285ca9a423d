//! A general purpose memory allocator built on segregated free lists with
//! boundary tag coalescing. Memory is obtained from the OS in fixed size
//! chunks bracketed by fencepost sentinels; freed blocks merge eagerly with
//! their neighbors, even across chunk boundaries when two chunks happen to
//! be adjacent. A single process wide mutex serializes every operation, so
//! the allocator can serve as a drop-in replacement for the platform
//! allocator in multi-threaded programs:
//!
//! ```no_run
//! use segalloc::Segalloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: Segalloc = Segalloc::new();
//! ```
//!
//! Start reading at `header` for the on-heap data model, then `freelist`,
//! `arena` and `heap` for the allocation machinery, and `allocator` for
//! the public surface.

use std::ptr::NonNull;

mod allocator;
mod arena;
mod freelist;
mod header;
mod heap;
mod platform;
mod verify;


/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::Segalloc;
