//! Allocation front end for registered-memory pools.
//!
//! Two pieces sit on top of `rmapool`:
//!
//!  * [`RegionPtr`]: a "fancy pointer" that dereferences like `*mut T`
//!    but also carries the [`rmapool::MemoryRegion`] its target lives
//!    in, so RMA operations can reach the registration keys without a
//!    pointer-to-region lookup table.
//!  * [`RegionAllocator`]: a standard-allocator-shaped facade that
//!    serves element requests from a shared [`rmapool::MemoryPool`] and
//!    returns them as `RegionPtr`s.

pub mod alloc;
pub mod ptr;

pub use alloc::RegionAllocator;
pub use ptr::RegionPtr;
