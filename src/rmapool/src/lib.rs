//! A pool allocator for pinned, pre-registered memory regions.
//!
//! # Overview
//!
//! RMA transports require every transfer buffer to be pinned and
//! registered with a protection domain before the adapter can touch it.
//! Registration is expensive, so this crate amortizes it:
//!
//!  * A [`block::BlockAllocator`] allocates one large buffer and registers
//!    it with the transport in a single call.
//!  * A [`stack::SlabStack`] slices such a block into fixed-size
//!    sub-regions and recycles them through a lock-free LIFO stack.
//!  * A [`pool::MemoryPool`] owns four slab stacks of increasing chunk
//!    sizes and routes each request to the smallest class that fits,
//!    falling back to one-off temporary registrations for oversize or
//!    exhausted requests.
//!
//! The transport itself is abstracted behind [`provider::RegionProvider`];
//! [`provider::system::SystemProvider`] pins with `mlock(2)` and
//! [`provider::mock::MockProvider`] counts registrations for tests.

pub mod block;
pub mod counter;
mod freelist;
pub mod pool;
pub mod provider;
pub mod region;
pub mod stack;

pub use counter::PerfCounter;
pub use pool::{ClassConfig, MemoryPool, PoolConfig};
pub use provider::{AccessFlags, LocalKey, RegionProvider, RemoteKey};
pub use region::{MemoryRegion, RegionFlags};
pub use stack::SlabStack;
