//! The multi-size-class pool.
//!
//! Four slab stacks of increasing chunk sizes; a request is routed to
//! the smallest class that fits. A class that stays empty after a
//! bounded number of pop-and-grow rounds, or a request larger than the
//! biggest class, is served by a one-off temporary registration
//! instead. Caller-owned buffers can be registered through the pool as
//! well; both kinds bypass the free stacks and are destroyed on
//! release.

use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, trace};
use thiserror::Error;

use crate::counter::PerfCounter;
use crate::provider::RegionProvider;
use crate::region::{self, MemoryRegion};
use crate::stack::SlabStack;

pub const TINY_CHUNK_SIZE: usize = 1 << 10;
pub const SMALL_CHUNK_SIZE: usize = 16 << 10;
pub const MEDIUM_CHUNK_SIZE: usize = 64 << 10;
pub const LARGE_CHUNK_SIZE: usize = 1 << 20;

pub const TINY_CHUNKS: u32 = 1024;
pub const SMALL_CHUNKS: u32 = 2048;
pub const MEDIUM_CHUNKS: u32 = 64;
pub const LARGE_CHUNKS: u32 = 16;

/// Pops re-attempted per class before falling back to a temporary
/// region. Every miss triggers one growth attempt inside the stack.
const POP_RETRIES: usize = 2;

#[derive(Error, Debug)]
pub enum Error {
    #[error("region: {0}")]
    Region(#[from] region::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ClassConfig {
    pub chunk_size: usize,
    pub initial_chunks: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub tiny: ClassConfig,
    pub small: ClassConfig,
    pub medium: ClassConfig,
    pub large: ClassConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            tiny: ClassConfig {
                chunk_size: TINY_CHUNK_SIZE,
                initial_chunks: TINY_CHUNKS,
            },
            small: ClassConfig {
                chunk_size: SMALL_CHUNK_SIZE,
                initial_chunks: SMALL_CHUNKS,
            },
            medium: ClassConfig {
                chunk_size: MEDIUM_CHUNK_SIZE,
                initial_chunks: MEDIUM_CHUNKS,
            },
            large: ClassConfig {
                chunk_size: LARGE_CHUNK_SIZE,
                initial_chunks: LARGE_CHUNKS,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeClass {
    Tiny,
    Small,
    Medium,
    Large,
    Oversize,
}

pub struct MemoryPool<P: RegionProvider> {
    // Declaration order is teardown order.
    tiny: SlabStack<P>,
    small: SlabStack<P>,
    medium: SlabStack<P>,
    large: SlabStack<P>,
    domain: Arc<P::Domain>,
    temp_regions: PerfCounter<u32>,
    user_regions: PerfCounter<u32>,
}

impl<P: RegionProvider> MemoryPool<P> {
    pub fn new(domain: Arc<P::Domain>) -> Self {
        Self::with_config(domain, PoolConfig::default())
    }

    pub fn with_config(domain: Arc<P::Domain>, config: PoolConfig) -> Self {
        assert!(
            config.tiny.chunk_size < config.small.chunk_size
                && config.small.chunk_size < config.medium.chunk_size
                && config.medium.chunk_size < config.large.chunk_size,
            "size classes must be disjoint bands ordered by chunk size"
        );
        MemoryPool {
            tiny: SlabStack::new(
                "tiny",
                Arc::clone(&domain),
                config.tiny.chunk_size,
                config.tiny.initial_chunks,
            ),
            small: SlabStack::new(
                "small",
                Arc::clone(&domain),
                config.small.chunk_size,
                config.small.initial_chunks,
            ),
            medium: SlabStack::new(
                "medium",
                Arc::clone(&domain),
                config.medium.chunk_size,
                config.medium.initial_chunks,
            ),
            large: SlabStack::new(
                "large",
                Arc::clone(&domain),
                config.large.chunk_size,
                config.large.initial_chunks,
            ),
            domain,
            temp_regions: PerfCounter::new(),
            user_regions: PerfCounter::new(),
        }
    }

    fn class_for(&self, len: usize) -> SizeClass {
        // A zero-length request still gets a region, from the smallest
        // class.
        if len <= self.tiny.chunk_size() {
            SizeClass::Tiny
        } else if len <= self.small.chunk_size() {
            SizeClass::Small
        } else if len <= self.medium.chunk_size() {
            SizeClass::Medium
        } else if len <= self.large.chunk_size() {
            SizeClass::Large
        } else {
            SizeClass::Oversize
        }
    }

    fn stack(&self, class: SizeClass) -> &SlabStack<P> {
        match class {
            SizeClass::Tiny => &self.tiny,
            SizeClass::Small => &self.small,
            SizeClass::Medium => &self.medium,
            SizeClass::Large => &self.large,
            SizeClass::Oversize => unreachable!("oversize requests have no slab stack"),
        }
    }

    /// Allocate a registered region of at least `len` bytes.
    ///
    /// The returned pointer stays valid until it is passed back to
    /// [`deallocate`](Self::deallocate) (temporary and user regions) or
    /// until the pool is dropped (pooled regions).
    pub fn allocate(&self, len: usize) -> Result<NonNull<MemoryRegion<P>>, Error> {
        match self.class_for(len) {
            SizeClass::Oversize => self.allocate_temporary(len),
            class => {
                let stack = self.stack(class);
                for _ in 0..=POP_RETRIES {
                    if let Some(region) = stack.pop() {
                        return Ok(region);
                    }
                }
                debug!(
                    "{} byte request exhausted its class, falling back to a temporary region",
                    len
                );
                self.allocate_temporary(len)
            }
        }
    }

    /// Release a region obtained from this pool.
    ///
    /// # Safety
    ///
    /// `region` must come from this pool's `allocate`,
    /// `allocate_temporary` or `register_user` and must not be used
    /// after this call.
    pub unsafe fn deallocate(&self, region: NonNull<MemoryRegion<P>>) {
        let (is_temp, is_user, is_partial, size) = {
            let r = region.as_ref();
            (r.is_temp(), r.is_user(), r.is_partial(), r.size())
        };
        if is_temp {
            self.temp_regions.dec();
            trace!(
                "destroying temporary region {:p}, temp regions {}",
                region.as_ptr(),
                self.temp_regions
            );
            drop(Box::from_raw(region.as_ptr()));
        } else if is_user {
            self.user_regions.dec();
            trace!(
                "destroying user region {:p}, user regions {}",
                region.as_ptr(),
                self.user_regions
            );
            drop(Box::from_raw(region.as_ptr()));
        } else {
            debug_assert!(is_partial, "released a region this pool does not manage");
            match self.class_for(size) {
                SizeClass::Oversize => {
                    unreachable!("pooled region larger than the largest class")
                }
                class => self.stack(class).push(region),
            }
        }
    }

    /// One-off region bypassing the pooled classes: its own buffer, its
    /// own registration, destroyed on release instead of recycled.
    pub fn allocate_temporary(&self, len: usize) -> Result<NonNull<MemoryRegion<P>>, Error> {
        let mut region = MemoryRegion::<P>::allocate(&self.domain, len)?;
        region.set_temp();
        self.temp_regions.inc();
        debug!(
            "allocated {} byte temporary region, temp regions {}",
            len, self.temp_regions
        );
        Ok(NonNull::from(Box::leak(Box::new(region))))
    }

    /// Register a caller-owned buffer. On release it is deregistered
    /// but not freed.
    ///
    /// # Safety
    ///
    /// `[ptr, ptr + len)` must stay valid until the returned region is
    /// deallocated.
    pub unsafe fn register_user(
        &self,
        ptr: *mut u8,
        len: usize,
    ) -> Result<NonNull<MemoryRegion<P>>, Error> {
        let region = MemoryRegion::<P>::register_user(&self.domain, ptr, len)?;
        self.user_regions.inc();
        debug!(
            "registered {} byte user region at {:p}, user regions {}",
            len, ptr, self.user_regions
        );
        Ok(NonNull::from(Box::leak(Box::new(region))))
    }

    /// Advisory: whether `allocate(len)` would currently be served
    /// without growing. Another thread may invalidate the answer at any
    /// time.
    pub fn can_allocate(&self, len: usize) -> bool {
        match self.class_for(len) {
            // A temporary allocation can always be attempted.
            SizeClass::Oversize => true,
            class => self.stack(class).has_free(),
        }
    }

    pub fn tiny(&self) -> &SlabStack<P> {
        &self.tiny
    }

    pub fn small(&self) -> &SlabStack<P> {
        &self.small
    }

    pub fn medium(&self) -> &SlabStack<P> {
        &self.medium
    }

    pub fn large(&self) -> &SlabStack<P> {
        &self.large
    }

    /// Outstanding temporary regions; default value with counters
    /// disabled.
    pub fn temp_regions(&self) -> u32 {
        self.temp_regions.get()
    }

    /// Outstanding user regions; default value with counters disabled.
    pub fn user_regions(&self) -> u32 {
        self.user_regions.get()
    }

    pub fn domain(&self) -> &Arc<P::Domain> {
        &self.domain
    }
}
