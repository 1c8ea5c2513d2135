//! Standard-allocator-shaped interface over a memory pool.
//!
//! [`RegionAllocator`] turns element counts into byte requests against
//! a [`MemoryPool`] and hands the result out as a [`RegionPtr`], so the
//! registration travels with the data pointer. The allocator manages
//! memory only; constructing and dropping values at the returned
//! address is the caller's business via the usual raw-pointer
//! primitives.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use log::trace;
use rmapool::{pool, MemoryPool, MemoryRegion, RegionProvider};

use crate::ptr::RegionPtr;

/// A copyable handle: all clones and rebindings refer to the same pool.
pub struct RegionAllocator<'p, T, P: RegionProvider> {
    pool: &'p MemoryPool<P>,
    _marker: PhantomData<fn() -> T>,
}

impl<'p, T, P: RegionProvider> RegionAllocator<'p, T, P> {
    pub fn new(pool: &'p MemoryPool<P>) -> Self {
        RegionAllocator {
            pool,
            _marker: PhantomData,
        }
    }

    /// Memory for `n` elements of `T`, registered and pooled.
    pub fn allocate(&self, n: usize) -> Result<RegionPtr<T, P>, pool::Error> {
        let bytes = mem::size_of::<T>()
            .checked_mul(n)
            .expect("capacity overflow");
        let region = self.pool.allocate(bytes)?;
        let r = unsafe { region.as_ref() };
        debug_assert!(
            r.address() as usize % mem::align_of::<T>() == 0,
            "chunk alignment cannot hold this element type"
        );
        trace!("allocated {} elements ({} bytes) at {:p}", n, bytes, r.address());
        Ok(RegionPtr::new(r.address() as *mut T, region.as_ptr()))
    }

    /// Give the memory behind `ptr` back to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on an allocator over the same
    /// pool, all values in it must already be dropped, and it must not
    /// be used afterwards. A null `ptr` is a no-op.
    pub unsafe fn deallocate(&self, ptr: RegionPtr<T, P>, _n: usize) {
        if let Some(region) = NonNull::new(ptr.region_ptr() as *mut MemoryRegion<P>) {
            trace!("releasing region {:p}", region.as_ptr());
            self.pool.deallocate(region);
        }
    }

    /// The same allocator for another element type; containers rebind
    /// through this.
    pub fn rebind<U>(self) -> RegionAllocator<'p, U, P> {
        RegionAllocator {
            pool: self.pool,
            _marker: PhantomData,
        }
    }

    pub fn pool(&self) -> &'p MemoryPool<P> {
        self.pool
    }
}

impl<'p, T, P: RegionProvider> Clone for RegionAllocator<'p, T, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'p, T, P: RegionProvider> Copy for RegionAllocator<'p, T, P> {}

/// Allocators compare equal iff they draw from the same pool, in which
/// case memory from one may be released through the other.
impl<'p, T, P: RegionProvider> PartialEq for RegionAllocator<'p, T, P> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.pool, other.pool)
    }
}

impl<'p, T, P: RegionProvider> Eq for RegionAllocator<'p, T, P> {}

impl<'p, T, P: RegionProvider> std::fmt::Debug for RegionAllocator<'p, T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("pool", &(self.pool as *const MemoryPool<P>))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmapool::provider::mock::{MockDomain, MockProvider};
    use rmapool::PoolConfig;
    use std::sync::Arc;

    fn pool() -> MemoryPool<MockProvider> {
        let mut config = PoolConfig::default();
        config.tiny.initial_chunks = 4;
        config.small.initial_chunks = 4;
        config.medium.initial_chunks = 2;
        config.large.initial_chunks = 2;
        MemoryPool::with_config(Arc::new(MockDomain::new()), config)
    }

    #[test]
    fn allocate_write_read_deallocate() {
        let pool = pool();
        let alloc: RegionAllocator<'_, u64, MockProvider> = RegionAllocator::new(&pool);

        let ptr = alloc.allocate(8).unwrap();
        assert!(!ptr.is_null());
        for i in 0..8usize {
            unsafe { (ptr + i).as_ptr().write(i as u64 * 3) };
        }
        for i in 0..8usize {
            assert_eq!(unsafe { *(ptr + i).as_ptr() }, i as u64 * 3);
        }
        // 64 bytes route to the tiny class.
        assert_eq!(unsafe { ptr.region() }.size(), rmapool::pool::TINY_CHUNK_SIZE);
        assert_eq!(pool.tiny().in_use(), 1);

        unsafe { alloc.deallocate(ptr, 8) };
        assert_eq!(pool.tiny().in_use(), 0);
    }

    #[test]
    fn pointer_carries_live_registration_keys() {
        let pool = pool();
        let alloc: RegionAllocator<'_, u8, MockProvider> = RegionAllocator::new(&pool);
        let ptr = alloc.allocate(4096).unwrap();
        let region = unsafe { ptr.region() };
        assert!(region.local_key().is_some());
        assert!(pool.domain().is_registered(region.remote_key().unwrap()));
        unsafe { alloc.deallocate(ptr, 4096) };
    }

    #[test]
    fn rebinding_shares_the_pool() {
        let pool = pool();
        let alloc: RegionAllocator<'_, u64, MockProvider> = RegionAllocator::new(&pool);
        let bytes = alloc.rebind::<u8>();
        assert_eq!(bytes, RegionAllocator::new(&pool));

        let ptr = bytes.allocate(16).unwrap();
        unsafe { bytes.deallocate(ptr, 16) };
    }

    #[test]
    fn oversize_allocations_arrive_as_temporaries() {
        let pool = pool();
        let alloc: RegionAllocator<'_, u8, MockProvider> = RegionAllocator::new(&pool);
        let ptr = alloc.allocate(rmapool::pool::LARGE_CHUNK_SIZE + 1).unwrap();
        assert!(unsafe { ptr.region() }.is_temp());
        assert_eq!(pool.temp_regions(), 1);
        unsafe { alloc.deallocate(ptr, rmapool::pool::LARGE_CHUNK_SIZE + 1) };
        assert_eq!(pool.temp_regions(), 0);
    }
}
