//! Backing-block allocation.
//!
//! One registration call covers a whole block; slab stacks slice the
//! block into chunks afterwards. Blocks are handed out behind `Arc` so
//! the registration stays alive for as long as anything references the
//! block's range. Callers do not use this directly; the pool does.

use std::sync::Arc;

use log::trace;

use crate::region::{Error, MemoryRegion};
use crate::provider::RegionProvider;

/// Stateless adapter turning "bytes wanted" into one registered block.
pub struct BlockAllocator;

impl BlockAllocator {
    /// Allocate and register one backing block of `bytes` bytes.
    pub fn allocate<P: RegionProvider>(
        domain: &P::Domain,
        bytes: usize,
    ) -> Result<Arc<MemoryRegion<P>>, Error> {
        let region = MemoryRegion::allocate(domain, bytes)?;
        trace!("allocated {} byte backing block at {:p}", bytes, region.base_address());
        Ok(Arc::new(region))
    }

    /// Drop an owning reference. The last reference deregisters and
    /// frees the block.
    pub fn free<P: RegionProvider>(region: Arc<MemoryRegion<P>>) {
        trace!("freeing backing block at {:p}", region.base_address());
        drop(region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockDomain, MockProvider};

    #[test]
    fn block_is_a_plain_owning_region() {
        let domain = MockDomain::new();
        let block = BlockAllocator::allocate::<MockProvider>(&domain, 64 * 1024).unwrap();
        assert!(block.flags().is_empty());
        assert_eq!(block.size(), 64 * 1024);
        assert_eq!(domain.registrations(), 1);
        BlockAllocator::free(block);
        assert_eq!(domain.active_regions(), 0);
    }
}
