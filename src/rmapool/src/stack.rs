//! One size class: a stack of fixed-size sub-regions.
//!
//! A [`SlabStack`] asks the block allocator for one large registered
//! block, slices it into `chunk_size` pieces and recycles the pieces
//! through a lock-free LIFO. Growth happens on demand: the first pop
//! allocates `initial_chunks`, and a pop that finds the stack empty
//! grows it by the number of chunks currently in use before asking the
//! caller to retry.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use log::{debug, error, trace};

use crate::block::BlockAllocator;
use crate::counter::PerfCounter;
use crate::freelist::FreeStack;
use crate::provider::RegionProvider;
use crate::region::{self, MemoryRegion};

#[cfg(feature = "poison")]
const POISON_WORD: u64 = 0xdead_beef;

/// Book-keeping mutated only while growing or tearing down.
struct Inner<P: RegionProvider> {
    /// Backing blocks by base address; the sole owning references.
    blocks: FnvHashMap<usize, Arc<MemoryRegion<P>>>,
    /// Every sub-region ever carved, in creation order. Boxes pin the
    /// addresses the free stack and callers point at. Never shrinks
    /// before teardown.
    regions: Vec<Box<MemoryRegion<P>>>,
}

pub struct SlabStack<P: RegionProvider> {
    name: &'static str,
    chunk_size: usize,
    initial_chunks: u32,
    domain: Arc<P::Domain>,
    inner: Mutex<Inner<P>>,
    free: FreeStack<NonNull<MemoryRegion<P>>>,
    /// Successful pops over the stack's lifetime.
    accesses: PerfCounter<u64>,
    /// Outstanding sub-regions. Not a `PerfCounter`: growth sizing and
    /// teardown diagnostics read it, so it cannot be compiled away.
    in_use: AtomicU64,
    /// Total sub-regions ever carved. Non-decreasing.
    chunks_avail: AtomicU64,
    #[cfg(feature = "debug-set")]
    outstanding: Mutex<fnv::FnvHashSet<usize>>,
}

// The free stack hands NonNull values between threads; the regions they
// point at are owned by `inner` and live until teardown.
unsafe impl<P: RegionProvider> Send for SlabStack<P> {}
unsafe impl<P: RegionProvider> Sync for SlabStack<P> {}

impl<P: RegionProvider> SlabStack<P> {
    pub fn new(
        name: &'static str,
        domain: Arc<P::Domain>,
        chunk_size: usize,
        initial_chunks: u32,
    ) -> Self {
        assert!(
            chunk_size >= 8 && chunk_size % 8 == 0,
            "chunk size must be a multiple of the machine word"
        );
        SlabStack {
            name,
            chunk_size,
            initial_chunks,
            domain,
            inner: Mutex::new(Inner {
                blocks: FnvHashMap::default(),
                regions: Vec::new(),
            }),
            free: FreeStack::new(),
            accesses: PerfCounter::new(),
            in_use: AtomicU64::new(0),
            chunks_avail: AtomicU64::new(0),
            #[cfg(feature = "debug-set")]
            outstanding: Mutex::new(fnv::FnvHashSet::default()),
        }
    }

    /// Grab a free sub-region.
    ///
    /// Returns `None` when the free stack is empty; in that case one
    /// growth attempt has already been made and the caller should retry
    /// or fall back to a temporary region.
    pub fn pop(&self) -> Option<NonNull<MemoryRegion<P>>> {
        match self.free.pop() {
            Some(region) => {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                self.accesses.inc();
                #[cfg(feature = "debug-set")]
                {
                    let inserted = self
                        .outstanding
                        .lock()
                        .unwrap()
                        .insert(region.as_ptr() as usize);
                    assert!(
                        inserted,
                        "{}: region {:p} handed out twice",
                        self.name,
                        region.as_ptr()
                    );
                }
                trace!("{}: pop, {}", self.name, self);
                Some(region)
            }
            None => {
                let grow_by = match self.chunks_avail.load(Ordering::Acquire) {
                    0 => self.initial_chunks,
                    _ => self.in_use.load(Ordering::Acquire) as u32,
                };
                debug!(
                    "{}: free stack empty, growing by {} chunks",
                    self.name, grow_by
                );
                if let Err(e) = self.grow(grow_by) {
                    error!("{}: grow failed: {}", self.name, e);
                }
                None
            }
        }
    }

    /// Return a sub-region to the free stack.
    ///
    /// Only regions previously handed out by `pop` may be pushed; with
    /// the `debug-set` feature an unknown region aborts.
    pub fn push(&self, region: NonNull<MemoryRegion<P>>) {
        #[cfg(feature = "debug-set")]
        {
            let known = self
                .outstanding
                .lock()
                .unwrap()
                .remove(&(region.as_ptr() as usize));
            assert!(
                known,
                "{}: region {:p} released but never handed out",
                self.name,
                region.as_ptr()
            );
        }
        #[cfg(feature = "poison")]
        unsafe {
            let words = self.chunk_size / 8;
            let ptr = region.as_ref().address() as *mut u64;
            for i in 0..words {
                ptr.add(i).write(POISON_WORD);
            }
        }
        trace!("{}: push {:p}, {}", self.name, region.as_ptr(), self);
        self.free.push(region);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Carve one more backing block into `num_chunks` sub-regions and
    /// put them on the free stack.
    ///
    /// Serialized by a mutex; a concurrent pop that misses while a grow
    /// is in flight merely triggers another grow, which over-provisions
    /// but stays correct.
    pub fn grow(&self, num_chunks: u32) -> Result<(), region::Error> {
        if num_chunks == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let block =
            BlockAllocator::allocate::<P>(&self.domain, self.chunk_size * num_chunks as usize)?;
        let handle = block.registration();
        let base = block.base_address();
        inner.blocks.insert(base as usize, block);

        inner.regions.reserve(num_chunks as usize);
        for i in 0..num_chunks as usize {
            let address = unsafe { base.add(i * self.chunk_size) };
            let mut region = Box::new(MemoryRegion::sub_region(
                Arc::clone(&handle),
                address,
                base,
                self.chunk_size,
            ));
            let ptr = NonNull::from(region.as_mut());
            inner.regions.push(region);
            self.free.push(ptr);
        }
        self.chunks_avail
            .fetch_add(num_chunks as u64, Ordering::AcqRel);
        debug!(
            "{}: grew by {} chunks of {:#x} bytes, {}",
            self.name, num_chunks, self.chunk_size, self
        );
        Ok(())
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Outstanding sub-regions.
    #[inline]
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    /// Total sub-regions ever carved in this stack.
    #[inline]
    pub fn chunks_avail(&self) -> u64 {
        self.chunks_avail.load(Ordering::Acquire)
    }

    /// Lifetime pops; the default value with counters disabled.
    #[inline]
    pub fn accesses(&self) -> u64 {
        self.accesses.get()
    }

    /// Advisory: whether a pop would currently succeed.
    #[inline]
    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }
}

impl<P: RegionProvider> Drop for SlabStack<P> {
    fn drop(&mut self) {
        let in_use = self.in_use.load(Ordering::Acquire);
        if in_use != 0 {
            error!(
                "{}: tearing down with {} sub-regions still in use",
                self.name, in_use
            );
            #[cfg(feature = "debug-set")]
            for addr in self.outstanding.lock().unwrap().iter() {
                error!("{}: still outstanding: {:#x}", self.name, addr);
            }
        }
        // The free stack holds plain pointers; drain it first, then drop
        // the sub-regions (cheap, they are partial) and finally the
        // blocks, whose owning regions deregister for real.
        while self.free.pop().is_some() {}
        let mut inner = self.inner.lock().unwrap();
        inner.regions.clear();
        inner.blocks.clear();
    }
}

impl<P: RegionProvider> fmt::Display for SlabStack<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_use = self.in_use.load(Ordering::Relaxed);
        let avail = self.chunks_avail.load(Ordering::Relaxed);
        write!(
            f,
            "| {} chunk_size {:#x} free {} used {} accesses {}",
            self.name,
            self.chunk_size,
            avail.saturating_sub(in_use),
            in_use,
            self.accesses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockDomain, MockProvider};

    fn stack(chunk_size: usize, initial: u32) -> (MockDomain, SlabStack<MockProvider>) {
        let domain = MockDomain::new();
        let stack = SlabStack::new("test", Arc::new(domain.clone()), chunk_size, initial);
        (domain, stack)
    }

    #[test]
    fn first_pop_grows_by_initial_chunks() {
        let (domain, stack) = stack(1024, 4);
        assert_eq!(stack.chunks_avail(), 0);
        assert_eq!(domain.registrations(), 0);

        // Miss, grow, retry.
        assert!(stack.pop().is_none());
        assert_eq!(stack.chunks_avail(), 4);
        assert_eq!(domain.registrations(), 1);

        let region = stack.pop().expect("grown stack must serve");
        assert_eq!(stack.in_use(), 1);
        let r = unsafe { region.as_ref() };
        assert!(r.is_partial());
        assert_eq!(r.size(), 1024);
        stack.push(region);
        assert_eq!(stack.in_use(), 0);
    }

    #[test]
    fn exhaustion_grows_by_in_use() {
        let (domain, stack) = stack(1024, 4);
        assert!(stack.pop().is_none());

        let regions: Vec<_> = (0..4).map(|_| stack.pop().unwrap()).collect();
        assert_eq!(stack.in_use(), 4);

        // All four out; the next miss doubles the stack.
        assert!(stack.pop().is_none());
        assert_eq!(stack.chunks_avail(), 8);
        assert_eq!(domain.registrations(), 2);

        let fifth = stack.pop().unwrap();
        assert_eq!(stack.in_use(), 5);

        stack.push(fifth);
        for region in regions {
            stack.push(region);
        }
        assert_eq!(stack.in_use(), 0);
    }

    #[test]
    fn lifo_reuse() {
        let (_domain, stack) = stack(512, 2);
        assert!(stack.pop().is_none());
        let a = stack.pop().unwrap();
        let addr = a.as_ptr() as usize;
        stack.push(a);
        let b = stack.pop().unwrap();
        assert_eq!(b.as_ptr() as usize, addr);
        stack.push(b);
    }

    #[test]
    fn sub_regions_tile_the_block() {
        let (domain, stack) = stack(1024, 4);
        assert!(stack.pop().is_none());
        let regions: Vec<_> = (0..4).map(|_| stack.pop().unwrap()).collect();

        let mut addrs: Vec<usize> = regions
            .iter()
            .map(|r| unsafe { r.as_ref() }.address() as usize)
            .collect();
        addrs.sort_unstable();
        let base = unsafe { regions[0].as_ref() }.base_address() as usize;
        assert_eq!(addrs, vec![base, base + 1024, base + 2048, base + 3072]);
        for r in &regions {
            let addr = unsafe { r.as_ref() }.address() as usize;
            assert_eq!(domain.registrations_covering(addr), 1);
        }
        for r in regions {
            stack.push(r);
        }
    }

    #[test]
    fn teardown_releases_every_block() {
        let (domain, stack) = stack(1024, 4);
        assert!(stack.pop().is_none());
        let region = stack.pop().unwrap();
        stack.push(region);
        drop(stack);
        assert_eq!(domain.active_regions(), 0);
        assert_eq!(domain.deregistrations(), domain.registrations());
    }

    #[cfg(feature = "poison")]
    #[test]
    fn push_poisons_the_chunk() {
        let (_domain, stack) = stack(1024, 2);
        assert!(stack.pop().is_none());
        let region = stack.pop().unwrap();
        let addr = unsafe { region.as_ref() }.address();
        unsafe { addr.write_bytes(0x11, 1024) };
        stack.push(region);

        let words = unsafe { std::slice::from_raw_parts(addr as *const u64, 1024 / 8) };
        assert!(words.iter().all(|&w| w == POISON_WORD));
    }

    #[cfg(feature = "debug-set")]
    #[test]
    #[should_panic(expected = "released but never handed out")]
    fn unknown_release_aborts() {
        let (domain, stack) = stack(1024, 2);
        let stray = Box::leak(Box::new(
            crate::region::MemoryRegion::<MockProvider>::allocate(&domain, 1024).unwrap(),
        ));
        stack.push(NonNull::from(stray));
    }
}
