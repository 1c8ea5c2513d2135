//! Descriptor for one pinned memory range.
//!
//! A [`MemoryRegion`] either owns a registration (a backing block, a
//! one-off temporary, or caller-provided user memory) or is a `PARTIAL`
//! sub-slice of a backing block, in which case it shares the parent's
//! registration handle and releases nothing on drop. The lifetime flags
//! drive the destruction policy; see [`RegionFlags`].

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use log::{error, trace};
use thiserror::Error;

use crate::provider::{self, LocalKey, RegionProvider, RemoteKey};

/// Alignment of every buffer this crate hands to a provider. Pinning
/// operates on pages, so backing blocks start on a page boundary.
pub const REGION_ALIGN: usize = 4096;

#[derive(Error, Debug)]
pub enum Error {
    #[error("provider: {0}")]
    Provider(#[from] provider::Error),
    #[error("backing allocation of {0} bytes failed")]
    OutOfMemory(usize),
}

bitflags! {
    /// Lifetime management flags.
    #[derive(Default)]
    pub struct RegionFlags: u32 {
        /// Caller owns the memory: deregister on drop, never free.
        const USER = 0b001;
        /// One-off registration outside the pooled classes: deregister
        /// and free on drop.
        const TEMP = 0b010;
        /// Sub-slice of a backing block: the parent owns the
        /// registration, drop releases nothing.
        const PARTIAL = 0b100;
    }
}

pub struct MemoryRegion<P: RegionProvider> {
    /// Start of the usable range; offset into `base_address` for
    /// partial regions.
    address: *mut u8,
    /// Start of the enclosing backing block.
    base_address: *mut u8,
    /// Usable length from `address`.
    size: usize,
    /// Length of the payload currently occupying the region, a hint
    /// passed to the transport. 0 when idle.
    used_space: usize,
    flags: RegionFlags,
    /// Registration handle. Owning regions hold the only share at
    /// rest; partial regions hold a non-owning share of the parent's.
    handle: Option<Arc<P::Handle>>,
}

// Raw addresses of registered buffers; the handle types are Send + Sync
// by the provider contract.
unsafe impl<P: RegionProvider> Send for MemoryRegion<P> {}
unsafe impl<P: RegionProvider> Sync for MemoryRegion<P> {}

impl<P: RegionProvider> MemoryRegion<P> {
    /// Allocate a fresh page-aligned buffer of `len` bytes and register
    /// it. The buffer is freed again if registration fails.
    pub fn allocate(domain: &P::Domain, len: usize) -> Result<Self, Error> {
        let layout = buffer_layout(len)?;
        let buffer = unsafe { alloc(layout) };
        if buffer.is_null() {
            return Err(Error::OutOfMemory(len));
        }
        let handle = match P::register(
            domain,
            buffer,
            len,
            P::default_flags(),
            0,
            buffer as u64,
            0,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                unsafe { dealloc(buffer, layout) };
                return Err(e.into());
            }
        };
        trace!("registered {} byte region at {:p}", len, buffer);
        Ok(MemoryRegion {
            address: buffer,
            base_address: buffer,
            size: len,
            used_space: 0,
            flags: RegionFlags::empty(),
            handle: Some(Arc::new(handle)),
        })
    }

    /// Register caller-owned memory. The region deregisters on drop but
    /// never frees the buffer.
    ///
    /// # Safety
    ///
    /// `[ptr, ptr + len)` must stay valid for the lifetime of the
    /// region.
    pub unsafe fn register_user(
        domain: &P::Domain,
        ptr: *mut u8,
        len: usize,
    ) -> Result<Self, Error> {
        let handle = P::register(domain, ptr, len, P::default_flags(), 0, ptr as u64, 0)?;
        trace!("registered {} byte user region at {:p}", len, ptr);
        Ok(MemoryRegion {
            address: ptr,
            base_address: ptr,
            size: len,
            used_space: len,
            flags: RegionFlags::USER,
            handle: Some(Arc::new(handle)),
        })
    }

    /// A partial region over `[address, address + size)` inside the
    /// block starting at `base_address`, sharing the block's
    /// registration.
    pub(crate) fn sub_region(
        handle: Arc<P::Handle>,
        address: *mut u8,
        base_address: *mut u8,
        size: usize,
    ) -> Self {
        MemoryRegion {
            address,
            base_address,
            size,
            used_space: 0,
            flags: RegionFlags::PARTIAL,
            handle: Some(handle),
        }
    }

    #[inline]
    pub fn address(&self) -> *mut u8 {
        self.address
    }

    #[inline]
    pub fn base_address(&self) -> *mut u8 {
        self.base_address
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn message_length(&self) -> usize {
        self.used_space
    }

    #[inline]
    pub fn set_message_length(&mut self, len: usize) {
        debug_assert!(len <= self.size);
        self.used_space = len;
    }

    #[inline]
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.flags.contains(RegionFlags::USER)
    }

    #[inline]
    pub fn is_temp(&self) -> bool {
        self.flags.contains(RegionFlags::TEMP)
    }

    #[inline]
    pub fn is_partial(&self) -> bool {
        self.flags.contains(RegionFlags::PARTIAL)
    }

    pub(crate) fn set_temp(&mut self) {
        debug_assert!(!self.is_partial());
        self.flags |= RegionFlags::TEMP;
    }

    /// Descriptor for local-side operations, `None` once released.
    pub fn local_key(&self) -> Option<LocalKey> {
        self.handle.as_deref().map(P::local_key)
    }

    /// Key shared with remote peers, `None` once released.
    pub fn remote_key(&self) -> Option<RemoteKey> {
        self.handle.as_deref().map(P::remote_key)
    }

    /// Share of the registration handle, for carving sub-regions.
    pub(crate) fn registration(&self) -> Arc<P::Handle> {
        Arc::clone(
            self.handle
                .as_ref()
                .expect("region carries no registration"),
        )
    }

    /// Deregister and, unless the memory is caller-owned, free the
    /// backing buffer. The handle is dropped locally even on failure so
    /// it is never closed twice.
    fn release(&mut self) -> Result<(), Error> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        match Arc::try_unwrap(handle) {
            Ok(handle) => {
                P::unregister(handle)?;
                trace!(
                    "deregistered {} byte region at {:p}",
                    self.size,
                    self.base_address
                );
                if !self.is_user() {
                    unsafe { self.free_buffer() };
                }
                Ok(())
            }
            Err(_) => {
                // Sub-regions derived from this block are still alive;
                // the caller broke the release contract. Leak the
                // registration and the buffer rather than yank pinned
                // memory from under them.
                error!(
                    "block at {:p} still has outstanding sub-regions, leaking registration",
                    self.base_address
                );
                Ok(())
            }
        }
    }

    unsafe fn free_buffer(&self) {
        // `allocate` never hands out a null buffer, so the layout
        // computation cannot fail here.
        let layout = buffer_layout(self.size).expect("layout was validated at allocation");
        dealloc(self.base_address, layout);
    }
}

fn buffer_layout(len: usize) -> Result<Layout, Error> {
    Layout::from_size_align(len.max(1), REGION_ALIGN).map_err(|_| Error::OutOfMemory(len))
}

impl<P: RegionProvider> Drop for MemoryRegion<P> {
    fn drop(&mut self) {
        if self.is_partial() {
            return;
        }
        if let Err(e) = self.release() {
            error!("releasing region at {:p}: {}", self.base_address, e);
        }
    }
}

impl<P: RegionProvider> fmt::Debug for MemoryRegion<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("address", &self.address)
            .field("base_address", &self.base_address)
            .field("size", &self.size)
            .field("used_space", &self.used_space)
            .field("flags", &self.flags)
            .field("local_key", &self.local_key())
            .field("remote_key", &self.remote_key())
            .finish()
    }
}
