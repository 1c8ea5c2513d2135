//! Transport abstraction for memory registration.
//!
//! Everything in this crate is parameterized over a [`RegionProvider`]:
//! the set of operations a transport exposes for pinning an address
//! range inside a protection domain and for retrieving the keys the
//! adapter needs to operate on it. The trait mirrors the shape of the
//! fabric registration API (`fi_mr_reg`/`fi_close`/`fi_mr_desc`/
//! `fi_mr_key`), with the out-parameter-and-status convention turned
//! into a `Result`.

use std::io;

use bitflags::bitflags;
use thiserror::Error;

pub mod mock;
pub mod system;

#[derive(Error, Debug)]
pub enum Error {
    #[error("memory registration failed: {0}")]
    Register(io::Error),
    #[error("memory deregistration failed: {0}")]
    Deregister(io::Error),
}

bitflags! {
    /// Access capabilities requested when registering a range.
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const READ = 0b000001;
        const WRITE = 0b000010;
        const RECV = 0b000100;
        const SEND = 0b001000;
        const REMOTE_READ = 0b010000;
        const REMOTE_WRITE = 0b100000;
    }
}

/// Key shared with remote peers to authorize RMA access to a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteKey(pub u64);

/// Opaque descriptor the adapter validates on local-side operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalKey(pub u64);

/// Registration operations of one transport.
///
/// Implementations are stateless dispatchers; all state lives in the
/// associated `Domain` (the protection domain) and `Handle` (one
/// registration) types.
pub trait RegionProvider: 'static {
    /// Protection domain registrations are confined to.
    type Domain: Send + Sync + 'static;
    /// Provider-side handle for one registered range.
    type Handle: Send + Sync + 'static;

    /// Pin `[addr, addr + len)` and make it known to the adapter.
    ///
    /// `requested_key` of 0 asks the provider to pick a key.
    fn register(
        domain: &Self::Domain,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
        offset: u64,
        requested_key: u64,
        flags: u64,
    ) -> Result<Self::Handle, Error>;

    /// Release a registration. The handle is consumed either way.
    fn unregister(handle: Self::Handle) -> Result<(), Error>;

    fn local_key(handle: &Self::Handle) -> LocalKey;

    fn remote_key(handle: &Self::Handle) -> RemoteKey;

    /// Capabilities used when the caller does not ask for anything
    /// specific.
    fn default_flags() -> AccessFlags {
        AccessFlags::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_cover_all_capabilities() {
        let flags = AccessFlags::all();
        assert!(flags.contains(AccessFlags::READ | AccessFlags::WRITE));
        assert!(flags.contains(AccessFlags::RECV | AccessFlags::SEND));
        assert!(flags.contains(AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE));
    }
}
