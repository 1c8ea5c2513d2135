//! Reference provider over OS memory pinning.
//!
//! Registration locks the range with `mlock(2)` so it stays resident,
//! which is the part of adapter registration the OS can give us without
//! a fabric library. Remote keys come from the caller's requested key
//! when present, otherwise from a per-domain sequence; the local key is
//! the range's start address.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{AccessFlags, Error, LocalKey, RegionProvider, RemoteKey};

pub struct SystemProvider;

pub struct SystemDomain {
    next_key: AtomicU64,
}

impl SystemDomain {
    pub fn new() -> Self {
        SystemDomain {
            // 0 is reserved to mean "pick a key for me".
            next_key: AtomicU64::new(1),
        }
    }
}

impl Default for SystemDomain {
    fn default() -> Self {
        SystemDomain::new()
    }
}

pub struct SystemHandle {
    addr: usize,
    len: usize,
    key: u64,
}

impl RegionProvider for SystemProvider {
    type Domain = SystemDomain;
    type Handle = SystemHandle;

    fn register(
        domain: &SystemDomain,
        addr: *mut u8,
        len: usize,
        _access: AccessFlags,
        _offset: u64,
        requested_key: u64,
        _flags: u64,
    ) -> Result<SystemHandle, Error> {
        let rc = unsafe { libc::mlock(addr as *const libc::c_void, len) };
        if rc != 0 {
            return Err(Error::Register(io::Error::last_os_error()));
        }
        let key = if requested_key != 0 {
            requested_key
        } else {
            domain.next_key.fetch_add(1, Ordering::Relaxed)
        };
        Ok(SystemHandle {
            addr: addr as usize,
            len,
            key,
        })
    }

    fn unregister(handle: SystemHandle) -> Result<(), Error> {
        let rc = unsafe { libc::munlock(handle.addr as *const libc::c_void, handle.len) };
        if rc != 0 {
            return Err(Error::Deregister(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn local_key(handle: &SystemHandle) -> LocalKey {
        LocalKey(handle.addr as u64)
    }

    fn remote_key(handle: &SystemHandle) -> RemoteKey {
        RemoteKey(handle.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_and_unpin_one_page() {
        let domain = SystemDomain::new();
        let mut page = vec![0u8; 4096];
        let handle = match SystemProvider::register(
            &domain,
            page.as_mut_ptr(),
            page.len(),
            SystemProvider::default_flags(),
            0,
            0,
            0,
        ) {
            Ok(h) => h,
            // Locked-memory rlimits in constrained environments are not
            // a bug in the provider.
            Err(Error::Register(e)) => {
                eprintln!("skipping mlock smoke test: {}", e);
                return;
            }
            Err(e) => panic!("unexpected error: {}", e),
        };
        assert_eq!(
            SystemProvider::local_key(&handle),
            LocalKey(page.as_ptr() as u64)
        );
        assert_eq!(SystemProvider::remote_key(&handle), RemoteKey(1));
        SystemProvider::unregister(handle).unwrap();
    }

    #[test]
    fn requested_key_is_honored() {
        let domain = SystemDomain::new();
        let mut buf = vec![0u8; 64];
        match SystemProvider::register(
            &domain,
            buf.as_mut_ptr(),
            buf.len(),
            AccessFlags::all(),
            0,
            0xabcd,
            0,
        ) {
            Ok(h) => {
                assert_eq!(SystemProvider::remote_key(&h), RemoteKey(0xabcd));
                SystemProvider::unregister(h).unwrap();
            }
            Err(Error::Register(e)) => eprintln!("skipping mlock smoke test: {}", e),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
