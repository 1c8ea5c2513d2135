//! Mock provider for tests.
//!
//! Simulates registration by handing out unique key tokens and keeps
//! per-domain books: lifetime register/unregister counts and the set of
//! currently active ranges, so tests can assert pairing, uniqueness and
//! that a sub-region's parent registration is still alive.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;

use super::{AccessFlags, Error, LocalKey, RegionProvider, RemoteKey};

pub struct MockProvider;

#[derive(Default)]
struct MockState {
    registered: AtomicU64,
    unregistered: AtomicU64,
    next_key: AtomicU64,
    fail_registrations: AtomicBool,
    active: Mutex<FnvHashMap<u64, (usize, usize)>>,
}

#[derive(Default, Clone)]
pub struct MockDomain {
    state: Arc<MockState>,
}

impl MockDomain {
    pub fn new() -> Self {
        MockDomain::default()
    }

    /// Lifetime number of successful `register` calls.
    pub fn registrations(&self) -> u64 {
        self.state.registered.load(Ordering::Acquire)
    }

    /// Lifetime number of `unregister` calls.
    pub fn deregistrations(&self) -> u64 {
        self.state.unregistered.load(Ordering::Acquire)
    }

    /// Number of registrations not yet unregistered.
    pub fn active_regions(&self) -> usize {
        self.state.active.lock().unwrap().len()
    }

    pub fn is_registered(&self, key: RemoteKey) -> bool {
        self.state.active.lock().unwrap().contains_key(&key.0)
    }

    /// How many active registrations cover `addr`.
    pub fn registrations_covering(&self, addr: usize) -> usize {
        self.state
            .active
            .lock()
            .unwrap()
            .values()
            .filter(|&&(start, len)| addr >= start && addr < start + len)
            .count()
    }

    /// Make subsequent `register` calls fail until cleared.
    pub fn set_fail_registrations(&self, fail: bool) {
        self.state.fail_registrations.store(fail, Ordering::Release);
    }
}

pub struct MockHandle {
    state: Arc<MockState>,
    key: u64,
    addr: usize,
}

impl RegionProvider for MockProvider {
    type Domain = MockDomain;
    type Handle = MockHandle;

    fn register(
        domain: &MockDomain,
        addr: *mut u8,
        len: usize,
        _access: AccessFlags,
        _offset: u64,
        _requested_key: u64,
        _flags: u64,
    ) -> Result<MockHandle, Error> {
        let state = &domain.state;
        if state.fail_registrations.load(Ordering::Acquire) {
            return Err(Error::Register(io::Error::new(
                io::ErrorKind::Other,
                "injected registration failure",
            )));
        }
        // Always a fresh token; the requested key is deliberately not
        // honored so key uniqueness holds across re-registrations of
        // the same address.
        let key = state.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        state
            .active
            .lock()
            .unwrap()
            .insert(key, (addr as usize, len));
        state.registered.fetch_add(1, Ordering::AcqRel);
        Ok(MockHandle {
            state: Arc::clone(state),
            key,
            addr: addr as usize,
        })
    }

    fn unregister(handle: MockHandle) -> Result<(), Error> {
        handle.state.active.lock().unwrap().remove(&handle.key);
        handle.state.unregistered.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn local_key(handle: &MockHandle) -> LocalKey {
        LocalKey(handle.addr as u64)
    }

    fn remote_key(handle: &MockHandle) -> RemoteKey {
        RemoteKey(handle.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_unregister_pairing() {
        let domain = MockDomain::new();
        let mut buf = [0u8; 32];
        let h = MockProvider::register(
            &domain,
            buf.as_mut_ptr(),
            buf.len(),
            AccessFlags::all(),
            0,
            0,
            0,
        )
        .unwrap();
        assert_eq!(domain.registrations(), 1);
        assert_eq!(domain.active_regions(), 1);
        let key = MockProvider::remote_key(&h);
        assert!(domain.is_registered(key));
        assert_eq!(domain.registrations_covering(buf.as_ptr() as usize), 1);

        MockProvider::unregister(h).unwrap();
        assert_eq!(domain.deregistrations(), 1);
        assert_eq!(domain.active_regions(), 0);
        assert!(!domain.is_registered(key));
    }

    #[test]
    fn injected_failure_surfaces() {
        let domain = MockDomain::new();
        domain.set_fail_registrations(true);
        let mut buf = [0u8; 8];
        let err = MockProvider::register(
            &domain,
            buf.as_mut_ptr(),
            buf.len(),
            AccessFlags::all(),
            0,
            0,
            0,
        );
        assert!(matches!(err, Err(Error::Register(_))));
        assert_eq!(domain.registrations(), 0);
    }

    #[test]
    fn keys_are_unique_tokens() {
        let domain = MockDomain::new();
        let mut buf = [0u8; 8];
        let h1 = MockProvider::register(
            &domain,
            buf.as_mut_ptr(),
            buf.len(),
            AccessFlags::all(),
            0,
            7,
            0,
        )
        .unwrap();
        let h2 = MockProvider::register(
            &domain,
            buf.as_mut_ptr(),
            buf.len(),
            AccessFlags::all(),
            0,
            7,
            0,
        )
        .unwrap();
        assert_ne!(MockProvider::remote_key(&h1), MockProvider::remote_key(&h2));
        MockProvider::unregister(h1).unwrap();
        MockProvider::unregister(h2).unwrap();
    }
}
