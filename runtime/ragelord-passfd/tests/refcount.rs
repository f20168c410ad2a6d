use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ragelord_obj_model::{Decrement, ResourceId, ResourcePtr};
use ragelord_passfd::{
    Family, HandleEnvelope, HandleKind, HostError, HostRuntime, ManagedHost, Rehydrator,
    ResourceHandle, ResourceKind,
};

fn fd_is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Delegates to a managed host and counts destructor runs.
struct CountingHost {
    inner: Arc<ManagedHost>,
    releases: AtomicUsize,
}

// SAFETY: every call is forwarded to a `ManagedHost`.
unsafe impl HostRuntime for CountingHost {
    fn allocate_resource(&self, kind: ResourceKind) -> Result<ResourcePtr, HostError> {
        self.inner.allocate_resource(kind)
    }

    unsafe fn resource_table_register(&self, ptr: ResourcePtr) -> Result<ResourceId, HostError> {
        unsafe { self.inner.resource_table_register(ptr) }
    }

    fn resource_table_fetch(&self, id: ResourceId) -> Option<ResourcePtr> {
        self.inner.resource_table_fetch(id)
    }

    fn resource_table_acquire(&self, id: ResourceId) -> Option<ResourcePtr> {
        self.inner.resource_table_acquire(id)
    }

    unsafe fn refcount_inc(&self, ptr: ResourcePtr) -> Result<u32, HostError> {
        unsafe { self.inner.refcount_inc(ptr) }
    }

    unsafe fn refcount_dec(&self, ptr: ResourcePtr) -> Result<Decrement, HostError> {
        let outcome = unsafe { self.inner.refcount_dec(ptr) }?;
        if outcome == Decrement::Released {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    unsafe fn persistent_register(&self, key: &str, ptr: ResourcePtr) -> Result<(), HostError> {
        unsafe { self.inner.persistent_register(key, ptr) }
    }

    fn persistent_fetch(&self, key: &str) -> Option<ResourcePtr> {
        self.inner.persistent_fetch(key)
    }

    fn persistent_acquire(&self, key: &str) -> Option<ResourcePtr> {
        self.inner.persistent_acquire(key)
    }

    fn persistent_release(&self, key: &str) -> Result<(), HostError> {
        self.inner.persistent_release(key)
    }
}

fn counting_host() -> Arc<CountingHost> {
    Arc::new(CountingHost {
        inner: ManagedHost::new().unwrap(),
        releases: AtomicUsize::new(0),
    })
}

fn socket_handle(rehydrator: &Rehydrator) -> (ResourceHandle, RawFd) {
    let (a, _b) = UnixStream::pair().unwrap();
    let raw = a.as_raw_fd();
    let env = HandleEnvelope::new(HandleKind::Socket, Family::Unix, true, 0);
    (rehydrator.rehydrate(OwnedFd::from(a), env).unwrap(), raw)
}

#[test]
fn clone_then_drop_restores_count_without_destroying() {
    let host = counting_host();
    let rehydrator = Rehydrator::new(host.clone());
    let (handle, raw) = socket_handle(&rehydrator);

    let clone = handle.clone();
    assert_eq!(handle.refcount(), 2);
    drop(clone);
    assert_eq!(handle.refcount(), 1);
    assert_eq!(host.releases.load(Ordering::SeqCst), 0);
    assert!(fd_is_open(raw));

    drop(handle);
    assert_eq!(host.releases.load(Ordering::SeqCst), 1);
    assert!(!fd_is_open(raw));
}

#[test]
fn concurrent_drops_destroy_exactly_once() {
    const THREADS: usize = 16;
    const CLONES_PER_THREAD: usize = 64;

    for _ in 0..20 {
        let host = counting_host();
        let rehydrator = Rehydrator::new(host.clone());
        let (handle, raw) = socket_handle(&rehydrator);

        let batches: Vec<Vec<ResourceHandle>> = (0..THREADS)
            .map(|_| (0..CLONES_PER_THREAD).map(|_| handle.clone()).collect())
            .collect();
        assert_eq!(handle.refcount() as usize, 1 + THREADS * CLONES_PER_THREAD);
        drop(handle);

        std::thread::scope(|scope| {
            for batch in batches {
                scope.spawn(move || {
                    for clone in batch {
                        let again = clone.clone();
                        drop(clone);
                        drop(again);
                    }
                });
            }
        });

        assert_eq!(host.releases.load(Ordering::SeqCst), 1);
        assert!(!fd_is_open(raw));
        assert_eq!(host.inner.live_resources(), 0);
        assert!(host.inner.table().is_empty());
    }
}

#[test]
fn concurrent_fetch_races_with_last_release() {
    let host = counting_host();
    let dyn_host: Arc<dyn HostRuntime> = host.clone();
    let rehydrator = Rehydrator::new(Arc::clone(&dyn_host));

    for _ in 0..200 {
        let (handle, _) = socket_handle(&rehydrator);
        let id = handle.id();
        std::thread::scope(|scope| {
            let fetcher = scope.spawn(|| ResourceHandle::fetch(&dyn_host, id));
            drop(handle);
            drop(fetcher.join().unwrap());
        });
        assert!(ResourceHandle::fetch(&dyn_host, id).is_none());
    }
    assert_eq!(host.releases.load(Ordering::SeqCst), 200);
    assert_eq!(host.inner.live_resources(), 0);
}
