//! The host runtime seam and the strong resource owner.
//!
//! [`HostRuntime`] is the narrow interface the rehydrator uses to build
//! resources in the receiving process's object model. [`ManagedHost`] is the
//! in-process implementation over a [`ResourceTable`]; embedders with their
//! own object model implement the trait themselves.

use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::raw::c_int;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use ragelord_obj_model::{
    Decrement, HostLayout, LayoutMismatch, RawResource, ResourceId, ResourcePtr, ResourceTable,
    SocketState, verify_host_layout,
};
use tracing::{trace, warn};

use crate::config::Persistence;
use crate::envelope::{Family, HandleKind};
use crate::error::HostError;

/// Resource kind ids registered by the host for descriptor-backed resources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResourceKind {
    Socket = 1,
    PersistentSocket = 2,
    Stream = 3,
    PersistentStream = 4,
}

impl ResourceKind {
    pub fn id(self) -> c_int {
        self as c_int
    }

    pub fn from_id(id: c_int) -> Option<Self> {
        match id {
            1 => Some(Self::Socket),
            2 => Some(Self::PersistentSocket),
            3 => Some(Self::Stream),
            4 => Some(Self::PersistentStream),
            _ => None,
        }
    }

    /// Generic handles are carried as streams.
    pub fn for_handle(kind: HandleKind, persistence: Persistence) -> Self {
        match (kind, persistence) {
            (HandleKind::Socket, Persistence::Volatile) => Self::Socket,
            (HandleKind::Socket, Persistence::Persistent) => Self::PersistentSocket,
            (HandleKind::Stream | HandleKind::Generic, Persistence::Volatile) => Self::Stream,
            (HandleKind::Stream | HandleKind::Generic, Persistence::Persistent) => {
                Self::PersistentStream
            }
        }
    }

    pub fn is_persistent(self) -> bool {
        matches!(self, Self::PersistentSocket | Self::PersistentStream)
    }
}

/// Operations the receiving runtime exposes for building resources.
///
/// `refcount_dec` runs the resource destructor when the count reaches zero;
/// the destructor closes the descriptor, frees the native state and removes
/// the table entry. Every method that takes a [`ResourcePtr`] reads through
/// it and is `unsafe`: the safe way to hold a resource is a
/// [`ResourceHandle`].
///
/// ```compile_fail,E0133
/// use std::os::fd::OwnedFd;
/// use std::os::unix::net::UnixStream;
/// use ragelord_passfd::{Family, HandleEnvelope, HandleKind, HostRuntime, ManagedHost, Rehydrator};
///
/// let host = ManagedHost::new().unwrap();
/// let rehydrator = Rehydrator::new(host.clone());
/// let (a, _b) = UnixStream::pair().unwrap();
/// let env = HandleEnvelope::new(HandleKind::Socket, Family::Unix, true, 0);
/// let handle = rehydrator.rehydrate(OwnedFd::from(a), env).unwrap();
/// host.refcount_dec(handle.ptr()).unwrap();
/// ```
///
/// # Safety
/// Callers dereference what this trait hands out. An implementation must
/// return from `allocate_resource` a record owned by the caller with count 1,
/// keep every record alive until `refcount_dec` observes its release, and
/// return from the fetch and acquire methods only records that are
/// registered and not yet destroyed.
pub unsafe trait HostRuntime: Send + Sync {
    /// A fresh resource with count 1, no native state and no table entry.
    fn allocate_resource(&self, kind: ResourceKind) -> Result<ResourcePtr, HostError>;
    /// # Safety
    /// The caller owns a reference to `ptr`.
    unsafe fn resource_table_register(&self, ptr: ResourcePtr) -> Result<ResourceId, HostError>;
    fn resource_table_fetch(&self, id: ResourceId) -> Option<ResourcePtr>;
    /// Looks `id` up and takes a reference in one step.
    fn resource_table_acquire(&self, id: ResourceId) -> Option<ResourcePtr>;
    /// # Safety
    /// The caller owns a reference to `ptr`.
    unsafe fn refcount_inc(&self, ptr: ResourcePtr) -> Result<u32, HostError>;
    /// # Safety
    /// The caller owns a reference to `ptr` and gives it up here; `ptr` must
    /// not be used through that reference again.
    unsafe fn refcount_dec(&self, ptr: ResourcePtr) -> Result<Decrement, HostError>;
    /// Stores `ptr` under `key` in the persistent list; the entry takes its
    /// own reference.
    ///
    /// # Safety
    /// The caller owns a reference to `ptr`.
    unsafe fn persistent_register(&self, key: &str, ptr: ResourcePtr) -> Result<(), HostError>;
    fn persistent_fetch(&self, key: &str) -> Option<ResourcePtr>;
    fn persistent_acquire(&self, key: &str) -> Option<ResourcePtr>;
    /// Removes `key` and drops the entry's reference.
    fn persistent_release(&self, key: &str) -> Result<(), HostError>;
}

/// Resource ceilings for a [`ManagedHost`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HostLimits {
    pub max_resources: Option<usize>,
    pub max_registered: Option<usize>,
}

pub struct ManagedHost {
    table: ResourceTable,
    live: AtomicUsize,
    max_resources: Option<usize>,
}

impl ManagedHost {
    pub fn new() -> Result<Arc<Self>, LayoutMismatch> {
        Self::with_layout(&HostLayout::compiled())
    }

    /// Verifies `layout` against this build before anything is allocated.
    pub fn with_layout(layout: &HostLayout) -> Result<Arc<Self>, LayoutMismatch> {
        Self::with_limits(layout, HostLimits::default())
    }

    pub fn with_limits(layout: &HostLayout, limits: HostLimits) -> Result<Arc<Self>, LayoutMismatch> {
        verify_host_layout(layout)?;
        let table = match limits.max_registered {
            Some(limit) => ResourceTable::with_limit(limit),
            None => ResourceTable::new(),
        };
        Ok(Arc::new(Self {
            table,
            live: AtomicUsize::new(0),
            max_resources: limits.max_resources,
        }))
    }

    pub fn table(&self) -> &ResourceTable {
        &self.table
    }

    /// Allocated resources whose destructor has not run yet.
    pub fn live_resources(&self) -> usize {
        self.live.load(AtomicOrdering::Acquire)
    }

    fn acquire(&self, ptr: ResourcePtr) -> Option<ResourcePtr> {
        // SAFETY: called under the table read lock, which the destructor
        // needs for writing before it frees the record.
        let resource = unsafe { ptr.as_ref() };
        resource.header().inc().ok().map(|_| ptr)
    }

    fn destroy(&self, ptr: ResourcePtr) {
        // SAFETY: the count just reached zero; no other owner remains.
        let resource = unsafe { ptr.as_ref() };
        if let Some(id) = ResourceId::new(resource.handle() as u64) {
            self.table.unregister(id);
        }
        let fd = release_native(resource);
        // SAFETY: allocated by `allocate_resource`, released exactly once.
        unsafe { ptr.free() };
        self.live.fetch_sub(1, AtomicOrdering::AcqRel);
        trace!(fd = fd.unwrap_or(-1), "resource destroyed");
    }
}

/// Drops the socket native state of a dead resource, closing its
/// descriptor. Returns the descriptor that was closed.
fn release_native(resource: &RawResource) -> Option<RawFd> {
    let native = resource.take_native();
    if native.is_null() {
        return None;
    }
    // SAFETY: every kind this host allocates carries boxed SocketState.
    let state = unsafe { Box::from_raw(native.cast::<SocketState>()) };
    if state.bsd_socket < 0 {
        return None;
    }
    // SAFETY: the resource owned this descriptor.
    drop(unsafe { OwnedFd::from_raw_fd(state.bsd_socket) });
    Some(state.bsd_socket)
}

// SAFETY: records come from `ResourcePtr::allocate` and are freed only by
// `destroy`, after the count reached zero and the table entry was removed
// under the write lock.
unsafe impl HostRuntime for ManagedHost {
    fn allocate_resource(&self, kind: ResourceKind) -> Result<ResourcePtr, HostError> {
        let max = self.max_resources.unwrap_or(usize::MAX);
        self.live
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .map_err(|_| HostError::AllocationRefused(kind.id()))?;
        Ok(ResourcePtr::allocate(kind.id()))
    }

    unsafe fn resource_table_register(&self, ptr: ResourcePtr) -> Result<ResourceId, HostError> {
        // SAFETY: the caller owns a reference; `destroy` removes the entry
        // before freeing.
        Ok(unsafe { self.table.register(ptr) }?)
    }

    fn resource_table_fetch(&self, id: ResourceId) -> Option<ResourcePtr> {
        self.table.fetch(id)
    }

    fn resource_table_acquire(&self, id: ResourceId) -> Option<ResourcePtr> {
        self.table.fetch_with(id, |ptr| self.acquire(ptr)).flatten()
    }

    unsafe fn refcount_inc(&self, ptr: ResourcePtr) -> Result<u32, HostError> {
        // SAFETY: the caller owns a reference.
        Ok(unsafe { ptr.as_ref() }.header().inc()?)
    }

    unsafe fn refcount_dec(&self, ptr: ResourcePtr) -> Result<Decrement, HostError> {
        // SAFETY: the caller owns a reference.
        let outcome = unsafe { ptr.as_ref() }.header().dec()?;
        if outcome == Decrement::Released {
            self.destroy(ptr);
        }
        Ok(outcome)
    }

    unsafe fn persistent_register(&self, key: &str, ptr: ResourcePtr) -> Result<(), HostError> {
        // SAFETY: the caller owns a reference, which keeps `ptr` alive until
        // the entry holds its own.
        unsafe {
            self.refcount_inc(ptr)?;
            if let Err(err) = self.table.register_persistent(key, ptr) {
                self.refcount_dec(ptr)?;
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn persistent_fetch(&self, key: &str) -> Option<ResourcePtr> {
        self.table.fetch_persistent(key)
    }

    fn persistent_acquire(&self, key: &str) -> Option<ResourcePtr> {
        self.table
            .fetch_persistent_with(key, |ptr| self.acquire(ptr))
            .flatten()
    }

    fn persistent_release(&self, key: &str) -> Result<(), HostError> {
        let ptr = self
            .table
            .unregister_persistent(key)
            .ok_or(HostError::Unregistered)?;
        // SAFETY: the entry owned a reference, handed over here.
        unsafe { self.refcount_dec(ptr) }?;
        Ok(())
    }
}

impl Drop for ManagedHost {
    fn drop(&mut self) {
        for key in self.table.persistent_keys() {
            if let Err(err) = self.persistent_release(&key) {
                warn!(%key, %err, "failed to release persistent resource");
            }
        }
        let leaked = self.live_resources();
        if leaked > 0 {
            warn!(leaked, "host dropped with live resources");
        }
    }
}

impl fmt::Debug for ManagedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedHost")
            .field("live", &self.live_resources())
            .field("registered", &self.table.len())
            .field("persistent", &self.table.persistent_len())
            .finish()
    }
}

/// A strong reference to a registered resource. Cloning takes a reference
/// through the host; dropping releases it, and the last drop runs the
/// destructor.
pub struct ResourceHandle {
    ptr: ResourcePtr,
    id: ResourceId,
    host: Arc<dyn HostRuntime>,
}

impl ResourceHandle {
    /// Takes over a reference the caller already owns.
    pub(crate) fn adopt(host: Arc<dyn HostRuntime>, ptr: ResourcePtr, id: ResourceId) -> Self {
        Self { ptr, id, host }
    }

    /// A new reference to the resource registered under `id`.
    pub fn fetch(host: &Arc<dyn HostRuntime>, id: ResourceId) -> Option<Self> {
        let ptr = host.resource_table_acquire(id)?;
        Some(Self::adopt(Arc::clone(host), ptr, id))
    }

    /// A new reference to the resource held under `key` in the persistent
    /// list.
    pub fn fetch_persistent(host: &Arc<dyn HostRuntime>, key: &str) -> Option<Self> {
        let ptr = host.persistent_acquire(key)?;
        // SAFETY: we now hold a reference.
        let handle = unsafe { ptr.as_ref() }.handle() as u64;
        match ResourceId::new(handle) {
            Some(id) => Some(Self::adopt(Arc::clone(host), ptr, id)),
            None => {
                // SAFETY: the reference taken by `persistent_acquire`.
                if let Err(err) = unsafe { host.refcount_dec(ptr) } {
                    warn!(%key, %err, "failed to release unregistered persistent resource");
                }
                None
            }
        }
    }

    fn resource(&self) -> &RawResource {
        // SAFETY: this handle owns a reference for its whole lifetime.
        unsafe { self.ptr.as_ref() }
    }

    fn socket(&self) -> Option<&SocketState> {
        let native = self.resource().native_ptr();
        // SAFETY: native state lives until the destructor, which cannot run
        // while this handle holds a reference.
        unsafe { native.cast::<SocketState>().as_ref() }
    }

    pub fn ptr(&self) -> ResourcePtr {
        self.ptr
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn host(&self) -> &Arc<dyn HostRuntime> {
        &self.host
    }

    pub fn kind(&self) -> Option<ResourceKind> {
        ResourceKind::from_id(self.resource().kind())
    }

    pub fn refcount(&self) -> u32 {
        self.resource().header().count()
    }

    pub fn type_tag(&self) -> u32 {
        self.resource().header().type_tag()
    }

    pub fn os_handle(&self) -> Option<RawFd> {
        self.socket()
            .map(|state| state.bsd_socket)
            .filter(|fd| *fd >= 0)
    }

    /// Borrows the descriptor for as long as this handle lives.
    pub fn borrow_fd(&self) -> Option<BorrowedFd<'_>> {
        // SAFETY: the descriptor stays open until the destructor runs.
        self.os_handle().map(|fd| unsafe { BorrowedFd::borrow_raw(fd) })
    }

    pub fn family(&self) -> Family {
        self.socket()
            .map(|state| Family::from_raw(state.family))
            .unwrap_or(Family::Unspecified)
    }

    pub fn is_blocking(&self) -> bool {
        self.socket().is_some_and(SocketState::is_blocking)
    }

    pub fn last_error(&self) -> i32 {
        self.socket().map_or(0, |state| state.error)
    }

    fn require_fd(&self) -> io::Result<RawFd> {
        self.os_handle()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl io::Read for &ResourceHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.require_fd()?;
        loop {
            // SAFETY: `buf` is a live mutable slice of the given length.
            let read = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if read >= 0 {
                return Ok(read as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl io::Write for &ResourceHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.require_fd()?;
        loop {
            // SAFETY: `buf` is a live slice of the given length.
            let written = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            if written >= 0 {
                return Ok(written as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for ResourceHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for ResourceHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Clone for ResourceHandle {
    fn clone(&self) -> Self {
        // SAFETY: this handle owns a reference.
        if let Err(err) = unsafe { self.host.refcount_inc(self.ptr) } {
            panic!("cannot take another reference to {}: {err}", self.id);
        }
        Self::adopt(Arc::clone(&self.host), self.ptr, self.id)
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        // SAFETY: this handle's reference, released exactly once.
        if let Err(err) = unsafe { self.host.refcount_dec(self.ptr) } {
            warn!(id = self.id.get(), %err, "resource release failed");
        }
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id.get())
            .field("kind", &self.kind())
            .field("fd", &self.os_handle())
            .field("refcount", &self.refcount())
            .finish()
    }
}
