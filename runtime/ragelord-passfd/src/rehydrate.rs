//! Rebuilds a managed resource from a received descriptor and its envelope.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::Arc;

use ragelord_obj_model::{ResourcePtr, SocketState};
use tracing::{debug, warn};

use crate::config::{PassfdConfig, Persistence};
use crate::envelope::{HandleEnvelope, HandleKind};
use crate::error::RehydrateError;
use crate::host::{HostRuntime, ResourceHandle, ResourceKind};

/// Turns `(descriptor, envelope)` pairs into registered host resources.
///
/// Each call consumes its descriptor. On any failure the descriptor is
/// closed exactly once before the error is returned.
pub struct Rehydrator {
    host: Arc<dyn HostRuntime>,
    supported: Vec<HandleKind>,
    persistence: Persistence,
}

impl Rehydrator {
    pub fn new(host: Arc<dyn HostRuntime>) -> Self {
        Self::from_config(host, &PassfdConfig::default())
    }

    pub fn from_config(host: Arc<dyn HostRuntime>, config: &PassfdConfig) -> Self {
        Self {
            host,
            supported: config.supported_kinds.clone(),
            persistence: config.persistence,
        }
    }

    pub fn with_supported_kinds(mut self, kinds: impl IntoIterator<Item = HandleKind>) -> Self {
        self.supported = kinds.into_iter().collect();
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn host(&self) -> &Arc<dyn HostRuntime> {
        &self.host
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn supports(&self, kind: HandleKind) -> bool {
        self.supported.contains(&kind)
    }

    pub fn rehydrate(
        &self,
        fd: OwnedFd,
        envelope: HandleEnvelope,
    ) -> Result<ResourceHandle, RehydrateError> {
        self.build(fd, envelope, self.persistence, None)
    }

    /// Rehydrates with the persistent kind and additionally stores the
    /// resource under `key` in the host's persistent list. The key is taken
    /// before the table registration, so once the resource is registered
    /// nothing else can fail.
    pub fn rehydrate_persistent(
        &self,
        fd: OwnedFd,
        envelope: HandleEnvelope,
        key: &str,
    ) -> Result<ResourceHandle, RehydrateError> {
        self.build(fd, envelope, Persistence::Persistent, Some(key))
    }

    fn build(
        &self,
        fd: OwnedFd,
        envelope: HandleEnvelope,
        persistence: Persistence,
        key: Option<&str>,
    ) -> Result<ResourceHandle, RehydrateError> {
        if !self.supports(envelope.kind()) {
            warn!(fd = fd.as_raw_fd(), kind = %envelope.kind(), "unsupported handle kind");
            return Err(RehydrateError::UnsupportedKind(envelope.kind()));
        }
        let kind = ResourceKind::for_handle(envelope.kind(), persistence);
        let ptr = match self.host.allocate_resource(kind) {
            Ok(ptr) => ptr,
            Err(err) => {
                warn!(fd = fd.as_raw_fd(), %err, "resource allocation failed");
                return Err(RehydrateError::Allocation(err));
            }
        };

        // The descriptor moves into the resource; from here the destructor
        // owns it.
        let state = SocketState::new(
            fd.into_raw_fd(),
            envelope.family().to_raw(),
            envelope.last_error(),
            envelope.blocking(),
        );
        // SAFETY: `ptr` was just allocated and this call owns its reference.
        let resource = unsafe { ptr.as_ref() };
        resource.install_native(Box::into_raw(Box::new(state)).cast());

        if let Some(key) = key {
            // SAFETY: this call owns a reference to `ptr`.
            if let Err(err) = unsafe { self.host.persistent_register(key, ptr) } {
                warn!(%key, %err, "persistent registration failed");
                self.release_unregistered(ptr);
                return Err(RehydrateError::Registration(err));
            }
        }

        // SAFETY: this call owns a reference to `ptr`.
        match unsafe { self.host.resource_table_register(ptr) } {
            Ok(id) => {
                debug!(id = id.get(), kind = ?kind, "descriptor rehydrated");
                Ok(ResourceHandle::adopt(Arc::clone(&self.host), ptr, id))
            }
            Err(err) => {
                warn!(%err, "resource registration failed");
                if let Some(key) = key {
                    if let Err(release) = self.host.persistent_release(key) {
                        warn!(%key, %release, "releasing persistent entry failed");
                    }
                }
                self.release_unregistered(ptr);
                Err(RehydrateError::Registration(err))
            }
        }
    }

    /// Drops the reference `build` holds on a resource that never reached
    /// the table; the destructor closes its descriptor.
    fn release_unregistered(&self, ptr: ResourcePtr) {
        // SAFETY: the reference taken by `allocate_resource`, released once.
        if let Err(release) = unsafe { self.host.refcount_dec(ptr) } {
            warn!(%release, "releasing unregistered resource failed");
        }
    }
}

impl std::fmt::Debug for Rehydrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rehydrator")
            .field("supported", &self.supported)
            .field("persistence", &self.persistence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Family;
    use crate::host::{HostLimits, ManagedHost};
    use ragelord_obj_model::{HostLayout, layout};
    use std::os::fd::{AsFd, RawFd};
    use std::os::unix::net::UnixStream;

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    fn socket_envelope() -> HandleEnvelope {
        HandleEnvelope::new(HandleKind::Socket, Family::Unix, true, 0)
    }

    #[test]
    fn rehydrated_socket_matches_envelope() {
        let host = ManagedHost::new().unwrap();
        let rehydrator = Rehydrator::new(host.clone());
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();

        let env = HandleEnvelope::new(HandleKind::Socket, Family::Unix, false, libc::ECONNRESET);
        let handle = rehydrator.rehydrate(OwnedFd::from(a), env).unwrap();
        assert_eq!(handle.kind(), Some(ResourceKind::Socket));
        assert_eq!(handle.refcount(), 1);
        assert_eq!(handle.type_tag(), layout::RESOURCE_TYPE_TAG);
        assert_eq!(handle.os_handle(), Some(raw));
        assert_eq!(handle.family(), Family::Unix);
        assert!(!handle.is_blocking());
        assert_eq!(handle.last_error(), libc::ECONNRESET);
        assert_eq!(host.table().fetch(handle.id()), Some(handle.ptr()));

        drop(handle);
        assert!(!fd_is_open(raw));
        assert!(host.table().is_empty());
    }

    #[test]
    fn unsupported_kind_closes_descriptor() {
        let host = ManagedHost::new().unwrap();
        let rehydrator = Rehydrator::new(host.clone()).with_supported_kinds([HandleKind::Stream]);
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();
        let err = rehydrator
            .rehydrate(OwnedFd::from(a), socket_envelope())
            .unwrap_err();
        assert!(matches!(err, RehydrateError::UnsupportedKind(HandleKind::Socket)));
        assert!(!fd_is_open(raw));
        assert_eq!(host.live_resources(), 0);
    }

    #[test]
    fn allocation_failure_closes_descriptor() {
        let host = ManagedHost::with_limits(
            &HostLayout::compiled(),
            HostLimits {
                max_resources: Some(0),
                max_registered: None,
            },
        )
        .unwrap();
        let rehydrator = Rehydrator::new(host.clone());
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();
        let err = rehydrator
            .rehydrate(OwnedFd::from(a), socket_envelope())
            .unwrap_err();
        assert!(matches!(err, RehydrateError::Allocation(_)));
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn registration_failure_releases_through_refcount() {
        let host = ManagedHost::with_limits(
            &HostLayout::compiled(),
            HostLimits {
                max_resources: None,
                max_registered: Some(0),
            },
        )
        .unwrap();
        let rehydrator = Rehydrator::new(host.clone());
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();
        let err = rehydrator
            .rehydrate(OwnedFd::from(a), socket_envelope())
            .unwrap_err();
        assert!(matches!(err, RehydrateError::Registration(_)));
        assert!(!fd_is_open(raw));
        assert_eq!(host.live_resources(), 0);
    }

    #[test]
    fn failed_persistent_rehydration_leaves_no_key_behind() {
        let host = ManagedHost::with_limits(
            &HostLayout::compiled(),
            HostLimits {
                max_resources: None,
                max_registered: Some(0),
            },
        )
        .unwrap();
        let rehydrator = Rehydrator::new(host.clone());
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();
        let err = rehydrator
            .rehydrate_persistent(OwnedFd::from(a), socket_envelope(), "irc:client:7")
            .unwrap_err();
        assert!(matches!(err, RehydrateError::Registration(_)));
        assert!(!fd_is_open(raw));
        assert_eq!(host.table().persistent_len(), 0);
        assert_eq!(host.live_resources(), 0);
    }

    #[test]
    fn persistence_selects_kind_id() {
        let host = ManagedHost::new().unwrap();
        let rehydrator = Rehydrator::new(host.clone()).with_persistence(Persistence::Persistent);
        let file = tempfile::tempfile().unwrap();
        let env = HandleEnvelope::new(HandleKind::Stream, Family::Unspecified, true, 0);
        let handle = rehydrator.rehydrate(OwnedFd::from(file), env).unwrap();
        assert_eq!(handle.kind(), Some(ResourceKind::PersistentStream));
        assert!(handle.kind().is_some_and(ResourceKind::is_persistent));
    }

    #[test]
    fn persistent_rehydration_is_fetchable_by_key() {
        let host = ManagedHost::new().unwrap();
        let dyn_host: Arc<dyn HostRuntime> = host.clone();
        let rehydrator = Rehydrator::new(Arc::clone(&dyn_host));
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();

        let handle = rehydrator
            .rehydrate_persistent(OwnedFd::from(a), socket_envelope(), "irc:client:42")
            .unwrap();
        assert_eq!(handle.kind(), Some(ResourceKind::PersistentSocket));
        assert_eq!(handle.refcount(), 2);
        drop(handle);

        let fetched = ResourceHandle::fetch_persistent(&dyn_host, "irc:client:42").unwrap();
        assert_eq!(fetched.borrow_fd().map(|fd| fd.as_raw_fd()), Some(raw));
        drop(fetched);

        let file = tempfile::tempfile().unwrap();
        let second = file.as_fd().try_clone_to_owned().unwrap();
        let second_raw = second.as_raw_fd();
        let dup = rehydrator.rehydrate_persistent(
            second,
            HandleEnvelope::new(HandleKind::Stream, Family::Unspecified, true, 0),
            "irc:client:42",
        );
        assert!(matches!(dup, Err(RehydrateError::Registration(_))));
        assert!(!fd_is_open(second_raw));
        assert_eq!(host.live_resources(), 1);
        assert_eq!(host.table().len(), 1);

        host.persistent_release("irc:client:42").unwrap();
        assert!(!fd_is_open(raw));
    }
}
