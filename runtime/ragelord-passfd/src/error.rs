use std::io;

use ragelord_obj_model::{RefcountError, TableError};
use thiserror::Error;

use crate::envelope::HandleKind;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("out of descriptors or buffer space: {0}")]
    ResourceExhausted(#[source] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("exactly one descriptor per transfer, got {0}")]
    DescriptorCount(usize),
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("channel I/O failed: {0}")]
    Io(#[source] io::Error),
}

impl ChannelError {
    /// Classifies a syscall failure. `EINTR` never reaches here; callers
    /// retry it.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EPIPE | libc::ECONNRESET | libc::ENOTCONN) => Self::Closed,
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
                Self::ResourceExhausted(err)
            }
            _ if err.kind() == io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(err),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("ancillary data was truncated")]
    TruncatedControl,
    #[error("message carried no descriptor")]
    MissingDescriptor,
    #[error("message carried {0} descriptors")]
    UnexpectedDescriptors(usize),
    #[error("unexpected control message (level {level}, type {kind})")]
    UnexpectedControl { level: i32, kind: i32 },
    #[error("received descriptor {fd} outside the open-file limit {limit}")]
    InvalidDescriptor { fd: i32, limit: i64 },
    #[error("peer announced a {len} byte payload, limit is {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("payload is {found} bytes, expected at least {needed}")]
    ShortPayload { needed: usize, found: usize },
    #[error("context declares {declared} bytes, {actual} present")]
    ContextLength { declared: usize, actual: usize },
    #[error("bad handle envelope: {0}")]
    Envelope(#[from] DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("envelope needs {needed} bytes, got {found}")]
    Truncated { needed: usize, found: usize },
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("unknown envelope version {0}")]
    UnknownVersion(u8),
    #[error("unknown handle kind {0}")]
    UnknownKind(u8),
    #[error("unknown address family {0}")]
    UnknownFamily(u8),
    #[error("blocking flag must be 0 or 1, got {0}")]
    InvalidBlocking(u8),
    #[error("reserved envelope bytes are not zero")]
    ReservedNonZero,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Refcount(#[from] RefcountError),
    #[error("host refused to allocate a resource of kind {0}")]
    AllocationRefused(i32),
    #[error("resource is not registered with this host")]
    Unregistered,
}

#[derive(Debug, Error)]
pub enum RehydrateError {
    #[error("receiver does not accept {0} handles")]
    UnsupportedKind(HandleKind),
    #[error("resource allocation failed: {0}")]
    Allocation(#[source] HostError),
    #[error("resource registration failed: {0}")]
    Registration(#[source] HostError),
}

#[derive(Debug, Error)]
pub enum HandoverError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("could not describe the outgoing descriptor: {0}")]
    Probe(#[source] io::Error),
    #[error("handover context: {0}")]
    Context(#[from] serde_json::Error),
    #[error(transparent)]
    Rehydrate(#[from] RehydrateError),
}
