//! Ancillary channel: one descriptor plus a framed payload per transfer over
//! a Unix-domain stream socket.
//!
//! Each transfer is a single frame `[len:u32 native][payload]`, handed to one
//! `sendmsg` with an `SCM_RIGHTS` control message carrying exactly one
//! descriptor. The receiver reads the length prefix with `recvmsg` (which
//! collects the control message) and then the body, so message boundaries
//! survive the stream socket. Any error after the length prefix is read
//! drains the body first, leaving the channel usable for the next frame.
//!
//! The channel never interprets the descriptor or the payload.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::raw::{c_int, c_void};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Mutex, OnceLock, PoisonError};

use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use tracing::{debug, warn};

use crate::config::{ChannelConfig, MAX_PAYLOAD_CEILING};
use crate::error::{ChannelError, ProtocolError};

pub const FRAME_HEADER_LEN: usize = 4;

const DRAIN_CHUNK: usize = 4096;
const LISTEN_BACKLOG: c_int = 16;

fn trace_frames() -> bool {
    static TRACE: OnceLock<bool> = OnceLock::new();
    *TRACE.get_or_init(|| std::env::var("RAGELORD_TRACE_PASSFD").as_deref() == Ok("1"))
}

pub struct AncillaryChannel {
    stream: UnixStream,
    config: ChannelConfig,
    closed: AtomicBool,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl AncillaryChannel {
    /// Two connected endpoints in this process.
    pub fn pair() -> Result<(Self, Self), ChannelError> {
        Self::pair_with_config(ChannelConfig::default())
    }

    pub fn pair_with_config(config: ChannelConfig) -> Result<(Self, Self), ChannelError> {
        let (a, b) =
            Socket::pair(Domain::UNIX, Type::STREAM, None).map_err(ChannelError::from_io)?;
        Ok((Self::from_socket(a, config)?, Self::from_socket(b, config)?))
    }

    pub fn connect(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        Self::connect_with_config(path, ChannelConfig::default())
    }

    pub fn connect_with_config(
        path: impl AsRef<Path>,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let addr = SockAddr::unix(path.as_ref()).map_err(ChannelError::Io)?;
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(ChannelError::from_io)?;
        loop {
            match socket.connect(&addr) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChannelError::from_io(err)),
            }
        }
        Self::from_socket(socket, config)
    }

    /// Wraps an already connected stream. The caller owns its close-on-exec
    /// setting.
    pub fn from_stream(stream: UnixStream, config: ChannelConfig) -> Result<Self, ChannelError> {
        suppress_sigpipe(SockRef::from(&stream))?;
        Ok(Self {
            stream,
            config,
            closed: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        })
    }

    fn from_socket(socket: Socket, config: ChannelConfig) -> Result<Self, ChannelError> {
        Self::from_stream(UnixStream::from(socket), config)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    /// Shuts both directions down. A `receive` blocked on another thread
    /// returns [`ChannelError::Closed`], as does every later call.
    pub fn shutdown(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            Err(err) => Err(ChannelError::Io(err)),
        }
    }

    /// The configured payload limit, capped at [`MAX_PAYLOAD_CEILING`] so a
    /// length always fits the u32 frame header.
    pub fn max_payload(&self) -> usize {
        self.config.max_payload.min(MAX_PAYLOAD_CEILING)
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_shut_down() {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Sends `fd` with `payload`. The caller keeps its copy of `fd`; the
    /// receiver gets a new descriptor for the same kernel object.
    pub fn send(&self, fd: BorrowedFd<'_>, payload: &[u8]) -> Result<(), ChannelError> {
        self.send_descriptors(&[fd], payload)
    }

    /// Checked front door for callers holding a descriptor list; anything
    /// other than exactly one descriptor is refused before any syscall.
    pub fn send_descriptors(
        &self,
        fds: &[BorrowedFd<'_>],
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let [fd] = fds else {
            return Err(ChannelError::DescriptorCount(fds.len()));
        };
        let max = self.max_payload();
        let too_large = || ChannelError::PayloadTooLarge {
            len: payload.len(),
            max,
        };
        if payload.len() > max {
            return Err(too_large());
        }
        let len = u32::try_from(payload.len()).map_err(|_| too_large())?;
        self.ensure_open()?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_ne_bytes());
        frame.extend_from_slice(payload);

        let _guard = self.send_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let socket = self.stream.as_raw_fd();
        let sent = sendmsg_with_descriptor(socket, &frame, fd.as_raw_fd())?;
        if sent < frame.len() {
            send_all(socket, &frame[sent..])?;
        }
        if trace_frames() {
            eprintln!(
                "ragelord passfd send: socket={} fd={} len={} first_chunk={}",
                socket,
                fd.as_raw_fd(),
                payload.len(),
                sent
            );
        }
        debug!(fd = fd.as_raw_fd(), len = payload.len(), "descriptor sent");
        Ok(())
    }

    /// Blocks until one descriptor and its payload arrive.
    pub fn receive(&self) -> Result<(OwnedFd, Vec<u8>), ChannelError> {
        self.ensure_open()?;
        let _guard = self.recv_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let socket = self.stream.as_raw_fd();

        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut control = ControlBuffer::with_capacity(self.config.control_capacity);
        let (read, descriptor) = match recvmsg_with_control(socket, &mut header, &mut control) {
            Ok(received) => received,
            Err(_) if self.is_shut_down() => return Err(ChannelError::Closed),
            Err(err) => return Err(err),
        };
        if read == 0 {
            return Err(ChannelError::Closed);
        }
        if read < FRAME_HEADER_LEN {
            recv_exact(socket, &mut header[read..])?;
        }

        let len = u32::from_ne_bytes(header) as usize;
        let max = self.max_payload();
        if len > max {
            drain(socket, len)?;
            warn!(len, max, "oversized frame dropped");
            return Err(ProtocolError::PayloadTooLarge { len, max }.into());
        }
        let mut payload = vec![0u8; len];
        recv_exact(socket, &mut payload)?;

        let fd = match descriptor {
            Ok(fd) => fd,
            Err(err) => {
                warn!(%err, len, "frame rejected");
                return Err(err.into());
            }
        };
        if trace_frames() {
            eprintln!(
                "ragelord passfd recv: socket={} fd={} len={}",
                socket,
                fd.as_raw_fd(),
                len
            );
        }
        debug!(fd = fd.as_raw_fd(), len, "descriptor received");
        Ok((fd, payload))
    }
}

impl AsFd for AncillaryChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl std::fmt::Debug for AncillaryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AncillaryChannel")
            .field("fd", &self.stream.as_raw_fd())
            .field("config", &self.config)
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

/// Listening endpoint bound to a filesystem path. The path is unlinked when
/// the listener is dropped.
#[derive(Debug)]
pub struct ChannelListener {
    socket: Socket,
    path: PathBuf,
    config: ChannelConfig,
}

impl ChannelListener {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        Self::bind_with_config(path, ChannelConfig::default())
    }

    /// Binds `path`, first removing a stale socket file left there by a
    /// previous process. Any other kind of file at `path` is an error.
    pub fn bind_with_config(
        path: impl AsRef<Path>,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        remove_stale_socket(path)?;
        let addr = SockAddr::unix(path).map_err(ChannelError::Io)?;
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(ChannelError::from_io)?;
        socket.bind(&addr).map_err(ChannelError::from_io)?;
        socket.listen(LISTEN_BACKLOG).map_err(ChannelError::from_io)?;
        debug!(path = %path.display(), "channel listener bound");
        Ok(Self {
            socket,
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn accept(&self) -> Result<AncillaryChannel, ChannelError> {
        loop {
            match self.socket.accept() {
                Ok((socket, _)) => return AncillaryChannel::from_socket(socket, self.config),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChannelError::from_io(err)),
            }
        }
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to unlink channel socket");
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), ChannelError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path).map_err(ChannelError::Io)?;
            debug!(path = %path.display(), "removed stale channel socket");
            Ok(())
        }
        Ok(_) => Err(ChannelError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ChannelError::Io(err)),
    }
}

#[cfg(target_vendor = "apple")]
fn suppress_sigpipe(socket: SockRef<'_>) -> Result<(), ChannelError> {
    socket.set_nosigpipe(true).map_err(ChannelError::Io)
}

#[cfg(not(target_vendor = "apple"))]
fn suppress_sigpipe(_socket: SockRef<'_>) -> Result<(), ChannelError> {
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

// --- Raw control-message handling ---

/// Ancillary buffer with `cmsghdr` alignment.
struct ControlBuffer {
    storage: Vec<u64>,
    len: usize,
}

impl ControlBuffer {
    fn with_capacity(len: usize) -> Self {
        Self {
            storage: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        if self.len == 0 {
            ptr::null_mut()
        } else {
            self.storage.as_mut_ptr().cast()
        }
    }
}

fn sendmsg_with_descriptor(socket: RawFd, frame: &[u8], fd: RawFd) -> Result<usize, ChannelError> {
    let data_len = std::mem::size_of::<RawFd>();
    // SAFETY: pure size arithmetic.
    let space = unsafe { libc::CMSG_SPACE(data_len as u32) as usize };
    let mut control = ControlBuffer::with_capacity(space);

    let mut iov = libc::iovec {
        iov_base: frame.as_ptr() as *mut c_void,
        iov_len: frame.len(),
    };
    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr();
    msghdr.msg_controllen = space as _;

    // SAFETY: the control buffer holds CMSG_SPACE(sizeof(int)) aligned bytes.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msghdr);
        if cmsg.is_null() {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "control buffer too small for SCM_RIGHTS",
            )));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
    }

    loop {
        // SAFETY: msghdr points at live iov and control buffers.
        let sent = unsafe { libc::sendmsg(socket, &msghdr, SEND_FLAGS) };
        if sent >= 0 {
            if sent == 0 {
                return Err(ChannelError::Io(io::ErrorKind::WriteZero.into()));
            }
            return Ok(sent as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(ChannelError::from_io(err));
        }
    }
}

fn send_all(socket: RawFd, mut bytes: &[u8]) -> Result<(), ChannelError> {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice of the given length.
        let sent = unsafe { libc::send(socket, bytes.as_ptr().cast(), bytes.len(), SEND_FLAGS) };
        if sent < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ChannelError::from_io(err));
        }
        if sent == 0 {
            return Err(ChannelError::Io(io::ErrorKind::WriteZero.into()));
        }
        bytes = &bytes[sent as usize..];
    }
    Ok(())
}

/// Reads into `buf` with `recvmsg`, returning the byte count and the outcome
/// of the control message. Received descriptors are owned immediately, so
/// rejected ones are closed on every path.
fn recvmsg_with_control(
    socket: RawFd,
    buf: &mut [u8],
    control: &mut ControlBuffer,
) -> Result<(usize, Result<OwnedFd, ProtocolError>), ChannelError> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr();
    msghdr.msg_controllen = control.len as _;

    // No MSG_CMSG_CLOEXEC: the transferred descriptor keeps its flags.
    let read = loop {
        // SAFETY: msghdr points at live iov and control buffers.
        let read = unsafe { libc::recvmsg(socket, &mut msghdr, 0) };
        if read >= 0 {
            break read as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(ChannelError::from_io(err));
        }
    };

    let parsed = parse_control(&msghdr);
    let truncated = msghdr.msg_flags & libc::MSG_CTRUNC != 0;
    let outcome = if truncated {
        drop(parsed.fds);
        Err(ProtocolError::TruncatedControl)
    } else if let Some(err) = parsed.error {
        Err(err)
    } else {
        let mut fds = parsed.fds;
        match fds.len() {
            0 => Err(ProtocolError::MissingDescriptor),
            1 => fds.pop().ok_or(ProtocolError::MissingDescriptor),
            count => Err(ProtocolError::UnexpectedDescriptors(count)),
        }
    };
    Ok((read, outcome))
}

struct ParsedControl {
    fds: Vec<OwnedFd>,
    error: Option<ProtocolError>,
}

impl ParsedControl {
    fn reject(&mut self, err: ProtocolError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

fn open_file_limit() -> i64 {
    // SAFETY: sysconf has no pointer arguments.
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 {
        i64::from(c_int::MAX)
    } else {
        limit as i64
    }
}

fn parse_control(msghdr: &libc::msghdr) -> ParsedControl {
    let mut parsed = ParsedControl {
        fds: Vec::new(),
        error: None,
    };
    let limit = open_file_limit();
    // SAFETY: msghdr points at the control buffer recvmsg just filled.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let kind = (*cmsg).cmsg_type;
            if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
                let base_len = libc::CMSG_LEN(0) as usize;
                let bytes = ((*cmsg).cmsg_len as usize).saturating_sub(base_len);
                let count = bytes / std::mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    let fd = ptr::read_unaligned(data.add(i));
                    if fd < 0 {
                        parsed.reject(ProtocolError::InvalidDescriptor { fd, limit });
                        continue;
                    }
                    // The kernel installed this descriptor for us; own it
                    // before validating so it is closed if rejected.
                    parsed.fds.push(OwnedFd::from_raw_fd(fd));
                    if i64::from(fd) >= limit {
                        parsed.reject(ProtocolError::InvalidDescriptor { fd, limit });
                    }
                }
            } else {
                parsed.reject(ProtocolError::UnexpectedControl { level, kind });
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    parsed
}

fn recv_exact(socket: RawFd, mut buf: &mut [u8]) -> Result<(), ChannelError> {
    while !buf.is_empty() {
        // SAFETY: `buf` is a live mutable slice of the given length.
        let read = unsafe { libc::recv(socket, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ChannelError::from_io(err));
        }
        if read == 0 {
            return Err(ChannelError::Closed);
        }
        buf = &mut buf[read as usize..];
    }
    Ok(())
}

fn drain(socket: RawFd, mut len: usize) -> Result<(), ChannelError> {
    let mut scratch = [0u8; DRAIN_CHUNK];
    while len > 0 {
        let chunk = len.min(DRAIN_CHUNK);
        recv_exact(socket, &mut scratch[..chunk])?;
        len -= chunk;
    }
    Ok(())
}
