//! Handle envelope: the fixed header describing a transferred descriptor.
//!
//! An envelope travels in the regular payload of the same message as its
//! descriptor. Wire layout, 12 bytes, native byte order (both ends are on the
//! same machine):
//!
//! ```text
//! 0         1        2          3            4                8            12
//! +---------+--------+----------+------------+----------------+------------+
//! | version | kind   | family   | blocking   | last_error i32 | reserved=0 |
//! +---------+--------+----------+------------+----------------+------------+
//! ```
//!
//! The codec never infers anything about the descriptor; [`probe`] is the
//! sender-side helper that asks the kernel.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::raw::c_int;
use std::str::FromStr;

use socket2::SockRef;

use crate::error::DecodeError;

pub const ENVELOPE_VERSION: u8 = 1;
pub const ENVELOPE_LEN: usize = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleKind {
    Socket = 1,
    Stream = 2,
    Generic = 3,
}

impl HandleKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Socket),
            2 => Some(Self::Stream),
            3 => Some(Self::Generic),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Stream => "stream",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HandleKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "socket" => Ok(Self::Socket),
            "stream" => Ok(Self::Stream),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown handle kind `{other}`")),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Family {
    Unspecified = 0,
    Unix = 1,
    Inet = 2,
    Inet6 = 3,
}

impl Family {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unspecified),
            1 => Some(Self::Unix),
            2 => Some(Self::Inet),
            3 => Some(Self::Inet6),
            _ => None,
        }
    }

    /// Maps an `AF_*` constant; anything else is `Unspecified`.
    pub fn from_raw(af: c_int) -> Self {
        match af {
            libc::AF_UNIX => Self::Unix,
            libc::AF_INET => Self::Inet,
            libc::AF_INET6 => Self::Inet6,
            _ => Self::Unspecified,
        }
    }

    pub fn to_raw(self) -> c_int {
        match self {
            Self::Unspecified => libc::AF_UNSPEC,
            Self::Unix => libc::AF_UNIX,
            Self::Inet => libc::AF_INET,
            Self::Inet6 => libc::AF_INET6,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandleEnvelope {
    kind: HandleKind,
    family: Family,
    blocking: bool,
    last_error: i32,
}

impl HandleEnvelope {
    pub fn new(kind: HandleKind, family: Family, blocking: bool, last_error: i32) -> Self {
        Self {
            kind,
            family,
            blocking,
            last_error,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn blocking(&self) -> bool {
        self.blocking
    }

    pub fn last_error(&self) -> i32 {
        self.last_error
    }
}

pub fn encode(envelope: &HandleEnvelope) -> [u8; ENVELOPE_LEN] {
    let mut out = [0u8; ENVELOPE_LEN];
    out[0] = ENVELOPE_VERSION;
    out[1] = envelope.kind.code();
    out[2] = envelope.family.code();
    out[3] = envelope.blocking as u8;
    out[4..8].copy_from_slice(&envelope.last_error.to_ne_bytes());
    out
}

/// Decodes exactly one envelope; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<HandleEnvelope, DecodeError> {
    let (envelope, rest) = decode_prefix(bytes)?;
    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(rest.len()));
    }
    Ok(envelope)
}

/// Decodes the envelope at the front of `bytes` and returns the remainder.
pub fn decode_prefix(bytes: &[u8]) -> Result<(HandleEnvelope, &[u8]), DecodeError> {
    if bytes.len() < ENVELOPE_LEN {
        return Err(DecodeError::Truncated {
            needed: ENVELOPE_LEN,
            found: bytes.len(),
        });
    }
    let (head, rest) = bytes.split_at(ENVELOPE_LEN);
    if head[0] != ENVELOPE_VERSION {
        return Err(DecodeError::UnknownVersion(head[0]));
    }
    let kind = HandleKind::from_code(head[1]).ok_or(DecodeError::UnknownKind(head[1]))?;
    let family = Family::from_code(head[2]).ok_or(DecodeError::UnknownFamily(head[2]))?;
    let blocking = match head[3] {
        0 => false,
        1 => true,
        other => return Err(DecodeError::InvalidBlocking(other)),
    };
    let last_error = i32::from_ne_bytes([head[4], head[5], head[6], head[7]]);
    if head[8..].iter().any(|&byte| byte != 0) {
        return Err(DecodeError::ReservedNonZero);
    }
    Ok((
        HandleEnvelope {
            kind,
            family,
            blocking,
            last_error,
        },
        rest,
    ))
}

/// Describes `fd` from kernel state: `fstat` for the kind, `O_NONBLOCK` for
/// blocking mode, and for sockets the bound family and pending `SO_ERROR`.
/// Reading `SO_ERROR` clears it on the sender's side.
pub fn probe(fd: BorrowedFd<'_>) -> io::Result<HandleEnvelope> {
    let raw = fd.as_raw_fd();
    // SAFETY: `stat` is plain data and fstat only writes into it.
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(raw, &mut stat) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_GETFL has no pointer arguments.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let blocking = flags & libc::O_NONBLOCK == 0;

    match stat.st_mode & libc::S_IFMT {
        libc::S_IFSOCK => {
            let socket = SockRef::from(&fd);
            let family = socket
                .local_addr()
                .map(|addr| Family::from_raw(addr.family() as c_int))
                .unwrap_or(Family::Unspecified);
            let last_error = socket
                .take_error()?
                .and_then(|err| err.raw_os_error())
                .unwrap_or(0);
            Ok(HandleEnvelope::new(
                HandleKind::Socket,
                family,
                blocking,
                last_error,
            ))
        }
        libc::S_IFIFO | libc::S_IFREG | libc::S_IFCHR => Ok(HandleEnvelope::new(
            HandleKind::Stream,
            Family::Unspecified,
            blocking,
            0,
        )),
        _ => Ok(HandleEnvelope::new(
            HandleKind::Generic,
            Family::Unspecified,
            blocking,
            0,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    fn envelope() -> impl Strategy<Value = HandleEnvelope> {
        (
            prop_oneof![
                Just(HandleKind::Socket),
                Just(HandleKind::Stream),
                Just(HandleKind::Generic)
            ],
            prop_oneof![
                Just(Family::Unspecified),
                Just(Family::Unix),
                Just(Family::Inet),
                Just(Family::Inet6)
            ],
            any::<bool>(),
            any::<i32>(),
        )
            .prop_map(|(kind, family, blocking, last_error)| {
                HandleEnvelope::new(kind, family, blocking, last_error)
            })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(env in envelope()) {
            prop_assert_eq!(decode(&encode(&env)), Ok(env));
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
            let _ = decode(&bytes);
        }
    }

    #[test]
    fn rejects_unknown_fields() {
        let good = encode(&HandleEnvelope::new(
            HandleKind::Socket,
            Family::Inet,
            true,
            0,
        ));

        let mut bad = good;
        bad[0] = 2;
        assert_eq!(decode(&bad), Err(DecodeError::UnknownVersion(2)));

        let mut bad = good;
        bad[1] = 0;
        assert_eq!(decode(&bad), Err(DecodeError::UnknownKind(0)));

        let mut bad = good;
        bad[2] = 9;
        assert_eq!(decode(&bad), Err(DecodeError::UnknownFamily(9)));

        let mut bad = good;
        bad[3] = 2;
        assert_eq!(decode(&bad), Err(DecodeError::InvalidBlocking(2)));

        let mut bad = good;
        bad[11] = 1;
        assert_eq!(decode(&bad), Err(DecodeError::ReservedNonZero));

        assert_eq!(
            decode(&good[..5]),
            Err(DecodeError::Truncated {
                needed: ENVELOPE_LEN,
                found: 5
            })
        );
    }

    #[test]
    fn prefix_leaves_remainder() {
        let env = HandleEnvelope::new(HandleKind::Stream, Family::Unspecified, false, 32);
        let mut bytes = encode(&env).to_vec();
        bytes.extend_from_slice(b"{\"nick\":\"x\"}");
        let (decoded, rest) = decode_prefix(&bytes).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(rest, b"{\"nick\":\"x\"}");
        assert_eq!(decode(&bytes), Err(DecodeError::TrailingBytes(12)));
    }

    #[test]
    fn probe_reports_unix_socket_state() {
        let (a, _b) = UnixStream::pair().unwrap();
        let env = probe(a.as_fd()).unwrap();
        assert_eq!(env.kind(), HandleKind::Socket);
        assert_eq!(env.family(), Family::Unix);
        assert!(env.blocking());
        assert_eq!(env.last_error(), 0);

        a.set_nonblocking(true).unwrap();
        assert!(!probe(a.as_fd()).unwrap().blocking());
    }

    #[test]
    fn probe_reports_tcp_family() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let env = probe(listener.as_fd()).unwrap();
        assert_eq!(env.kind(), HandleKind::Socket);
        assert_eq!(env.family(), Family::Inet);
    }

    #[test]
    fn probe_reports_files_as_streams() {
        let file = tempfile::tempfile().unwrap();
        let env = probe(file.as_fd()).unwrap();
        assert_eq!(env.kind(), HandleKind::Stream);
        assert_eq!(env.family(), Family::Unspecified);
    }
}
