//! Socket call abstraction
//!
//! [`SocketApi`] is the capability set the interception layer substitutes:
//! `connect`, `send`, `recv`, `sendto`, `recvfrom` and `close`, plus the
//! handful of queries the tunnel-aware implementation needs about a socket.
//! Two implementations exist:
//!
//! - [`OsSockets`]: the real operating-system calls (passthrough)
//! - [`crate::Interceptor`]: the tunnel-aware wrapper around any `SocketApi`
//!
//! Errors are `io::Error` carrying raw OS error codes so the C ABI layer can
//! hand them back as `errno` unchanged.

mod os;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

pub use os::OsSockets;

/// OS socket handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub RawFd);

impl SocketHandle {
    /// The raw descriptor
    #[must_use]
    pub const fn raw(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

impl From<RawFd> for SocketHandle {
    fn from(fd: RawFd) -> Self {
        Self(fd)
    }
}

/// Transport protocol of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    /// Raw, SEQPACKET, unix sockets and anything else never tunneled
    Other,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// `MSG_*` flags passed to send/recv calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags(pub i32);

impl MsgFlags {
    pub const NONE: Self = Self(0);
    pub const DONTWAIT: Self = Self(libc::MSG_DONTWAIT);
    pub const PEEK: Self = Self(libc::MSG_PEEK);
    pub const WAITALL: Self = Self(libc::MSG_WAITALL);
    pub const NOSIGNAL: Self = Self(libc::MSG_NOSIGNAL);

    /// Check whether all bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MsgFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Blocking behavior of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoMode {
    /// O_NONBLOCK is set on the descriptor
    pub nonblocking: bool,
    /// SO_RCVTIMEO, `None` when unset
    pub recv_timeout: Option<Duration>,
    /// SO_SNDTIMEO, `None` when unset
    pub send_timeout: Option<Duration>,
}

impl IoMode {
    /// Blocking socket without timeouts
    pub const BLOCKING: Self = Self {
        nonblocking: false,
        recv_timeout: None,
        send_timeout: None,
    };

    /// Non-blocking socket
    pub const NONBLOCKING: Self = Self {
        nonblocking: true,
        recv_timeout: None,
        send_timeout: None,
    };

    /// Whether a call with these flags must not wait
    #[must_use]
    pub const fn is_nonblocking(&self, flags: MsgFlags) -> bool {
        self.nonblocking || flags.contains(MsgFlags::DONTWAIT)
    }
}

/// Poll-style readiness of a tunneled handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Connection failed or the peer closed it
    pub hangup: bool,
}

/// The substituted socket calls
///
/// Implementations must be usable from many threads at once; calls on
/// unrelated handles must not serialize on each other.
pub trait SocketApi: Send + Sync {
    /// `connect(2)`
    ///
    /// # Errors
    ///
    /// Returns the OS error a real connect would report.
    fn connect(&self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()>;

    /// `send(2)`
    ///
    /// # Errors
    ///
    /// Returns the OS error a real send would report.
    fn send(&self, handle: SocketHandle, buf: &[u8], flags: MsgFlags) -> io::Result<usize>;

    /// `recv(2)`
    ///
    /// # Errors
    ///
    /// Returns the OS error a real recv would report.
    fn recv(&self, handle: SocketHandle, buf: &mut [u8], flags: MsgFlags) -> io::Result<usize>;

    /// `sendto(2)`; `dest = None` behaves like `send`
    ///
    /// # Errors
    ///
    /// Returns the OS error a real sendto would report.
    fn send_to(
        &self,
        handle: SocketHandle,
        buf: &[u8],
        flags: MsgFlags,
        dest: Option<SocketAddr>,
    ) -> io::Result<usize>;

    /// `recvfrom(2)`; the address is `None` when the OS reports none
    ///
    /// # Errors
    ///
    /// Returns the OS error a real recvfrom would report.
    fn recv_from(
        &self,
        handle: SocketHandle,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> io::Result<(usize, Option<SocketAddr>)>;

    /// `close(2)`
    ///
    /// # Errors
    ///
    /// Returns the OS error a real close would report.
    fn close(&self, handle: SocketHandle) -> io::Result<()>;

    /// `getsockopt(SO_TYPE)` mapped to a protocol
    ///
    /// # Errors
    ///
    /// Returns the OS error for invalid handles.
    fn socket_type(&self, handle: SocketHandle) -> io::Result<Protocol>;

    /// `getsockname(2)`; `None` for unbound or non-IP sockets
    ///
    /// # Errors
    ///
    /// Returns the OS error for invalid handles.
    fn local_addr(&self, handle: SocketHandle) -> io::Result<Option<SocketAddr>>;

    /// `bind(2)`
    ///
    /// # Errors
    ///
    /// Returns the OS error a real bind would report.
    fn bind(&self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()>;

    /// `shutdown(SHUT_RDWR)`, used to wake threads blocked in the OS
    ///
    /// # Errors
    ///
    /// Returns the OS error a real shutdown would report.
    fn shutdown(&self, handle: SocketHandle) -> io::Result<()>;

    /// Blocking flag and timeouts of the descriptor
    ///
    /// # Errors
    ///
    /// Returns the OS error for invalid handles.
    fn io_mode(&self, handle: SocketHandle) -> io::Result<IoMode>;
}
