//! Passthrough implementation backed by the real OS socket calls
//!
//! Descriptors belong to the application. Every call borrows the descriptor
//! as a `socket2::Socket` wrapped in `ManuallyDrop` so dropping the wrapper
//! never closes it; only [`SocketApi::close`] does.

use std::io;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::FromRawFd;

use socket2::{SockAddr, Socket, Type};

use super::{IoMode, MsgFlags, Protocol, SocketApi, SocketHandle};

/// Real operating-system sockets
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSockets;

impl OsSockets {
    /// Create the passthrough implementation
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn borrow(handle: SocketHandle) -> io::Result<ManuallyDrop<Socket>> {
    if handle.raw() < 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // SAFETY: the descriptor is non-negative and owned by the caller for the
    // duration of the call; ManuallyDrop guarantees we never close it here.
    Ok(ManuallyDrop::new(unsafe { Socket::from_raw_fd(handle.raw()) }))
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: MaybeUninit<u8> has the same layout as u8, and the kernel only
    // ever writes initialized bytes into the buffer.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

fn is_inet(addr: &SockAddr) -> bool {
    let family = i32::from(addr.family());
    family == libc::AF_INET || family == libc::AF_INET6
}

impl SocketApi for OsSockets {
    fn connect(&self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()> {
        borrow(handle)?.connect(&SockAddr::from(addr))
    }

    fn send(&self, handle: SocketHandle, buf: &[u8], flags: MsgFlags) -> io::Result<usize> {
        borrow(handle)?.send_with_flags(buf, flags.0)
    }

    fn recv(&self, handle: SocketHandle, buf: &mut [u8], flags: MsgFlags) -> io::Result<usize> {
        borrow(handle)?.recv_with_flags(as_uninit(buf), flags.0)
    }

    fn send_to(
        &self,
        handle: SocketHandle,
        buf: &[u8],
        flags: MsgFlags,
        dest: Option<SocketAddr>,
    ) -> io::Result<usize> {
        let socket = borrow(handle)?;
        match dest {
            Some(addr) => socket.send_to_with_flags(buf, &SockAddr::from(addr), flags.0),
            None => socket.send_with_flags(buf, flags.0),
        }
    }

    fn recv_from(
        &self,
        handle: SocketHandle,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> io::Result<(usize, Option<SocketAddr>)> {
        let (n, addr) = borrow(handle)?.recv_from_with_flags(as_uninit(buf), flags.0)?;
        Ok((n, addr.as_socket()))
    }

    fn close(&self, handle: SocketHandle) -> io::Result<()> {
        // SAFETY: closing a caller-provided descriptor is exactly the
        // requested operation; an invalid descriptor yields EBADF.
        let result = unsafe { libc::close(handle.raw()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn socket_type(&self, handle: SocketHandle) -> io::Result<Protocol> {
        let socket = borrow(handle)?;
        if !is_inet(&socket.local_addr()?) {
            return Ok(Protocol::Other);
        }
        let ty = socket.r#type()?;
        Ok(if ty == Type::DGRAM {
            Protocol::Udp
        } else if ty == Type::STREAM {
            Protocol::Tcp
        } else {
            Protocol::Other
        })
    }

    fn local_addr(&self, handle: SocketHandle) -> io::Result<Option<SocketAddr>> {
        Ok(borrow(handle)?.local_addr()?.as_socket())
    }

    fn bind(&self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()> {
        borrow(handle)?.bind(&SockAddr::from(addr))
    }

    fn shutdown(&self, handle: SocketHandle) -> io::Result<()> {
        borrow(handle)?.shutdown(Shutdown::Both)
    }

    fn io_mode(&self, handle: SocketHandle) -> io::Result<IoMode> {
        let socket = borrow(handle)?;
        // SAFETY: F_GETFL only reads descriptor flags.
        let flags = unsafe { libc::fcntl(handle.raw(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(IoMode {
            nonblocking: flags & libc::O_NONBLOCK != 0,
            recv_timeout: socket.read_timeout()?,
            send_timeout: socket.write_timeout()?,
        })
    }
}
