//! C ABI
//!
//! `wg_*` functions with the libc signatures of the calls they replace. They
//! route through the interceptor installed with [`install`]; with nothing
//! installed every call goes straight to the OS. Failures return -1 and set
//! `errno`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use libc::{c_int, c_void, size_t, sockaddr, socklen_t, ssize_t};
use socket2::SockAddr;
use tracing::info;

use crate::interceptor::Interceptor;
use crate::socket::{MsgFlags, OsSockets, SocketApi, SocketHandle};

static INSTALLED: ArcSwapOption<Interceptor<OsSockets>> = ArcSwapOption::const_empty();

/// Route the C ABI through `interceptor`
///
/// Replaces any previously installed interceptor and tears it down.
pub fn install(interceptor: Arc<Interceptor<OsSockets>>) {
    info!("Installing interceptor for the C ABI");
    if let Some(previous) = INSTALLED.swap(Some(interceptor)) {
        previous.teardown();
    }
}

/// Remove the installed interceptor, returning it
///
/// Calls made afterwards pass straight through to the OS.
pub fn uninstall() -> Option<Arc<Interceptor<OsSockets>>> {
    INSTALLED.swap(None)
}

/// Whether an interceptor is installed
pub fn is_installed() -> bool {
    INSTALLED.load().is_some()
}

fn with_api<T>(call: impl FnOnce(&dyn SocketApi) -> io::Result<T>) -> io::Result<T> {
    let installed = INSTALLED.load_full();
    match installed.as_deref() {
        Some(interceptor) => call(interceptor),
        None => call(&OsSockets::new()),
    }
}

fn set_errno(code: i32) {
    // SAFETY: __errno_location returns the calling thread's errno slot.
    unsafe {
        *libc::__errno_location() = code;
    }
}

fn fail(err: &io::Error) -> c_int {
    set_errno(err.raw_os_error().unwrap_or(libc::EIO));
    -1
}

fn fail_len(err: &io::Error) -> ssize_t {
    set_errno(err.raw_os_error().unwrap_or(libc::EIO));
    -1
}

fn finish_len(result: io::Result<usize>) -> ssize_t {
    match result {
        Ok(n) => ssize_t::try_from(n).unwrap_or(ssize_t::MAX),
        Err(e) => fail_len(&e),
    }
}

/// Read a C socket address
///
/// # Safety
///
/// `addr` must point to `len` readable bytes.
unsafe fn read_sockaddr(addr: *const sockaddr, len: socklen_t) -> io::Result<SocketAddr> {
    if addr.is_null() {
        return Err(io::Error::from_raw_os_error(libc::EFAULT));
    }
    let size = len as usize;
    if size > std::mem::size_of::<libc::sockaddr_storage>() {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    let ((), parsed) = SockAddr::try_init(|storage, storage_len| {
        std::ptr::copy_nonoverlapping(addr.cast::<u8>(), storage.cast::<u8>(), size);
        *storage_len = len;
        Ok(())
    })?;
    parsed
        .as_socket()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EAFNOSUPPORT))
}

/// Write a socket address into a caller buffer, truncating like the kernel
///
/// # Safety
///
/// `out` and `out_len` must be null or valid; `*out_len` is the buffer size.
unsafe fn write_sockaddr(addr: Option<SocketAddr>, out: *mut sockaddr, out_len: *mut socklen_t) {
    if out.is_null() || out_len.is_null() {
        return;
    }
    let Some(addr) = addr else {
        *out_len = 0;
        return;
    };
    let encoded = SockAddr::from(addr);
    let n = (*out_len as usize).min(encoded.len() as usize);
    std::ptr::copy_nonoverlapping(encoded.as_ptr().cast::<u8>(), out.cast::<u8>(), n);
    *out_len = encoded.len();
}

/// Byte slice from a C buffer; a null pointer is only valid with length 0
///
/// # Safety
///
/// `buf` must point to `len` readable bytes.
unsafe fn in_buf<'a>(buf: *const c_void, len: size_t) -> io::Result<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if buf.is_null() {
        return Err(io::Error::from_raw_os_error(libc::EFAULT));
    }
    Ok(std::slice::from_raw_parts(buf.cast::<u8>(), len))
}

/// # Safety
///
/// `buf` must point to `len` writable bytes.
unsafe fn out_buf<'a>(buf: *mut c_void, len: size_t) -> io::Result<&'a mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if buf.is_null() {
        return Err(io::Error::from_raw_os_error(libc::EFAULT));
    }
    Ok(std::slice::from_raw_parts_mut(buf.cast::<u8>(), len))
}

/// `connect(2)`
///
/// # Safety
///
/// `addr` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn wg_connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let result = read_sockaddr(addr, len).and_then(|addr| with_api(|api| api.connect(SocketHandle(fd), addr)));
    match result {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}

/// `send(2)`
///
/// # Safety
///
/// `buf` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn wg_send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    finish_len(in_buf(buf, len).and_then(|data| with_api(|api| api.send(SocketHandle(fd), data, MsgFlags(flags)))))
}

/// `recv(2)`
///
/// # Safety
///
/// `buf` must point to `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn wg_recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    finish_len(out_buf(buf, len).and_then(|data| with_api(|api| api.recv(SocketHandle(fd), data, MsgFlags(flags)))))
}

/// `sendto(2)`; a null `addr` behaves like `send`
///
/// # Safety
///
/// `buf` must point to `len` readable bytes and `addr`, when non-null, to
/// `addr_len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn wg_sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addr_len: socklen_t,
) -> ssize_t {
    let dest = if addr.is_null() {
        None
    } else {
        match read_sockaddr(addr, addr_len) {
            Ok(dest) => Some(dest),
            Err(e) => return fail_len(&e),
        }
    };
    finish_len(in_buf(buf, len).and_then(|data| {
        with_api(|api| api.send_to(SocketHandle(fd), data, MsgFlags(flags), dest))
    }))
}

/// `recvfrom(2)`
///
/// # Safety
///
/// `buf` must point to `len` writable bytes; `addr`/`addr_len` must be null
/// or valid, with `*addr_len` holding the size of `addr`.
#[no_mangle]
pub unsafe extern "C" fn wg_recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addr_len: *mut socklen_t,
) -> ssize_t {
    let result = out_buf(buf, len).and_then(|data| with_api(|api| api.recv_from(SocketHandle(fd), data, MsgFlags(flags))));
    match result {
        Ok((n, source)) => {
            write_sockaddr(source, addr, addr_len);
            ssize_t::try_from(n).unwrap_or(ssize_t::MAX)
        }
        Err(e) => fail_len(&e),
    }
}

/// `close(2)`
#[no_mangle]
pub extern "C" fn wg_close(fd: c_int) -> c_int {
    match with_api(|api| api.close(SocketHandle(fd))) {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}
