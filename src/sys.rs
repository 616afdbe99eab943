//! Unix stream socket plumbing.
//!
//! Thin wrappers over the `libc` calls the endpoints need, returning
//! [`io::Result`] and handing out [`OwnedFd`] so every descriptor is closed
//! exactly once. All sockets are created non-blocking and close-on-exec.
//!
//! # Message boundaries
//!
//! There is no length prefix on the wire. A writer performs one
//! [`write_message`] per message and the reader drains whatever is readable
//! with [`ReceiveBuffer::read_message`], growing its buffer until a read comes
//! back short or would block. That pair only works because readiness is
//! level-triggered and peers are serviced one at a time.

// Rust guideline compliant 2026-02

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn unix_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path contains a NUL byte",
        ));
    }
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket path too long: {}", path.display()),
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

// ─── Sockets ───────────────────────────────────────────────────────────────

/// Create a non-blocking, close-on-exec `AF_UNIX` stream socket.
pub fn stream_socket() -> io::Result<OwnedFd> {
    // SAFETY: socket() takes no pointers.
    let fd = cvt(unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;
    // SAFETY: fd was just returned by socket() and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Connect `fd` to the socket at `path`.
pub fn connect(fd: &OwnedFd, path: &Path) -> io::Result<()> {
    let (addr, len) = unix_addr(path)?;
    // SAFETY: addr is a valid sockaddr_un and len does not exceed its size.
    cvt(unsafe {
        libc::connect(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
            len,
        )
    })?;
    Ok(())
}

/// Remove any stale file at `path`, then bind `fd` there and listen.
pub fn bind_listen(fd: &OwnedFd, path: &Path, backlog: i32) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("[sys] removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let (addr, len) = unix_addr(path)?;
    // SAFETY: addr is a valid sockaddr_un and len does not exceed its size.
    cvt(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
            len,
        )
    })?;
    // SAFETY: listen() takes no pointers.
    cvt(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(())
}

/// Accept one pending connection as a non-blocking, close-on-exec socket.
pub fn accept(listener: RawFd) -> io::Result<OwnedFd> {
    loop {
        // SAFETY: null address pointers are allowed when the peer address is unwanted.
        let ret = unsafe {
            libc::accept4(
                listener,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        match cvt(ret) {
            // SAFETY: fd was just returned by accept4() and is owned by nobody else.
            Ok(fd) => return Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Shut down both directions of `fd` without closing it.
pub fn shutdown(fd: RawFd) -> io::Result<()> {
    // SAFETY: shutdown() takes no pointers.
    cvt(unsafe { libc::shutdown(fd, libc::SHUT_RDWR) })?;
    Ok(())
}

// ─── Message I/O ───────────────────────────────────────────────────────────

/// Write one message to `fd`.
///
/// Interrupted writes are retried. A write that would block ends the call
/// early and the byte count so far is returned, which may be short of
/// `bytes.len()` (or zero). Callers that need the whole message on the wire
/// must compare the count themselves.
pub fn write_message(fd: RawFd, bytes: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < bytes.len() {
        let rest = &bytes[written..];
        // SAFETY: rest points to rest.len() initialised bytes.
        let n = unsafe {
            libc::send(
                fd,
                rest.as_ptr().cast::<libc::c_void>(),
                rest.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(written),
                _ => return Err(err),
            }
        }
        written += n as usize;
    }
    Ok(written)
}

/// Result of draining a readable socket.
#[derive(Debug)]
pub enum ReadOutcome<'a> {
    /// One complete message.
    Message(&'a [u8]),
    /// The peer closed the connection.
    Closed,
    /// Readiness was spurious; nothing was read.
    WouldBlock,
    /// A fatal read error.
    Error(io::Error),
}

/// Growable read buffer.
///
/// Capacity doubles whenever a read fills the remaining space, so a message
/// of any size is read in one call. The buffer never shrinks.
#[derive(Debug)]
pub struct ReceiveBuffer {
    buf: Vec<u8>,
}

impl ReceiveBuffer {
    /// Create a buffer with `capacity` bytes (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)],
        }
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Read everything currently available on `fd` as one message.
    pub fn read_message(&mut self, fd: RawFd) -> ReadOutcome<'_> {
        let mut offset = 0;
        loop {
            let space = self.buf.len() - offset;
            // SAFETY: the destination range lies entirely inside self.buf.
            let n = unsafe {
                libc::read(
                    fd,
                    self.buf[offset..].as_mut_ptr().cast::<libc::c_void>(),
                    space,
                )
            };

            if n == 0 {
                return ReadOutcome::Closed;
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock if offset == 0 => ReadOutcome::WouldBlock,
                    io::ErrorKind::WouldBlock => ReadOutcome::Message(&self.buf[..offset]),
                    _ => ReadOutcome::Error(err),
                };
            }

            let n = n as usize;
            if n >= space {
                offset += n;
                let doubled = self.buf.len() * 2;
                self.buf.resize(doubled, 0);
                continue;
            }

            return ReadOutcome::Message(&self.buf[..offset + n]);
        }
    }
}
