//! Dedicated readiness loop thread.
//!
//! # Architecture
//!
//! ```text
//! owner thread                         loop thread
//! ────────────                         ───────────
//! EventLoop::new(primary, handler)
//!   epoll_create1 + eventfd
//!   register primary + eventfd
//! EventLoop::start() ───spawn───────►  loop {
//!                                        epoll_wait(-1)
//!                                        primary ready ─► handler.on_primary()
//!                                        other fd ready ─► handler.on_other()
//!                                        eventfd == 1  ─► break
//!                                      }
//! EventLoop::stop()  ──write(1)──────►  (wakes, exits, returns handler)
//!   join ◄──────────────────────────────┘
//! ```
//!
//! The handler moves into the thread on `start` and comes back on `stop`, so
//! the loop can be restarted. Extra fds (accepted peers) are only registered
//! and deregistered from inside the handler callbacks, through the [`Poller`]
//! they receive.

// Rust guideline compliant 2026-02

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Maximum readiness events handled per wakeup.
const MAX_EVENTS: usize = 128;

/// Value written to the wake fd to request exit.
const STOP: u64 = 1;

/// Callbacks run on the loop thread.
pub trait LoopHandler: Send + 'static {
    /// The primary fd is readable.
    fn on_primary(&mut self, poller: &Poller, fd: RawFd);

    /// Some other registered fd is readable.
    fn on_other(&mut self, _poller: &Poller, fd: RawFd) {
        log::debug!("[event-loop] ignoring readiness on fd {fd}");
    }
}

// ─── Poller ────────────────────────────────────────────────────────────────

/// The epoll set plus its private wake eventfd.
#[derive(Debug)]
pub struct Poller {
    epoll: OwnedFd,
    wake: OwnedFd,
}

impl Poller {
    fn new() -> io::Result<Self> {
        // SAFETY: eventfd() takes no pointers.
        let wake = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: wake was just returned by eventfd() and is owned by nobody else.
        let wake = unsafe { OwnedFd::from_raw_fd(wake) };

        // SAFETY: epoll_create1() takes no pointers.
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll was just returned by epoll_create1() and is owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let poller = Self { epoll, wake };
        poller.add(poller.wake.as_raw_fd())?;
        Ok(poller)
    }

    /// Watch `fd` for readability (level-triggered).
    pub fn add(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        // SAFETY: event is a valid epoll_event for the duration of the call.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                &mut event,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Stop watching `fd`.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: a null event pointer is allowed for EPOLL_CTL_DEL.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn signal_stop(&self) -> io::Result<()> {
        let value = STOP.to_ne_bytes();
        // SAFETY: value is 8 initialised bytes, the size eventfd expects.
        let n = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                value.as_ptr().cast::<libc::c_void>(),
                value.len(),
            )
        };
        if n != value.len() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Consume the wake counter; true when it asks the loop to exit.
    fn take_stop(&self) -> bool {
        let mut value = [0u8; 8];
        // SAFETY: value has room for the 8 bytes eventfd returns.
        let n = unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                value.as_mut_ptr().cast::<libc::c_void>(),
                value.len(),
            )
        };
        n == value.len() as isize && u64::from_ne_bytes(value) == STOP
    }
}

fn run<H: LoopHandler>(poller: &Poller, primary: RawFd, mut handler: H) -> H {
    let wake = poller.wake.as_raw_fd();
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

    loop {
        // SAFETY: events has room for MAX_EVENTS entries.
        let n = unsafe {
            libc::epoll_wait(
                poller.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                -1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("[event-loop] failed to wait for events: {err}");
            }
            continue;
        }

        let mut exit = false;
        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            if fd == primary {
                handler.on_primary(poller, fd);
            } else if fd == wake {
                exit |= poller.take_stop();
            } else {
                handler.on_other(poller, fd);
            }
        }
        if exit {
            return handler;
        }
    }
}

// ─── EventLoop ─────────────────────────────────────────────────────────────

/// One loop thread watching a primary fd.
///
/// Dropping a running loop stops it first. The primary fd itself is owned by
/// the caller and must outlive the loop.
pub struct EventLoop<H: LoopHandler> {
    name: &'static str,
    poller: Arc<Poller>,
    primary: RawFd,
    handler: Option<H>,
    thread: Option<JoinHandle<H>>,
}

impl<H: LoopHandler> EventLoop<H> {
    /// Create the epoll set and wake fd and register `primary`.
    ///
    /// `name` labels the loop thread.
    pub fn new(name: &'static str, primary: RawFd, handler: H) -> io::Result<Self> {
        let poller = Poller::new()?;
        poller.add(primary)?;
        Ok(Self {
            name,
            poller: Arc::new(poller),
            primary,
            handler: Some(handler),
            thread: None,
        })
    }

    /// Spawn the loop thread. No-op if already running.
    pub fn start(&mut self) -> io::Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let handler = self
            .handler
            .take()
            .ok_or_else(|| io::Error::other("event loop handler was lost"))?;
        let poller = Arc::clone(&self.poller);
        let primary = self.primary;

        let thread = thread::Builder::new()
            .name(format!("reqsock-{}", self.name))
            .spawn(move || run(&poller, primary, handler))?;
        self.thread = Some(thread);
        log::debug!("[event-loop] {} started on fd {primary}", self.name);
        Ok(())
    }

    /// Wake the loop thread and join it. No-op if not running.
    ///
    /// Must not be called from the loop thread itself.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            log::error!(
                "[event-loop] {} stop requested from its own thread",
                self.name
            );
            self.thread = Some(thread);
            return;
        }
        if let Err(e) = self.poller.signal_stop() {
            log::error!("[event-loop] {} could not signal stop: {e}", self.name);
            self.thread = Some(thread);
            return;
        }
        match thread.join() {
            Ok(handler) => self.handler = Some(handler),
            Err(_) => log::error!("[event-loop] {} loop thread panicked", self.name),
        }
        log::debug!("[event-loop] {} stopped", self.name);
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// The handler, while the loop is stopped.
    pub fn handler(&self) -> Option<&H> {
        self.handler.as_ref()
    }

    /// Mutable handler, while the loop is stopped.
    pub fn handler_mut(&mut self) -> Option<&mut H> {
        self.handler.as_mut()
    }
}

impl<H: LoopHandler> std::fmt::Debug for EventLoop<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<H: LoopHandler> Drop for EventLoop<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::{self, ReadOutcome, ReceiveBuffer};
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn socket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: socketpair writes exactly two valid FDs into `fds` on success.
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0, "socketpair: {}", io::Error::last_os_error());
        // SAFETY: both fds are fresh and owned by nobody else.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    /// Forwards every message to a channel, tagged with which callback saw it.
    struct Forward {
        buf: ReceiveBuffer,
        tx: mpsc::Sender<(&'static str, Vec<u8>)>,
        extra: Option<OwnedFd>,
        count: usize,
    }

    impl Forward {
        fn new(tx: mpsc::Sender<(&'static str, Vec<u8>)>) -> Self {
            Self {
                buf: ReceiveBuffer::new(16),
                tx,
                extra: None,
                count: 0,
            }
        }

        fn forward(&mut self, tag: &'static str, fd: RawFd) {
            if let ReadOutcome::Message(bytes) = self.buf.read_message(fd) {
                self.count += 1;
                let _ = self.tx.send((tag, bytes.to_vec()));
            }
        }
    }

    impl LoopHandler for Forward {
        fn on_primary(&mut self, poller: &Poller, fd: RawFd) {
            self.forward("primary", fd);
            if let Some(extra) = &self.extra {
                poller.add(extra.as_raw_fd()).unwrap();
            }
        }

        fn on_other(&mut self, _poller: &Poller, fd: RawFd) {
            self.forward("other", fd);
        }
    }

    #[test]
    fn test_primary_readiness_dispatches() {
        let (a, b) = socket_pair();
        let (tx, rx) = mpsc::channel();
        let mut event_loop = EventLoop::new("test", b.as_raw_fd(), Forward::new(tx)).unwrap();
        event_loop.start().unwrap();
        assert!(event_loop.is_running());

        sys::write_message(a.as_raw_fd(), b"hi").unwrap();
        let got = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(got, ("primary", b"hi".to_vec()));

        event_loop.stop();
        assert!(!event_loop.is_running());
        assert_eq!(event_loop.handler().unwrap().count, 1);
    }

    #[test]
    fn test_restart_after_stop() {
        let (a, b) = socket_pair();
        let (tx, rx) = mpsc::channel();
        let mut event_loop = EventLoop::new("test", b.as_raw_fd(), Forward::new(tx)).unwrap();

        for round in 0..3u8 {
            event_loop.start().unwrap();
            sys::write_message(a.as_raw_fd(), &[round]).unwrap();
            assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().1, vec![round]);
            event_loop.stop();
        }
        assert_eq!(event_loop.handler().unwrap().count, 3);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let (_a, b) = socket_pair();
        let (tx, _rx) = mpsc::channel();
        let mut event_loop = EventLoop::new("test", b.as_raw_fd(), Forward::new(tx)).unwrap();
        event_loop.stop();
        event_loop.stop();
        assert!(event_loop.handler().is_some());
    }

    #[test]
    fn test_fds_added_from_callback_dispatch_to_other() {
        let (a, b) = socket_pair();
        let (c, d) = socket_pair();
        let (tx, rx) = mpsc::channel();
        let mut handler = Forward::new(tx);
        handler.extra = Some(d);

        let mut event_loop = EventLoop::new("test", b.as_raw_fd(), handler).unwrap();
        event_loop.start().unwrap();

        sys::write_message(a.as_raw_fd(), b"first").unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().0, "primary");

        sys::write_message(c.as_raw_fd(), b"second").unwrap();
        let got = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(got, ("other", b"second".to_vec()));
    }

    #[test]
    fn test_drop_stops_running_loop() {
        let (_a, b) = socket_pair();
        let (tx, rx) = mpsc::channel();
        let mut event_loop = EventLoop::new("test", b.as_raw_fd(), Forward::new(tx)).unwrap();
        event_loop.start().unwrap();
        drop(event_loop);
        // The handler (and its channel sender) went away with the thread.
        assert!(rx.recv_timeout(TIMEOUT).is_err());
    }
}
