//! Client-side connection with FIFO reply correlation.
//!
//! # Architecture
//!
//! ```text
//! owner thread                    loop thread
//! ────────────                    ───────────
//! send(bytes, cb)
//!   pending.push(cb)  ──────┐
//!   write(bytes)            │
//!                           ▼
//!                   ┌──────────────┐   reply bytes
//!                   │ PendingQueue │ ◄─ pop_front ─── read_message(socket)
//!                   └──────────────┘
//!                           │ connection lost
//!                           └──► drain: every cb(&[]) in send order
//! ```
//!
//! The wire carries no request ids. Each inbound message is the reply to the
//! oldest outstanding request, which holds because the receiver answers one
//! request at a time over an in-order byte stream.
//!
//! `send` takes `&mut self`, so requests are queued from one owning thread at
//! a time. The queue itself is shared with the loop thread behind a mutex.

use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandler, Poller};
use crate::sys::{self, ReadOutcome, ReceiveBuffer};

/// Called once with the reply bytes, or with an empty slice if the
/// connection went away first.
pub type ReplyCallback = Box<dyn FnOnce(&[u8]) + Send>;

/// Called on the loop thread when the server side closes the connection.
pub type LostConnectionHandler = Box<dyn FnMut(RawFd) + Send>;

// ─── PendingQueue ──────────────────────────────────────────────────────────

/// Bounded FIFO of reply callbacks.
pub(crate) struct PendingQueue {
    entries: VecDeque<(u64, ReplyCallback)>,
    capacity: usize,
    next_ticket: u64,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_ticket: 0,
        }
    }

    /// Enqueue `cb`, returning a ticket for [`PendingQueue::cancel`].
    pub(crate) fn push(&mut self, cb: ReplyCallback) -> Result<u64> {
        if self.entries.len() >= self.capacity {
            return Err(Error::QueueFull(self.capacity));
        }
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.entries.push_back((ticket, cb));
        Ok(ticket)
    }

    pub(crate) fn pop_front(&mut self) -> Option<ReplyCallback> {
        self.entries.pop_front().map(|(_, cb)| cb)
    }

    /// Remove the newest entry if it is still `ticket`.
    pub(crate) fn cancel(&mut self, ticket: u64) -> Option<ReplyCallback> {
        match self.entries.back() {
            Some((t, _)) if *t == ticket => self.entries.pop_back().map(|(_, cb)| cb),
            _ => None,
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<ReplyCallback> {
        self.entries.drain(..).map(|(_, cb)| cb).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ─── Shared state ──────────────────────────────────────────────────────────

struct Shared {
    connected: AtomicBool,
    lost: AtomicBool,
    pending: Mutex<PendingQueue>,
    on_lost: Mutex<Option<LostConnectionHandler>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingQueue> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every outstanding request with an empty payload, oldest first.
    fn drain_pending(&self) {
        let callbacks = self.pending().drain();
        if !callbacks.is_empty() {
            log::info!("[sender] draining {} pending request(s)", callbacks.len());
        }
        for cb in callbacks {
            cb(&[]);
        }
    }
}

struct SenderLoop {
    shared: Arc<Shared>,
    buffer: ReceiveBuffer,
}

impl SenderLoop {
    fn connection_lost(&mut self, poller: &Poller, fd: RawFd) {
        if let Err(e) = poller.remove(fd) {
            log::debug!("[sender] could not deregister fd {fd}: {e}");
        }
        if let Err(e) = sys::shutdown(fd) {
            log::debug!("[sender] shutdown of fd {fd} failed: {e}");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.lost.store(true, Ordering::SeqCst);

        let mut on_lost = self
            .shared
            .on_lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = on_lost.as_mut() {
            handler(fd);
        }
        drop(on_lost);

        self.shared.drain_pending();
    }
}

impl LoopHandler for SenderLoop {
    fn on_primary(&mut self, poller: &Poller, fd: RawFd) {
        let lost = match self.buffer.read_message(fd) {
            ReadOutcome::Message(bytes) => {
                let cb = self.shared.pending().pop_front();
                match cb {
                    Some(cb) => cb(bytes),
                    None => log::warn!(
                        "[sender] dropping {} byte message with no pending request",
                        bytes.len()
                    ),
                }
                false
            }
            ReadOutcome::WouldBlock => false,
            ReadOutcome::Closed => true,
            ReadOutcome::Error(e) => {
                log::error!("[sender] could not read reply: {e}");
                true
            }
        };
        if lost {
            self.connection_lost(poller, fd);
        }
    }
}

// ─── Sender ────────────────────────────────────────────────────────────────

/// One outgoing connection to a receiver.
pub struct Sender {
    event_loop: EventLoop<SenderLoop>,
    socket: OwnedFd,
    shared: Arc<Shared>,
    path: PathBuf,
    buffer_size: usize,
}

impl Sender {
    /// Resolve `path` and create an unconnected socket and loop.
    pub fn new(
        path: impl AsRef<Path>,
        config: &Config,
        on_lost: Option<LostConnectionHandler>,
    ) -> Result<Self> {
        if config.buffer_size == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "receive buffer size must be non-zero",
            )));
        }
        let path = crate::path::resolve(path)?;
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            pending: Mutex::new(PendingQueue::new(config.pending_capacity)),
            on_lost: Mutex::new(on_lost),
        });
        let socket = sys::stream_socket()?;
        let event_loop = Self::new_loop(&socket, &shared, config.buffer_size)?;

        Ok(Self {
            event_loop,
            socket,
            shared,
            path,
            buffer_size: config.buffer_size,
        })
    }

    fn new_loop(
        socket: &OwnedFd,
        shared: &Arc<Shared>,
        buffer_size: usize,
    ) -> Result<EventLoop<SenderLoop>> {
        let handler = SenderLoop {
            shared: Arc::clone(shared),
            buffer: ReceiveBuffer::new(buffer_size),
        };
        Ok(EventLoop::new("sender", socket.as_raw_fd(), handler)?)
    }

    /// The resolved socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connect and start the loop thread. No-op if already connected.
    ///
    /// After a lost connection or a [`Sender::disconnect`] the socket and
    /// loop are recreated first. Failure leaves the sender retryable.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        if self.shared.lost.load(Ordering::SeqCst) {
            self.event_loop.stop();
            let socket = sys::stream_socket()?;
            let event_loop = Self::new_loop(&socket, &self.shared, self.buffer_size)?;
            // Old loop must go before its socket.
            self.event_loop = event_loop;
            self.socket = socket;
            self.shared.lost.store(false, Ordering::SeqCst);
        }

        if let Err(e) = sys::connect(&self.socket, &self.path) {
            // Start over with a fresh socket next time.
            self.shared.lost.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        if let Err(e) = self.event_loop.start() {
            self.shared.connected.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        log::info!("[sender] connected to {}", self.path.display());
        Ok(())
    }

    /// Stop the loop and shut the socket down in both directions.
    ///
    /// Outstanding requests are drained with an empty payload. The lost
    /// connection handler is not called.
    pub fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }
        self.event_loop.stop();
        if let Err(e) = sys::shutdown(self.socket.as_raw_fd()) {
            log::debug!("[sender] shutdown failed: {e}");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.lost.store(true, Ordering::SeqCst);
        self.shared.drain_pending();
        log::info!("[sender] disconnected from {}", self.path.display());
    }

    /// True while connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    /// Write `bytes` as one message.
    ///
    /// With a `reply` callback the request is queued for the next inbound
    /// message; if the queue is full nothing is written. The callback is
    /// removed again if the write fails outright.
    ///
    /// An `Err` does not guarantee the callback never runs. If the loop
    /// thread notices the lost connection between the enqueue and the failed
    /// write, it drains the queue first, so the callback fires with an empty
    /// payload and `send` still returns the write error.
    ///
    /// A write cut short by backpressure still counts as sent.
    pub fn send(&mut self, bytes: &[u8], reply: Option<ReplyCallback>) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::EmptyMessage);
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let ticket = match reply {
            Some(cb) => Some(self.shared.pending().push(cb)?),
            None => None,
        };

        let rollback = |shared: &Shared| {
            if let Some(ticket) = ticket {
                shared.pending().cancel(ticket);
            }
        };

        match sys::write_message(self.socket.as_raw_fd(), bytes) {
            Ok(0) => {
                rollback(&self.shared);
                Err(Error::WriteFailed)
            }
            Ok(n) => {
                if n < bytes.len() {
                    log::warn!("[sender] short write: {n} of {} bytes", bytes.len());
                }
                Ok(())
            }
            Err(e) => {
                rollback(&self.shared);
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("path", &self.path)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.disconnect();
        self.event_loop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recorder(tx: &mpsc::Sender<(usize, Vec<u8>)>, id: usize) -> ReplyCallback {
        let tx = tx.clone();
        Box::new(move |bytes: &[u8]| {
            let _ = tx.send((id, bytes.to_vec()));
        })
    }

    #[test]
    fn test_queue_is_fifo() {
        let (tx, rx) = mpsc::channel();
        let mut queue = PendingQueue::new(4);
        for id in 0..3 {
            queue.push(recorder(&tx, id)).unwrap();
        }
        while let Some(cb) = queue.pop_front() {
            cb(b"r");
        }
        let order: Vec<usize> = rx.try_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_queue_full_is_rejected_without_change() {
        let (tx, _rx) = mpsc::channel();
        let mut queue = PendingQueue::new(2);
        queue.push(recorder(&tx, 0)).unwrap();
        queue.push(recorder(&tx, 1)).unwrap();
        let err = queue.push(recorder(&tx, 2)).unwrap_err();
        assert!(matches!(err, Error::QueueFull(2)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_cancel_only_removes_newest_matching_ticket() {
        let (tx, _rx) = mpsc::channel();
        let mut queue = PendingQueue::new(4);
        let first = queue.push(recorder(&tx, 0)).unwrap();
        let second = queue.push(recorder(&tx, 1)).unwrap();

        assert!(queue.cancel(first).is_none());
        assert_eq!(queue.len(), 2);
        assert!(queue.cancel(second).is_some());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_keeps_order_and_empties() {
        let (tx, rx) = mpsc::channel();
        let mut queue = PendingQueue::new(8);
        for id in 0..5 {
            queue.push(recorder(&tx, id)).unwrap();
        }
        for cb in queue.drain() {
            cb(&[]);
        }
        assert_eq!(queue.len(), 0);
        let seen: Vec<(usize, Vec<u8>)> = rx.try_iter().collect();
        assert_eq!(seen, (0..5).map(|id| (id, Vec::new())).collect::<Vec<_>>());
    }

    #[test]
    fn test_send_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = Sender::new(dir.path().join("nobody"), &Config::default(), None).unwrap();
        assert!(!sender.is_connected());
        assert!(matches!(sender.send(b"x", None), Err(Error::NotConnected)));
        assert!(matches!(sender.send(b"", None), Err(Error::EmptyMessage)));
        assert!(sender.connect().is_err());
        assert!(!sender.is_connected());
        assert_eq!(sender.pending_len(), 0);
    }

    #[test]
    fn test_zero_buffer_size_is_rejected() {
        let config = Config::default().with_buffer_size(0);
        assert!(Sender::new("/tmp/reqsock-unused", &config, None).is_err());
    }
}
