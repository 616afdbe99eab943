//! Listening endpoint.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────── loop thread ────────────┐
//! listener readable ──► │ accept4 ─► poller.add(peer)          │
//!                       │          ─► events.peer_state(Connected)
//! peer readable     ──► │ read_message(peer)                   │
//!                       │   message ─► events.handle_message() │
//!                       │   closed  ─► poller.remove, close,   │
//!                       │             peer_state(Disconnected) │
//!                       └──────────────────────────────────────┘
//! ```
//!
//! All peers share one [`ReceiveBuffer`]. That is sound because the loop
//! thread services one readable peer at a time and the message slice handed
//! to [`ReceiverEvents::handle_message`] does not outlive the call.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandler, Poller};
use crate::sys::{self, ReadOutcome, ReceiveBuffer};

/// Peer connection state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// A peer was accepted.
    Connected,
    /// A peer closed its connection (or failed a read) and was dropped.
    Disconnected,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Receiver callbacks, run on the loop thread.
pub trait ReceiverEvents: Send + 'static {
    /// A peer connected or disconnected.
    fn peer_state(&mut self, peer: RawFd, state: PeerState) {
        log::debug!("[receiver] peer {peer} {state}");
    }

    /// Handle one inbound message and reply on `peer`.
    ///
    /// Returns whether the reply was written. The default echoes `bytes`.
    fn handle_message(&mut self, peer: RawFd, bytes: &[u8]) -> bool {
        matches!(sys::write_message(peer, bytes), Ok(n) if n == bytes.len())
    }
}

/// Echoes every message back to its sender.
#[derive(Debug, Default)]
pub struct Echo;

impl ReceiverEvents for Echo {}

struct ReceiverLoop<E> {
    events: E,
    peers: HashMap<RawFd, OwnedFd>,
    buffer: ReceiveBuffer,
}

impl<E: ReceiverEvents> ReceiverLoop<E> {
    fn drop_peer(&mut self, poller: &Poller, fd: RawFd) {
        if let Err(e) = poller.remove(fd) {
            log::debug!("[receiver] could not deregister peer {fd}: {e}");
        }
        self.peers.remove(&fd);
        self.events.peer_state(fd, PeerState::Disconnected);
    }
}

impl<E: ReceiverEvents> LoopHandler for ReceiverLoop<E> {
    fn on_primary(&mut self, poller: &Poller, fd: RawFd) {
        let peer = match sys::accept(fd) {
            Ok(peer) => peer,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::error!("[receiver] accept failed: {e}");
                return;
            }
        };
        let peer_fd = peer.as_raw_fd();
        if let Err(e) = poller.add(peer_fd) {
            log::error!("[receiver] could not watch peer {peer_fd}: {e}");
            return;
        }
        self.peers.insert(peer_fd, peer);
        self.events.peer_state(peer_fd, PeerState::Connected);
    }

    fn on_other(&mut self, poller: &Poller, fd: RawFd) {
        if !self.peers.contains_key(&fd) {
            log::warn!("[receiver] readiness on unknown fd {fd}");
            return;
        }
        let closed = match self.buffer.read_message(fd) {
            ReadOutcome::Message(bytes) => {
                if !self.events.handle_message(fd, bytes) {
                    log::error!("[receiver] could not reply to peer {fd}");
                }
                false
            }
            ReadOutcome::WouldBlock => false,
            ReadOutcome::Closed => true,
            ReadOutcome::Error(e) => {
                log::error!("[receiver] could not read message from peer {fd}: {e}");
                true
            }
        };
        if closed {
            self.drop_peer(poller, fd);
        }
    }
}

/// A bound, listening socket with its loop thread.
///
/// Dropping the receiver stops the loop, closes every peer and the listener,
/// and removes the socket file.
pub struct Receiver<E: ReceiverEvents> {
    event_loop: EventLoop<ReceiverLoop<E>>,
    listener: OwnedFd,
    path: PathBuf,
}

impl<E: ReceiverEvents> Receiver<E> {
    /// Resolve `path`, replace any stale socket file there, bind and listen.
    ///
    /// The loop is not started.
    pub fn new(path: impl AsRef<Path>, config: &Config, events: E) -> Result<Self> {
        if config.buffer_size == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "receive buffer size must be non-zero",
            )));
        }
        let path = crate::path::resolve(path)?;
        let listener = sys::stream_socket()?;
        sys::bind_listen(&listener, &path, config.listen_backlog)?;

        let handler = ReceiverLoop {
            events,
            peers: HashMap::new(),
            buffer: ReceiveBuffer::new(config.buffer_size),
        };
        let event_loop = match EventLoop::new("receiver", listener.as_raw_fd(), handler) {
            Ok(event_loop) => event_loop,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };

        log::info!("[receiver] listening on {}", path.display());
        Ok(Self {
            event_loop,
            listener,
            path,
        })
    }

    /// Start accepting and servicing peers.
    pub fn start(&mut self) -> Result<()> {
        Ok(self.event_loop.start()?)
    }

    /// Stop the loop thread. Connected peers stay open.
    pub fn stop(&mut self) {
        self.event_loop.stop();
    }

    /// True while the loop thread runs.
    pub fn is_running(&self) -> bool {
        self.event_loop.is_running()
    }

    /// The resolved socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The event handler, while the loop is stopped.
    pub fn events(&self) -> Option<&E> {
        self.event_loop.handler().map(|h| &h.events)
    }

    /// Number of connected peers, while the loop is stopped.
    pub fn peer_count(&self) -> Option<usize> {
        self.event_loop.handler().map(|h| h.peers.len())
    }
}

impl<E: ReceiverEvents> std::fmt::Debug for Receiver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("path", &self.path)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<E: ReceiverEvents> Drop for Receiver<E> {
    fn drop(&mut self) {
        self.event_loop.stop();
        if let Some(handler) = self.event_loop.handler_mut() {
            handler.peers.clear();
        }
        log::debug!(
            "[receiver] closing listener {} at {}",
            self.listener.as_raw_fd(),
            self.path.display()
        );
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("[receiver] could not remove {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Recording {
        tx: mpsc::Sender<(RawFd, PeerState)>,
    }

    impl ReceiverEvents for Recording {
        fn peer_state(&mut self, peer: RawFd, state: PeerState) {
            let _ = self.tx.send((peer, state));
        }
    }

    fn connect(path: &Path) -> OwnedFd {
        let fd = sys::stream_socket().unwrap();
        sys::connect(&fd, path).unwrap();
        fd
    }

    fn read_blocking(fd: RawFd) -> Vec<u8> {
        let mut buf = ReceiveBuffer::new(64);
        let deadline = std::time::Instant::now() + TIMEOUT;
        loop {
            match buf.read_message(fd) {
                ReadOutcome::Message(bytes) => return bytes.to_vec(),
                ReadOutcome::WouldBlock if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => panic!("no reply: {other:?}"),
            }
        }
    }

    #[test]
    fn test_default_handler_echoes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo");
        let mut receiver = Receiver::new(path, &Config::default(), Echo).unwrap();
        receiver.start().unwrap();

        let client = connect(receiver.path());
        sys::write_message(client.as_raw_fd(), b"ping").unwrap();
        assert_eq!(read_blocking(client.as_raw_fd()), b"ping");
    }

    #[test]
    fn test_peer_state_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let path = dir.path().join("state");
        let mut receiver = Receiver::new(path, &Config::default(), Recording { tx }).unwrap();
        receiver.start().unwrap();

        let client = connect(receiver.path());
        let (fd, state) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(state, PeerState::Connected);

        drop(client);
        let got = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(got, (fd, PeerState::Disconnected));

        receiver.stop();
        assert_eq!(receiver.peer_count(), Some(0));
    }

    #[test]
    fn test_stale_file_is_replaced_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        std::fs::write(&path, b"leftover").unwrap();

        let receiver = Receiver::new(&path, &Config::default(), Echo).unwrap();
        assert!(!receiver.is_running());
        assert!(path.exists());
        drop(receiver);
        assert!(!path.exists());
    }

    #[test]
    fn test_stop_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = Receiver::new(dir.path().join("rs"), &Config::default(), Echo).unwrap();
        receiver.start().unwrap();
        assert!(receiver.is_running());
        receiver.stop();
        assert!(!receiver.is_running());
        receiver.start().unwrap();

        let client = connect(receiver.path());
        sys::write_message(client.as_raw_fd(), b"again").unwrap();
        assert_eq!(read_blocking(client.as_raw_fd()), b"again");
    }

    #[test]
    fn test_large_message_grows_shared_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().with_buffer_size(8);
        let mut receiver = Receiver::new(dir.path().join("big"), &config, Echo).unwrap();
        receiver.start().unwrap();

        let client = connect(receiver.path());
        let payload = vec![0x5a; 3000];
        sys::write_message(client.as_raw_fd(), &payload).unwrap();
        assert_eq!(read_blocking(client.as_raw_fd()), payload);
    }
}
