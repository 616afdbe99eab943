//! Named request dispatch on top of [`Receiver`].
//!
//! Each inbound message is decoded as a request frame and routed by exact
//! name to a registered handler, which answers through a [`Responder`].
//!
//! # Locking
//!
//! The handler table and the peer handler share one mutex, and a handler
//! runs with that mutex held. Every peer is serviced by the same loop
//! thread, so a handler that blocks stalls the whole server, and a handler
//! that calls back into [`Server::set_request_handler`] deadlocks.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol;
use crate::receiver::{PeerState, Receiver, ReceiverEvents};
use crate::sys;
use crate::value::{PodCodec, Value, ValueCodec};

/// Reply sent when a message does not decode as a request.
pub const PARSE_ERROR: &str = "could not parse request";

/// Reply sent when no handler matches the request name.
pub const NOT_FOUND_ERROR: &str = "request handler not found";

/// Request handler: `(responder, name, args) -> handled`.
///
/// Must answer with exactly one of [`Responder::reply_ok`] or
/// [`Responder::reply_error`]. The return value is only logged; no
/// additional reply is sent either way.
pub type RequestHandler = Box<dyn FnMut(&Responder<'_>, &str, &Value) -> bool + Send>;

/// Peer connect/disconnect notification.
pub type PeerHandler = Box<dyn FnMut(RawFd, PeerState) + Send>;

// ─── Responder ─────────────────────────────────────────────────────────────

/// Writes replies to one peer.
pub struct Responder<'a> {
    codec: &'a dyn ValueCodec,
    peer: RawFd,
}

impl<'a> Responder<'a> {
    fn new(codec: &'a dyn ValueCodec, peer: RawFd) -> Self {
        Self { codec, peer }
    }

    /// The peer's socket fd.
    pub fn peer_fd(&self) -> RawFd {
        self.peer
    }

    /// Answer with a successful reply.
    pub fn reply_ok(&self, value: &Value) -> Result<()> {
        let frame = protocol::build_reply_ok(self.codec, value)?;
        write_frame(self.peer, &frame)
    }

    /// Answer with an error reply.
    pub fn reply_error(&self, msg: &str) -> Result<()> {
        let frame = protocol::build_reply_error(self.codec, msg)?;
        write_frame(self.peer, &frame)
    }
}

impl std::fmt::Debug for Responder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn write_frame(peer: RawFd, frame: &[u8]) -> Result<()> {
    let n = sys::write_message(peer, frame)?;
    if n != frame.len() {
        return Err(Error::WriteFailed);
    }
    Ok(())
}

// ─── Handler table ─────────────────────────────────────────────────────────

struct HandlerTable {
    entries: Vec<(String, RequestHandler)>,
    capacity: usize,
}

impl HandlerTable {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    fn insert(&mut self, name: &str, handler: RequestHandler) -> Result<()> {
        if self.entries.iter().any(|(n, _)| n == name) {
            return Err(Error::DuplicateHandler(name.to_owned()));
        }
        if self.entries.len() >= self.capacity {
            return Err(Error::HandlerTableFull(self.capacity));
        }
        self.entries.push((name.to_owned(), handler));
        Ok(())
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        self.entries.len() != before
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut RequestHandler> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, h)| h)
    }
}

struct Registry {
    peer_handler: Option<PeerHandler>,
    handlers: HandlerTable,
}

struct Shared {
    codec: Arc<dyn ValueCodec>,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ServerEvents {
    shared: Arc<Shared>,
}

impl ReceiverEvents for ServerEvents {
    fn peer_state(&mut self, peer: RawFd, state: PeerState) {
        log::info!("[server] peer {peer} {state}");
        let mut registry = self.shared.registry();
        if let Some(handler) = registry.peer_handler.as_mut() {
            handler(peer, state);
        }
    }

    fn handle_message(&mut self, peer: RawFd, bytes: &[u8]) -> bool {
        log::info!("[server] message from peer {peer}");
        let responder = Responder::new(&*self.shared.codec, peer);

        let Some((name, args)) = protocol::parse_request(&*self.shared.codec, bytes) else {
            log::warn!("[server] could not parse request from peer {peer}");
            return responder.reply_error(PARSE_ERROR).is_ok();
        };

        let mut registry = self.shared.registry();
        if let Some(handler) = registry.handlers.get_mut(&name) {
            return handler(&responder, &name, &args);
        }

        log::warn!("[server] no handler for request {name:?}");
        responder.reply_error(NOT_FOUND_ERROR).is_ok()
    }
}

// ─── Server ────────────────────────────────────────────────────────────────

/// Request/reply server.
pub struct Server {
    receiver: Receiver<ServerEvents>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind at `path` with the default [`PodCodec`], optionally starting the loop.
    pub fn new(path: impl AsRef<Path>, config: &Config, start: bool) -> Result<Self> {
        Self::with_codec(path, config, Arc::new(PodCodec), start)
    }

    /// Bind at `path` with a custom value codec.
    pub fn with_codec(
        path: impl AsRef<Path>,
        config: &Config,
        codec: Arc<dyn ValueCodec>,
        start: bool,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            codec,
            registry: Mutex::new(Registry {
                peer_handler: None,
                handlers: HandlerTable::new(config.handler_capacity),
            }),
        });
        let events = ServerEvents {
            shared: Arc::clone(&shared),
        };
        let mut receiver = Receiver::new(path, config, events)?;
        if start {
            if let Err(e) = receiver.start() {
                log::error!("[server] failed to start receiver: {e}");
                return Err(e);
            }
        }
        Ok(Self { receiver, shared })
    }

    /// Start servicing peers.
    pub fn start(&mut self) -> Result<()> {
        self.receiver.start()
    }

    /// Stop the loop thread.
    pub fn stop(&mut self) {
        self.receiver.stop();
    }

    /// True while the loop thread runs.
    pub fn is_running(&self) -> bool {
        self.receiver.is_running()
    }

    /// The resolved socket path.
    pub fn path(&self) -> &Path {
        self.receiver.path()
    }

    /// The value codec used for frames.
    pub fn codec(&self) -> &Arc<dyn ValueCodec> {
        &self.shared.codec
    }

    /// Install the peer connect/disconnect handler, replacing any previous one.
    pub fn set_peer_handler<F>(&self, handler: F)
    where
        F: FnMut(RawFd, PeerState) + Send + 'static,
    {
        self.shared.registry().peer_handler = Some(Box::new(handler));
    }

    /// Remove the peer handler.
    pub fn clear_peer_handler(&self) {
        self.shared.registry().peer_handler = None;
    }

    /// Register `handler` for requests named `name`.
    ///
    /// Fails without changing anything if the name is taken or the table is
    /// full.
    pub fn set_request_handler<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: FnMut(&Responder<'_>, &str, &Value) -> bool + Send + 'static,
    {
        self.shared
            .registry()
            .handlers
            .insert(name, Box::new(handler))
    }

    /// Unregister the handler for `name`. Returns whether one was removed.
    pub fn clear_request_handler(&self, name: &str) -> bool {
        self.shared.registry().handlers.remove(name)
    }

    /// Number of registered request handlers.
    pub fn handler_count(&self) -> usize {
        self.shared.registry().handlers.entries.len()
    }

    /// Send a successful reply to `peer_fd`.
    pub fn reply_ok(&self, peer_fd: RawFd, value: &Value) -> Result<()> {
        Responder::new(&*self.shared.codec, peer_fd).reply_ok(value)
    }

    /// Send an error reply to `peer_fd`.
    pub fn reply_error(&self, peer_fd: RawFd, msg: &str) -> Result<()> {
        Responder::new(&*self.shared.codec, peer_fd).reply_error(msg)
    }
}
