//! Request framing on top of [`Sender`].

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{RequestError, Result};
use crate::protocol;
use crate::sender::{LostConnectionHandler, ReplyCallback, Sender};
use crate::value::{PodCodec, Value, ValueCodec};

/// Classify raw reply bytes.
///
/// An empty slice means the connection was lost before the reply arrived.
pub fn finish(codec: &dyn ValueCodec, bytes: &[u8]) -> std::result::Result<Value, RequestError> {
    if bytes.is_empty() {
        return Err(RequestError::ConnectionLost);
    }
    if protocol::is_reply_error(codec, bytes) {
        return match protocol::parse_reply_error(codec, bytes) {
            Some(msg) => Err(RequestError::Remote(msg)),
            None => Err(RequestError::InvalidReply),
        };
    }
    protocol::parse_reply_ok(codec, bytes).ok_or(RequestError::InvalidReply)
}

fn warn_lost_connection(fd: RawFd) {
    log::warn!("[client] lost connection with server {fd}");
}

/// Request/reply client.
pub struct Client {
    sender: Sender,
    codec: Arc<dyn ValueCodec>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client for `path` with the default [`PodCodec`].
    ///
    /// With `connect`, a failed initial connection is logged and the client
    /// is still returned; call [`Client::connect`] to retry.
    pub fn new(path: impl AsRef<Path>, config: &Config, connect: bool) -> Result<Self> {
        Self::with_codec(path, config, Arc::new(PodCodec), None, connect)
    }

    /// Create a client with a custom codec and lost-connection handler.
    ///
    /// Without a handler, a lost connection is logged as a warning.
    pub fn with_codec(
        path: impl AsRef<Path>,
        config: &Config,
        codec: Arc<dyn ValueCodec>,
        on_lost: Option<LostConnectionHandler>,
        connect: bool,
    ) -> Result<Self> {
        let on_lost = on_lost.unwrap_or_else(|| Box::new(warn_lost_connection));
        let sender = Sender::new(path, config, Some(on_lost))?;
        let mut client = Self { sender, codec };
        if connect {
            if let Err(e) = client.connect() {
                log::warn!(
                    "[client] could not connect to {}: {e}",
                    client.sender.path().display()
                );
            }
        }
        Ok(client)
    }

    /// Connect (or reconnect after a loss).
    pub fn connect(&mut self) -> Result<()> {
        self.sender.connect()
    }

    /// Disconnect, failing outstanding requests with an empty payload.
    pub fn disconnect(&mut self) {
        self.sender.disconnect();
    }

    /// True while connected.
    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    /// Number of requests awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.sender.pending_len()
    }

    /// The value codec used for frames.
    pub fn codec(&self) -> &Arc<dyn ValueCodec> {
        &self.codec
    }

    /// Send request `name` with `args`; `reply` receives the raw reply bytes.
    ///
    /// Pass the bytes to [`Client::send_request_finish`] (or [`finish`]) to
    /// decode them.
    pub fn send_request<F>(&mut self, name: &str, args: &Value, reply: F) -> Result<()>
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        let frame = protocol::build_request(&*self.codec, name, args)?;
        let reply: ReplyCallback = Box::new(reply);
        self.sender.send(&frame, Some(reply))
    }

    /// Decode raw reply bytes with this client's codec.
    pub fn send_request_finish(&self, bytes: &[u8]) -> std::result::Result<Value, RequestError> {
        let result = finish(&*self.codec, bytes);
        if let Err(RequestError::Remote(msg)) = &result {
            log::info!("[client] request failed: {msg}");
        }
        result
    }

    /// Send a request and hand the decoded reply to `done`.
    pub fn call<F>(&mut self, name: &str, args: &Value, done: F) -> Result<()>
    where
        F: FnOnce(std::result::Result<Value, RequestError>) + Send + 'static,
    {
        let codec = Arc::clone(&self.codec);
        self.send_request(name, args, move |bytes| done(finish(&*codec, bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_ok() {
        let codec = PodCodec;
        let bytes = protocol::build_reply_ok(&codec, &Value::Int(42)).unwrap();
        assert_eq!(finish(&codec, &bytes), Ok(Value::Int(42)));
    }

    #[test]
    fn test_finish_remote_error() {
        let codec = PodCodec;
        let bytes = protocol::build_reply_error(&codec, "request handler not found").unwrap();
        let err = finish(&codec, &bytes).unwrap_err();
        assert_eq!(err.message(), Some("request handler not found"));
    }

    #[test]
    fn test_finish_empty_is_connection_lost() {
        assert_eq!(finish(&PodCodec, &[]), Err(RequestError::ConnectionLost));
    }

    #[test]
    fn test_finish_garbage_is_invalid() {
        let codec = PodCodec;
        let reply = finish(&codec, b"garbage!");
        assert_eq!(reply, Err(RequestError::InvalidReply));
        let request = protocol::build_request(&codec, "ping", &Value::None).unwrap();
        assert_eq!(finish(&codec, &request), Err(RequestError::InvalidReply));
    }

    #[test]
    fn test_new_without_server_still_returns_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let mut client = Client::new(path, &Config::default(), true).unwrap();
        assert!(!client.is_connected());
        let err = client.send_request("ping", &Value::None, |_| {}).unwrap_err();
        assert!(matches!(err, crate::Error::NotConnected));
        assert_eq!(client.pending_len(), 0);
    }
}
