//! reqsock - local request/reply messaging over Unix domain sockets.
//!
//! A control process and any number of peers exchange named requests and
//! correlated replies over a local stream socket. Every endpoint owns one
//! dedicated epoll thread that performs all of its socket I/O.
//!
//! # Architecture
//!
//! ```text
//! Client ──► Sender ──► EventLoop ──┐               ┌── EventLoop ◄── Receiver ◄── Server
//!            (FIFO of reply cbs)    │  Unix socket  │   (accept, peers)   (handler table)
//!                                   └───────────────┘
//! ```
//!
//! - **Sender / Client** - connect, send requests, match replies in send order
//! - **Receiver / Server** - listen, accept peers, dispatch requests by name
//! - **EventLoop** - one thread per endpoint blocked in `epoll_wait`
//!
//! # Modules
//!
//! - [`path`] - socket path resolution
//! - [`value`] - the pluggable value model and its default codec
//! - [`protocol`] - request and reply frames
//! - [`sys`] - socket syscalls and the grow-read buffer
//! - [`event_loop`] - the loop thread
//! - [`sender`], [`client`] - the connecting side
//! - [`receiver`], [`server`] - the listening side
//! - [`config`], [`logging`], [`error`] - runtime configuration and diagnostics

pub mod client;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod path;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod sys;
pub mod value;

// Re-export commonly used types
pub use client::Client;
pub use config::{Config, LogLevel};
pub use error::{Error, RequestError, Result};
pub use receiver::{Echo, PeerState, Receiver, ReceiverEvents};
pub use sender::Sender;
pub use server::{Responder, Server};
pub use value::{PodCodec, Value, ValueCodec};
