#![cfg_attr(docsrs, feature(doc_cfg))]

//! # evsock - Event-Driven Sockets
//!
//! evsock wraps a connection-oriented socket in a small state machine and
//! reports everything that happens to it through events, so application code
//! reacts to "connection requested", "data received", "data sent" and "state
//! changed" instead of driving blocking I/O itself.
//!
//! ## Lifecycle
//!
//! ```text
//! Closed ─bind─▶ Bound ─listen─▶ Listening
//!   │              │
//!   └──connect─────┴──▶ Connecting ─▶ Connected
//! ```
//!
//! Any failure, an explicit [`AsyncSocket::close`] or the peer going away
//! returns the socket to [`ConnectionState::Closed`]. A closed socket is
//! immediately usable again: it has already swapped in a fresh OS handle.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use evsock::{AsyncSocket, ConnectionState};
//!
//! // Sockets close when their last clone is dropped, so keep accepted
//! // connections somewhere.
//! let connections = Arc::new(Mutex::new(Vec::new()));
//!
//! let server = AsyncSocket::tcp_v4().unwrap();
//! let accepted = connections.clone();
//! server.on_connection_requested(move |server, token| {
//!     if let Some(conn) = server.accept(token) {
//!         conn.on_data_received(|conn, buf| {
//!             // Echo back.
//!             conn.send(buf.as_slice());
//!         });
//!         accepted.lock().unwrap().push(conn);
//!     }
//! });
//! server.bind("127.0.0.1:7000".parse().unwrap());
//! server.listen();
//!
//! let client = AsyncSocket::tcp_v4().unwrap();
//! client.on_state_changed(|client, change| {
//!     if change.current == ConnectionState::Connected {
//!         client.send(b"ping");
//!     }
//! });
//! client.connect("127.0.0.1:7000".parse().unwrap());
//! ```
//!
//! ## Threading
//!
//! Public operations never block. Accepts and receives are re-armed by
//! timers after each completion, with a configurable delay (see
//! [`SocketConfig`]). Event handlers run synchronously, in registration
//! order, on whichever thread produced the event: the caller of a public
//! operation or a thread of the crate's elastic worker pool. Timer ticks and
//! transport completions both run on the pool, never on the single timer or
//! reactor thread, so a handler that blocks delays only its own socket. No
//! lock is held while a handler runs, so handlers may call back into the
//! socket.
//!
//! ## Error Handling
//!
//! Operations report failure by returning `false` and transitioning to
//! `Closed` with an [`ErrorKind`] describing the cause. Transport failures
//! are mapped onto [`ErrorKind`] in one place, [`classify`].

pub mod buf;
pub mod config;
pub mod error;
pub mod event;
mod socket;
pub mod state;
mod timer;
pub mod transport;

#[doc(hidden)]
pub mod test_utils;

pub use buf::Buffer;
pub use config::{ConfigError, SocketConfig, SocketConfigBuilder};
pub use error::{OpKind, TransportError, classify};
pub use event::{EventKind, StateChanged, Subscription};
pub use socket::{AcceptToken, AsyncSocket};
pub use state::{ConnectionState, ErrorKind, NotifyPolicy};
pub use timer::MIN_INTERVAL;
pub use transport::{MsgFlags, SocketHandle, SocketSpec, sys::SysSocket};
