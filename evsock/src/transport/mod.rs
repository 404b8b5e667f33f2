//! The asynchronous I/O provider an [`AsyncSocket`](crate::AsyncSocket)
//! issues its operations against.
//!
//! A [`SocketHandle`] wraps exactly one OS-level, connection-oriented socket.
//! Synchronous operations (`bind`, `listen`, `shutdown`, ...) return their
//! result directly. Asynchronous operations (`begin_*`) either fail to be
//! issued, returning `Err` immediately, or return `Ok(())` and later invoke
//! their completion callback exactly once from a provider thread.
//!
//! # Buffer ownership
//!
//! Receives take the destination region by value and hand it back with the
//! result, the way completion-based I/O APIs return their buffers:
//!
//! ```ignore
//! handle.begin_receive(vec![0; 1024], MsgFlags::NONE, Box::new(|(res, region)| {
//!     let n = res.unwrap_or(0);
//!     println!("{:?}", &region[..n]);
//! }))?;
//! ```
//!
//! Providers:
//! - [`sys::SysSocket`]: real TCP/IP sockets (`socket2` + a shared `poll(2)`
//!   reactor).
//! - [`crate::test_utils::MockSocket`]: scripted, for deterministic tests.

pub(crate) mod pool;
pub(crate) mod reactor;
pub mod sys;

use std::{
  fmt,
  net::{Shutdown, SocketAddr},
  ops::BitOr,
  sync::Arc,
};

use socket2::{Domain, Protocol, Type};

use crate::error::TransportError;

/// Completion of [`SocketHandle::begin_accept`]: the accepted connection.
pub type AcceptCallback =
  Box<dyn FnOnce(Result<Arc<dyn SocketHandle>, TransportError>) + Send>;

pub type ConnectCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Completion of [`SocketHandle::begin_send`]: bytes actually sent.
pub type SendCallback = Box<dyn FnOnce(Result<usize, TransportError>) + Send>;

/// Result of a receive together with the region it was received into.
///
/// `Ok(0)` signals an orderly close by the peer.
pub type RecvResult = (Result<usize, TransportError>, Vec<u8>);

pub type RecvCallback = Box<dyn FnOnce(RecvResult) + Send>;

/// Address family, socket type and protocol of a handle.
///
/// Kept so a replacement handle can be created with the same parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSpec {
  pub domain: Domain,
  pub ty: Type,
  pub protocol: Option<Protocol>,
}

impl SocketSpec {
  pub const fn new(domain: Domain, ty: Type, protocol: Option<Protocol>) -> Self {
    Self { domain, ty, protocol }
  }

  pub const fn tcp_v4() -> Self {
    Self::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
  }

  pub const fn tcp_v6() -> Self {
    Self::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
  }

  /// A TCP socket description able to reach `addr`.
  pub fn tcp_for(addr: SocketAddr) -> Self {
    match addr {
      SocketAddr::V4(_) => Self::tcp_v4(),
      SocketAddr::V6(_) => Self::tcp_v6(),
    }
  }
}

/// Flags passed to send and receive calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgFlags(libc::c_int);

impl MsgFlags {
  pub const NONE: Self = Self(0);
  /// Process out-of-band data.
  pub const OOB: Self = Self(libc::MSG_OOB);
  /// Peek at incoming data without consuming it.
  pub const PEEK: Self = Self(libc::MSG_PEEK);
  /// Send without using routing tables.
  pub const DONT_ROUTE: Self = Self(libc::MSG_DONTROUTE);

  pub const fn bits(self) -> libc::c_int {
    self.0
  }

  pub const fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }
}

impl BitOr for MsgFlags {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    Self(self.0 | rhs.0)
  }
}

/// One OS-level socket, driven asynchronously.
pub trait SocketHandle: Send + Sync + fmt::Debug {
  fn spec(&self) -> SocketSpec;

  fn bind(&self, addr: SocketAddr) -> Result<(), TransportError>;

  fn listen(&self, backlog: i32) -> Result<(), TransportError>;

  fn begin_accept(&self, on_done: AcceptCallback) -> Result<(), TransportError>;

  fn begin_connect(
    &self,
    addr: SocketAddr,
    on_done: ConnectCallback,
  ) -> Result<(), TransportError>;

  fn begin_send(
    &self,
    data: Vec<u8>,
    flags: MsgFlags,
    on_done: SendCallback,
  ) -> Result<(), TransportError>;

  fn begin_receive(
    &self,
    region: Vec<u8>,
    flags: MsgFlags,
    on_done: RecvCallback,
  ) -> Result<(), TransportError>;

  fn shutdown(&self, how: Shutdown) -> Result<(), TransportError>;

  /// Closes the connection while keeping the handle reusable, where the
  /// platform supports it.
  fn disconnect(&self) -> Result<(), TransportError>;

  /// Releases the handle. Outstanding operations complete with
  /// [`TransportError::Aborted`].
  fn close(&self);

  /// Creates a brand-new handle with the same [`SocketSpec`].
  fn reopen(&self) -> Result<Arc<dyn SocketHandle>, TransportError>;

  fn is_connected(&self) -> bool;

  fn local_addr(&self) -> Option<SocketAddr>;

  fn peer_addr(&self) -> Option<SocketAddr>;
}
