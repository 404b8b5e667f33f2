//! Connection states and the error taxonomy attached to every transition.
//!
//! ```text
//!            bind            listen
//!  Closed ─────────▶ Bound ─────────▶ Listening
//!    │  ▲              │
//!    │  │  connect     │ connect
//!    │  │              ▼
//!    │  └──────── Connecting ──success──▶ Connected
//!    │                                        │
//!    └◀──────────── close / failure ◀─────────┘
//! ```
//!
//! Every state may fall back to [`ConnectionState::Closed`]; the engine owns
//! the only code path that performs a transition.

use std::fmt;

/// The lifecycle state of an [`AsyncSocket`](crate::AsyncSocket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
  /// No connection; the initial state and the state after any reset.
  #[default]
  Closed,
  /// Bound to a local endpoint.
  Bound,
  /// Accepting incoming connections.
  Listening,
  /// An asynchronous connect has been issued and has not completed yet.
  Connecting,
  /// Connected to a peer; the receive loop is running.
  Connected,
}

impl ConnectionState {
  /// `bind` is allowed without a forced close only from `Closed`.
  pub fn can_bind(self) -> bool {
    self == Self::Closed
  }

  /// `listen` and `connect` are allowed without a forced close from
  /// `Closed` and `Bound`.
  pub fn can_listen(self) -> bool {
    matches!(self, Self::Closed | Self::Bound)
  }

  pub fn can_connect(self) -> bool {
    self.can_listen()
  }
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Closed => "closed",
      Self::Bound => "bound",
      Self::Listening => "listening",
      Self::Connecting => "connecting",
      Self::Connected => "connected",
    };
    f.write_str(name)
  }
}

/// Classification attached to a state transition.
///
/// Non-error transitions carry [`ErrorKind::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
  #[default]
  None,
  /// The local side closed the connection.
  LocalClose,
  /// The peer closed the connection, or a receive could not be armed.
  RemoteClose,
  /// The endpoint could not be bound or listened on.
  EndpointUnavailable,
  /// The underlying socket is disposed or failed at the transport level.
  SocketUnavailable,
  /// The operation was denied by the operating system.
  ResourceInaccessible,
  /// The operation is not valid in the socket's current configuration.
  InvalidOperation,
  /// The buffer arguments were missing or out of range.
  BufferUnavailable,
  /// An asynchronous connect did not complete successfully.
  OperationTimedOut,
  Unknown,
  /// Never produced; kept so the taxonomy stays stable for callers.
  PortInUse,
}

impl ErrorKind {
  pub fn is_error(self) -> bool {
    self != Self::None
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::None => "none",
      Self::LocalClose => "local close",
      Self::RemoteClose => "remote close",
      Self::EndpointUnavailable => "endpoint unavailable",
      Self::SocketUnavailable => "socket unavailable",
      Self::ResourceInaccessible => "resource inaccessible",
      Self::InvalidOperation => "invalid operation",
      Self::BufferUnavailable => "buffer unavailable",
      Self::OperationTimedOut => "operation timed out",
      Self::Unknown => "unknown",
      Self::PortInUse => "port in use",
    };
    f.write_str(name)
  }
}

/// When a transition notifies `StateChanged` subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPolicy {
  /// Notify only when the new state differs from the previous one.
  IfChanged,
  Always,
  Never,
}

impl NotifyPolicy {
  pub(crate) fn should_notify(
    self,
    previous: ConnectionState,
    current: ConnectionState,
  ) -> bool {
    match self {
      Self::Always => true,
      Self::IfChanged => previous != current,
      Self::Never => false,
    }
  }
}
