//! Transport failures and their mapping onto [`ErrorKind`].
//!
//! Providers report failures as [`TransportError`]. The engine never lets
//! them escape its public surface: each one is passed through [`classify`]
//! together with the [`OpKind`] that produced it, and the resulting
//! [`ErrorKind`] accompanies the transition to `Closed`.

use std::io;

use crate::state::ErrorKind;

/// A failure reported by a [`SocketHandle`](crate::transport::SocketHandle).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  /// The handle was closed before or while the operation ran.
  #[error("socket handle is closed")]
  Disposed,

  /// The operation was cut short because the handle was closed under it.
  #[error("operation aborted by handle close")]
  Aborted,

  /// A required argument (address, payload) was missing.
  #[error("missing argument: {0}")]
  MissingArgument(&'static str),

  /// Offset or length fall outside of the supplied buffer.
  #[error("buffer range {offset}..{offset}+{len} exceeds {capacity} bytes")]
  OutOfRange { offset: usize, len: usize, capacity: usize },

  /// The handle is not in a state that permits the operation.
  #[error("invalid operation: {0}")]
  InvalidOperation(&'static str),

  #[error("operation not supported: {0}")]
  NotSupported(&'static str),

  #[error("permission denied")]
  PermissionDenied,

  /// Socket-level failure from the operating system.
  #[error("socket error: {0}")]
  Io(#[from] io::Error),

  #[error("{0}")]
  Other(String),
}

impl TransportError {
  /// Lifts an [`io::Error`] into the most specific variant.
  pub fn from_io(err: io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::PermissionDenied => Self::PermissionDenied,
      io::ErrorKind::Unsupported => Self::NotSupported("unsupported by platform"),
      _ => Self::Io(err),
    }
  }

  /// Whether the failure came from the handle being closed under the
  /// operation rather than from the peer or the OS.
  pub fn is_handle_closed(&self) -> bool {
    matches!(self, Self::Disposed | Self::Aborted)
  }
}

/// The engine operation a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
  Bind,
  Listen,
  Accept,
  Connect,
  Send,
  Receive,
}

/// Maps a transport failure observed during `op` onto the error taxonomy.
///
/// Socket-level failures are classified by the operation that saw them:
/// binding and listening blame the endpoint, everything else blames the
/// socket. Receive failures are always reported as a remote close.
pub fn classify(op: OpKind, err: &TransportError) -> ErrorKind {
  use TransportError as E;

  if op == OpKind::Receive {
    return ErrorKind::RemoteClose;
  }

  match (op, err) {
    (_, E::Disposed | E::Aborted) => ErrorKind::SocketUnavailable,
    (OpKind::Bind | OpKind::Connect, E::MissingArgument(_)) => {
      ErrorKind::EndpointUnavailable
    }
    (_, E::MissingArgument(_) | E::OutOfRange { .. }) => {
      ErrorKind::BufferUnavailable
    }
    (_, E::InvalidOperation(_) | E::NotSupported(_)) => {
      ErrorKind::InvalidOperation
    }
    (_, E::PermissionDenied) => ErrorKind::ResourceInaccessible,
    (OpKind::Bind | OpKind::Listen, E::Io(_)) => ErrorKind::EndpointUnavailable,
    (_, E::Io(_)) => ErrorKind::SocketUnavailable,
    (_, E::Other(_)) => ErrorKind::Unknown,
  }
}
