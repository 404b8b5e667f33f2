use std::{fmt, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;

use crate::{error::TransportError, transport::SocketHandle};

type Accepted = Result<Arc<dyn SocketHandle>, TransportError>;

/// A connection accepted by a listening socket, waiting to be claimed with
/// [`AsyncSocket::accept`](crate::AsyncSocket::accept).
///
/// Delivered by the `ConnectionRequested` event. Clones refer to the same
/// pending connection; it can be claimed once. If every clone is dropped
/// without claiming it, the connection is closed.
#[derive(Clone)]
pub struct AcceptToken(Arc<PendingAccept>);

struct PendingAccept {
  slot: Mutex<Option<Accepted>>,
}

impl AcceptToken {
  pub(crate) fn new(accepted: Accepted) -> Self {
    Self(Arc::new(PendingAccept { slot: Mutex::new(Some(accepted)) }))
  }

  /// Takes the accepted handle. `None` if the accept failed or the token was
  /// already claimed.
  pub(crate) fn claim(&self) -> Option<Arc<dyn SocketHandle>> {
    match self.0.slot.lock().take()? {
      Ok(handle) => Some(handle),
      Err(err) => {
        tracing::debug!(%err, "accept completed with an error");
        None
      }
    }
  }

  /// Closes the pending connection without claiming it.
  pub(crate) fn reject(&self) {
    if let Some(Ok(handle)) = self.0.slot.lock().take() {
      handle.close();
    }
  }

  pub fn is_claimed(&self) -> bool {
    self.0.slot.lock().is_none()
  }

  /// Whether the accept itself failed.
  pub fn is_failed(&self) -> bool {
    matches!(*self.0.slot.lock(), Some(Err(_)))
  }

  pub fn peer_addr(&self) -> Option<SocketAddr> {
    match &*self.0.slot.lock() {
      Some(Ok(handle)) => handle.peer_addr(),
      _ => None,
    }
  }
}

impl fmt::Debug for AcceptToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AcceptToken")
      .field("claimed", &self.is_claimed())
      .field("failed", &self.is_failed())
      .finish()
  }
}

impl Drop for PendingAccept {
  fn drop(&mut self) {
    if let Some(Ok(handle)) = self.slot.get_mut().take() {
      tracing::warn!(peer = ?handle.peer_addr(), "accepted connection never claimed, closing it");
      handle.close();
    }
  }
}
