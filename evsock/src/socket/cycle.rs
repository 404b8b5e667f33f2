//! Re-arm timer ticks and transport completion handlers.
//!
//! A tick stops its timer and issues at most one operation, gated by the
//! matching guard. The completion clears the guard and, if the socket is
//! still in the state that loop belongs to, starts the timer again. Nothing
//! restarts a loop for a handle generation that has been replaced.

use std::sync::{Arc, atomic::Ordering};

use super::{AcceptToken, AsyncSocket};
use crate::{
  buf::Buffer,
  error::{OpKind, TransportError},
  state::{ConnectionState, ErrorKind, NotifyPolicy},
  transport::{RecvResult, SocketHandle},
};

impl AsyncSocket {
  pub(super) fn on_listen_tick(&self) {
    self.inner.listen_timer.stop();

    if self.inner.accepting.swap(true, Ordering::AcqRel) {
      tracing::trace!("accept still outstanding");
      return;
    }
    let Some((handle, generation)) = self.current() else {
      self.inner.accepting.store(false, Ordering::Release);
      return;
    };

    let weak = self.downgrade();
    let issued = handle.begin_accept(Box::new(move |res| {
      match Self::upgrade(&weak) {
        Some(socket) => socket.on_accept_done(generation, res),
        None => {
          if let Ok(accepted) = res {
            accepted.close();
          }
        }
      }
    }));

    if let Err(err) = issued {
      self.inner.accepting.store(false, Ordering::Release);
      self.fail_current(generation, OpKind::Accept, &err);
    }
  }

  fn on_accept_done(
    &self,
    generation: u64,
    res: Result<Arc<dyn SocketHandle>, TransportError>,
  ) {
    let listening = {
      let core = self.inner.core.lock();
      core.generation == generation && core.state == ConnectionState::Listening
    };
    let token = AcceptToken::new(res);

    if !listening {
      tracing::debug!("connection arrived after listening stopped, closing it");
      token.reject();
      self.inner.accepting.store(false, Ordering::Release);
      return;
    }

    tracing::debug!(peer = ?token.peer_addr(), "connection requested");
    self.inner.events.emit_connection_requested(self, &token);
    self.inner.accepting.store(false, Ordering::Release);
    self.restart_loop(generation, ConnectionState::Listening);
  }

  pub(super) fn on_connect_done(
    &self,
    generation: u64,
    res: Result<(), TransportError>,
  ) {
    if self.generation() != generation {
      tracing::debug!("connect completed on a replaced handle, ignoring");
      return;
    }

    match res {
      Ok(()) => {
        self.transition(ConnectionState::Connected, ErrorKind::None, NotifyPolicy::IfChanged);
        self.inner.receiving.store(false, Ordering::Release);
        self.restart_loop(generation, ConnectionState::Connected);
      }
      Err(err) => {
        tracing::debug!(%err, "connect failed");
        self.transition(
          ConnectionState::Closed,
          ErrorKind::OperationTimedOut,
          NotifyPolicy::IfChanged,
        );
      }
    }
  }

  pub(super) fn on_send_done(
    &self,
    generation: u64,
    res: Result<usize, TransportError>,
  ) {
    let count = res.unwrap_or_else(|err| {
      tracing::debug!(%err, "send failed");
      0
    });

    let connected = {
      let core = self.inner.core.lock();
      core.generation == generation && core.state == ConnectionState::Connected
    };
    if connected {
      self.inner.events.emit_data_sent(self, &count);
    } else {
      tracing::trace!(count, "send completed while not connected");
    }

    self.inner.sending.store(false, Ordering::Release);
  }

  pub(super) fn on_receive_tick(&self) {
    self.inner.receive_timer.stop();

    if self.inner.receiving.swap(true, Ordering::AcqRel) {
      tracing::trace!("receive still outstanding");
      return;
    }

    let issue = {
      let mut core = self.inner.core.lock();
      if core.disposed {
        None
      } else {
        let capacity = core.receive_capacity;
        // Never receive into a buffer an observer may still be reading.
        if core.buffer.available_len() > 0 || core.buffer.capacity() != capacity {
          core.buffer = Arc::new(Buffer::new(capacity));
        }
        let region = match Arc::get_mut(&mut core.buffer) {
          Some(buf) => buf.lend(),
          None => vec![0; capacity],
        };
        Some((core.handle.clone(), core.generation, core.receive_flags, region))
      }
    };
    let Some((handle, generation, flags, region)) = issue else {
      self.inner.receiving.store(false, Ordering::Release);
      return;
    };

    let weak = self.downgrade();
    let issued = handle.begin_receive(
      region,
      flags,
      Box::new(move |res| {
        if let Some(socket) = Self::upgrade(&weak) {
          socket.on_receive_done(generation, res);
        }
      }),
    );

    if let Err(err) = issued {
      self.inner.receiving.store(false, Ordering::Release);
      self.fail_current(generation, OpKind::Receive, &err);
    }
  }

  fn on_receive_done(&self, generation: u64, (res, region): RecvResult) {
    let received = res.unwrap_or_else(|err| {
      tracing::debug!(%err, "receive failed");
      0
    });

    let mut core = self.inner.core.lock();
    if core.generation != generation {
      drop(core);
      tracing::debug!("stale receive completion ignored");
      self.inner.receiving.store(false, Ordering::Release);
      return;
    }

    if received == 0 {
      restore_region(&mut core.buffer, region);
      drop(core);
      tracing::debug!("remote end closed the connection");
      self.inner.receiving.store(false, Ordering::Release);
      self.transition(ConnectionState::Closed, ErrorKind::RemoteClose, NotifyPolicy::IfChanged);
      return;
    }

    let data = if core.state == ConnectionState::Connected {
      let buf = Arc::new(Buffer::from_vec(region, received));
      core.buffer = buf.clone();
      Some(buf)
    } else {
      restore_region(&mut core.buffer, region);
      None
    };
    drop(core);

    if let Some(buf) = data {
      tracing::trace!(bytes = received, "data received");
      self.inner.events.emit_data_received(self, &buf);
    }
    self.inner.receiving.store(false, Ordering::Release);
    self.restart_loop(generation, ConnectionState::Connected);
  }

  /// Starts the timer driving `state`'s loop, if the socket is still in that
  /// state on the same handle.
  pub(super) fn restart_loop(&self, generation: u64, state: ConnectionState) {
    let core = self.inner.core.lock();
    if core.generation != generation || core.state != state {
      return;
    }
    match state {
      ConnectionState::Listening => self.inner.listen_timer.start(),
      ConnectionState::Connected => self.inner.receive_timer.start(),
      _ => {}
    }
  }
}

fn restore_region(buffer: &mut Arc<Buffer>, region: Vec<u8>) {
  if let Some(buf) = Arc::get_mut(buffer) {
    if buf.is_lent() {
      buf.restore(region);
    }
  }
}
