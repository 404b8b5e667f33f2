//! Publish/subscribe registry for socket events.
//!
//! Each event kind keeps its subscribers in registration order. Delivery is
//! synchronous: handlers run on whichever thread produced the event (the
//! caller of a public operation or a worker pool thread), one after another,
//! in the order they were registered. The
//! registry lock is not held while handlers run, so a handler may call back
//! into the socket, subscribe, or unsubscribe.
//!
//! Handlers receive the emitting socket as their first argument and should
//! not capture an owning clone of it, which would keep it alive forever.

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{
  buf::Buffer,
  socket::{AcceptToken, AsyncSocket},
  state::{ConnectionState, ErrorKind},
};

/// Payload of the `StateChanged` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChanged {
  pub previous: ConnectionState,
  pub current: ConnectionState,
  pub error: ErrorKind,
}

/// Identifies a registered handler; pass it to
/// [`AsyncSocket::unsubscribe`] to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
  kind: EventKind,
  id: u64,
}

impl Subscription {
  pub fn kind(&self) -> EventKind {
    self.kind
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  StateChanged,
  ConnectionRequested,
  DataReceived,
  DataSent,
}

type Handler<E> = Arc<dyn Fn(&AsyncSocket, &E) + Send + Sync>;

struct Subscribers<E: ?Sized> {
  kind: EventKind,
  handlers: Mutex<Vec<(u64, Handler<E>)>>,
}

impl<E: ?Sized> Subscribers<E> {
  fn new(kind: EventKind) -> Self {
    Self { kind, handlers: Mutex::new(Vec::new()) }
  }

  fn push(&self, id: u64, handler: Handler<E>) -> Subscription {
    self.handlers.lock().push((id, handler));
    Subscription { kind: self.kind, id }
  }

  fn remove(&self, id: u64) -> bool {
    let mut handlers = self.handlers.lock();
    let before = handlers.len();
    handlers.retain(|(handler_id, _)| *handler_id != id);
    handlers.len() != before
  }

  fn len(&self) -> usize {
    self.handlers.lock().len()
  }

  fn emit(&self, sender: &AsyncSocket, event: &E) {
    // Snapshot so handlers can (un)subscribe while being called.
    let snapshot: Vec<Handler<E>> =
      self.handlers.lock().iter().map(|(_, handler)| handler.clone()).collect();

    for handler in snapshot {
      handler(sender, event);
    }
  }

  fn clear(&self) {
    self.handlers.lock().clear();
  }
}

/// The four notification channels of a socket.
pub(crate) struct EventSink {
  next_id: AtomicU64,
  state_changed: Subscribers<StateChanged>,
  connection_requested: Subscribers<AcceptToken>,
  data_received: Subscribers<Buffer>,
  data_sent: Subscribers<usize>,
}

impl EventSink {
  pub(crate) fn new() -> Self {
    Self {
      next_id: AtomicU64::new(0),
      state_changed: Subscribers::new(EventKind::StateChanged),
      connection_requested: Subscribers::new(EventKind::ConnectionRequested),
      data_received: Subscribers::new(EventKind::DataReceived),
      data_sent: Subscribers::new(EventKind::DataSent),
    }
  }

  fn next_id(&self) -> u64 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }

  pub(crate) fn on_state_changed(
    &self,
    handler: Handler<StateChanged>,
  ) -> Subscription {
    self.state_changed.push(self.next_id(), handler)
  }

  pub(crate) fn on_connection_requested(
    &self,
    handler: Handler<AcceptToken>,
  ) -> Subscription {
    self.connection_requested.push(self.next_id(), handler)
  }

  pub(crate) fn on_data_received(
    &self,
    handler: Handler<Buffer>,
  ) -> Subscription {
    self.data_received.push(self.next_id(), handler)
  }

  pub(crate) fn on_data_sent(&self, handler: Handler<usize>) -> Subscription {
    self.data_sent.push(self.next_id(), handler)
  }

  pub(crate) fn unsubscribe(&self, subscription: Subscription) -> bool {
    match subscription.kind {
      EventKind::StateChanged => self.state_changed.remove(subscription.id),
      EventKind::ConnectionRequested => {
        self.connection_requested.remove(subscription.id)
      }
      EventKind::DataReceived => self.data_received.remove(subscription.id),
      EventKind::DataSent => self.data_sent.remove(subscription.id),
    }
  }

  pub(crate) fn subscriber_count(&self, kind: EventKind) -> usize {
    match kind {
      EventKind::StateChanged => self.state_changed.len(),
      EventKind::ConnectionRequested => self.connection_requested.len(),
      EventKind::DataReceived => self.data_received.len(),
      EventKind::DataSent => self.data_sent.len(),
    }
  }

  pub(crate) fn emit_state_changed(
    &self,
    sender: &AsyncSocket,
    event: &StateChanged,
  ) {
    self.state_changed.emit(sender, event);
  }

  pub(crate) fn emit_connection_requested(
    &self,
    sender: &AsyncSocket,
    token: &AcceptToken,
  ) {
    self.connection_requested.emit(sender, token);
  }

  pub(crate) fn emit_data_received(&self, sender: &AsyncSocket, buf: &Buffer) {
    self.data_received.emit(sender, buf);
  }

  pub(crate) fn emit_data_sent(&self, sender: &AsyncSocket, count: &usize) {
    self.data_sent.emit(sender, count);
  }

  pub(crate) fn clear(&self) {
    self.state_changed.clear();
    self.connection_requested.clear();
    self.data_received.clear();
    self.data_sent.clear();
  }
}
