//! The event-driven socket engine.
//!
//! An [`AsyncSocket`] owns one transport handle at a time, a receive
//! [`Buffer`], the connection state, three operation guards and two re-arm
//! timers. Public calls never block: they issue a transport operation and
//! return, and results surface later as events.
//!
//! Every state change goes through a single transition routine. Entering
//! [`ConnectionState::Closed`] resets the engine before anyone is notified:
//! the handle is shut down and replaced by a brand-new one, the timers are
//! stopped, and the handle generation is bumped. Operations capture the
//! generation they were issued under, so a completion arriving for a
//! replaced handle is recognised as stale and ignored.

mod accept;
mod cycle;

pub use accept::AcceptToken;

use std::{
  fmt,
  net::{Shutdown, SocketAddr},
  sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};

use crate::{
  buf::Buffer,
  config::SocketConfig,
  error::{OpKind, TransportError, classify},
  event::{EventKind, EventSink, StateChanged, Subscription},
  state::{ConnectionState, ErrorKind, NotifyPolicy},
  timer::ReArmTimer,
  transport::{MsgFlags, SocketHandle, SocketSpec, pool, sys::SysSocket},
};

struct Core {
  state: ConnectionState,
  last_error: ErrorKind,
  handle: Arc<dyn SocketHandle>,
  generation: u64,
  buffer: Arc<Buffer>,
  receive_capacity: usize,
  receive_flags: MsgFlags,
  backlog: i32,
  disposed: bool,
}

pub(crate) struct Inner {
  core: Mutex<Core>,
  accepting: AtomicBool,
  sending: AtomicBool,
  receiving: AtomicBool,
  events: EventSink,
  listen_timer: ReArmTimer,
  receive_timer: ReArmTimer,
}

impl Inner {
  /// Puts the engine back into a connectable shape. Never fails.
  fn reset(&self, core: &mut Core) {
    let old = core.handle.clone();

    if let Err(err) = old.shutdown(Shutdown::Both) {
      tracing::trace!(%err, "shutdown during reset");
    }
    if let Err(err) = old.disconnect() {
      tracing::trace!(%err, "disconnect during reset");
    }

    self.listen_timer.stop();
    self.receive_timer.stop();

    let fresh = if core.disposed {
      None
    } else {
      match old.reopen() {
        Ok(handle) => Some(handle),
        Err(err) => {
          tracing::warn!(%err, "could not replace socket handle");
          None
        }
      }
    };

    old.close();
    if let Some(fresh) = fresh {
      core.handle = fresh;
    }
    core.generation = core.generation.wrapping_add(1);
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    self.core.get_mut().handle.close();
  }
}

/// An event-driven wrapper around one connection-oriented socket.
///
/// Cloning is cheap; clones drive the same socket. The underlying handle is
/// closed when [`dispose`](Self::dispose) is called or the last clone is
/// dropped.
///
/// ```no_run
/// use evsock::{AsyncSocket, ConnectionState};
///
/// let socket = AsyncSocket::tcp_v4().unwrap();
/// socket.on_state_changed(|_, change| {
///     if change.current == ConnectionState::Connected {
///         println!("connected");
///     }
/// });
/// socket.on_data_received(|_, buf| println!("got {:?}", buf.as_slice()));
/// socket.connect("127.0.0.1:7000".parse().unwrap());
/// ```
#[derive(Clone)]
pub struct AsyncSocket {
  inner: Arc<Inner>,
}

impl AsyncSocket {
  /// Wraps an existing transport handle.
  ///
  /// A handle that is already connected starts the engine in
  /// [`ConnectionState::Connected`] with its receive loop running.
  pub fn from_handle(handle: Arc<dyn SocketHandle>, config: SocketConfig) -> Self {
    let connected = handle.is_connected();

    let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
      let on_listen = weak.clone();
      let on_receive = weak.clone();

      Inner {
        core: Mutex::new(Core {
          state: ConnectionState::Closed,
          last_error: ErrorKind::None,
          handle,
          generation: 0,
          buffer: Arc::new(Buffer::new(config.receive_capacity())),
          receive_capacity: config.receive_capacity(),
          receive_flags: config.receive_flags(),
          backlog: config.backlog(),
          disposed: false,
        }),
        accepting: AtomicBool::new(false),
        sending: AtomicBool::new(false),
        receiving: AtomicBool::new(false),
        events: EventSink::new(),
        listen_timer: ReArmTimer::new("listen", config.listen_interval(), move || {
          if let Some(socket) = Self::upgrade(&on_listen) {
            socket.inner.listen_timer.stop();
            socket.hand_off(Self::on_listen_tick);
          }
        }),
        receive_timer: ReArmTimer::new("receive", config.receive_interval(), move || {
          if let Some(socket) = Self::upgrade(&on_receive) {
            socket.inner.receive_timer.stop();
            socket.hand_off(Self::on_receive_tick);
          }
        }),
      }
    });

    let socket = Self { inner };
    if connected {
      socket.transition(ConnectionState::Connected, ErrorKind::None, NotifyPolicy::Never);
      socket.inner.receiving.store(false, Ordering::Release);
      socket.inner.receive_timer.start();
    }
    socket
  }

  /// Creates a socket over a fresh OS handle.
  pub fn new(
    domain: Domain,
    ty: Type,
    protocol: Option<Protocol>,
  ) -> Result<Self, TransportError> {
    Self::with_config(SocketSpec::new(domain, ty, protocol), SocketConfig::default())
  }

  pub fn with_config(spec: SocketSpec, config: SocketConfig) -> Result<Self, TransportError> {
    let handle = SysSocket::with_spec(spec)?.into_handle();
    Ok(Self::from_handle(handle, config))
  }

  pub fn tcp_v4() -> Result<Self, TransportError> {
    Self::with_config(SocketSpec::tcp_v4(), SocketConfig::default())
  }

  pub fn tcp_v6() -> Result<Self, TransportError> {
    Self::with_config(SocketSpec::tcp_v6(), SocketConfig::default())
  }

  fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
    weak.upgrade().map(|inner| Self { inner })
  }

  /// Runs a timer tick on the worker pool, keeping the shared timer thread
  /// free of anything a handler might block on.
  fn hand_off(self, tick: fn(&AsyncSocket)) {
    let socket = self.clone();
    if let Err(err) = pool::spawn(move || tick(&socket)) {
      tracing::warn!(%err, "worker pool unavailable, running tick inline");
      tick(&self);
    }
  }

  fn downgrade(&self) -> Weak<Inner> {
    Arc::downgrade(&self.inner)
  }

  /// The current handle and its generation, unless disposed.
  fn current(&self) -> Option<(Arc<dyn SocketHandle>, u64)> {
    let core = self.inner.core.lock();
    (!core.disposed).then(|| (core.handle.clone(), core.generation))
  }

  fn generation(&self) -> u64 {
    self.inner.core.lock().generation
  }

  fn is_disposed(&self) -> bool {
    self.inner.core.lock().disposed
  }

  /// The only place the connection state changes.
  fn transition(
    &self,
    next: ConnectionState,
    error: ErrorKind,
    policy: NotifyPolicy,
  ) {
    let previous = {
      let mut core = self.inner.core.lock();
      let previous = core.state;
      core.state = next;
      core.last_error = error;
      if next == ConnectionState::Closed {
        self.inner.reset(&mut core);
      }
      previous
    };

    tracing::debug!(%previous, current = %next, %error, "state transition");

    if policy.should_notify(previous, next) {
      let change = StateChanged { previous, current: next, error };
      self.inner.events.emit_state_changed(self, &change);
    }
  }

  fn fail(&self, op: OpKind, err: &TransportError) {
    let kind = classify(op, err);
    tracing::debug!(?op, %err, %kind, "operation failed");
    self.transition(ConnectionState::Closed, kind, NotifyPolicy::IfChanged);
  }

  /// Like [`fail`](Self::fail), unless the handle was replaced since
  /// `generation`.
  fn fail_current(&self, generation: u64, op: OpKind, err: &TransportError) {
    if self.generation() != generation {
      tracing::debug!(?op, %err, "failure on a replaced handle ignored");
      return;
    }
    self.fail(op, err);
  }

  /// Binds to `addr`, closing the socket first unless it is `Closed`.
  pub fn bind(&self, addr: SocketAddr) -> bool {
    if self.is_disposed() {
      return false;
    }
    if !self.state().can_bind() {
      self.close();
    }
    let Some((handle, _)) = self.current() else { return false };

    match handle.bind(addr) {
      Ok(()) => {
        self.transition(ConnectionState::Bound, ErrorKind::None, NotifyPolicy::IfChanged);
        true
      }
      Err(err) => {
        self.fail(OpKind::Bind, &err);
        false
      }
    }
  }

  /// Starts listening with the configured backlog (65535 by default).
  pub fn listen(&self) -> bool {
    let backlog = self.inner.core.lock().backlog;
    self.listen_with_backlog(backlog)
  }

  /// Starts listening and polling for incoming connections, which are
  /// announced through [`on_connection_requested`](Self::on_connection_requested).
  pub fn listen_with_backlog(&self, backlog: i32) -> bool {
    if self.is_disposed() {
      return false;
    }
    if !self.state().can_listen() {
      self.close();
    }
    let Some((handle, generation)) = self.current() else { return false };

    if let Err(err) = handle.listen(backlog) {
      self.fail(OpKind::Listen, &err);
      return false;
    }

    self.transition(ConnectionState::Listening, ErrorKind::None, NotifyPolicy::IfChanged);
    self.inner.accepting.store(false, Ordering::Release);
    self.restart_loop(generation, ConnectionState::Listening);
    true
  }

  /// Starts connecting to `addr`. The outcome is reported as a transition to
  /// `Connected`, or to `Closed` with [`ErrorKind::OperationTimedOut`].
  pub fn connect(&self, addr: SocketAddr) -> bool {
    if self.is_disposed() {
      return false;
    }
    if !self.state().can_connect() {
      self.close();
    }
    let Some((handle, generation)) = self.current() else { return false };

    self.transition(ConnectionState::Connecting, ErrorKind::None, NotifyPolicy::IfChanged);

    let weak = self.downgrade();
    let issued = handle.begin_connect(
      addr,
      Box::new(move |res| {
        if let Some(socket) = Self::upgrade(&weak) {
          socket.on_connect_done(generation, res);
        }
      }),
    );

    match issued {
      Ok(()) => true,
      Err(err) => {
        self.fail_current(generation, OpKind::Connect, &err);
        false
      }
    }
  }

  /// Sends all of `payload`.
  pub fn send(&self, payload: &[u8]) -> bool {
    self.send_data(payload, 0, payload.len(), MsgFlags::NONE)
  }

  /// Starts sending `payload[offset..offset + length]`.
  ///
  /// Returns `false` without side effects when `length` is zero. A range
  /// outside of `payload` closes the socket with
  /// [`ErrorKind::BufferUnavailable`]. The number of bytes actually sent is
  /// reported through [`on_data_sent`](Self::on_data_sent).
  pub fn send_data(
    &self,
    payload: &[u8],
    offset: usize,
    length: usize,
    flags: MsgFlags,
  ) -> bool {
    if length == 0 || self.is_disposed() {
      return false;
    }

    let range = offset.checked_add(length).and_then(|end| payload.get(offset..end));
    let Some(data) = range else {
      let err = TransportError::OutOfRange { offset, len: length, capacity: payload.len() };
      self.fail(OpKind::Send, &err);
      return false;
    };
    let Some((handle, generation)) = self.current() else { return false };

    let was_sending = self.inner.sending.swap(true, Ordering::AcqRel);
    let weak = self.downgrade();
    let issued = handle.begin_send(
      data.to_vec(),
      flags,
      Box::new(move |res| {
        if let Some(socket) = Self::upgrade(&weak) {
          socket.on_send_done(generation, res);
        }
      }),
    );

    match issued {
      Ok(()) => true,
      Err(err) => {
        self.inner.sending.store(was_sending, Ordering::Release);
        self.fail_current(generation, OpKind::Send, &err);
        false
      }
    }
  }

  /// Claims a connection announced by `ConnectionRequested`, wrapping it in
  /// a new socket that starts out `Connected` with this socket's settings.
  ///
  /// Returns `None` if the accept failed or the token was already claimed.
  pub fn accept(&self, token: &AcceptToken) -> Option<AsyncSocket> {
    if self.is_disposed() {
      token.reject();
      return None;
    }
    let handle = token.claim()?;
    tracing::debug!(peer = ?handle.peer_addr(), "accepted connection");
    Some(Self::from_handle(handle, self.config()))
  }

  /// Closes the connection or stops connecting/listening. Always succeeds.
  pub fn close(&self) -> bool {
    self.transition(ConnectionState::Closed, ErrorKind::LocalClose, NotifyPolicy::IfChanged);
    true
  }

  /// Closes the socket for good and releases its buffer and subscribers.
  ///
  /// Subscribers still see the final transition to `Closed`. Every later
  /// operation fails.
  pub fn dispose(&self) {
    {
      let mut core = self.inner.core.lock();
      if core.disposed {
        return;
      }
      core.disposed = true;
    }

    self.close();
    self.inner.core.lock().buffer = Arc::new(Buffer::from_vec(Vec::new(), 0));
    self.inner.events.clear();
  }

  pub fn state(&self) -> ConnectionState {
    self.inner.core.lock().state
  }

  /// The error classification of the most recent transition.
  pub fn last_error(&self) -> ErrorKind {
    self.inner.core.lock().last_error
  }

  /// The most recently received data.
  ///
  /// This is a snapshot: the socket swaps in a fresh buffer when the next
  /// receive starts.
  pub fn receive_buffer(&self) -> Arc<Buffer> {
    self.inner.core.lock().buffer.clone()
  }

  pub fn is_on_accepting(&self) -> bool {
    self.inner.accepting.load(Ordering::Acquire)
  }

  pub fn is_on_sending(&self) -> bool {
    self.inner.sending.load(Ordering::Acquire)
  }

  pub fn is_on_receiving(&self) -> bool {
    self.inner.receiving.load(Ordering::Acquire)
  }

  pub fn listen_interval(&self) -> Duration {
    self.inner.listen_timer.interval()
  }

  /// Sets the delay between accept cycles, at least one millisecond.
  pub fn set_listen_interval(&self, interval: Duration) {
    self.inner.listen_timer.set_interval(interval);
  }

  pub fn receive_interval(&self) -> Duration {
    self.inner.receive_timer.interval()
  }

  /// Sets the delay between receive cycles, at least one millisecond.
  pub fn set_receive_interval(&self, interval: Duration) {
    self.inner.receive_timer.set_interval(interval);
  }

  pub fn receive_flags(&self) -> MsgFlags {
    self.inner.core.lock().receive_flags
  }

  /// Flags passed to every subsequent receive.
  pub fn set_receive_flags(&self, flags: MsgFlags) {
    self.inner.core.lock().receive_flags = flags;
  }

  pub fn receive_buffer_capacity(&self) -> usize {
    self.inner.core.lock().receive_capacity
  }

  /// Changes the receive buffer capacity, at least one byte. Takes effect
  /// with the next receive; data in the current buffer is lost.
  pub fn set_receive_buffer_capacity(&self, capacity: usize) {
    let capacity = capacity.max(1);
    let mut core = self.inner.core.lock();
    core.receive_capacity = capacity;
    if let Some(buf) = Arc::get_mut(&mut core.buffer) {
      if !buf.is_lent() {
        buf.resize(capacity);
      }
    }
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.inner.core.lock().handle.local_addr()
  }

  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.inner.core.lock().handle.peer_addr()
  }

  /// The settings an accepted connection inherits.
  fn config(&self) -> SocketConfig {
    let core = self.inner.core.lock();
    SocketConfig::builder()
      .listen_interval(self.listen_interval())
      .receive_interval(self.receive_interval())
      .receive_capacity(core.receive_capacity)
      .receive_flags(core.receive_flags)
      .backlog(core.backlog)
      .build()
      .unwrap_or_default()
  }

  pub fn on_state_changed<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&AsyncSocket, &StateChanged) + Send + Sync + 'static,
  {
    self.inner.events.on_state_changed(Arc::new(handler))
  }

  /// Registers a handler for incoming connections. Claim the connection with
  /// [`accept`](Self::accept); an unclaimed token closes it once dropped.
  pub fn on_connection_requested<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&AsyncSocket, &AcceptToken) + Send + Sync + 'static,
  {
    self.inner.events.on_connection_requested(Arc::new(handler))
  }

  /// Registers a handler for received data. The buffer is only valid for
  /// the duration of the call.
  pub fn on_data_received<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&AsyncSocket, &Buffer) + Send + Sync + 'static,
  {
    self.inner.events.on_data_received(Arc::new(handler))
  }

  pub fn on_data_sent<F>(&self, handler: F) -> Subscription
  where
    F: Fn(&AsyncSocket, &usize) + Send + Sync + 'static,
  {
    self.inner.events.on_data_sent(Arc::new(handler))
  }

  /// Removes a handler. Returns `false` if it was already removed.
  pub fn unsubscribe(&self, subscription: Subscription) -> bool {
    self.inner.events.unsubscribe(subscription)
  }

  pub fn subscriber_count(&self, kind: EventKind) -> usize {
    self.inner.events.subscriber_count(kind)
  }
}

impl fmt::Debug for AsyncSocket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let core = self.inner.core.lock();
    f.debug_struct("AsyncSocket")
      .field("state", &core.state)
      .field("last_error", &core.last_error)
      .field("generation", &core.generation)
      .field("handle", &core.handle)
      .finish()
  }
}
