//! Scripted transport for deterministic engine tests.
//!
//! A [`MockScript`] owns a family of [`MockSocket`] handles: the one an
//! engine starts with and every replacement created through
//! [`SocketHandle::reopen`]. Asynchronous operations issued against any of
//! them are queued, oldest first, until the test completes them explicitly
//! with one of the `complete_*`/`fail_*` methods. Completion callbacks are
//! invoked on the calling thread with no script lock held.
//!
//! Only intended for tests.

use std::{
  collections::{HashMap, VecDeque},
  fmt, io,
  net::{Shutdown, SocketAddr},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
  error::{OpKind, TransportError},
  transport::{
    AcceptCallback, ConnectCallback, MsgFlags, RecvCallback, SendCallback,
    SocketHandle, SocketSpec,
  },
};

struct PendingConnect {
  connected: Arc<AtomicBool>,
  on_done: ConnectCallback,
}

struct PendingReceive {
  region: Vec<u8>,
  on_done: RecvCallback,
}

#[derive(Default)]
struct ScriptState {
  opened: usize,
  closed: usize,
  failures: HashMap<OpKind, VecDeque<TransportError>>,
  issued: HashMap<OpKind, usize>,
  accepts: VecDeque<AcceptCallback>,
  connects: VecDeque<PendingConnect>,
  sends: VecDeque<(usize, SendCallback)>,
  receives: VecDeque<PendingReceive>,
  sent: Vec<Vec<u8>>,
  receive_flags: Option<MsgFlags>,
  bound: Option<SocketAddr>,
  backlog: Option<i32>,
}

impl ScriptState {
  fn issue(&mut self, op: OpKind) -> Result<(), TransportError> {
    if let Some(err) = self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
      return Err(err);
    }
    *self.issued.entry(op).or_default() += 1;
    Ok(())
  }

  fn pending(&self, op: OpKind) -> usize {
    match op {
      OpKind::Accept => self.accepts.len(),
      OpKind::Connect => self.connects.len(),
      OpKind::Send => self.sends.len(),
      OpKind::Receive => self.receives.len(),
      OpKind::Bind | OpKind::Listen => 0,
    }
  }
}

/// Drives every handle of one engine.
#[doc(hidden)]
pub struct MockScript {
  state: Mutex<ScriptState>,
}

impl fmt::Debug for MockScript {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("MockScript")
      .field("opened", &state.opened)
      .field("closed", &state.closed)
      .field("issued", &state.issued)
      .finish()
  }
}

impl MockScript {
  #[doc(hidden)]
  pub fn new() -> Arc<Self> {
    Arc::new(Self { state: Mutex::new(ScriptState::default()) })
  }

  /// Opens a fresh, unconnected handle.
  #[doc(hidden)]
  pub fn handle(self: &Arc<Self>) -> Arc<dyn SocketHandle> {
    self.open(false)
  }

  /// Opens a handle that reports itself as already connected.
  #[doc(hidden)]
  pub fn connected_handle(self: &Arc<Self>) -> Arc<dyn SocketHandle> {
    self.open(true)
  }

  fn open(self: &Arc<Self>, connected: bool) -> Arc<dyn SocketHandle> {
    self.state.lock().opened += 1;
    Arc::new(MockSocket {
      script: self.clone(),
      closed: AtomicBool::new(false),
      connected: Arc::new(AtomicBool::new(connected)),
    })
  }

  /// Makes the next issue of `op` fail with `err`.
  #[doc(hidden)]
  pub fn fail_next(&self, op: OpKind, err: TransportError) {
    self.state.lock().failures.entry(op).or_default().push_back(err);
  }

  /// How many `op` operations were successfully issued so far.
  #[doc(hidden)]
  pub fn issued(&self, op: OpKind) -> usize {
    self.state.lock().issued.get(&op).copied().unwrap_or(0)
  }

  /// How many `op` operations are waiting for completion.
  #[doc(hidden)]
  pub fn pending(&self, op: OpKind) -> usize {
    self.state.lock().pending(op)
  }

  #[doc(hidden)]
  pub fn handles_opened(&self) -> usize {
    self.state.lock().opened
  }

  #[doc(hidden)]
  pub fn handles_closed(&self) -> usize {
    self.state.lock().closed
  }

  /// Payloads passed to `begin_send`, in issue order.
  #[doc(hidden)]
  pub fn sent(&self) -> Vec<Vec<u8>> {
    self.state.lock().sent.clone()
  }

  #[doc(hidden)]
  pub fn bound_addr(&self) -> Option<SocketAddr> {
    self.state.lock().bound
  }

  #[doc(hidden)]
  pub fn backlog(&self) -> Option<i32> {
    self.state.lock().backlog
  }

  /// Flags of the most recently issued receive.
  #[doc(hidden)]
  pub fn receive_flags(&self) -> Option<MsgFlags> {
    self.state.lock().receive_flags
  }

  /// Polls until `issued(op)` reaches `count`.
  #[doc(hidden)]
  pub fn wait_issued(&self, op: OpKind, count: usize, timeout: Duration) -> bool {
    wait_until(timeout, || self.issued(op) >= count)
  }

  /// Polls until `pending(op)` reaches `count`.
  #[doc(hidden)]
  pub fn wait_pending(&self, op: OpKind, count: usize, timeout: Duration) -> bool {
    wait_until(timeout, || self.pending(op) >= count)
  }

  /// Completes the oldest pending accept with a new connected handle and
  /// returns the script driving it.
  #[doc(hidden)]
  pub fn complete_accept(&self) -> Option<Arc<MockScript>> {
    let on_done = self.state.lock().accepts.pop_front()?;
    let child = MockScript::new();
    on_done(Ok(child.connected_handle()));
    Some(child)
  }

  #[doc(hidden)]
  pub fn fail_accept(&self, err: TransportError) -> bool {
    let Some(on_done) = self.state.lock().accepts.pop_front() else {
      return false;
    };
    on_done(Err(err));
    true
  }

  #[doc(hidden)]
  pub fn complete_connect(&self, result: Result<(), TransportError>) -> bool {
    let Some(pending) = self.state.lock().connects.pop_front() else {
      return false;
    };
    if result.is_ok() {
      pending.connected.store(true, Ordering::Release);
    }
    (pending.on_done)(result);
    true
  }

  #[doc(hidden)]
  pub fn complete_send(&self, result: Result<usize, TransportError>) -> bool {
    let Some((_, on_done)) = self.state.lock().sends.pop_front() else {
      return false;
    };
    on_done(result);
    true
  }

  /// Completes every pending send as fully sent. Returns how many there were.
  #[doc(hidden)]
  pub fn complete_send_all(&self) -> usize {
    let pending: Vec<_> = self.state.lock().sends.drain(..).collect();
    let count = pending.len();
    for (len, on_done) in pending {
      on_done(Ok(len));
    }
    count
  }

  /// Completes the oldest pending receive with `data`, truncated to the
  /// receive region.
  #[doc(hidden)]
  pub fn complete_receive(&self, data: &[u8]) -> bool {
    let Some(PendingReceive { mut region, on_done }) =
      self.state.lock().receives.pop_front()
    else {
      return false;
    };
    let n = data.len().min(region.len());
    region[..n].copy_from_slice(&data[..n]);
    on_done((Ok(n), region));
    true
  }

  /// Completes the oldest pending receive as an orderly remote close.
  #[doc(hidden)]
  pub fn complete_receive_eof(&self) -> bool {
    self.complete_receive(&[])
  }

  #[doc(hidden)]
  pub fn fail_receive(&self, err: TransportError) -> bool {
    let Some(PendingReceive { region, on_done }) =
      self.state.lock().receives.pop_front()
    else {
      return false;
    };
    on_done((Err(err), region));
    true
  }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  loop {
    if done() {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    thread::sleep(Duration::from_millis(1));
  }
}

/// One handle of a [`MockScript`] family.
#[doc(hidden)]
#[derive(Debug)]
pub struct MockSocket {
  script: Arc<MockScript>,
  closed: AtomicBool,
  connected: Arc<AtomicBool>,
}

impl MockSocket {
  fn issue(&self, op: OpKind) -> Result<parking_lot::MutexGuard<'_, ScriptState>, TransportError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(TransportError::Disposed);
    }
    let mut state = self.script.state.lock();
    state.issue(op)?;
    Ok(state)
  }
}

impl SocketHandle for MockSocket {
  fn spec(&self) -> SocketSpec {
    SocketSpec::tcp_v4()
  }

  fn bind(&self, addr: SocketAddr) -> Result<(), TransportError> {
    self.issue(OpKind::Bind)?.bound = Some(addr);
    Ok(())
  }

  fn listen(&self, backlog: i32) -> Result<(), TransportError> {
    self.issue(OpKind::Listen)?.backlog = Some(backlog);
    Ok(())
  }

  fn begin_accept(&self, on_done: AcceptCallback) -> Result<(), TransportError> {
    self.issue(OpKind::Accept)?.accepts.push_back(on_done);
    Ok(())
  }

  fn begin_connect(
    &self,
    _addr: SocketAddr,
    on_done: ConnectCallback,
  ) -> Result<(), TransportError> {
    let connected = self.connected.clone();
    self.issue(OpKind::Connect)?.connects.push_back(PendingConnect { connected, on_done });
    Ok(())
  }

  fn begin_send(
    &self,
    data: Vec<u8>,
    _flags: MsgFlags,
    on_done: SendCallback,
  ) -> Result<(), TransportError> {
    let mut state = self.issue(OpKind::Send)?;
    state.sends.push_back((data.len(), on_done));
    state.sent.push(data);
    Ok(())
  }

  fn begin_receive(
    &self,
    region: Vec<u8>,
    flags: MsgFlags,
    on_done: RecvCallback,
  ) -> Result<(), TransportError> {
    let mut state = self.issue(OpKind::Receive)?;
    state.receive_flags = Some(flags);
    state.receives.push_back(PendingReceive { region, on_done });
    Ok(())
  }

  fn shutdown(&self, _how: Shutdown) -> Result<(), TransportError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(TransportError::Disposed);
    }
    if !self.connected.swap(false, Ordering::AcqRel) {
      return Err(io::Error::from(io::ErrorKind::NotConnected).into());
    }
    Ok(())
  }

  fn disconnect(&self) -> Result<(), TransportError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(TransportError::Disposed);
    }
    self.connected.store(false, Ordering::Release);
    Ok(())
  }

  fn close(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      self.connected.store(false, Ordering::Release);
      self.script.state.lock().closed += 1;
    }
  }

  fn reopen(&self) -> Result<Arc<dyn SocketHandle>, TransportError> {
    Ok(self.script.handle())
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::Acquire)
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    self.script.bound_addr()
  }

  fn peer_addr(&self) -> Option<SocketAddr> {
    None
  }
}
