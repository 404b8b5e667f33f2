//! Real TCP/IP provider built on `socket2` sockets.
//!
//! Sockets are nonblocking. Each asynchronous operation is first attempted
//! on the [`pool`](super::pool). When the syscall would block, the operation
//! is parked on the shared [`Reactor`] and retried once the descriptor is
//! ready, so a waiting accept or receive holds no thread. A
//! [`close`](SocketHandle::close) releases everything parked on the handle,
//! which then completes with [`TransportError::Aborted`].
//!
//! The descriptor itself is released once the last in-flight operation
//! holding it has finished, so a closed descriptor number can never be
//! reused under a running or parked operation.

use std::{
  io,
  net::{Shutdown, SocketAddr},
  os::fd::{AsRawFd, RawFd},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
};

use socket2::{Domain, Protocol, Socket, Type};

use super::{
  AcceptCallback, ConnectCallback, MsgFlags, RecvCallback, SendCallback,
  SocketHandle, SocketSpec, pool, reactor::Reactor,
};
use crate::error::TransportError;

#[cfg(linux)]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(linux))]
const SEND_FLAGS: libc::c_int = 0;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub(crate) struct SysInner {
  id: u64,
  socket: Socket,
  spec: SocketSpec,
  closed: AtomicBool,
  connected: AtomicBool,
}

impl SysInner {
  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  pub(crate) fn raw_fd(&self) -> RawFd {
    self.socket.as_raw_fd()
  }

  fn check_open(&self) -> Result<(), TransportError> {
    if self.is_closed() {
      Err(TransportError::Disposed)
    } else {
      Ok(())
    }
  }

  fn fail(&self, err: io::Error) -> TransportError {
    if self.is_closed() {
      TransportError::Aborted
    } else {
      TransportError::from_io(err)
    }
  }
}

/// An operation retried each time its descriptor becomes ready.
trait Pending: Send + Sized + 'static {
  type Output;

  /// Readiness the operation waits for after `WouldBlock`.
  const EVENTS: libc::c_short;

  fn attempt(&mut self, inner: &SysInner) -> io::Result<Self::Output>;

  fn complete(self, res: Result<Self::Output, TransportError>);
}

/// Attempts `op` until it finishes, parking it on the reactor whenever the
/// syscall would block.
fn drive<P: Pending>(inner: Arc<SysInner>, mut op: P) {
  loop {
    if inner.is_closed() {
      return op.complete(Err(TransportError::Aborted));
    }

    match op.attempt(&inner) {
      Ok(out) => return op.complete(Ok(out)),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        let owner = inner.clone();
        let waiter = Box::new(move |ready: bool| {
          if ready {
            drive(inner, op);
          } else {
            op.complete(Err(TransportError::Aborted));
          }
        });
        Reactor::get().register(owner, P::EVENTS, waiter);
        return;
      }
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
      Err(err) => {
        let err = inner.fail(err);
        return op.complete(Err(err));
      }
    }
  }
}

struct AcceptOp {
  on_done: AcceptCallback,
}

impl Pending for AcceptOp {
  type Output = Arc<dyn SocketHandle>;
  const EVENTS: libc::c_short = libc::POLLIN;

  fn attempt(&mut self, inner: &SysInner) -> io::Result<Self::Output> {
    let (socket, _) = inner.socket.accept()?;
    SysSocket::configure(socket, inner.spec, true).map(SysSocket::into_handle)
  }

  fn complete(self, res: Result<Self::Output, TransportError>) {
    (self.on_done)(res)
  }
}

struct ConnectOp {
  addr: SocketAddr,
  started: bool,
  on_done: ConnectCallback,
}

impl Pending for ConnectOp {
  type Output = ();
  const EVENTS: libc::c_short = libc::POLLOUT;

  fn attempt(&mut self, inner: &SysInner) -> io::Result<()> {
    if !self.started {
      self.started = true;
      match inner.socket.connect(&self.addr.into()) {
        Ok(()) => {}
        // The handshake carries on in the background either way.
        Err(err)
          if err.raw_os_error() == Some(libc::EINPROGRESS)
            || err.kind() == io::ErrorKind::WouldBlock
            || err.kind() == io::ErrorKind::Interrupted =>
        {
          return Err(io::ErrorKind::WouldBlock.into());
        }
        Err(err) => return Err(err),
      }
    } else if let Some(err) = inner.socket.take_error()? {
      return Err(err);
    }

    inner.connected.store(true, Ordering::Release);
    Ok(())
  }

  fn complete(self, res: Result<(), TransportError>) {
    (self.on_done)(res)
  }
}

struct SendOp {
  data: Vec<u8>,
  sent: usize,
  flags: MsgFlags,
  on_done: SendCallback,
}

impl Pending for SendOp {
  type Output = usize;
  const EVENTS: libc::c_short = libc::POLLOUT;

  fn attempt(&mut self, inner: &SysInner) -> io::Result<usize> {
    while self.sent < self.data.len() {
      let rest = &self.data[self.sent..];
      let n = unsafe {
        libc::send(
          inner.raw_fd(),
          rest.as_ptr().cast(),
          rest.len(),
          self.flags.bits() | SEND_FLAGS,
        )
      };
      if n < 0 {
        return Err(io::Error::last_os_error());
      }
      self.sent += n as usize;
    }
    Ok(self.sent)
  }

  fn complete(self, res: Result<usize, TransportError>) {
    (self.on_done)(res)
  }
}

struct RecvOp {
  region: Vec<u8>,
  flags: MsgFlags,
  on_done: RecvCallback,
}

impl Pending for RecvOp {
  type Output = usize;
  const EVENTS: libc::c_short = libc::POLLIN;

  fn attempt(&mut self, inner: &SysInner) -> io::Result<usize> {
    let n = unsafe {
      libc::recv(
        inner.raw_fd(),
        self.region.as_mut_ptr().cast(),
        self.region.len(),
        self.flags.bits(),
      )
    };
    if n < 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
  }

  fn complete(self, res: Result<usize, TransportError>) {
    (self.on_done)((res, self.region))
  }
}

/// A nonblocking OS socket driven through the worker pool.
#[derive(Debug, Clone)]
pub struct SysSocket {
  inner: Arc<SysInner>,
}

impl SysSocket {
  pub fn new(
    domain: Domain,
    ty: Type,
    protocol: Option<Protocol>,
  ) -> Result<Self, TransportError> {
    Self::with_spec(SocketSpec::new(domain, ty, protocol))
  }

  pub fn with_spec(spec: SocketSpec) -> Result<Self, TransportError> {
    let socket = Socket::new(spec.domain, spec.ty, spec.protocol)
      .map_err(TransportError::from_io)?;
    Self::from_socket(socket, spec, false)
  }

  pub fn tcp_v4() -> Result<Self, TransportError> {
    Self::with_spec(SocketSpec::tcp_v4())
  }

  pub fn tcp_v6() -> Result<Self, TransportError> {
    Self::with_spec(SocketSpec::tcp_v6())
  }

  /// Wraps an existing socket, switching it to nonblocking mode.
  pub fn from_socket(
    socket: Socket,
    spec: SocketSpec,
    connected: bool,
  ) -> Result<Self, TransportError> {
    Self::configure(socket, spec, connected).map_err(TransportError::from_io)
  }

  fn configure(socket: Socket, spec: SocketSpec, connected: bool) -> io::Result<Self> {
    socket.set_nonblocking(true)?;
    #[cfg(apple)]
    socket.set_nosigpipe(true)?;

    Ok(Self {
      inner: Arc::new(SysInner {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        socket,
        spec,
        closed: AtomicBool::new(false),
        connected: AtomicBool::new(connected),
      }),
    })
  }

  pub fn into_handle(self) -> Arc<dyn SocketHandle> {
    Arc::new(self)
  }
}

impl SocketHandle for SysSocket {
  fn spec(&self) -> SocketSpec {
    self.inner.spec
  }

  fn bind(&self, addr: SocketAddr) -> Result<(), TransportError> {
    self.inner.check_open()?;
    self.inner.socket.bind(&addr.into()).map_err(TransportError::from_io)
  }

  fn listen(&self, backlog: i32) -> Result<(), TransportError> {
    self.inner.check_open()?;
    self.inner.socket.listen(backlog).map_err(TransportError::from_io)
  }

  fn begin_accept(&self, on_done: AcceptCallback) -> Result<(), TransportError> {
    self.inner.check_open()?;
    let inner = self.inner.clone();
    pool::spawn(move || drive(inner, AcceptOp { on_done }))
  }

  fn begin_connect(
    &self,
    addr: SocketAddr,
    on_done: ConnectCallback,
  ) -> Result<(), TransportError> {
    self.inner.check_open()?;
    let inner = self.inner.clone();
    pool::spawn(move || drive(inner, ConnectOp { addr, started: false, on_done }))
  }

  fn begin_send(
    &self,
    data: Vec<u8>,
    flags: MsgFlags,
    on_done: SendCallback,
  ) -> Result<(), TransportError> {
    self.inner.check_open()?;
    let inner = self.inner.clone();
    pool::spawn(move || drive(inner, SendOp { data, sent: 0, flags, on_done }))
  }

  fn begin_receive(
    &self,
    region: Vec<u8>,
    flags: MsgFlags,
    on_done: RecvCallback,
  ) -> Result<(), TransportError> {
    self.inner.check_open()?;
    let inner = self.inner.clone();
    pool::spawn(move || drive(inner, RecvOp { region, flags, on_done }))
  }

  fn shutdown(&self, how: Shutdown) -> Result<(), TransportError> {
    self.inner.check_open()?;
    self.inner.connected.store(false, Ordering::Release);
    self.inner.socket.shutdown(how).map_err(TransportError::from_io)
  }

  #[cfg(linux)]
  fn disconnect(&self) -> Result<(), TransportError> {
    self.inner.check_open()?;

    // Connecting to an AF_UNSPEC address dissolves the association and
    // leaves the descriptor reusable.
    let mut addr: libc::sockaddr = unsafe { std::mem::zeroed() };
    addr.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
    let rc = unsafe {
      libc::connect(
        self.inner.socket.as_raw_fd(),
        &addr,
        std::mem::size_of::<libc::sockaddr>() as libc::socklen_t,
      )
    };

    self.inner.connected.store(false, Ordering::Release);
    if rc < 0 {
      return Err(TransportError::from_io(io::Error::last_os_error()));
    }
    Ok(())
  }

  #[cfg(not(linux))]
  fn disconnect(&self) -> Result<(), TransportError> {
    self.inner.check_open()?;
    Err(TransportError::NotSupported("disconnect"))
  }

  fn close(&self) {
    if self.inner.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    self.inner.connected.store(false, Ordering::Release);
    // Wakes the peer; the descriptor goes away with the last Arc.
    let _ = self.inner.socket.shutdown(Shutdown::Both);
    Reactor::cancel(self.inner.id);
  }

  fn reopen(&self) -> Result<Arc<dyn SocketHandle>, TransportError> {
    Self::with_spec(self.inner.spec).map(Self::into_handle)
  }

  fn is_connected(&self) -> bool {
    self.inner.connected.load(Ordering::Acquire)
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    self.inner.socket.local_addr().ok().and_then(|addr| addr.as_socket())
  }

  fn peer_addr(&self) -> Option<SocketAddr> {
    self.inner.socket.peer_addr().ok().and_then(|addr| addr.as_socket())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::mpsc, thread, time::Duration};

  const WAIT: Duration = Duration::from_secs(5);

  fn listener() -> (SysSocket, SocketAddr) {
    let socket = SysSocket::tcp_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    socket.listen(16).unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
  }

  fn connected_pair() -> (Arc<dyn SocketHandle>, SysSocket) {
    let (server, addr) = listener();

    let (accept_tx, accept_rx) = mpsc::sync_channel(1);
    server
      .begin_accept(Box::new(move |res| accept_tx.send(res).unwrap()))
      .unwrap();

    let client = SysSocket::tcp_v4().unwrap();
    let (connect_tx, connect_rx) = mpsc::sync_channel(1);
    client
      .begin_connect(addr, Box::new(move |res| connect_tx.send(res).unwrap()))
      .unwrap();

    connect_rx.recv_timeout(WAIT).unwrap().unwrap();
    let accepted = accept_rx.recv_timeout(WAIT).unwrap().unwrap();
    (accepted, client)
  }

  #[test]
  fn connect_send_receive() {
    let (accepted, client) = connected_pair();
    assert!(accepted.is_connected());
    assert!(client.is_connected());
    assert_eq!(client.peer_addr(), accepted.local_addr());

    let (send_tx, send_rx) = mpsc::sync_channel(1);
    client
      .begin_send(
        b"hello".to_vec(),
        MsgFlags::NONE,
        Box::new(move |res| send_tx.send(res).unwrap()),
      )
      .unwrap();
    assert_eq!(send_rx.recv_timeout(WAIT).unwrap().unwrap(), 5);

    let (recv_tx, recv_rx) = mpsc::sync_channel(1);
    accepted
      .begin_receive(
        vec![0; 64],
        MsgFlags::NONE,
        Box::new(move |res| recv_tx.send(res).unwrap()),
      )
      .unwrap();
    let (res, region) = recv_rx.recv_timeout(WAIT).unwrap();
    let n = res.unwrap();
    assert_eq!(&region[..n], b"hello");
  }

  #[test]
  fn peer_close_reads_zero() {
    let (accepted, client) = connected_pair();
    client.close();

    let (tx, rx) = mpsc::sync_channel(1);
    accepted
      .begin_receive(vec![0; 8], MsgFlags::NONE, Box::new(move |res| tx.send(res).unwrap()))
      .unwrap();
    let (res, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(res.unwrap(), 0);
  }

  #[test]
  fn close_aborts_pending_receive() {
    let (accepted, _client) = connected_pair();

    let (tx, rx) = mpsc::sync_channel(1);
    accepted
      .begin_receive(vec![0; 8], MsgFlags::NONE, Box::new(move |res| tx.send(res).unwrap()))
      .unwrap();
    accepted.close();

    let (res, region) = rx.recv_timeout(WAIT).unwrap();
    // The local shutdown may surface as end of stream before the flag is seen.
    match res {
      Ok(0) | Err(TransportError::Aborted) => {}
      other => panic!("unexpected receive result: {other:?}"),
    }
    assert_eq!(region.len(), 8);
  }

  #[test]
  fn parked_receive_resumes_when_data_arrives() {
    let (accepted, client) = connected_pair();

    let (tx, rx) = mpsc::sync_channel(1);
    accepted
      .begin_receive(vec![0; 16], MsgFlags::NONE, Box::new(move |res| tx.send(res).unwrap()))
      .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err());

    client
      .begin_send(b"late".to_vec(), MsgFlags::NONE, Box::new(|_| {}))
      .unwrap();
    let (res, region) = rx.recv_timeout(WAIT).unwrap();
    let n = res.unwrap();
    assert_eq!(&region[..n], b"late");
  }

  #[test]
  fn close_releases_every_parked_operation() {
    let (server, _) = listener();
    let (tx, rx) = mpsc::channel();

    for _ in 0..32 {
      let tx = tx.clone();
      server.begin_accept(Box::new(move |res| tx.send(res).unwrap())).unwrap();
    }
    thread::sleep(Duration::from_millis(50));
    server.close();

    for _ in 0..32 {
      let res = rx.recv_timeout(WAIT).expect("parked accept released");
      assert!(matches!(res, Err(TransportError::Aborted)));
    }
  }

  #[test]
  fn close_aborts_pending_accept() {
    let (server, _) = listener();

    let (tx, rx) = mpsc::sync_channel(1);
    server.begin_accept(Box::new(move |res| tx.send(res).unwrap())).unwrap();
    server.close();

    let res = rx.recv_timeout(WAIT).unwrap();
    assert!(res.unwrap_err().is_handle_closed());
  }

  #[test]
  fn closed_handle_refuses_operations() {
    let socket = SysSocket::tcp_v4().unwrap();
    socket.close();
    socket.close();

    assert!(matches!(
      socket.bind("127.0.0.1:0".parse().unwrap()),
      Err(TransportError::Disposed)
    ));
    assert!(matches!(
      socket.begin_accept(Box::new(|_| {})),
      Err(TransportError::Disposed)
    ));
  }

  #[test]
  fn connect_refused() {
    // Grab a free port, then release it so nothing is listening there.
    let addr = {
      let (socket, addr) = listener();
      socket.close();
      addr
    };

    let client = SysSocket::tcp_v4().unwrap();
    let (tx, rx) = mpsc::sync_channel(1);
    client.begin_connect(addr, Box::new(move |res| tx.send(res).unwrap())).unwrap();

    assert!(rx.recv_timeout(WAIT).unwrap().is_err());
    assert!(!client.is_connected());
  }

  #[test]
  fn reopen_keeps_spec() {
    let socket = SysSocket::tcp_v6().unwrap();
    let fresh = socket.reopen().unwrap();
    assert_eq!(fresh.spec(), SocketSpec::tcp_v6());
    assert!(!fresh.is_connected());
  }

  #[cfg(linux)]
  #[test]
  fn disconnect_releases_connection() {
    let (_accepted, client) = connected_pair();
    client.disconnect().unwrap();
    assert!(!client.is_connected());
    assert!(client.peer_addr().is_none());
  }
}
