mod common;

use std::{
  net::{SocketAddr, TcpListener},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc::{Receiver, sync_channel},
  },
};

use common::{WAIT, fast_config, setup_log, wait_until};
use evsock::{AsyncSocket, ConnectionState, ErrorKind, SocketSpec};

fn tcp() -> AsyncSocket {
  AsyncSocket::with_config(SocketSpec::tcp_v4(), fast_config()).expect("create socket")
}

/// Forwards every received chunk and every send count to the test.
fn pipe(socket: &AsyncSocket) -> (Receiver<Vec<u8>>, Receiver<usize>) {
  let (data_tx, data_rx) = sync_channel(64);
  let (sent_tx, sent_rx) = sync_channel(64);
  socket.on_data_received(move |_, buf| {
    let _ = data_tx.send(buf.as_slice().to_vec());
  });
  socket.on_data_sent(move |_, count| {
    let _ = sent_tx.send(*count);
  });
  (data_rx, sent_rx)
}

fn read_exact(rx: &Receiver<Vec<u8>>, len: usize) -> Vec<u8> {
  let mut out = Vec::new();
  while out.len() < len {
    let chunk = rx.recv_timeout(WAIT).expect("data before timeout");
    out.extend_from_slice(&chunk);
  }
  out
}

#[test]
fn test_loopback_exchange() {
  setup_log();

  let listener = tcp();
  let requests = Arc::new(AtomicUsize::new(0));
  let (accepted_tx, accepted_rx) = sync_channel(4);

  let counter = requests.clone();
  listener.on_connection_requested(move |listener, token| {
    counter.fetch_add(1, Ordering::SeqCst);
    if let Some(conn) = listener.accept(token) {
      let _ = accepted_tx.send(conn);
    }
  });

  assert!(listener.bind("127.0.0.1:0".parse().unwrap()));
  assert!(listener.listen_with_backlog(1));
  assert_eq!(listener.state(), ConnectionState::Listening);
  let addr = listener.local_addr().expect("bound address");

  let client = tcp();
  let (client_data, client_sent) = pipe(&client);
  assert!(client.connect(addr));
  assert!(wait_until(WAIT, || client.state() == ConnectionState::Connected));

  let server = accepted_rx.recv_timeout(WAIT).expect("accepted connection");
  assert_eq!(server.state(), ConnectionState::Connected);
  assert_eq!(server.peer_addr(), client.local_addr());
  let (server_data, server_sent) = pipe(&server);

  assert!(client.send(b"hello"));
  assert_eq!(client_sent.recv_timeout(WAIT).unwrap(), 5);
  assert_eq!(read_exact(&server_data, 5), b"hello");

  assert!(server.send(b"abc"));
  assert_eq!(server_sent.recv_timeout(WAIT).unwrap(), 3);
  assert_eq!(read_exact(&client_data, 3), b"abc");

  assert!(client.close());
  assert_eq!(client.last_error(), ErrorKind::LocalClose);
  assert!(wait_until(WAIT, || server.state() == ConnectionState::Closed));
  assert_eq!(server.last_error(), ErrorKind::RemoteClose);

  assert_eq!(requests.load(Ordering::SeqCst), 1);

  server.dispose();
  client.dispose();
  listener.dispose();
  assert_eq!(listener.state(), ConnectionState::Closed);
}

#[test]
fn test_refused_connect_times_out() {
  setup_log();

  // Grab a free port, then release it so nothing is listening there.
  let addr: SocketAddr = {
    let spare = TcpListener::bind("127.0.0.1:0").unwrap();
    spare.local_addr().unwrap()
  };

  let client = tcp();
  assert!(client.connect(addr));
  assert!(wait_until(WAIT, || client.state() == ConnectionState::Closed));
  assert_eq!(client.last_error(), ErrorKind::OperationTimedOut);
  client.dispose();
}

#[test]
fn test_listener_survives_many_clients() {
  setup_log();

  let listener = tcp();
  let (accepted_tx, accepted_rx) = sync_channel(16);
  listener.on_connection_requested(move |listener, token| {
    if let Some(conn) = listener.accept(token) {
      let _ = accepted_tx.send(conn);
    }
  });
  assert!(listener.bind("127.0.0.1:0".parse().unwrap()));
  assert!(listener.listen());
  let addr = listener.local_addr().unwrap();

  let mut pairs = Vec::new();
  for _ in 0..4 {
    let client = tcp();
    assert!(client.connect(addr));
    let server = accepted_rx.recv_timeout(WAIT).expect("accepted connection");
    pairs.push((client, server));
  }

  for (client, server) in &pairs {
    assert!(wait_until(WAIT, || client.state() == ConnectionState::Connected));
    assert_eq!(server.state(), ConnectionState::Connected);
  }

  for (client, server) in pairs {
    client.dispose();
    server.dispose();
  }
  listener.dispose();
}
