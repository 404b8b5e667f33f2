mod common;

use std::{
  io,
  net::SocketAddr,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  thread,
  time::Duration,
};

use common::{Recorder, WAIT, fast_config, idle_config, mock_socket};
use evsock::{ConnectionState::*, ErrorKind, EventKind, OpKind, StateChanged, TransportError};

fn addr() -> SocketAddr {
  "127.0.0.1:9000".parse().unwrap()
}

fn change(
  previous: evsock::ConnectionState,
  current: evsock::ConnectionState,
  error: ErrorKind,
) -> StateChanged {
  StateChanged { previous, current, error }
}

#[test]
fn test_bind_listen_close() {
  let (socket, script) = mock_socket(idle_config());
  let events = Recorder::attach(&socket);

  assert!(socket.bind(addr()));
  assert_eq!(socket.state(), Bound);
  assert_eq!(script.bound_addr(), Some(addr()));

  assert!(socket.listen());
  assert_eq!(socket.state(), Listening);
  assert_eq!(script.backlog(), Some(65535));

  assert!(socket.close());
  assert_eq!(socket.state(), Closed);
  assert_eq!(socket.last_error(), ErrorKind::LocalClose);

  assert_eq!(
    events.states(),
    vec![
      change(Closed, Bound, ErrorKind::None),
      change(Bound, Listening, ErrorKind::None),
      change(Listening, Closed, ErrorKind::LocalClose),
    ]
  );
}

#[test]
fn test_close_when_closed_is_silent() {
  let (socket, _) = mock_socket(idle_config());
  let events = Recorder::attach(&socket);

  assert!(socket.close());
  assert!(socket.close());
  assert!(events.states().is_empty());
}

#[test]
fn test_rebind_closes_first() {
  let (socket, script) = mock_socket(idle_config());
  let events = Recorder::attach(&socket);

  assert!(socket.listen_with_backlog(4));
  assert!(socket.bind(addr()));

  assert_eq!(
    events.states(),
    vec![
      change(Closed, Listening, ErrorKind::None),
      change(Listening, Closed, ErrorKind::LocalClose),
      change(Closed, Bound, ErrorKind::None),
    ]
  );
  assert_eq!(script.handles_opened(), 2);
  assert_eq!(script.handles_closed(), 1);
}

#[test]
fn test_connect_from_bound_keeps_handle() {
  let (socket, script) = mock_socket(idle_config());
  assert!(socket.bind(addr()));
  assert!(socket.connect("127.0.0.1:9001".parse().unwrap()));

  assert_eq!(socket.state(), Connecting);
  assert_eq!(script.handles_opened(), 1);
}

#[test]
fn test_reset_stops_accept_loop() {
  let (socket, script) = mock_socket(fast_config());
  assert!(socket.bind(addr()));
  assert!(socket.listen());
  assert!(script.wait_issued(OpKind::Accept, 1, WAIT));

  socket.close();
  thread::sleep(Duration::from_millis(30));
  assert_eq!(script.issued(OpKind::Accept), 1);

  // The fresh handle is usable without any manual recovery.
  assert!(socket.bind(addr()));
  assert!(socket.listen());
  assert!(script.wait_issued(OpKind::Accept, 2, WAIT));
}

#[test]
fn test_connect_success_starts_receiving() {
  let (socket, script) = mock_socket(fast_config());
  let events = Recorder::attach(&socket);

  assert!(socket.connect("127.0.0.1:9001".parse().unwrap()));
  assert_eq!(socket.state(), Connecting);
  assert_eq!(script.issued(OpKind::Receive), 0);

  assert!(script.complete_connect(Ok(())));
  assert_eq!(socket.state(), Connected);
  assert!(script.wait_issued(OpKind::Receive, 1, WAIT));
  assert!(socket.is_on_receiving());

  assert_eq!(
    events.states(),
    vec![
      change(Closed, Connecting, ErrorKind::None),
      change(Connecting, Connected, ErrorKind::None),
    ]
  );
}

#[test]
fn test_connect_failure_is_timed_out() {
  let (socket, script) = mock_socket(idle_config());
  assert!(socket.connect("127.0.0.1:9001".parse().unwrap()));

  let refused = io::Error::from_raw_os_error(libc::ECONNREFUSED);
  assert!(script.complete_connect(Err(refused.into())));

  assert_eq!(socket.state(), Closed);
  assert_eq!(socket.last_error(), ErrorKind::OperationTimedOut);
}

#[test]
fn test_listen_failure_is_endpoint_unavailable() {
  let (socket, script) = mock_socket(idle_config());
  let in_use = io::Error::from_raw_os_error(libc::EADDRINUSE);
  script.fail_next(OpKind::Listen, in_use.into());

  assert!(!socket.listen());
  assert_eq!(socket.state(), Closed);
  assert_eq!(socket.last_error(), ErrorKind::EndpointUnavailable);
}

#[test]
fn test_bind_on_disposed_handle() {
  let (socket, script) = mock_socket(idle_config());
  script.fail_next(OpKind::Bind, TransportError::Disposed);

  assert!(!socket.bind(addr()));
  assert_eq!(socket.last_error(), ErrorKind::SocketUnavailable);
}

#[test]
fn test_handlers_can_reenter_socket() {
  let (socket, _) = mock_socket(idle_config());
  let seen = Arc::new(Mutex::new(Vec::new()));

  let log = seen.clone();
  socket.on_state_changed(move |socket, change| {
    log.lock().unwrap().push((change.current, socket.state()));
    if change.current == Listening {
      socket.close();
    }
  });

  assert!(socket.listen());
  assert_eq!(socket.state(), Closed);
  assert_eq!(*seen.lock().unwrap(), vec![(Listening, Listening), (Closed, Closed)]);
}

#[test]
fn test_handlers_run_in_registration_order() {
  let (socket, _) = mock_socket(idle_config());
  let order = Arc::new(Mutex::new(Vec::new()));

  for i in 0..3 {
    let order = order.clone();
    socket.on_state_changed(move |_, _| order.lock().unwrap().push(i));
  }

  socket.bind(addr());
  assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_unsubscribe() {
  let (socket, _) = mock_socket(idle_config());
  let calls = Arc::new(AtomicUsize::new(0));

  let counter = calls.clone();
  let sub = socket.on_state_changed(move |_, _| {
    counter.fetch_add(1, Ordering::SeqCst);
  });
  assert_eq!(sub.kind(), EventKind::StateChanged);
  assert_eq!(socket.subscriber_count(EventKind::StateChanged), 1);

  socket.bind(addr());
  assert!(socket.unsubscribe(sub));
  assert!(!socket.unsubscribe(sub));
  socket.close();

  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(socket.subscriber_count(EventKind::StateChanged), 0);
}

#[test]
fn test_dispose_notifies_once_then_goes_quiet() {
  let (socket, _) = mock_socket(idle_config());
  assert!(socket.bind(addr()));
  let events = Recorder::attach(&socket);

  socket.dispose();
  assert_eq!(events.states(), vec![change(Bound, Closed, ErrorKind::LocalClose)]);

  assert!(!socket.bind(addr()));
  assert_eq!(events.states().len(), 1);
}

#[test]
fn test_intervals_are_clamped() {
  let (socket, _) = mock_socket(idle_config());
  socket.set_listen_interval(Duration::ZERO);
  socket.set_receive_interval(Duration::from_micros(10));
  assert_eq!(socket.listen_interval(), evsock::MIN_INTERVAL);
  assert_eq!(socket.receive_interval(), evsock::MIN_INTERVAL);

  socket.set_receive_interval(Duration::from_millis(250));
  assert_eq!(socket.receive_interval(), Duration::from_millis(250));
}
