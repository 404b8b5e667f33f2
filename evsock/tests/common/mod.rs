#![allow(dead_code)]

use std::{
  sync::{Arc, Mutex},
  thread,
  time::{Duration, Instant},
};

use evsock::{
  AsyncSocket, SocketConfig, StateChanged, test_utils::MockScript,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn setup_log() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// Re-arms quickly so tests don't wait on the default 100 ms.
pub fn fast_config() -> SocketConfig {
  SocketConfig::builder().poll_interval(Duration::from_millis(2)).build().unwrap()
}

/// Timers that never fire within a test.
pub fn idle_config() -> SocketConfig {
  SocketConfig::builder().poll_interval(Duration::from_secs(3600)).build().unwrap()
}

pub fn mock_socket(config: SocketConfig) -> (AsyncSocket, Arc<MockScript>) {
  setup_log();
  let script = MockScript::new();
  let socket = AsyncSocket::from_handle(script.handle(), config);
  (socket, script)
}

pub fn connected_mock_socket(config: SocketConfig) -> (AsyncSocket, Arc<MockScript>) {
  setup_log();
  let script = MockScript::new();
  let socket = AsyncSocket::from_handle(script.connected_handle(), config);
  (socket, script)
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while !done() {
    if Instant::now() >= deadline {
      return false;
    }
    thread::sleep(Duration::from_millis(1));
  }
  true
}

/// Collects every event a socket emits.
#[derive(Clone, Default)]
pub struct Recorder {
  states: Arc<Mutex<Vec<StateChanged>>>,
  received: Arc<Mutex<Vec<Vec<u8>>>>,
  sent: Arc<Mutex<Vec<usize>>>,
}

impl Recorder {
  pub fn attach(socket: &AsyncSocket) -> Self {
    let recorder = Self::default();

    let states = recorder.states.clone();
    socket.on_state_changed(move |_, change| states.lock().unwrap().push(*change));

    let received = recorder.received.clone();
    socket.on_data_received(move |_, buf| {
      received.lock().unwrap().push(buf.as_slice().to_vec())
    });

    let sent = recorder.sent.clone();
    socket.on_data_sent(move |_, count| sent.lock().unwrap().push(*count));

    recorder
  }

  pub fn states(&self) -> Vec<StateChanged> {
    self.states.lock().unwrap().clone()
  }

  pub fn received(&self) -> Vec<Vec<u8>> {
    self.received.lock().unwrap().clone()
  }

  pub fn sent(&self) -> Vec<usize> {
    self.sent.lock().unwrap().clone()
  }
}
