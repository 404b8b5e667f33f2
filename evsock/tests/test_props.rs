mod common;

use std::{
  net::SocketAddr,
  sync::{Arc, Mutex},
};

use common::{idle_config, mock_socket};
use evsock::{ConnectionState, ErrorKind, StateChanged};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
  Bind,
  Listen,
  Connect,
  Close,
  FinishConnect(bool),
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    Just(Op::Bind),
    Just(Op::Listen),
    Just(Op::Connect),
    Just(Op::Close),
    any::<bool>().prop_map(Op::FinishConnect),
  ]
}

/// What the engine should look like after a sequence of operations.
struct Model {
  state: ConnectionState,
  generation: usize,
  /// Handle generation of every connect still waiting for completion.
  connects: Vec<usize>,
}

impl Model {
  fn reset(&mut self) {
    self.state = ConnectionState::Closed;
    self.generation += 1;
  }

  fn apply(&mut self, op: Op) {
    use ConnectionState::*;

    match op {
      Op::Bind => {
        if self.state != Closed {
          self.reset();
        }
        self.state = Bound;
      }
      Op::Listen | Op::Connect => {
        if !matches!(self.state, Closed | Bound) {
          self.reset();
        }
        if let Op::Connect = op {
          self.state = Connecting;
          self.connects.push(self.generation);
        } else {
          self.state = Listening;
        }
      }
      Op::Close => self.reset(),
      Op::FinishConnect(ok) => {
        if self.connects.is_empty() {
          return;
        }
        if self.connects.remove(0) == self.generation {
          if ok {
            self.state = Connected;
          } else {
            self.reset();
          }
        }
      }
    }
  }
}

proptest! {
  #[test]
  fn prop_events_follow_the_state_machine(ops in proptest::collection::vec(op(), 0..48)) {
    let (socket, script) = mock_socket(idle_config());
    let events = Arc::new(Mutex::new(Vec::<StateChanged>::new()));
    let sink = events.clone();
    socket.on_state_changed(move |_, change| sink.lock().unwrap().push(*change));

    let bind: SocketAddr = "127.0.0.1:9500".parse().unwrap();
    let peer: SocketAddr = "127.0.0.1:9501".parse().unwrap();
    let mut model = Model { state: ConnectionState::Closed, generation: 0, connects: Vec::new() };

    for op in ops {
      match op {
        Op::Bind => prop_assert!(socket.bind(bind)),
        Op::Listen => prop_assert!(socket.listen()),
        Op::Connect => prop_assert!(socket.connect(peer)),
        Op::Close => prop_assert!(socket.close()),
        Op::FinishConnect(ok) => {
          let res = if ok { Ok(()) } else { Err(evsock::TransportError::Aborted) };
          prop_assert_eq!(script.complete_connect(res), !model.connects.is_empty());
        }
      }
      model.apply(op);
      prop_assert_eq!(socket.state(), model.state);
    }

    let events = events.lock().unwrap();
    let mut previous = ConnectionState::Closed;
    for change in events.iter() {
      prop_assert_eq!(change.previous, previous);
      prop_assert_ne!(change.previous, change.current);
      prop_assert_eq!(change.current == ConnectionState::Closed, change.error != ErrorKind::None);
      previous = change.current;
    }
    prop_assert_eq!(previous, socket.state());

    prop_assert_eq!(script.handles_opened(), 1 + model.generation);
    prop_assert_eq!(script.handles_closed(), model.generation);
  }
}
