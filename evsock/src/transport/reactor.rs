//! Shared readiness loop for [`SysSocket`](super::sys::SysSocket).
//!
//! A single `evsock-reactor` thread polls every descriptor that has a parked
//! operation, plus the read end of a notifier socket pair used to wake it
//! when registrations change. Registrations are one-shot: once a descriptor
//! reports readiness, or its handle is closed, the registration is removed
//! and its waiter runs on the worker [`pool`], where the operation is
//! retried.

use std::{
  io::{self, Read, Write},
  os::{fd::AsRawFd, unix::net::UnixStream},
  sync::{Arc, OnceLock},
  thread,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use super::{pool, sys::SysInner};

/// Runs with `true` once the descriptor is ready, `false` if its handle was
/// closed first.
pub(crate) type Waiter = Box<dyn FnOnce(bool) + Send>;

struct Registration {
  owner: Arc<SysInner>,
  events: libc::c_short,
  waiter: Waiter,
}

enum Command {
  Register(Registration),
  Cancel(u64),
}

pub(crate) struct Reactor {
  tx: Sender<Command>,
  notifier: UnixStream,
}

static REACTOR: OnceLock<Reactor> = OnceLock::new();

impl Reactor {
  pub(crate) fn get() -> &'static Reactor {
    REACTOR.get_or_init(|| {
      let (notifier, wake) =
        UnixStream::pair().expect("Failed to create reactor notifier");
      notifier.set_nonblocking(true).expect("Failed to configure reactor notifier");
      wake.set_nonblocking(true).expect("Failed to configure reactor notifier");

      let (tx, rx) = crossbeam_channel::unbounded();
      thread::Builder::new()
        .name("evsock-reactor".into())
        .spawn(move || run(rx, wake))
        .expect("Failed to spawn reactor thread");
      Reactor { tx, notifier }
    })
  }

  /// Parks `waiter` until `owner`'s descriptor reports one of `events`.
  pub(crate) fn register(
    &self,
    owner: Arc<SysInner>,
    events: libc::c_short,
    waiter: Waiter,
  ) {
    self.send(Command::Register(Registration { owner, events, waiter }));
  }

  /// Releases every waiter parked on the handle `id` with `false`.
  ///
  /// A no-op until the reactor has been started, since nothing can be
  /// parked before then.
  pub(crate) fn cancel(id: u64) {
    if let Some(reactor) = REACTOR.get() {
      reactor.send(Command::Cancel(id));
    }
  }

  fn send(&self, command: Command) {
    // The receiver lives for the whole process.
    let _ = self.tx.send(command);
    self.notify();
  }

  fn notify(&self) {
    // A full notifier buffer already guarantees a pending wakeup.
    let _ = (&self.notifier).write(&[1]);
  }
}

fn dispatch(waiter: Waiter, ready: bool) {
  if let Err(err) = pool::spawn(move || waiter(ready)) {
    tracing::error!(%err, "could not hand a parked operation to the pool");
  }
}

fn run(rx: Receiver<Command>, mut wake: UnixStream) {
  let mut parked: Vec<Registration> = Vec::new();
  let mut fds: Vec<libc::pollfd> = Vec::new();

  loop {
    loop {
      match rx.try_recv() {
        Ok(Command::Register(reg)) => {
          if reg.owner.is_closed() {
            dispatch(reg.waiter, false);
          } else {
            parked.push(reg);
          }
        }
        Ok(Command::Cancel(id)) => {
          let mut i = 0;
          while i < parked.len() {
            if parked[i].owner.id() == id {
              dispatch(parked.swap_remove(i).waiter, false);
            } else {
              i += 1;
            }
          }
        }
        Err(TryRecvError::Empty) => break,
        Err(TryRecvError::Disconnected) => return,
      }
    }

    fds.clear();
    fds.push(libc::pollfd { fd: wake.as_raw_fd(), events: libc::POLLIN, revents: 0 });
    fds.extend(parked.iter().map(|reg| libc::pollfd {
      fd: reg.owner.raw_fd(),
      events: reg.events,
      revents: 0,
    }));

    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
    if n < 0 {
      let err = io::Error::last_os_error();
      if err.kind() != io::ErrorKind::Interrupted {
        tracing::error!(%err, "reactor poll failed");
      }
      continue;
    }

    if fds[0].revents != 0 {
      let mut drain = [0u8; 64];
      while matches!(wake.read(&mut drain), Ok(n) if n > 0) {}
    }

    // Backwards, so `swap_remove` only moves entries already looked at.
    for i in (0..parked.len()).rev() {
      if fds[i + 1].revents != 0 {
        dispatch(parked.swap_remove(i).waiter, true);
      }
    }
  }
}
