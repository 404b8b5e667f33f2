//! Re-arm timers.
//!
//! A [`ReArmTimer`] fires its callback every `interval` while started. All
//! timers in the process share one scheduler thread, fed through a
//! `crossbeam-channel` and sleeping with `recv_deadline` until the earliest
//! pending deadline.
//!
//! Callbacks run on the scheduler thread and delay every other timer while
//! they run. The socket engine's callbacks only hand the tick to the worker
//! pool.
//!
//! Every `start`/`stop` bumps a generation counter; a scheduled firing whose
//! generation no longer matches is dropped, so stopping a timer is immediate
//! even though its entry is still queued.

use std::{
  cmp::Ordering,
  collections::BinaryHeap,
  sync::{Arc, OnceLock, Weak},
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// The smallest interval a timer accepts.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

type Callback = Box<dyn Fn() + Send + Sync>;

struct TimerState {
  enabled: bool,
  generation: u64,
  interval: Duration,
}

struct TimerShared {
  name: &'static str,
  state: Mutex<TimerState>,
  callback: Callback,
}

impl TimerShared {
  fn fire(self: &Arc<Self>, generation: u64) {
    {
      let state = self.state.lock();
      if !state.enabled || state.generation != generation {
        return;
      }
    }

    tracing::trace!(timer = self.name, "tick");
    (self.callback)();

    let state = self.state.lock();
    if state.enabled && state.generation == generation {
      Scheduler::get().schedule(self, Instant::now() + state.interval, generation);
    }
  }
}

/// A periodic trigger that can be started, stopped and re-started.
pub(crate) struct ReArmTimer {
  shared: Arc<TimerShared>,
}

impl ReArmTimer {
  pub(crate) fn new<F>(name: &'static str, interval: Duration, callback: F) -> Self
  where
    F: Fn() + Send + Sync + 'static,
  {
    Self {
      shared: Arc::new(TimerShared {
        name,
        state: Mutex::new(TimerState {
          enabled: false,
          generation: 0,
          interval: interval.max(MIN_INTERVAL),
        }),
        callback: Box::new(callback),
      }),
    }
  }

  /// Starts the timer; the first tick happens one interval from now.
  ///
  /// Starting a running timer does nothing.
  pub(crate) fn start(&self) {
    let mut state = self.shared.state.lock();
    if state.enabled {
      return;
    }
    state.enabled = true;
    state.generation = state.generation.wrapping_add(1);
    let deadline = Instant::now() + state.interval;
    Scheduler::get().schedule(&self.shared, deadline, state.generation);
  }

  pub(crate) fn stop(&self) {
    let mut state = self.shared.state.lock();
    state.enabled = false;
    state.generation = state.generation.wrapping_add(1);
  }

  pub(crate) fn is_running(&self) -> bool {
    self.shared.state.lock().enabled
  }

  pub(crate) fn interval(&self) -> Duration {
    self.shared.state.lock().interval
  }

  /// Sets the interval, clamped to [`MIN_INTERVAL`]. Takes effect from the
  /// next scheduled tick.
  pub(crate) fn set_interval(&self, interval: Duration) {
    self.shared.state.lock().interval = interval.max(MIN_INTERVAL);
  }
}

impl Drop for ReArmTimer {
  fn drop(&mut self) {
    self.stop();
  }
}

struct Entry {
  deadline: Instant,
  generation: u64,
  timer: Weak<TimerShared>,
}

impl PartialEq for Entry {
  fn eq(&self, other: &Self) -> bool {
    self.deadline == other.deadline
  }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Entry {
  // Reversed: BinaryHeap is a max-heap, the earliest deadline must be on top.
  fn cmp(&self, other: &Self) -> Ordering {
    other.deadline.cmp(&self.deadline)
  }
}

struct Scheduler {
  tx: Sender<Entry>,
}

static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

impl Scheduler {
  fn get() -> &'static Scheduler {
    SCHEDULER.get_or_init(|| {
      let (tx, rx) = crossbeam_channel::unbounded();
      thread::Builder::new()
        .name("evsock-timer".into())
        .spawn(move || run(rx))
        .expect("Failed to spawn timer thread");
      Scheduler { tx }
    })
  }

  fn schedule(&self, timer: &Arc<TimerShared>, deadline: Instant, generation: u64) {
    let entry = Entry { deadline, generation, timer: Arc::downgrade(timer) };
    // The receiver lives for the whole process.
    let _ = self.tx.send(entry);
  }
}

fn run(rx: Receiver<Entry>) {
  let mut pending = BinaryHeap::<Entry>::new();

  loop {
    let received = match pending.peek() {
      Some(next) => rx.recv_deadline(next.deadline),
      None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };

    match received {
      Ok(entry) => pending.push(entry),
      Err(RecvTimeoutError::Timeout) => {}
      Err(RecvTimeoutError::Disconnected) => break,
    }

    let now = Instant::now();
    while pending.peek().is_some_and(|entry| entry.deadline <= now) {
      let Some(entry) = pending.pop() else { break };
      if let Some(timer) = entry.timer.upgrade() {
        timer.fire(entry.generation);
      }
    }
  }
}
