//! Elastic worker pool running socket operations and their completions.
//!
//! Operations that would block are parked on the [`reactor`](super::reactor)
//! rather than here, but completions run user handlers, which may block for
//! as long as they like, so a fixed-size pool could starve. Instead a job is handed to an idle worker when one exists and
//! otherwise gets a freshly spawned worker. Workers that stay idle for
//! [`KEEP_ALIVE`] exit.
//!
//! `idle` counts workers waiting on the queue that no submitted job has
//! claimed yet. A submitter claims one by decrementing it before sending.

use std::{
  sync::{
    OnceLock,
    atomic::{AtomicUsize, Ordering},
  },
  thread,
  time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::TransportError;

const KEEP_ALIVE: Duration = Duration::from_secs(10);

type Job = Box<dyn FnOnce() + Send>;

struct WorkerPool {
  tx: Sender<Job>,
  rx: Receiver<Job>,
  idle: AtomicUsize,
  next_worker: AtomicUsize,
}

static POOL: OnceLock<WorkerPool> = OnceLock::new();

fn pool() -> &'static WorkerPool {
  POOL.get_or_init(|| {
    let (tx, rx) = crossbeam_channel::unbounded();
    WorkerPool { tx, rx, idle: AtomicUsize::new(0), next_worker: AtomicUsize::new(0) }
  })
}

/// Runs `job` on a pool thread.
pub(crate) fn spawn<F>(job: F) -> Result<(), TransportError>
where
  F: FnOnce() + Send + 'static,
{
  pool().submit(Box::new(job))
}

impl WorkerPool {
  fn try_claim(&self) -> bool {
    self
      .idle
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
      .is_ok()
  }

  fn submit(&'static self, job: Job) -> Result<(), TransportError> {
    if self.try_claim() {
      // `self.rx` keeps the channel open for the life of the process.
      let _ = self.tx.send(job);
      return Ok(());
    }

    let worker_id = self.next_worker.fetch_add(1, Ordering::Relaxed);
    thread::Builder::new()
      .name(format!("evsock-worker-{worker_id}"))
      .spawn(move || self.work(job))
      .map_err(TransportError::Io)?;

    Ok(())
  }

  fn work(&self, first: Job) {
    first();
    self.idle.fetch_add(1, Ordering::AcqRel);

    loop {
      match self.rx.recv_timeout(KEEP_ALIVE) {
        Ok(job) => {
          job();
          self.idle.fetch_add(1, Ordering::AcqRel);
        }
        // A job may already be promised to this worker; only leave when an
        // unclaimed idle slot can be given up.
        Err(RecvTimeoutError::Timeout) => {
          if self.try_claim() {
            break;
          }
        }
        Err(RecvTimeoutError::Disconnected) => break,
      }
    }
  }
}
