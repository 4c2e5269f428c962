//! Confined execution context.
//!
//! A single named thread runs every job handed to it, one at a time, in
//! submission order. Callers block until their job finishes. A job that
//! submits more work from inside the context runs that work inline.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};

use crate::error::{BackingError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Context {
  tx: Option<mpsc::UnboundedSender<Job>>,
  thread: Option<JoinHandle<()>>,
  thread_id: ThreadId,
}

impl Context {
  /// Start the context thread.
  pub fn spawn(name: &str) -> Result<Self> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

    let thread = thread::Builder::new()
      .name(name.to_string())
      .spawn(move || {
        while let Some(job) = rx.blocking_recv() {
          job();
        }
        tracing::debug!("backing context drained, exiting");
      })
      .map_err(BackingError::ContextSpawn)?;

    Ok(Self {
      tx: Some(tx),
      thread_id: thread.thread().id(),
      thread: Some(thread),
    })
  }

  /// Whether the calling thread is the context thread.
  pub fn is_current(&self) -> bool {
    thread::current().id() == self.thread_id
  }

  /// Run `f` on the context and wait for its result.
  ///
  /// Must not be called from inside an async runtime worker: the hand-off
  /// blocks the calling thread. A panic in `f` is re-raised on the caller.
  pub fn perform_and_wait<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
  {
    if self.is_current() {
      return Ok(f());
    }

    let tx = self.tx.as_ref().ok_or(BackingError::ContextClosed)?;
    let (reply_tx, reply_rx) = oneshot::channel();

    let job: Job = Box::new(move || {
      let outcome = panic::catch_unwind(AssertUnwindSafe(f));
      // The caller may have given up waiting; nothing to do then
      let _ = reply_tx.send(outcome);
    });
    tx.send(job).map_err(|_| BackingError::ContextClosed)?;

    match reply_rx.blocking_recv() {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(payload)) => panic::resume_unwind(payload),
      Err(_) => Err(BackingError::ContextClosed),
    }
  }
}

impl Drop for Context {
  fn drop(&mut self) {
    // Closing the channel lets the thread finish queued jobs and exit
    self.tx.take();

    if let Some(thread) = self.thread.take() {
      // The last owner can be released by a job running on the context
      // itself; joining there would wait forever.
      if !self.is_current() && thread.join().is_err() {
        tracing::warn!("backing context thread panicked");
      }
    }
  }
}
