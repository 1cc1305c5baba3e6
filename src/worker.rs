//! In-process async executor for recalculation jobs.
//!
//! [`channel`] returns a [`ChannelDispatcher`] to hand to the engine and a
//! [`JobQueue`] to hand to [`Worker::spawn`] once the engine is shared.
//!
//! ```ignore
//! let (dispatcher, queue) = worker::channel();
//! let engine = Arc::new(Engine::new(store, registry, settings, dispatcher));
//! let worker = Worker::spawn(Arc::clone(&engine), queue);
//!
//! engine.flag_as_stale(&mut record, &balance, None, true)?;
//!
//! let stats = worker.shutdown().await?;
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::dispatch::{Dispatcher, RecalculationJob};
use crate::engine::Engine;
use crate::store::Store;

/// Create a connected dispatcher/queue pair.
pub fn channel() -> (ChannelDispatcher, JobQueue) {
  let (tx, rx) = mpsc::unbounded_channel();
  (ChannelDispatcher { tx }, JobQueue { rx })
}

/// Dispatcher that pushes jobs onto an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
  tx: mpsc::UnboundedSender<RecalculationJob>,
}

impl Dispatcher for ChannelDispatcher {
  fn submit(&self, job: RecalculationJob) -> Result<()> {
    self
      .tx
      .send(job)
      .map_err(|_| eyre!("Recalculation queue is closed"))
  }
}

/// Receiving end of a [`ChannelDispatcher`].
pub struct JobQueue {
  rx: mpsc::UnboundedReceiver<RecalculationJob>,
}

/// Counters reported when a worker stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
  pub completed: u64,
  pub failed: u64,
  /// Jobs dropped because an identical job was still waiting to run
  pub coalesced: u64,
}

/// Handle to a running worker.
pub struct WorkerHandle {
  shutdown: oneshot::Sender<()>,
  join: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
  /// Stop accepting new jobs, finish queued and in-flight ones, and return
  /// the final counters.
  pub async fn shutdown(self) -> Result<WorkerStats> {
    // The worker may already have stopped because every dispatcher is gone.
    let _ = self.shutdown.send(());
    self
      .join
      .await
      .map_err(|e| eyre!("Recalculation worker panicked: {}", e))
  }
}

/// Runs recalculation jobs against a shared engine.
///
/// Failed jobs are logged and dropped; retrying is left to callers, who can
/// flag the attribute as stale again.
pub struct Worker<S: Store, D: Dispatcher> {
  engine: Arc<Engine<S, D>>,
  /// Idempotency keys of jobs accepted but not yet started
  waiting: Arc<Mutex<HashSet<String>>>,
  tasks: JoinSet<Result<()>>,
  stats: WorkerStats,
}

impl<S, D> Worker<S, D>
where
  S: Store + 'static,
  D: Dispatcher + 'static,
{
  /// Start the worker loop on the current tokio runtime.
  pub fn spawn(engine: Arc<Engine<S, D>>, queue: JobQueue) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let worker = Self {
      engine,
      waiting: Arc::new(Mutex::new(HashSet::new())),
      tasks: JoinSet::new(),
      stats: WorkerStats::default(),
    };

    let join = tokio::spawn(worker.run(queue, shutdown_rx));

    WorkerHandle {
      shutdown: shutdown_tx,
      join,
    }
  }

  async fn run(mut self, mut queue: JobQueue, mut shutdown: oneshot::Receiver<()>) -> WorkerStats {
    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        job = queue.rx.recv() => match job {
          Some(job) => self.accept(job),
          None => break,
        },
        Some(done) = self.tasks.join_next(), if !self.tasks.is_empty() => self.finish(done),
      }
    }

    // Drain whatever was submitted before shutdown.
    queue.rx.close();
    while let Ok(job) = queue.rx.try_recv() {
      self.accept(job);
    }
    while let Some(done) = self.tasks.join_next().await {
      self.finish(done);
    }

    debug!(stats = ?self.stats, "recalculation worker stopped");
    self.stats
  }

  fn accept(&mut self, job: RecalculationJob) {
    let key = job.idempotency_key();
    if !lock(&self.waiting).insert(key.clone()) {
      debug!(model = %job.model, pk = job.pk, attribute = %job.attribute, "coalesced duplicate job");
      self.stats.coalesced += 1;
      return;
    }

    let engine = Arc::clone(&self.engine);
    let pending = Pending {
      waiting: Arc::clone(&self.waiting),
      key,
    };
    self.tasks.spawn(async move {
      if let Some(delay) = job.params.countdown() {
        tokio::time::sleep(delay).await;
      }

      // From here on a new job for the same key must run again: the data may
      // change while this one computes.
      drop(pending);

      tokio::task::spawn_blocking(move || {
        engine.recalculate_job(&job).map_err(|e| {
          eyre!(
            "Recalculating {} of {} #{} failed: {}",
            job.attribute,
            job.model,
            job.pk,
            e
          )
        })
      })
      .await
      .map_err(|e| eyre!("Recalculation task panicked: {}", e))?
      .map(|_| ())
    });
  }

  fn finish(&mut self, done: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match done {
      Ok(Ok(())) => self.stats.completed += 1,
      Ok(Err(e)) => {
        warn!("{}", e);
        self.stats.failed += 1;
      }
      Err(e) => {
        warn!("Recalculation task aborted: {}", e);
        self.stats.failed += 1;
      }
    }
  }
}

/// Marks a job as waiting until dropped, even if its task panics or is
/// aborted.
struct Pending {
  waiting: Arc<Mutex<HashSet<String>>>,
  key: String,
}

impl Drop for Pending {
  fn drop(&mut self) {
    lock(&self.waiting).remove(&self.key);
  }
}

/// The set stays consistent even if a holder panicked, so ignore poisoning.
fn lock(waiting: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
  waiting.lock().unwrap_or_else(PoisonError::into_inner)
}
