//! Actor-service base
//!
//! Every core service owns private state that is only ever touched by one
//! worker task. Callers never reach that state directly: they push a tagged
//! task onto the service's bounded FIFO queue and return. The worker drains
//! the queue strictly in submission order and calls `Worker::settle` after
//! each run of tasks, which is where state is published to readers.
//!
//! Lifecycle:
//! - `ActorService::new` prepares the empty state and the queue (tasks may be
//!   queued before boot and run once the worker starts),
//! - `boot` spawns exactly one worker,
//! - `stop` enqueues a terminal task. Once the worker reaches it, the running
//!   flag flips to false and anything still queued behind it is dropped.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::utils::{BrokerError, Result};

/// A unit of work with a semantic type used for tracing.
pub trait Task: Send + 'static {
    /// e.g. `NEW_SUBSCRIBER`, `DELETE_TOPIC`.
    fn kind(&self) -> &'static str;
}

/// The private state of a service and the code that mutates it.
pub trait Worker: Send + 'static {
    type Task: Task;

    fn handle(&mut self, task: Self::Task);

    /// Periodic housekeeping, only called when the service has a tick interval.
    fn tick(&mut self) {}

    /// Called after a run of tasks: once the queue is drained or
    /// `SETTLE_BATCH` tasks ran, before a flush completes, and after each tick.
    fn settle(&mut self) {}
}

/// Upper bound on tasks handled between two `Worker::settle` calls.
pub const SETTLE_BATCH: usize = 256;

enum Envelope<T> {
    Task(T),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable submission side of a service's queue.
pub struct TaskQueue<T> {
    service: &'static str,
    tx: mpsc::Sender<Envelope<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            service: self.service,
            tx: self.tx.clone(),
        }
    }
}

impl<T: Task> TaskQueue<T> {
    /// Enqueues `task`, waiting for room if the queue is full.
    ///
    /// Returns once the task is queued, not once it ran.
    pub async fn submit(&self, task: T) -> Result<()> {
        let kind = task.kind();
        self.tx.send(Envelope::Task(task)).await.map_err(|_| {
            error!(service = self.service, task = kind, "Queue closed, dropping task");
            BrokerError::QueueClosed {
                service: self.service,
            }
        })
    }

    /// Enqueues `task` without waiting. Usable from synchronous contexts such
    /// as listener callbacks.
    pub fn try_submit(&self, task: T) -> Result<()> {
        let kind = task.kind();
        match self.tx.try_send(Envelope::Task(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!(service = self.service, task = kind, "Queue full, dropping task");
                Err(BrokerError::QueueFull {
                    service: self.service,
                })
            }
            Err(TrySendError::Closed(_)) => {
                error!(service = self.service, task = kind, "Queue closed, dropping task");
                Err(BrokerError::QueueClosed {
                    service: self.service,
                })
            }
        }
    }

    /// Completes once every task queued before this call has executed.
    pub async fn flush(&self) -> Result<()> {
        let closed = || BrokerError::QueueClosed {
            service: self.service,
        };
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Flush(tx))
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    pub fn service(&self) -> &'static str {
        self.service
    }
}

/// Lifecycle as seen by the orchestrator.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    fn boot(&self) -> Result<()>;

    /// Enqueues the shutdown task and waits for the worker to exit.
    async fn stop(&self);

    fn is_running(&self) -> bool;
}

/// A worker plus its queue, driven by one dedicated tokio task.
pub struct ActorService<W: Worker> {
    name: &'static str,
    queue: TaskQueue<W::Task>,
    idle: Mutex<Option<(W, mpsc::Receiver<Envelope<W::Task>>)>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    tick: Option<Duration>,
}

impl<W: Worker> ActorService<W> {
    pub fn new(name: &'static str, worker: W, capacity: usize) -> Self {
        info!("Initializing {name}...");
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            queue: TaskQueue { service: name, tx },
            idle: Mutex::new(Some((worker, rx))),
            handle: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            tick: None,
        }
    }

    /// Calls `Worker::tick` every `every` between tasks.
    pub fn with_tick(mut self, every: Duration) -> Self {
        if !every.is_zero() {
            self.tick = Some(every);
        }
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn queue(&self) -> &TaskQueue<W::Task> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn boot(&self) -> Result<()> {
        let Some((worker, rx)) = self.idle.lock().take() else {
            warn!("{} has already been booted", self.name);
            return Err(BrokerError::AlreadyBooted { service: self.name });
        };
        info!("Booting {}...", self.name);
        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_worker(
            self.name,
            worker,
            rx,
            self.running.clone(),
            self.tick,
        ));
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            debug!("{} is not running, nothing to stop", self.name);
            return;
        };
        if self.queue.tx.send(Envelope::Shutdown).await.is_err() {
            error!("Failed to inject shutdown task into {} queue", self.name);
        }
        if let Err(e) = handle.await {
            error!("{} worker ended abnormally: {e}", self.name);
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn run_worker<W: Worker>(
    name: &'static str,
    mut worker: W,
    mut rx: mpsc::Receiver<Envelope<W::Task>>,
    running: Arc<AtomicBool>,
    tick: Option<Duration>,
) {
    info!("{name} booted successfully");
    let mut ticker = tick.map(|every| {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    let mut unsettled = 0usize;
    while running.load(Ordering::SeqCst) {
        let envelope = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                envelope = rx.recv() => envelope,
                _ = ticker.tick() => {
                    if catch_unwind(AssertUnwindSafe(|| worker.tick())).is_err() {
                        error!("{name} panicked during periodic tick");
                    }
                    settle(name, &mut worker);
                    unsettled = 0;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match envelope {
            Some(Envelope::Task(task)) => {
                let kind = task.kind();
                debug!("{kind} job received by {name}, executing task...");
                if catch_unwind(AssertUnwindSafe(|| worker.handle(task))).is_err() {
                    error!("{name} panicked while executing {kind}, continuing");
                }
                unsettled += 1;
                if unsettled >= SETTLE_BATCH || rx.is_empty() {
                    settle(name, &mut worker);
                    unsettled = 0;
                }
            }
            Some(Envelope::Flush(done)) => {
                settle(name, &mut worker);
                unsettled = 0;
                let _ = done.send(());
            }
            Some(Envelope::Shutdown) => {
                info!("Stopping {name}...");
                settle(name, &mut worker);
                running.store(false, Ordering::SeqCst);
            }
            None => {
                debug!("{name} queue dropped, exiting");
                settle(name, &mut worker);
                running.store(false, Ordering::SeqCst);
            }
        }
    }
    info!("{name} stopped");
}

fn settle<W: Worker>(name: &'static str, worker: &mut W) {
    if catch_unwind(AssertUnwindSafe(|| worker.settle())).is_err() {
        error!("{name} panicked while publishing its state");
    }
}
