use crate::utils::{Result, TsbError, CODE_TOO_SLOW};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

/// `min(max(2·CPU, 8), CPU²)`, never zero.
pub fn default_concurrency() -> usize {
    let cpus = num_cpus::get().max(1);
    (2 * cpus).max(8).min(cpus * cpus).max(1)
}

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ErrorSlot {
    poisoned: bool,
    error: Option<TsbError>,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    running: AtomicUsize,
    refs: AtomicUsize,
    error: parking_lot::Mutex<ErrorSlot>,
    notify: Notify,
    concurrency: usize,
}

impl Inner {
    fn poison(&self, err: TsbError) {
        let mut slot = self.error.lock();
        if slot.poisoned {
            warn!("queue already poisoned, dropping: {}", err);
        } else {
            slot.poisoned = true;
            slot.error = Some(err);
        }
        drop(slot);
        self.notify.notify_waiters();
    }

    fn take_error(&self) -> Option<TsbError> {
        let mut slot = self.error.lock();
        if !slot.poisoned {
            return None;
        }
        Some(
            slot.error
                .take()
                .unwrap_or_else(|| TsbError::Poisoned("an earlier task failed".to_string())),
        )
    }
}

/// Bounded-parallelism task runner shared by refinement and the graph
/// driver. Admission is fair FIFO (tokio semaphore), so tasks submitted by
/// one caller start in submission order; completion ordering across callers
/// is the writer queue's job.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(concurrency)),
                running: AtomicUsize::new(0),
                refs: AtomicUsize::new(0),
                error: parking_lot::Mutex::new(ErrorSlot::default()),
                notify: Notify::new(),
                concurrency,
            }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Schedules a task. The future runs once a permit frees up; a 5 s
    /// watchdog logs a slowness advisory without interrupting it. A task
    /// error poisons the queue and resolves the handle to `None`.
    pub fn run<F, T>(&self, name: &str, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        let name = name.to_string();
        inner.running.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let permit = inner.semaphore.clone().acquire_owned().await;
            let result = match permit {
                Ok(_permit) => {
                    tokio::pin!(fut);
                    loop {
                        tokio::select! {
                            result = &mut fut => break result,
                            _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {
                                warn!("TS{}: {} is still running", CODE_TOO_SLOW, name);
                            }
                        }
                    }
                }
                Err(_) => Err(TsbError::Poisoned("queue closed".to_string())),
            };
            inner.running.fetch_sub(1, Ordering::SeqCst);
            let out = match result {
                Ok(value) => Some(value),
                Err(err) => {
                    inner.poison(err);
                    None
                }
            };
            inner.notify.notify_waiters();
            out
        })
    }

    /// Holds the queue open for work the pool does not own (e.g. the output
    /// writer).
    pub fn add_ref(&self) {
        self.inner.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unref(&self) {
        self.inner.refs.fetch_sub(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Poisons the queue; surfaced at the next `once_end`.
    pub fn error(&self, err: TsbError) {
        self.inner.poison(err);
    }

    /// Resolves when the in-flight set drops below capacity.
    pub async fn once_has_idle(&self) -> Result<()> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(err) = self.inner.take_error() {
                return Err(err);
            }
            if self.inner.running.load(Ordering::SeqCst) < self.inner.concurrency {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Resolves when the queue drains and all external references are gone,
    /// surfacing any stored poison error.
    pub async fn once_end(&self) -> Result<()> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(err) = self.inner.take_error() {
                return Err(err);
            }
            if self.inner.running.load(Ordering::SeqCst) == 0
                && self.inner.refs.load(Ordering::SeqCst) == 0
            {
                return Ok(());
            }
            notified.await;
        }
    }
}
