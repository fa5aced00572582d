//! Two-queue task manager.
//!
//! Background tasks run on a single worker thread. A background task may
//! return a follow-up foreground task, which is queued until the owning
//! thread drains the foreground queue with
//! [`TaskManager::run_foreground_tasks`]. Foreground tasks receive `&mut C`,
//! so every observer-visible mutation of `C` happens on that thread.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};

/// How long the worker waits for a task before re-checking the stop flag.
pub const BACKGROUND_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Work that mutates the foreground context.
pub type ForegroundTask<C> = Box<dyn FnOnce(&mut C) -> Result<()> + Send>;

/// Work run on the background worker, optionally producing a foreground task.
pub type BackgroundTask<C> = Box<dyn FnOnce() -> Result<Option<ForegroundTask<C>>> + Send>;

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Count of submitted background tasks that have not finished yet.
#[derive(Debug, Default)]
struct Outstanding {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Outstanding {
    fn add(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let _count = self
            .drained
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Cloneable handle for submitting foreground tasks from any thread.
pub struct ForegroundSender<C> {
    tx: Sender<ForegroundTask<C>>,
    queued: Arc<AtomicUsize>,
}

impl<C> Clone for ForegroundSender<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            queued: Arc::clone(&self.queued),
        }
    }
}

impl<C> ForegroundSender<C> {
    /// Queue a foreground task. Never blocks.
    pub fn put(&self, task: ForegroundTask<C>) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            warn!("Foreground queue closed; dropping task");
        }
    }
}

/// Background/foreground scheduler for a foreground context `C`.
pub struct TaskManager<C> {
    background_tx: Sender<BackgroundTask<C>>,
    // Held here while the worker is stopped; the worker hands it back on exit.
    background_rx: Mutex<Option<Receiver<BackgroundTask<C>>>>,
    background_queued: Arc<AtomicUsize>,
    outstanding: Arc<Outstanding>,
    foreground: ForegroundSender<C>,
    foreground_rx: Mutex<Receiver<ForegroundTask<C>>>,
    worker: Mutex<Option<JoinHandle<Receiver<BackgroundTask<C>>>>>,
    stop_flag: Arc<AtomicBool>,
}

impl<C: 'static> Default for TaskManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> TaskManager<C> {
    /// Creates a stopped task manager.
    #[must_use]
    pub fn new() -> Self {
        let (background_tx, background_rx) = channel();
        let (foreground_tx, foreground_rx) = channel();
        Self {
            background_tx,
            background_rx: Mutex::new(Some(background_rx)),
            background_queued: Arc::new(AtomicUsize::new(0)),
            outstanding: Arc::new(Outstanding::default()),
            foreground: ForegroundSender {
                tx: foreground_tx,
                queued: Arc::new(AtomicUsize::new(0)),
            },
            foreground_rx: Mutex::new(foreground_rx),
            worker: Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true while the background worker is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start the background worker. Does nothing if it is already running.
    ///
    /// # Errors
    /// Returns an error if the worker thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            warn!("Task manager already started");
            return Ok(());
        }

        let Some(rx) = self
            .background_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("Task manager background queue unavailable");
            return Ok(());
        };

        info!("Starting task manager...");
        self.stop_flag.store(false, Ordering::SeqCst);

        let context = WorkerContext {
            rx,
            foreground: self.foreground.clone(),
            queued: Arc::clone(&self.background_queued),
            outstanding: Arc::clone(&self.outstanding),
            stop_flag: Arc::clone(&self.stop_flag),
        };
        let handle = thread::Builder::new()
            .name("diffpix-background".to_string())
            .spawn(move || context.run())?;
        *worker = Some(handle);

        info!("Task manager started");
        Ok(())
    }

    /// Stop the background worker.
    ///
    /// With `await_finish`, blocks until every queued background task has run.
    /// Otherwise tasks still queued are kept and run after the next
    /// [`Self::start`].
    pub fn stop(&self, await_finish: bool) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = worker.take() else {
            info!("Task manager already stopped");
            return;
        };

        info!("Stopping task manager...");
        if await_finish {
            self.outstanding.wait_drained();
        }
        self.stop_flag.store(true, Ordering::SeqCst);

        match handle.join() {
            Ok(rx) => {
                *self
                    .background_rx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(rx);
            }
            Err(payload) => error!(
                "Background worker panicked: {}",
                panic_message(payload.as_ref())
            ),
        }
        info!("Task manager stopped");
    }

    /// Queue a background task. Never blocks; callable from any thread.
    pub fn put_background_task(&self, task: BackgroundTask<C>) {
        self.outstanding.add();
        self.background_queued.fetch_add(1, Ordering::SeqCst);
        if self.background_tx.send(task).is_err() {
            self.background_queued.fetch_sub(1, Ordering::SeqCst);
            self.outstanding.done();
            warn!("Background queue closed; dropping task");
        }
    }

    /// Queue a foreground task. Never blocks; callable from any thread.
    pub fn put_foreground_task(&self, task: ForegroundTask<C>) {
        self.foreground.put(task);
    }

    /// Handle for queueing foreground tasks from other threads.
    #[must_use]
    pub fn foreground_sender(&self) -> ForegroundSender<C> {
        self.foreground.clone()
    }

    /// Number of background tasks waiting to run.
    pub fn background_queue_size(&self) -> usize {
        self.background_queued.load(Ordering::SeqCst)
    }

    /// Number of foreground tasks waiting to run.
    pub fn foreground_queue_size(&self) -> usize {
        self.foreground.queued.load(Ordering::SeqCst)
    }

    /// Run queued foreground tasks on the calling thread until the queue is
    /// empty, returning how many ran.
    ///
    /// Failures and panics are logged per task and never stop the drain. Must
    /// only be called from the thread that owns `context`.
    pub fn run_foreground_tasks(&self, context: &mut C) -> usize {
        let rx = self
            .foreground_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;

        while let Ok(task) = rx.try_recv() {
            self.foreground.queued.fetch_sub(1, Ordering::SeqCst);
            count += 1;
            match catch_unwind(AssertUnwindSafe(|| task(context))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Foreground task failed: {e}"),
                Err(payload) => error!(
                    "Foreground task failed: {}",
                    Error::TaskPanicked(panic_message(payload.as_ref()))
                ),
            }
        }

        count
    }
}

impl<C> Drop for TaskManager<C> {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            self.stop_flag.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                error!("Background worker panicked");
            }
        }
    }
}

struct WorkerContext<C> {
    rx: Receiver<BackgroundTask<C>>,
    foreground: ForegroundSender<C>,
    queued: Arc<AtomicUsize>,
    outstanding: Arc<Outstanding>,
    stop_flag: Arc<AtomicBool>,
}

impl<C> WorkerContext<C> {
    fn run(self) -> Receiver<BackgroundTask<C>> {
        while !self.stop_flag.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(BACKGROUND_POLL_TIMEOUT) {
                Ok(task) => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    self.execute(task);
                    self.outstanding.done();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Background worker exiting");
        self.rx
    }

    fn execute(&self, task: BackgroundTask<C>) {
        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(Some(foreground_task))) => self.foreground.put(foreground_task),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => error!("Background task failed: {e}"),
            Err(payload) => error!(
                "Background task failed: {}",
                Error::TaskPanicked(panic_message(payload.as_ref()))
            ),
        }
    }
}
