// Bounded worker pool for blocking image work
//
// A fixed set of OS threads drains a bounded crossbeam channel. Submission
// never blocks: a full queue is reported back to the caller instead.

use crate::error::PoolError;
use crossbeam::channel::{self, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_depth: usize) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded::<Job>(queue_depth.max(1));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let active = active.clone();
            let handle = thread::Builder::new()
                .name(format!("htr-worker-{i}"))
                .spawn(move || {
                    for job in rx {
                        active.fetch_add(1, Ordering::SeqCst);
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!("Background job panicked");
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                    tracing::debug!("Worker {} finished gracefully", i);
                })?;
            handles.push(handle);
        }
        tracing::info!(
            "Started {} workers with a queue of {}",
            handles.len(),
            queue_depth.max(1)
        );

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            active,
        })
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(PoolError::ShutDown)?;
        match tx.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::Saturated),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::ShutDown),
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued_jobs(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |tx| tx.len())
    }

    /// Stops accepting jobs, lets queued ones finish and joins the workers.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        tracing::info!("Waiting for {} workers to finish", handles.len());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Worker thread exited abnormally");
            }
        }
    }
}
