use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Named FIFO queue with exactly one consumer.
///
/// A dedicated OS thread drives a current-thread tokio runtime and runs each
/// task to completion before starting the next, so tasks never overlap.
/// Submitting never blocks.
pub struct DeliveryQueue {
    name: String,
    tx: Option<mpsc::UnboundedSender<Task>>,
    pending: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl DeliveryQueue {
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker_name = name.clone();
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(task) = rx.recv().await {
                        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                            error!(
                                queue = %worker_name,
                                panic = panic_message(panic.as_ref()),
                                "queued task panicked"
                            );
                        }
                        worker_pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    debug!(queue = %worker_name, "queue closed, worker exiting");
                });
            })?;

        Ok(Self {
            name,
            tx: Some(tx),
            pending,
            worker: Some(worker),
        })
    }

    /// Append a task. Returns `false` if the worker is gone.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(tx) = &self.tx else {
            return false;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(Box::pin(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Tasks submitted but not yet finished, including the running one.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the queue, let the worker finish what is queued, and join it.
    pub fn shutdown(mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(queue = %self.name, "queue worker terminated abnormally");
            }
        }
    }
}

impl Drop for DeliveryQueue {
    // The worker drains remaining tasks on its own; joining here could block
    // an async caller.
    fn drop(&mut self) {
        drop(self.tx.take());
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
