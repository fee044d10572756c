//! Background workers
//!
//! Each worker is one named thread draining a FIFO job queue. The pool has
//! an `io` worker for capture and persistence and an `inference` worker
//! for everything touching the engine.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Sender};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum Message {
    Run(Job),
    Stop,
}

/// Cloneable handle for submitting jobs to a worker
#[derive(Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    tx: Sender<Message>,
}

impl WorkerHandle {
    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. Fails once the worker has stopped; the job is dropped.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(job)))
            .map_err(|_| anyhow!("worker '{}' has stopped", self.name))
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").field("name", &self.name).finish()
    }
}

/// A background thread with a job queue. Dropping it drains the queue and
/// joins the thread.
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start a worker thread
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = unbounded::<Message>();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("{}-worker", name))
            .spawn(move || {
                debug!("Worker '{}' started", thread_name);
                for message in rx.iter() {
                    match message {
                        Message::Run(job) => {
                            // A panicking job must not take the worker down
                            if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                                error!("Job on worker '{}' panicked: {}", thread_name, panic_message(&*panic));
                            }
                        }
                        Message::Stop => break,
                    }
                }
                debug!("Worker '{}' stopped", thread_name);
            })
            .with_context(|| format!("Failed to spawn worker '{}'", name))?;

        Ok(Self {
            handle: WorkerHandle {
                name: Arc::from(name),
                tx,
            },
            thread: Some(thread),
        })
    }

    /// Handle for submitting jobs
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Message::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The fixed set of pipeline workers
pub struct WorkerPool {
    /// Capture and persistence
    pub io: Worker,
    /// Engine lifecycle and inference
    pub inference: Worker,
}

impl WorkerPool {
    /// Start both workers
    pub fn new() -> Result<Self> {
        let pool = Self {
            io: Worker::spawn("io")?,
            inference: Worker::spawn("inference")?,
        };
        info!("Worker pool started");
        Ok(pool)
    }
}
