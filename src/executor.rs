use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};
use log::{debug, error};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of named worker threads that run listener callbacks and edge notifications off the
/// update path.
///
/// Each worker owns its own queue. Jobs submitted with the same lane key always land on the same
/// worker, so they run in submission order; unkeyed jobs are spread round robin.
pub struct Executor {
    name: String,
    lanes: RwLock<Vec<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl Executor {
    /// Spawns `size` workers (at least one).
    pub fn new(name: &str, size: usize) -> Result<Executor> {
        let size = size.max(1);
        let mut lanes = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for i in 0..size {
            let (tx, rx) = unbounded::<Job>();
            let thread_name = format!("{}-{}", name, i);
            let worker_name = thread_name.clone();
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    // the loop ends once every sender is dropped and the queue is drained
                    for job in rx.iter() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("[{}] a listener panicked; continuing", worker_name);
                        }
                    }
                    debug!("[{}] stopped", worker_name);
                })
                .map_err(Error::WorkerSpawn)?;
            lanes.push(tx);
            workers.push(handle);
        }

        Ok(Executor {
            name: name.to_string(),
            lanes: RwLock::new(lanes),
            workers: Mutex::new(workers),
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.lanes.read().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.lanes.read().is_empty()
    }

    /// Runs `job` on the next worker in turn.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let lane = self.next.fetch_add(1, Ordering::Relaxed);
        self.dispatch(lane, Box::new(job))
    }

    /// Runs `job` on the worker that owns `key`, after every job previously submitted for it.
    pub fn execute_keyed<F>(&self, key: &str, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.dispatch(hasher.finish() as usize, Box::new(job))
    }

    fn dispatch(&self, lane: usize, job: Job) -> Result<()> {
        let lanes = self.lanes.read();
        if lanes.is_empty() {
            return Err(Error::ExecutorShutdown);
        }
        lanes[lane % lanes.len()]
            .send(job)
            .map_err(|_| Error::ExecutorShutdown)
    }

    /// Stops accepting jobs, lets the queued ones finish and joins the workers. Calling this from
    /// one of the workers skips joining that worker. Safe to call more than once.
    pub fn shutdown(&self) {
        let lanes = std::mem::take(&mut *self.lanes.write());
        if lanes.is_empty() {
            return;
        }
        drop(lanes);

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("[{}] worker exited abnormally", self.name);
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
