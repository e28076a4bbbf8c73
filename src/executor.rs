use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::error::DhtError;
use crate::future::DhtFuture;

type Job = Box<dyn FnOnce() + Send>;

/// A fixed-size pool of worker threads.
///
/// A task must not block on another task of the same pool: once every worker waits, the awaited
/// tasks never get to run.
///
/// Every submitted task gets a handle to its own future so it can check for cancellation and
/// register the futures it spawns as children.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
}

impl WorkerPool {
    pub fn new(size: usize, name: &str) -> Self {
        let size = size.max(1);
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for index in 0..size {
            let rx = Arc::clone(&rx);
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", name, index))
                .spawn(move || Self::work(&rx));
            if let Err(err) = spawned {
                error!("{} - Could not spawn worker {}: {}", name, index, err);
            }
        }
        WorkerPool {
            sender: Mutex::new(Some(tx)),
        }
    }

    fn work(rx: &Mutex<Receiver<Job>>) {
        loop {
            let job = {
                let rx = rx.lock();
                rx.recv()
            };
            match job {
                Ok(job) => job(),
                Err(_) => break,
            }
        }
    }

    /// Runs `task` on the pool and returns its future. The task is skipped if the future is
    /// cancelled before a worker picks it up.
    pub fn submit<T, F>(&self, task: F) -> DhtFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&DhtFuture<T>) -> Result<T, DhtError> + Send + 'static,
    {
        let future = DhtFuture::new();
        let handle = future.clone();
        let job: Job = Box::new(move || {
            if handle.is_done() {
                return;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| task(&handle)))
                .unwrap_or_else(|payload| Err(DhtError::TaskPanicked(panic_message(&*payload))));
            handle.complete(result);
        });

        let sent = match *self.sender.lock() {
            Some(ref sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            future.complete(Err(DhtError::Shutdown));
        }
        future
    }

    /// Stops accepting tasks. Workers exit once the queued tasks are drained.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
