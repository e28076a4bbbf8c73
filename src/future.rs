//! A cancellable, listenable result slot shared between a task and its callers.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::DhtError;

/// The state of a `DhtFuture`. Every future leaves `Pending` exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Success,
    Failure,
    Cancelled,
}

/// Anything that can be cancelled as part of a parent's cancellation.
pub trait Cancel: Send + Sync {
    /// Returns `true` if this call moved the target into the cancelled state.
    fn cancel(&self) -> bool;
}

type Listener<T> = Box<dyn FnOnce(&Result<T, DhtError>) + Send>;

struct Slot<T> {
    outcome: Option<Result<T, DhtError>>,
    listeners: Vec<Listener<T>>,
    children: Vec<Box<dyn Cancel>>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// The pending result of an asynchronous DHT operation.
///
/// Clones share the same slot. Listeners run exactly once, on the thread that completes the
/// future, or immediately on the registering thread if the future is already done. Cancelling a
/// future cancels every child registered through `add_child`.
pub struct DhtFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DhtFuture<T> {
    fn clone(&self) -> Self {
        DhtFuture {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for DhtFuture<T> {
    fn default() -> Self {
        DhtFuture::new()
    }
}

impl<T: Clone + Send + 'static> DhtFuture<T> {
    /// Constructs a new, pending future.
    pub fn new() -> Self {
        DhtFuture {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    outcome: None,
                    listeners: Vec::new(),
                    children: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Constructs a future that is already done.
    pub fn completed(result: Result<T, DhtError>) -> Self {
        let ret = DhtFuture::new();
        ret.complete(result);
        ret
    }

    pub fn state(&self) -> FutureState {
        match self.inner.slot.lock().outcome {
            None => FutureState::Pending,
            Some(Ok(_)) => FutureState::Success,
            Some(Err(DhtError::Cancelled)) => FutureState::Cancelled,
            Some(Err(_)) => FutureState::Failure,
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.slot.lock().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// Returns `true` if both handles refer to the same future.
    pub fn ptr_eq(&self, other: &DhtFuture<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Moves the future into its terminal state. Returns `false` if it was already done.
    pub fn complete(&self, result: Result<T, DhtError>) -> bool {
        let listeners = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(result.clone());
            slot.children.clear();
            mem::replace(&mut slot.listeners, Vec::new())
        };
        self.inner.cond.notify_all();
        for listener in listeners {
            listener(&result);
        }
        true
    }

    /// Cancels the future and all of its children. Calling this on a finished future is a no-op.
    pub fn cancel(&self) -> bool {
        let (listeners, children) = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(Err(DhtError::Cancelled));
            (
                mem::replace(&mut slot.listeners, Vec::new()),
                mem::replace(&mut slot.children, Vec::new()),
            )
        };
        self.inner.cond.notify_all();
        for child in children {
            child.cancel();
        }
        let result = Err(DhtError::Cancelled);
        for listener in listeners {
            listener(&result);
        }
        true
    }

    /// Registers `listener` to run once the future is done.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, DhtError>) + Send + 'static,
    {
        let result = {
            let mut slot = self.inner.slot.lock();
            match slot.outcome.clone() {
                Some(result) => result,
                None => {
                    slot.listeners.push(Box::new(listener));
                    return;
                },
            }
        };
        listener(&result);
    }

    /// Ties `child` to this future's cancellation. A child added to an already cancelled future is
    /// cancelled immediately.
    pub fn add_child<C: Cancel + 'static>(&self, child: C) {
        let cancelled = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_none() {
                slot.children.push(Box::new(child));
                return;
            }
            matches!(slot.outcome, Some(Err(DhtError::Cancelled)))
        };
        if cancelled {
            child.cancel();
        }
    }

    /// Blocks until the future is done.
    pub fn get(&self) -> Result<T, DhtError> {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(ref result) = slot.outcome {
                return result.clone();
            }
            self.inner.cond.wait(&mut slot);
        }
    }

    /// Blocks until the future is done or `timeout` elapses. Timing out does not cancel the
    /// future.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, DhtError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(ref result) = slot.outcome {
                return result.clone();
            }
            if self.inner.cond.wait_until(&mut slot, deadline).timed_out() {
                return match slot.outcome {
                    Some(ref result) => result.clone(),
                    None => Err(DhtError::Timeout),
                };
            }
        }
    }

    /// Returns a future completed with `f` applied to this future's success value.
    pub fn map<U, F>(&self, f: F) -> DhtFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |value| Ok(f(value)))
    }

    /// Returns a future completed with the result of `f` applied to this future's success value.
    /// Failures pass through unchanged, and cancelling the returned future cancels this one.
    pub fn and_then<U, F>(&self, f: F) -> DhtFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, DhtError> + Send + 'static,
    {
        let ret = DhtFuture::new();
        ret.add_child(self.clone());
        let target = ret.clone();
        self.add_listener(move |result| {
            target.complete(result.clone().and_then(f));
        });
        ret
    }
}

impl<T: Clone + Send + 'static> Cancel for DhtFuture<T> {
    fn cancel(&self) -> bool {
        DhtFuture::cancel(self)
    }
}

impl<T: Clone + Send + 'static> Debug for DhtFuture<T> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "DhtFuture({:?})", self.state())
    }
}
