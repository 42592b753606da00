//! Bounded execution of background fetch work.
//!
//! A [`WorkerPool`] spawns tasks onto the runtime but gates their bodies
//! behind a semaphore, so at most `concurrency` of them make progress at a
//! time. [`WorkerPool::purge`] drops everything still waiting for a permit;
//! tasks that already started keep running to completion.

use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Handle to the spawned future that will cancel it on drop.
#[derive(Debug)]
pub struct CancelOnDrop<T> {
    handle: JoinHandle<T>,
}

impl<T> CancelOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        CancelOnDrop { handle }
    }
}

impl<T> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl<T> Future for CancelOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    name: &'static str,
    runtime: Handle,
    permits: Arc<Semaphore>,
    /// Replaced wholesale on purge; tasks hold a clone of the token that was
    /// current when they were submitted.
    gate: Mutex<CancellationToken>,
}

impl WorkerPool {
    pub fn new(name: &'static str, concurrency: usize, runtime: Handle) -> Self {
        Self {
            name,
            runtime,
            permits: Arc::new(Semaphore::new(concurrency)),
            gate: Mutex::new(CancellationToken::new()),
        }
    }

    fn current_gate(&self) -> CancellationToken {
        match self.gate.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Submits a task, yielding `None` if it was purged before it started.
    pub fn submit<F, T>(&self, task: F) -> CancelOnDrop<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = self.name;
        let permits = Arc::clone(&self.permits);
        let gate = self.current_gate();

        let handle = self.runtime.spawn(async move {
            let _permit = tokio::select! {
                _ = gate.cancelled() => {
                    metric!(counter("worker_pool.purged") += 1, "pool" => name);
                    return None;
                }
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return None,
                },
            };

            metric!(counter("worker_pool.task") += 1, "pool" => name);
            Some(task.await)
        });

        CancelOnDrop::new(handle)
    }

    /// Submits one task per index in `range`, keyed by that index.
    ///
    /// The tasks are created eagerly and all queued at once; the pool's
    /// permit count decides how many of them actually overlap.
    pub fn submit_sequence<M, F, T>(
        &self,
        range: Range<u64>,
        mut make_task: M,
    ) -> Vec<(u64, CancelOnDrop<Option<T>>)>
    where
        M: FnMut(u64) -> F,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        range
            .map(|index| (index, self.submit(make_task(index))))
            .collect()
    }

    /// Drops all submitted tasks that have not acquired a permit yet.
    ///
    /// The pool stays usable, later submissions run normally.
    pub fn purge(&self) {
        let mut gate = match self.gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        gate.cancel();
        *gate = CancellationToken::new();
    }
}
