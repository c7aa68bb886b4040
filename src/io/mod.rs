//! # I/O Pool
//!
//! Block payload reads and writes are executed by a small pool of worker
//! threads so the issuing context never blocks on a `pwrite` it does not
//! need to wait for.
//!
//! - [`IoPool`] — workers fed by two crossbeam queues; the high-priority
//!   queue is always drained first.
//! - [`IoAccount`] — a priority plus an optional limit on outstanding
//!   requests. Submitting through an account whose limit is reached blocks
//!   the submitter until one of its requests completes.
//! - [`IoCompletion`] — completion slot for one request, waited on with a
//!   condition variable. [`IoSignal`] is the payload-less variant that any
//!   number of threads may wait on.

#[cfg(test)]
mod tests;

use std::{
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, trace};

/// Priority of accounts created without an explicit one.
pub const DEFAULT_IO_PRIORITY: i32 = 100;

/// Outstanding-request limit meaning "no limit".
pub const UNLIMITED_OUTSTANDING_REQUESTS: usize = 0;

type IoJob = Box<dyn FnOnce() + Send>;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors reported by the I/O pool.
#[derive(Debug, Error, Clone)]
pub enum IoError {
    /// The operation itself failed.
    #[error("I/O request failed: {0}")]
    Failed(String),

    /// The pool has been shut down.
    #[error("I/O pool is closed")]
    PoolClosed,

    /// Poisoned lock or a completion that was consumed twice.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Completions
// ------------------------------------------------------------------------------------------------

/// Completion slot of one I/O request.
#[derive(Debug)]
pub struct IoCompletion<T> {
    state: Mutex<CompletionState<T>>,
    cv: Condvar,
}

#[derive(Debug)]
struct CompletionState<T> {
    result: Option<Result<T, String>>,
    finished: bool,
    taken: bool,
}

/// Completion of a request that produces no data.
pub type IoSignal = IoCompletion<()>;

impl<T> IoCompletion<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                result: None,
                finished: false,
                taken: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Stores the result and wakes every waiter.
    pub fn finish(&self, result: Result<T, String>) {
        if let Ok(mut state) = self.state.lock() {
            state.result = Some(result);
            state.finished = true;
        }
        self.cv.notify_all();
    }

    /// Returns `true` once a result has been stored, even if it was taken since.
    pub fn is_complete(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.finished,
            Err(_) => false,
        }
    }

    fn wait_until_complete(&self) -> Result<MutexGuard<'_, CompletionState<T>>, IoError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IoError::Internal("Mutex poisoned".into()))?;
        while !state.finished {
            state = self
                .cv
                .wait(state)
                .map_err(|_| IoError::Internal("Mutex poisoned".into()))?;
        }
        Ok(state)
    }

    /// Blocks until the request completes and moves its result out.
    pub fn take(&self) -> Result<T, IoError> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| IoError::Internal("Mutex poisoned".into()))?;
            if state.taken {
                return Err(IoError::Internal("completion already taken".into()));
            }
            state.taken = true;
        }
        let mut state = self.wait_until_complete()?;
        match state.result.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(IoError::Failed(e)),
            None => Err(IoError::Internal("completion vanished".into())),
        }
    }
}

impl<T> Default for IoCompletion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> IoCompletion<T> {
    /// Blocks until the request completes and returns a copy of its result.
    /// Any number of threads may wait.
    pub fn wait(&self) -> Result<T, IoError> {
        let state = self.wait_until_complete()?;
        match state.result.as_ref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(e)) => Err(IoError::Failed(e.clone())),
            None => Err(IoError::Internal("completion already taken".into())),
        }
    }

    /// Copy of the result if the request has completed, without blocking.
    pub fn peek(&self) -> Option<Result<T, IoError>> {
        let state = self.state.lock().ok()?;
        state.result.as_ref().map(|result| match result {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(IoError::Failed(e.clone())),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// I/O accounts
// ------------------------------------------------------------------------------------------------

/// Priority and throttling settings that requests are submitted under.
#[derive(Debug, Clone)]
pub struct IoAccount {
    inner: Arc<AccountInner>,
}

#[derive(Debug)]
struct AccountInner {
    priority: i32,
    outstanding_limit: usize,
    permits: Option<(Sender<()>, Receiver<()>)>,
}

/// One outstanding request slot; returned to the account on drop.
struct Permit {
    release: Option<Receiver<()>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(rx) = self.release.take() {
            let _ = rx.try_recv();
        }
    }
}

impl IoAccount {
    /// Creates an account. `outstanding_limit == 0` means unlimited.
    pub fn new(priority: i32, outstanding_limit: usize) -> Self {
        let permits = if outstanding_limit == UNLIMITED_OUTSTANDING_REQUESTS {
            None
        } else {
            Some(channel::bounded(outstanding_limit))
        };
        Self {
            inner: Arc::new(AccountInner {
                priority,
                outstanding_limit,
                permits,
            }),
        }
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    pub fn outstanding_limit(&self) -> usize {
        self.inner.outstanding_limit
    }

    fn is_high_priority(&self) -> bool {
        self.inner.priority > DEFAULT_IO_PRIORITY
    }

    /// Blocks while the account already has `outstanding_limit` requests in flight.
    fn acquire(&self) -> Result<Permit, IoError> {
        match &self.inner.permits {
            None => Ok(Permit { release: None }),
            Some((tx, rx)) => {
                tx.send(()).map_err(|_| IoError::PoolClosed)?;
                Ok(Permit {
                    release: Some(rx.clone()),
                })
            }
        }
    }
}

impl Default for IoAccount {
    fn default() -> Self {
        Self::new(DEFAULT_IO_PRIORITY, UNLIMITED_OUTSTANDING_REQUESTS)
    }
}

// ------------------------------------------------------------------------------------------------
// Worker pool
// ------------------------------------------------------------------------------------------------

/// Worker threads executing submitted I/O closures.
pub struct IoPool {
    queues: Mutex<Option<(Sender<IoJob>, Sender<IoJob>)>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for IoPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoPool").finish_non_exhaustive()
    }
}

impl IoPool {
    /// Spawns `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let (high_tx, high_rx) = channel::unbounded::<IoJob>();
        let (normal_tx, normal_rx) = channel::unbounded::<IoJob>();

        let mut workers = Vec::with_capacity(threads.max(1));
        for id in 0..threads.max(1) {
            let high = high_rx.clone();
            let normal = normal_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("logser-io-{id}"))
                .spawn(move || worker_loop(high, normal))
                .expect("failed to spawn I/O worker thread");
            workers.push(handle);
        }

        Self {
            queues: Mutex::new(Some((high_tx, normal_tx))),
            workers: Mutex::new(workers),
        }
    }

    /// Queues `op` under `account` and returns its completion.
    ///
    /// Blocks only while the account's outstanding-request limit is reached.
    pub fn submit<T, F>(&self, account: &IoAccount, op: F) -> Result<Arc<IoCompletion<T>>, IoError>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let completion = Arc::new(IoCompletion::new());
        self.submit_into(account, Arc::clone(&completion), op)?;
        Ok(completion)
    }

    /// Like [`submit`](Self::submit), but reports into a completion the
    /// caller created beforehand.
    pub fn submit_into<T, F>(
        &self,
        account: &IoAccount,
        completion: Arc<IoCompletion<T>>,
        op: F,
    ) -> Result<(), IoError>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let sender = {
            let queues = self
                .queues
                .lock()
                .map_err(|_| IoError::Internal("Mutex poisoned".into()))?;
            match queues.as_ref() {
                Some((high, _)) if account.is_high_priority() => high.clone(),
                Some((_, normal)) => normal.clone(),
                None => return Err(IoError::PoolClosed),
            }
        };

        let permit = account.acquire()?;
        let job: IoJob = Box::new(move || {
            let result = op().map_err(|e| e.to_string());
            drop(permit);
            completion.finish(result);
        });

        sender.send(job).map_err(|_| IoError::PoolClosed)?;
        trace!(priority = account.priority(), "I/O request queued");
        Ok(())
    }

    /// Stops accepting requests, lets the workers drain both queues and joins them.
    pub fn shutdown(&self) {
        let queues = match self.queues.lock() {
            Ok(mut q) => q.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(queues);

        let workers = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let count = workers.len();
        for worker in workers {
            let _ = worker.join();
        }
        if count > 0 {
            debug!(workers = count, "I/O pool drained");
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(high: Receiver<IoJob>, normal: Receiver<IoJob>) {
    loop {
        if let Ok(job) = high.try_recv() {
            job();
            continue;
        }
        crossbeam::select! {
            recv(high) -> msg => match msg {
                Ok(job) => job(),
                Err(_) => {
                    for job in normal.iter() {
                        job();
                    }
                    return;
                }
            },
            recv(normal) -> msg => match msg {
                Ok(job) => job(),
                Err(_) => {
                    for job in high.iter() {
                        job();
                    }
                    return;
                }
            },
        }
    }
}
