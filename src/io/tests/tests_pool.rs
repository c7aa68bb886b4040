//! I/O pool, account throttling and completion tests.
//!
//! Coverage:
//! - Submitted closures run and their results are delivered
//! - Failed operations surface as `IoError::Failed`
//! - A completion can only be taken once; signals can be waited on repeatedly
//! - Outstanding-request limit blocks the submitter until a slot frees
//! - Submitting after shutdown is rejected

#[cfg(test)]
mod tests {
    use crate::io::{DEFAULT_IO_PRIORITY, IoAccount, IoError, IoPool, IoSignal};
    use std::{
        io,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    #[test]
    fn submit_delivers_result() {
        let pool = IoPool::new(2);
        let account = IoAccount::default();

        let done = pool.submit(&account, || Ok(vec![1u8, 2, 3])).unwrap();
        assert_eq!(done.take().unwrap(), vec![1, 2, 3]);
        assert!(done.is_complete());
    }

    /// # Scenario
    /// A completion whose result has been moved out by `take`.
    ///
    /// # Actions
    /// 1. Finish a signal by hand and take its result.
    /// 2. Query it again from another thread.
    ///
    /// # Expected behavior
    /// It still reports completion, and a later `wait` returns instead of
    /// blocking forever.
    #[test]
    fn taken_completion_stays_complete() {
        let signal = Arc::new(IoSignal::new());
        assert!(!signal.is_complete());
        signal.finish(Ok(()));
        signal.take().unwrap();
        assert!(signal.is_complete());

        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        assert!(matches!(waiter.join().unwrap(), Err(IoError::Internal(_))));
    }

    #[test]
    fn failure_is_reported() {
        let pool = IoPool::new(1);
        let account = IoAccount::default();

        let done = pool
            .submit::<(), _>(&account, || Err(io::Error::other("disk on fire")))
            .unwrap();
        let err = done.wait().unwrap_err();
        assert!(matches!(err, IoError::Failed(msg) if msg.contains("disk on fire")));
    }

    #[test]
    fn completion_taken_once_signal_waited_many() {
        let pool = IoPool::new(1);
        let account = IoAccount::default();

        let value = pool.submit(&account, || Ok(7u64)).unwrap();
        assert_eq!(value.take().unwrap(), 7);
        assert!(matches!(value.take(), Err(IoError::Internal(_))));

        let signal = pool.submit(&account, || Ok(())).unwrap();
        signal.wait().unwrap();
        signal.wait().unwrap();
        assert!(signal.is_complete());
    }

    /// # Scenario
    /// An account limited to one outstanding request.
    ///
    /// # Actions
    /// 1. Submit a request that blocks until released.
    /// 2. From another thread, submit a second request.
    /// 3. Release the first request.
    ///
    /// # Expected behavior
    /// The second submit does not return until the first request has
    /// completed.
    #[test]
    fn outstanding_limit_throttles_submitter() {
        let pool = Arc::new(IoPool::new(2));
        let account = IoAccount::new(DEFAULT_IO_PRIORITY, 1);
        assert_eq!(account.outstanding_limit(), 1);

        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);
        let first = pool
            .submit(&account, move || {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();

        let submitted = Arc::new(AtomicUsize::new(0));
        let submitter = {
            let pool = Arc::clone(&pool);
            let account = account.clone();
            let submitted = Arc::clone(&submitted);
            thread::spawn(move || {
                let second = pool.submit(&account, || Ok(())).unwrap();
                submitted.store(1, Ordering::SeqCst);
                second.wait().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(submitted.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        first.wait().unwrap();
        submitter.join().unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn high_priority_requests_run() {
        let pool = IoPool::new(1);
        let high = IoAccount::new(DEFAULT_IO_PRIORITY + 10, 0);
        let normal = IoAccount::default();

        let a = pool.submit(&normal, || Ok(1u8)).unwrap();
        let b = pool.submit(&high, || Ok(2u8)).unwrap();
        assert_eq!(a.take().unwrap() + b.take().unwrap(), 3);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = IoPool::new(1);
        let account = IoAccount::default();
        let queued = pool.submit(&account, || Ok(())).unwrap();
        pool.shutdown();
        queued.wait().unwrap();

        let err = pool.submit(&account, || Ok(())).unwrap_err();
        assert!(matches!(err, IoError::PoolClosed));
    }
}
