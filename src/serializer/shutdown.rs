//! Shutdown sequencing.
//!
//! Shutdown is an explicit state value that only moves forward:
//!
//! ```text
//! Begin → WaitingOnSerializer → WaitingOnDataBlockManager
//!       → WaitingOnBlockTokens → WaitingOnLba → Done
//! ```
//!
//! Each step is left when the component it waits on reports completion
//! through [`ShutdownListener::on_shutdown_complete`]. The data block
//! manager and the LBA index call the listener themselves; the serializer
//! reports its own two steps (transaction queue drained, block tokens
//! released). Callers observe the whole sequence through one
//! [`ShutdownHandle`].

use super::SerializerError;
use crate::io::IoSignal;
use std::{
    sync::{Arc, Mutex},
    thread,
};
use tracing::debug;

/// Progress of a serializer shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownState {
    Begin,
    WaitingOnSerializer,
    WaitingOnDataBlockManager,
    WaitingOnBlockTokens,
    WaitingOnLba,
    Done,
}

impl ShutdownState {
    fn successor(self) -> Option<Self> {
        match self {
            Self::Begin => Some(Self::WaitingOnSerializer),
            Self::WaitingOnSerializer => Some(Self::WaitingOnDataBlockManager),
            Self::WaitingOnDataBlockManager => Some(Self::WaitingOnBlockTokens),
            Self::WaitingOnBlockTokens => Some(Self::WaitingOnLba),
            Self::WaitingOnLba => Some(Self::Done),
            Self::Done => None,
        }
    }
}

/// Narrow completion hook handed to components that take part in shutdown.
pub trait ShutdownListener {
    /// The component has finished everything it had outstanding.
    fn on_shutdown_complete(&mut self);
}

/// Drives [`ShutdownState`] forward; shared with the caller's handle.
#[derive(Debug)]
pub(crate) struct ShutdownMachine {
    state: Arc<Mutex<ShutdownState>>,
    overrun: bool,
}

impl ShutdownMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ShutdownState::Begin)),
            overrun: false,
        }
    }

    pub(crate) fn shared_state(&self) -> Arc<Mutex<ShutdownState>> {
        Arc::clone(&self.state)
    }

    pub(crate) fn state(&self) -> ShutdownState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Moves to the next state.
    pub(crate) fn advance(&mut self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.successor() {
            Some(next) => {
                debug!(from = ?*state, to = ?next, "shutdown advanced");
                *state = next;
            }
            None => self.overrun = true,
        }
    }

    /// Fails unless the machine is in `expected`.
    pub(crate) fn expect(&self, expected: ShutdownState) -> Result<(), SerializerError> {
        let current = self.state();
        if self.overrun || current != expected {
            return Err(SerializerError::InvariantViolation(format!(
                "shutdown in state {current:?}, expected {expected:?}"
            )));
        }
        Ok(())
    }
}

impl ShutdownListener for ShutdownMachine {
    fn on_shutdown_complete(&mut self) {
        self.advance();
    }
}

/// Completion handle returned by
/// [`LogSerializer::begin_shutdown`](super::LogSerializer::begin_shutdown).
#[derive(Debug)]
pub struct ShutdownHandle {
    state: Arc<Mutex<ShutdownState>>,
    done: Arc<IoSignal>,
    worker: Option<thread::JoinHandle<Result<(), SerializerError>>>,
}

impl ShutdownHandle {
    pub(crate) fn new(
        state: Arc<Mutex<ShutdownState>>,
        done: Arc<IoSignal>,
        worker: thread::JoinHandle<Result<(), SerializerError>>,
    ) -> Self {
        Self {
            state,
            done,
            worker: Some(worker),
        }
    }

    /// Current step of the shutdown sequence.
    pub fn state(&self) -> ShutdownState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// `true` once the sequence has finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.done.is_complete()
    }

    /// Blocks until the shutdown sequence finishes.
    pub fn wait(mut self) -> Result<(), SerializerError> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| SerializerError::Internal("shutdown thread panicked".into()))?,
            None => Ok(()),
        }
    }
}
