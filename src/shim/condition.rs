//! Wait/post handoff between the library callback thread and the coordinator thread.

use log::debug;
use nix::sys::signal::Signal;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, ignoring poisoning: a panicked callback must not hang the coordinator.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reason for releasing every waiter at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trip {
    /// Launcher (or, in attach mode, application) terminated.
    LauncherTerminated,
    /// The last connection to the server was lost.
    ConnectionLost,
    /// Shutdown requested by a signal.
    Interrupted(Signal),
}

/// Process-wide escape hatch: once tripped no [`Condition::wait`] blocks anymore.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<Option<Trip>>,
}

impl Latch {
    /// Trip the latch. The first reason wins, return false if already tripped.
    pub fn trip(&self, reason: Trip) -> bool {
        let mut state = lock(&self.state);
        if state.is_some() {
            return false;
        }
        *state = Some(reason);
        true
    }

    pub fn state(&self) -> Option<Trip> {
        *lock(&self.state)
    }

    pub fn is_tripped(&self) -> bool {
        self.state().is_some()
    }
}

/// Outcome of a [`Condition::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    Posted,
    Released(Trip),
}

/// Named mutex + condition variable + pending flag.
///
/// A waiter blocks while the condition is pending and the latch is open, then re-arms the
/// condition before returning, so one instance serves any number of wait/post cycles.
#[derive(Debug)]
pub struct Condition {
    name: &'static str,
    pending: Mutex<bool>,
    cvar: Condvar,
    latch: Arc<Latch>,
}

impl Condition {
    pub fn new(name: &'static str, latch: Arc<Latch>) -> Self {
        Self {
            name,
            pending: Mutex::new(true),
            cvar: Condvar::new(),
            latch,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn wait(&self) -> Wake {
        debug!(target: "shim", "wait for condition '{}'", self.name);

        let mut pending = lock(&self.pending);
        while *pending && !self.latch.is_tripped() {
            pending = self
                .cvar
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *pending = true;
        drop(pending);

        match self.latch.state() {
            Some(trip) => Wake::Released(trip),
            None => Wake::Posted,
        }
    }

    pub fn post(&self) {
        debug!(target: "shim", "post condition '{}'", self.name);

        let mut pending = lock(&self.pending);
        *pending = false;
        self.cvar.notify_all();
    }
}

/// The conditions of a shim run, sharing one latch.
#[derive(Debug)]
pub struct Conditions {
    /// Launcher declared itself ready.
    pub ready: Condition,
    /// Launcher finished launching the application.
    pub complete: Condition,
    /// Launcher (or application) terminated.
    pub terminate: Condition,
    /// An event handler registration completed.
    pub registration: Condition,
    latch: Arc<Latch>,
}

impl Default for Conditions {
    fn default() -> Self {
        Self::new()
    }
}

impl Conditions {
    pub fn new() -> Self {
        let latch = Arc::new(Latch::default());
        Self {
            ready: Condition::new("launch-ready", latch.clone()),
            complete: Condition::new("launch-complete", latch.clone()),
            terminate: Condition::new("launch-terminated", latch.clone()),
            registration: Condition::new("callback-registration", latch.clone()),
            latch,
        }
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    /// Post every condition.
    pub fn release_all(&self) {
        self.ready.post();
        self.complete.post();
        self.terminate.post();
        self.registration.post();
    }

    /// Trip the latch and wake every waiter.
    pub fn trip(&self, reason: Trip) {
        if self.latch.trip(reason) {
            debug!(target: "shim", "release all conditions: {reason:?}");
        }
        self.release_all();
    }
}
