//! Resuming a stopped tracer on the way out, exactly once.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::tracer::Tracer;
use crate::Pid;


const ABSENT: i32 = 0;

/// Holder of the tracer handle.
///
/// Once armed, the first [`release()`](CleanupGuard::release) swaps the handle back to
/// absent and thaws the tracer. Any later or concurrent release finds it absent and does
/// nothing, so the tracer sees at most one `SIGCONT` however many exit paths run.
pub struct CleanupGuard {
    tracer: AtomicI32,
    control: Arc<dyn Tracer>,
}

impl CleanupGuard {
    pub fn new(control: Arc<dyn Tracer>) -> Self {
        let tracer = AtomicI32::new(ABSENT);
        Self { tracer, control }
    }

    /// Record `tracer` as the process to resume. A guard can only be armed once.
    pub fn arm(&self, tracer: Pid) -> Result<()> {
        let raw = tracer.as_raw();

        if raw <= ABSENT {
            return Err(Error::Internal(format!("cannot arm cleanup guard with PID {tracer}")));
        }

        if self.tracer.compare_exchange(ABSENT, raw, Ordering::AcqRel, Ordering::Acquire).is_err() {
            internal_error!("cleanup guard armed twice");
        }

        Ok(())
    }

    /// The tracer still to be resumed, if any.
    pub fn tracer(&self) -> Option<Pid> {
        match self.tracer.load(Ordering::Acquire) {
            ABSENT => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    /// Resume the tracer if it has not been resumed yet.
    ///
    /// Returns `true` iff this call sent the resume.
    pub fn release(&self) -> Result<bool> {
        let raw = self.tracer.load(Ordering::Acquire);
        info!(tracer = raw, "Resuming tracer PID {}", raw);

        self.release_quiet()
    }

    /// [`release()`](CleanupGuard::release) without logging, for exit and signal handlers.
    pub fn release_quiet(&self) -> Result<bool> {
        match self.tracer.swap(ABSENT, Ordering::AcqRel) {
            ABSENT => Ok(false),
            raw => {
                self.control.resume(Pid::from_raw(raw))?;
                Ok(true)
            },
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_quiet() {
            warn!(%err, "could not resume tracer");
        }
    }
}
