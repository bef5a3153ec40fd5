//! Monotonic time and deadline-bounded polling.
//!
//! Every wait in the harness goes through [`TimedWait`], so a stuck tracer turns into an
//! error after a fixed budget instead of a hang. The [`Clock`] is injectable, which lets
//! tests expire deadlines without sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};


/// How a polling loop spends the gap between two attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pace {
    /// Spin on the CPU, without entering the kernel.
    Spin,

    /// Give up the processor with `sched_yield(2)`.
    Yield,
}

/// Source of monotonic time for deadlines.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    /// Let time pass between two attempts of a polling loop.
    fn relax(&self, pace: Pace) -> Result<()>;
}

/// `CLOCK_MONOTONIC`, via [`Instant`].
#[derive(Clone, Copy, Debug)]
pub struct Monotonic {
    origin: Instant,
}

impl Monotonic {
    pub fn new() -> Self {
        let origin = Instant::now();
        Self { origin }
    }
}

impl Default for Monotonic {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for Monotonic {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn relax(&self, pace: Pace) -> Result<()> {
        match pace {
            Pace::Spin => std::hint::spin_loop(),
            Pace::Yield => nix::sched::sched_yield()?,
        }

        Ok(())
    }
}

/// A wall-clock budget for one blocking operation.
///
/// The budget starts counting when a wait begins, not when the `TimedWait` is built, so
/// one value can bound several consecutive waits.
#[derive(Clone)]
pub struct TimedWait {
    clock: Arc<dyn Clock>,
    budget: Duration,
    pace: Pace,
    cancel: Option<Arc<AtomicBool>>,
}

impl TimedWait {
    pub fn new(clock: Arc<dyn Clock>, budget: Duration) -> Self {
        let pace = Pace::Spin;
        let cancel = None;

        Self { clock, budget, pace, cancel }
    }

    /// Set how to pass time between attempts. Defaults to [`Pace::Spin`].
    pub fn with_pace(mut self, pace: Pace) -> Self {
        self.pace = pace;
        self
    }

    /// Abort the wait with [`Error::Cancelled`] once `flag` is raised.
    pub fn cancelled_by(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn pace(&self) -> Pace {
        self.pace
    }

    /// Mark the start of a wait.
    pub fn start(&self) -> Duration {
        self.clock.now()
    }

    /// Time left of the budget for a wait begun at `start`.
    pub fn remaining(&self, start: Duration) -> Duration {
        let elapsed = self.clock.now().saturating_sub(start);
        self.budget.saturating_sub(elapsed)
    }

    pub fn expired(&self, start: Duration) -> bool {
        self.remaining(start) == Duration::ZERO
    }

    pub fn relax(&self) -> Result<()> {
        self.clock.relax(self.pace)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Acquire) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Call `probe` until it yields a value or the budget runs out.
    ///
    /// The probe always runs at least once. Returns `Ok(None)` on expiry; callers turn that
    /// into the timeout error that names what they were waiting for.
    pub fn poll<T>(&self, mut probe: impl FnMut() -> Result<Option<T>>) -> Result<Option<T>> {
        let start = self.start();

        loop {
            self.check_cancelled()?;

            if let Some(value) = probe()? {
                return Ok(Some(value));
            }

            self.relax()?;

            if self.expired(start) {
                trace!(budget = ?self.budget, pace = ?self.pace, "poll deadline expired");
                return Ok(None);
            }
        }
    }
}
