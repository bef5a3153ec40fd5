//! Binary locks used purely as start/stop signals between the controller and the workers.
//!
//! A [`Gate`] is an error-checking mutex: it records which thread holds it, so re-locking
//! a self-held gate or unlocking someone else's gate is reported instead of hanging.
//! Acquisition never blocks in the kernel. It spins on [`Gate::try_lock()`] under a
//! [`TimedWait`], so a stopped tracer cannot stall a futex wake we depend on.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::TimedWait;
use crate::error::{Error, Result};
use crate::Pid;


/// Lock budget of the controller.
///
/// Shorter than [`WORKER_TIMEOUT`], so the controller gives up first. It is the thread
/// that resumes a stopped tracer on the way out.
pub const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Lock budget of a worker.
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(15);

/// The part an actor plays in the rendezvous, which sets its deadlines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Controller,
    Worker,
}

impl Role {
    pub fn default_budget(self) -> Duration {
        match self {
            Role::Controller => CONTROLLER_TIMEOUT,
            Role::Worker => WORKER_TIMEOUT,
        }
    }
}

const UNLOCKED: i32 = 0;

#[derive(Debug)]
pub struct Gate {
    name: &'static str,

    /// Raw TID of the holder, or `UNLOCKED`.
    owner: AtomicI32,
}

impl Gate {
    pub const fn new(name: &'static str) -> Self {
        let owner = AtomicI32::new(UNLOCKED);
        Self { name, owner }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current holder, if locked. Only a snapshot.
    pub fn holder(&self) -> Option<Pid> {
        match self.owner.load(Ordering::Acquire) {
            UNLOCKED => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    /// Make one attempt to lock the gate for `owner`.
    ///
    /// Returns `Ok(false)` if another actor holds the gate. Every other failure is an
    /// error.
    pub fn try_lock(&self, owner: Pid) -> Result<bool> {
        let raw = owner.as_raw();

        if raw <= UNLOCKED {
            return Err(Error::Internal(format!("invalid owner {owner} for gate `{}`", self.name)));
        }

        match self.owner.compare_exchange(UNLOCKED, raw, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(true),
            Err(held) if held == raw => Err(Error::Relock { gate: self.name, owner }),
            Err(_) => Ok(false),
        }
    }

    /// Lock the gate for `owner`, spinning until it is free or `wait` expires.
    pub fn lock(&self, owner: Pid, role: Role, wait: &TimedWait) -> Result<()> {
        trace!(gate = self.name, owner = owner.as_raw(), ?role, "acquiring gate");

        let acquired = wait.poll(|| Ok(self.try_lock(owner)?.then_some(())))?;

        if acquired.is_none() {
            return Err(Error::LockTimeout { gate: self.name, role, budget: wait.budget() });
        }

        debug!(gate = self.name, owner = owner.as_raw(), ?role, "acquired gate");

        Ok(())
    }

    pub fn unlock(&self, owner: Pid) -> Result<()> {
        let raw = owner.as_raw();

        if let Err(held) = self.owner.compare_exchange(raw, UNLOCKED, Ordering::AcqRel, Ordering::Acquire) {
            let holder = (held != UNLOCKED).then(|| Pid::from_raw(held));
            return Err(Error::NotOwner { gate: self.name, caller: owner, holder });
        }

        debug!(gate = self.name, owner = raw, "released gate");

        Ok(())
    }

    /// Wait for the gate to open, then let it go again at once.
    pub fn pass(&self, owner: Pid, role: Role, wait: &TimedWait) -> Result<()> {
        self.lock(owner, role, wait)?;
        self.unlock(owner)
    }
}
