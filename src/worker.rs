//! The two threads that get trapped by the watchpoints.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::unistd::gettid;
use tracing::{debug, warn};

use crate::channel::IdentitySlot;
use crate::clock::{Clock, TimedWait};
use crate::error::{Error, Result};
use crate::gate::{Gate, Role};
use crate::watch;


/// Number of worker threads in the rendezvous.
pub const WORKERS: usize = 2;

/// Progress of a worker through the rendezvous.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Created = 0,
    PublishingIdentity,
    AwaitingStartup,
    TracedAccess,
    AwaitingTermination,
    Finished,
}

impl Phase {
    fn from_raw(raw: u8) -> Self {
        use Phase::*;

        match raw {
            0 => Created,
            1 => PublishingIdentity,
            2 => AwaitingStartup,
            3 => TracedAccess,
            4 => AwaitingTermination,
            _ => Finished,
        }
    }
}

/// State shared by the controller and both workers.
pub struct Shared {
    startup: Gate,
    termination: Gate,
    slots: [IdentitySlot; WORKERS],
    phases: [AtomicU8; WORKERS],
    cancelled: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    worker_budget: Duration,
}

impl Shared {
    pub fn new(clock: Arc<dyn Clock>, worker_budget: Duration) -> Self {
        Self {
            startup: Gate::new("startup"),
            termination: Gate::new("termination"),
            slots: [IdentitySlot::new(0), IdentitySlot::new(1)],
            phases: [AtomicU8::new(Phase::Created as u8), AtomicU8::new(Phase::Created as u8)],
            cancelled: Arc::new(AtomicBool::new(false)),
            clock,
            worker_budget,
        }
    }

    /// Held by the controller until the tracer is stopped.
    pub fn startup(&self) -> &Gate {
        &self.startup
    }

    /// Held by the controller until both workers have been seen trapped.
    pub fn termination(&self) -> &Gate {
        &self.termination
    }

    pub fn slot(&self, index: usize) -> &IdentitySlot {
        &self.slots[index]
    }

    pub fn phase(&self, index: usize) -> Phase {
        Phase::from_raw(self.phases[index].load(Ordering::Acquire))
    }

    /// Make every pending and future worker wait fail with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn worker_wait(&self) -> TimedWait {
        TimedWait::new(self.clock.clone(), self.worker_budget).cancelled_by(self.cancelled.clone())
    }

    fn enter(&self, index: usize, phase: Phase) {
        debug!(index, ?phase, "worker entering phase");
        self.phases[index].store(phase as u8, Ordering::Release);
    }
}

pub struct Worker {
    index: usize,
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(index: usize, shared: Arc<Shared>) -> Self {
        Self { index, shared }
    }

    pub fn spawn(self) -> Result<JoinHandle<Result<()>>> {
        let index = self.index;

        thread::Builder::new()
            .name(format!("watch-{}", index + 1))
            .spawn(move || self.run())
            .map_err(|source| Error::Spawn { index, source })
    }

    pub fn run(&self) -> Result<()> {
        let result = self.rendezvous();

        if let Err(err) = &result {
            warn!(index = self.index, %err, "worker failed");
        }

        result
    }

    fn rendezvous(&self) -> Result<()> {
        let Worker { index, shared } = self;
        let index = *index;
        let wait = shared.worker_wait();

        shared.enter(index, Phase::PublishingIdentity);
        let tid = gettid();
        shared.slot(index).publish(tid, &wait)?;

        // The controller opens this once the tracer, if any, is stopped.
        shared.enter(index, Phase::AwaitingStartup);
        shared.startup.pass(tid, Role::Worker, &wait)?;

        shared.enter(index, Phase::TracedAccess);
        watch::touch(index);

        // Stay alive until the controller has seen both of us in tracing stop.
        shared.enter(index, Phase::AwaitingTermination);
        shared.termination.pass(tid, Role::Worker, &wait)?;

        shared.enter(index, Phase::Finished);

        Ok(())
    }
}
