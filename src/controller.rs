//! The main thread's side of the rendezvous.
//!
//! The controller holds both gates while it spawns the workers and, unless standalone,
//! stops the tracer. It then lets the workers run into their watchpoints, collects their
//! TIDs, and waits until the kernel reports both of them in tracing stop while the tracer
//! is still frozen. Only then does it thaw the tracer and let the workers finish.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::unistd::{getpid, getppid, gettid};
use tracing::{debug, info, warn};

use crate::clock::{Clock, Monotonic, TimedWait};
use crate::error::{Error, Result};
use crate::exit_hook;
use crate::gate::{Role, CONTROLLER_TIMEOUT, WORKER_TIMEOUT};
use crate::guard::CleanupGuard;
use crate::oracle::{Oracle, ProcStatus, StatusStore, STATE, STOPPED, TRACING_STOP};
use crate::tracer::{SignalTracer, Tracer};
use crate::watch;
use crate::worker::{Shared, Worker, WORKERS};
use crate::Pid;


/// Settings of one rendezvous.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    /// Run without a tracer: no validation, no `SIGSTOP`, no state polling.
    standalone: bool,

    /// Budget of every wait on the controller thread.
    controller_timeout: Duration,

    /// Budget of every wait on a worker thread.
    worker_timeout: Duration,

    /// Register the cleanup guard with `atexit(3)` and the fatal signal handlers.
    exit_hook: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            standalone: false,
            controller_timeout: CONTROLLER_TIMEOUT,
            worker_timeout: WORKER_TIMEOUT,
            exit_hook: true,
        }
    }
}

impl Config {
    pub fn standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }

    pub fn controller_timeout(mut self, timeout: Duration) -> Self {
        self.controller_timeout = timeout;
        self
    }

    pub fn worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Whether to install the process-wide exit hook. Defaults to `true`.
    ///
    /// There is one hook per process, so in-process tests must turn this off.
    pub fn exit_hook(mut self, exit_hook: bool) -> Self {
        self.exit_hook = exit_hook;
        self
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    pub fn budget(&self, role: Role) -> Duration {
        match role {
            Role::Controller => self.controller_timeout,
            Role::Worker => self.worker_timeout,
        }
    }
}

/// Process IDs of the subject.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Identity {
    pub pid: Pid,

    /// Must be the tracer, in attached mode.
    pub parent: Pid,
}

impl Identity {
    pub fn current() -> Self {
        Self { pid: getpid(), parent: getppid() }
    }
}

/// Outcome of a completed rendezvous.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Rendezvous {
    pub pid: Pid,
    pub tracer: Option<Pid>,
    pub workers: [Pid; WORKERS],
}

pub struct Controller<S> {
    config: Config,
    identity: Identity,
    oracle: Oracle<S>,
    clock: Arc<dyn Clock>,
    control: Arc<dyn Tracer>,
    guard: Arc<CleanupGuard>,
}

impl Controller<ProcStatus> {
    /// Controller of the current process, backed by procfs, `CLOCK_MONOTONIC` and signals.
    pub fn system(config: Config) -> Self {
        Self::new(
            config,
            Identity::current(),
            ProcStatus,
            Arc::new(Monotonic::new()),
            Arc::new(SignalTracer),
        )
    }
}

impl<S: StatusStore> Controller<S> {
    pub fn new(
        config: Config,
        identity: Identity,
        store: S,
        clock: Arc<dyn Clock>,
        control: Arc<dyn Tracer>,
    ) -> Self {
        let oracle = Oracle::new(store);
        let guard = Arc::new(CleanupGuard::new(control.clone()));

        Self { config, identity, oracle, clock, control, guard }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Guard that resumes the tracer, armed during [`run()`](Controller::run).
    pub fn guard(&self) -> Arc<CleanupGuard> {
        self.guard.clone()
    }

    /// Drive the whole rendezvous on the calling thread.
    ///
    /// On failure, the workers are cancelled and left detached, and the tracer has been
    /// resumed.
    pub fn run(self) -> Result<Rendezvous> {
        let me = gettid();
        let wait = TimedWait::new(self.clock.clone(), self.config.budget(Role::Controller));
        let shared = Arc::new(Shared::new(self.clock.clone(), self.config.budget(Role::Worker)));

        // Close both gates before any worker exists, so each one stops at its first gate.
        shared.startup().lock(me, Role::Controller, &wait)?;
        shared.termination().lock(me, Role::Controller, &wait)?;

        let result = self
            .spawn_workers(&shared)
            .and_then(|handles| self.rendezvous(me, &shared, &wait, handles));

        if result.is_err() {
            shared.cancel();

            if let Err(err) = self.guard.release() {
                warn!(%err, "could not resume tracer after failed rendezvous");
            }
        }

        result
    }

    fn spawn_workers(&self, shared: &Arc<Shared>) -> Result<Vec<JoinHandle<Result<()>>>> {
        let mut handles = Vec::with_capacity(WORKERS);

        for index in 0..WORKERS {
            let handle = Worker::new(index, shared.clone()).spawn()?;
            handles.push(handle);
        }

        Ok(handles)
    }

    fn rendezvous(
        &self,
        me: Pid,
        shared: &Shared,
        wait: &TimedWait,
        handles: Vec<JoinHandle<Result<()>>>,
    ) -> Result<Rendezvous> {
        let tracer = if self.config.standalone {
            None
        } else {
            Some(self.resolve_tracer()?)
        };

        if let Some(tracer) = tracer {
            self.guard.arm(tracer)?;
        }

        // From here on, the tracer is resumed however the process ends.
        if self.config.exit_hook {
            exit_hook::install(self.guard.clone())?;
        }

        let raw_tracer = tracer.map(Pid::as_raw).unwrap_or(0);
        info!(tracer = raw_tracer, "Stopping tracer PID {}", raw_tracer);

        if let Some(tracer) = tracer {
            self.control.suspend(tracer)?;
            self.oracle.wait_for_field_value(tracer, STATE, STOPPED, wait)?;
        }

        // Hold both handoff locks before letting the workers go.
        let first = shared.slot(0).handoff(me, wait)?;
        let second = shared.slot(1).handoff(me, wait)?;

        shared.startup().unlock(me)?;

        info!("Waiting till the threads initialize their TIDs.");

        let workers = [first.wait(wait)?, second.wait(wait)?];

        if workers[0] == workers[1] {
            return Err(Error::Internal(format!("both workers published TID {}", workers[0])));
        }

        info!(
            thread1 = workers[0].as_raw(),
            thread2 = workers[1].as_raw(),
            pid = self.identity.pid.as_raw(),
            "Thread 1 TID = {}, thread 2 TID = {}, PID = {}.",
            workers[0],
            workers[1],
            self.identity.pid
        );

        for index in 0..WORKERS {
            debug!(
                index,
                addr = format_args!("{:#x}", watch::target_addr(index)),
                decoy = format_args!("{:#x}", watch::decoy_addr(index)),
                "watch area"
            );
        }

        info!("Waiting till the threads get trapped by the watchpoints.");

        if tracer.is_some() {
            for tid in workers {
                self.oracle.wait_for_any_field_value(tid, STATE, &TRACING_STOP, wait)?;
            }
        }

        self.guard.release()?;

        info!("Joining the threads.");

        shared.termination().unlock(me)?;

        for (index, handle) in handles.into_iter().enumerate() {
            handle.join().map_err(|_| Error::WorkerPanicked { index })??;
        }

        info!("Exiting.");
        watch::watchthreads_break_at_exit();

        let pid = self.identity.pid;

        Ok(Rendezvous { pid, tracer, workers })
    }

    /// Read our tracer from the oracle, and check that it is our parent.
    fn resolve_tracer(&self) -> Result<Pid> {
        let Identity { pid, parent } = self.identity;

        let tracer = self.oracle.tracer_of(pid)?.ok_or(Error::NotTraced)?;

        if tracer != parent {
            return Err(Error::ForeignTracer { tracer, parent });
        }

        debug!(tracer = tracer.as_raw(), "validated tracer");

        Ok(tracer)
    }
}
