//! Control over the external tracer process.

use nix::sys::signal::kill;
use tracing::debug;

use crate::error::{Error, Result};
use crate::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;


/// The ability to freeze and thaw the tracer.
///
/// Observing the tracer's state is the job of the [`Oracle`](crate::oracle::Oracle).
pub trait Tracer: Send + Sync {
    fn suspend(&self, tracer: Pid) -> Result<()>;

    /// Thaw `tracer`.
    ///
    /// May be called from a signal handler, so implementations must not allocate, lock or
    /// log.
    fn resume(&self, tracer: Pid) -> Result<()>;
}

/// Job control of the tracer with `SIGSTOP` and `SIGCONT`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SignalTracer;

impl SignalTracer {
    fn send(pid: Pid, signal: Signal) -> Result<()> {
        kill(pid, signal).map_err(|source| Error::Signal { pid, signal, source })
    }
}

impl Tracer for SignalTracer {
    fn suspend(&self, tracer: Pid) -> Result<()> {
        debug!(tracer = tracer.as_raw(), "sending SIGSTOP");
        Self::send(tracer, Signal::SIGSTOP)
    }

    fn resume(&self, tracer: Pid) -> Result<()> {
        Self::send(tracer, Signal::SIGCONT)
    }
}
