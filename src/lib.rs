#[macro_use]
pub mod error;

pub mod channel;
pub mod clock;
pub mod controller;
pub mod exit_hook;
pub mod gate;
pub mod guard;
pub mod oracle;
pub mod tracer;
pub mod watch;
pub mod worker;

pub use clock::{Clock, Monotonic, Pace, TimedWait};
pub use controller::{Config, Controller, Identity, Rendezvous};
pub use error::{Error, ErrorKind, Result};
pub use gate::{Gate, Role};
pub use guard::CleanupGuard;
pub use oracle::{Oracle, ProcStatus, StatusStore, TaskState};
pub use tracer::{Signal, SignalTracer, Tracer};

pub use nix::unistd::Pid;
