use std::io;
use std::time::Duration;

use crate::gate::Role;
use crate::Pid;
use crate::tracer::Signal;


pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a failed run.
///
/// Every kind is fatal to the rendezvous. The kind only tells the operator where to look.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Bad invocation, or the process is not traced the way the harness requires.
    Environment,

    /// A gate, channel or state poll ran past its deadline.
    Timeout,

    /// A status record could not be opened, read or parsed.
    Io,

    /// Broken gate or channel bookkeeping, or a worker that died.
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("The harness must be run under a tracer")]
    NotTraced,

    #[error("Tracer = {tracer} is not our parent = {parent}")]
    ForeignTracer { tracer: Pid, parent: Pid },

    #[error("Timed out waiting for internal lock `{gate}` after {budget:?} as {role:?}")]
    LockTimeout { gate: &'static str, role: Role, budget: Duration },

    #[error("Gate `{gate}` is already held by its caller = {owner}")]
    Relock { gate: &'static str, owner: Pid },

    #[error("Gate `{gate}` released by {caller}, but it is held by {holder:?}")]
    NotOwner { gate: &'static str, caller: Pid, holder: Option<Pid> },

    #[error("Timed out waiting for worker {index} to publish its TID")]
    IdentityTimeout { index: usize },

    #[error("Worker {index} published a TID more than once")]
    AlreadyPublished { index: usize },

    #[error("Worker {index} TID was already consumed")]
    AlreadyConsumed { index: usize },

    #[error("Worker {index} published an invalid TID = {tid}")]
    InvalidIdentity { index: usize, tid: Pid },

    #[error("Timed out waiting for PID {pid} {wanted:?} (now it is {last:?})")]
    StateTimeout { pid: Pid, wanted: String, last: String },

    #[error("Could not open status record {path} for {label:?}")]
    StatusOpen { path: String, label: String, source: io::Error },

    #[error("Could not read status record {path}")]
    StatusRead { path: String, source: io::Error },

    #[error("{path}: line is not newline-terminated")]
    MalformedRecord { path: String },

    #[error("{path}: no line {label:?} found")]
    MissingField { path: String, label: String },

    #[error("{path}: field {label:?} = {value:?} is not a valid unsigned integer")]
    InvalidInteger { path: String, label: String, value: String },

    #[error("Could not send {signal} to tracer = {pid}")]
    Signal { pid: Pid, signal: Signal, source: nix::Error },

    #[error("Could not spawn worker {index}")]
    Spawn { index: usize, source: io::Error },

    #[error("Worker {index} panicked")]
    WorkerPanicked { index: usize },

    #[error("Rendezvous was abandoned by the controller")]
    Cancelled,

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;

        match self {
            NotTraced | ForeignTracer { .. } =>
                ErrorKind::Environment,
            LockTimeout { .. } | IdentityTimeout { .. } | StateTimeout { .. } =>
                ErrorKind::Timeout,
            StatusOpen { .. } | StatusRead { .. } | MalformedRecord { .. } |
            MissingField { .. } | InvalidInteger { .. } | IO(_) =>
                ErrorKind::Io,
            Relock { .. } | NotOwner { .. } | AlreadyPublished { .. } |
            AlreadyConsumed { .. } | InvalidIdentity { .. } | Error::Signal { .. } |
            Spawn { .. } | WorkerPanicked { .. } | Cancelled | OS(_) | Internal(_) =>
                ErrorKind::Internal,
        }
    }

    /// True when some bounded wait ran out of time.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
