//! Point-in-time queries of process and thread state, read from `/proc/<id>/status`.
//!
//! Nothing here is cached. Every query re-opens and re-scans the record, so each sample
//! reflects the live state of the task at the moment it was taken.

use std::fs;
use std::io::{self, BufRead, BufReader};

use tracing::trace;

use crate::clock::{Pace, TimedWait};
use crate::error::{Error, Result};
use crate::Pid;


/// Label of the field naming the tracer of a process, `0` if untraced.
pub const TRACER_PID: &str = "TracerPid:\t";

/// Label of the scheduler state field, e.g. `S (sleeping)`.
pub const STATE: &str = "State:\t";

/// State of a task stopped by a signal, such as a tracer we sent `SIGSTOP`.
pub const STOPPED: &str = "T (stopped)";

/// Spellings of a ptrace-stopped task. Linux 2.6.33 switched from the first to the second.
pub const TRACING_STOP: [&str; 2] = ["T (tracing stop)", "t (tracing stop)"];

/// A read-only, line-oriented store of `label: value` records, one record per task.
pub trait StatusStore {
    /// Name of the record for `id`, for diagnostics.
    fn path(&self, id: Pid) -> String;

    /// Open a fresh reader over the current record for `id`.
    fn open(&self, id: Pid) -> io::Result<Box<dyn BufRead>>;
}

/// The kernel's procfs status records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProcStatus;

impl StatusStore for ProcStatus {
    fn path(&self, id: Pid) -> String {
        format!("/proc/{}/status", id)
    }

    fn open(&self, id: Pid) -> io::Result<Box<dyn BufRead>> {
        let file = fs::File::open(self.path(id))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Scheduler state of a task, as reported in the `State:` field.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    TracingStop,
    Zombie,
    Dead,
    Idle,
    Unknown(String),
}

impl TaskState {
    pub fn parse(s: &str) -> Self {
        use TaskState::*;

        match s {
            "R (running)" => Running,
            "S (sleeping)" => Sleeping,
            "D (disk sleep)" => DiskSleep,
            STOPPED => Stopped,
            "T (tracing stop)" | "t (tracing stop)" => TracingStop,
            "Z (zombie)" => Zombie,
            "X (dead)" => Dead,
            "I (idle)" => Idle,
            _ => Unknown(s.to_owned()),
        }
    }

    /// True for both a signal stop and a ptrace-stop.
    pub fn is_stopped(&self) -> bool {
        matches!(self, TaskState::Stopped | TaskState::TracingStop)
    }
}

/// Parse a status field the way `strtol(3)` would, then reject anything that is not a
/// non-negative value below `i64::MAX` consumed in full.
///
/// As with `strtol()`, leading whitespace and a sign are accepted, and an empty field
/// reads as zero.
pub fn parse_ulong(s: &str) -> Option<u64> {
    if s.is_empty() {
        return Some(0);
    }

    let digits = s.trim_start_matches(|c: char| c.is_ascii_whitespace() || c == '\x0b');
    let value: i64 = digits.parse().ok()?;

    if value < 0 || value == i64::MAX {
        return None;
    }

    Some(value as u64)
}

#[derive(Clone, Debug)]
pub struct Oracle<S> {
    store: S,
}

impl<S: StatusStore> Oracle<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Return the remainder of the first line of the record of `id` that starts with
    /// `label`, without its newline.
    pub fn read_field(&self, id: Pid, label: &str) -> Result<String> {
        let path = self.store.path(id);

        let mut reader = self.store.open(id).map_err(|source| Error::StatusOpen {
            path: path.clone(),
            label: label.to_owned(),
            source,
        })?;

        // `Name:` carries raw `comm` bytes, so lines are only bytes until one matches.
        let mut buf = Vec::new();

        loop {
            buf.clear();

            let len = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| Error::StatusRead { path: path.clone(), source })?;

            if len == 0 {
                return Err(Error::MissingField { path, label: label.to_owned() });
            }

            let line = match buf.strip_suffix(b"\n") {
                Some(line) => line,
                None => return Err(Error::MalformedRecord { path }),
            };

            if let Some(value) = line.strip_prefix(label.as_bytes()) {
                return Ok(String::from_utf8_lossy(value).into_owned());
            }
        }
    }

    pub fn read_uint_field(&self, id: Pid, label: &str) -> Result<u64> {
        let value = self.read_field(id, label)?;

        parse_ulong(&value).ok_or_else(|| Error::InvalidInteger {
            path: self.store.path(id),
            label: label.to_owned(),
            value,
        })
    }

    /// Tracer of `id`, or `None` if it is not being traced.
    pub fn tracer_of(&self, id: Pid) -> Result<Option<Pid>> {
        let raw = self.read_uint_field(id, TRACER_PID)?;

        // `parse_ulong()` caps at `i64::MAX`, but a PID must also fit a `pid_t`.
        let raw = i32::try_from(raw).map_err(|_| Error::InvalidInteger {
            path: self.store.path(id),
            label: TRACER_PID.to_owned(),
            value: raw.to_string(),
        })?;

        let tracer = (raw != 0).then(|| Pid::from_raw(raw));

        Ok(tracer)
    }

    pub fn state(&self, id: Pid) -> Result<TaskState> {
        let state = self.read_field(id, STATE)?;
        Ok(TaskState::parse(&state))
    }

    /// Sample `label` of `id` until it reads exactly `expected`.
    pub fn wait_for_field_value(
        &self,
        id: Pid,
        label: &str,
        expected: &str,
        wait: &TimedWait,
    ) -> Result<()> {
        self.wait_for_any_field_value(id, label, &[expected], wait)?;
        Ok(())
    }

    /// Sample `label` of `id` until it reads exactly one of `accepted`, yielding the
    /// processor between samples. Returns the matching sample.
    ///
    /// On expiry, the error carries the last value seen.
    pub fn wait_for_any_field_value(
        &self,
        id: Pid,
        label: &str,
        accepted: &[&str],
        wait: &TimedWait,
    ) -> Result<String> {
        let wait = wait.clone().with_pace(Pace::Yield);
        let mut last = String::new();

        let matched = wait.poll(|| {
            let sample = self.read_field(id, label)?;
            trace!(pid = id.as_raw(), label, %sample, "sampled status field");

            if accepted.iter().any(|want| *want == sample) {
                return Ok(Some(sample));
            }

            last = sample;
            Ok(None)
        })?;

        matched.ok_or_else(|| Error::StateTimeout {
            pid: id,
            wanted: accepted.join(" | "),
            last,
        })
    }
}
