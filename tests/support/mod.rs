#![allow(unused)]

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use watchthreads::{Clock, Pace, Pid, StatusStore, Tracer};

macro_rules! pid {
    ($raw: expr) => {
        watchthreads::Pid::from_raw($raw)
    };
}

/// Render a plausible `/proc/<id>/status` record.
pub fn status(state: &str, tracer_pid: i32) -> String {
    format!(
        "Name:\twatchthreads\nUmask:\t0022\nState:\t{}\nTgid:\t4242\nPid:\t4242\nTracerPid:\t{}\n",
        state, tracer_pid,
    )
}

/// One response of a [`ScriptedStatus`] to an open request.
#[derive(Clone, Debug)]
pub enum Record {
    /// The record reads back as this text.
    Text(String),

    /// The record reads back as these raw bytes.
    Bytes(Vec<u8>),

    /// The record cannot be opened, as if the task had exited.
    Vanished,

    /// The record yields this text, then fails with an I/O error.
    Truncated(String),
}

#[derive(Clone, Debug)]
struct Script {
    records: Vec<Record>,
    next: usize,
    opens: usize,
}

impl Script {
    fn new(records: Vec<Record>) -> Self {
        Self { records, next: 0, opens: 0 }
    }

    // Replay the records in order, then repeat the last one forever.
    fn advance(&mut self) -> Record {
        self.opens += 1;

        let record = self.records[self.next].clone();

        if self.next + 1 < self.records.len() {
            self.next += 1;
        }

        record
    }
}

#[derive(Default)]
struct Scripts {
    tasks: HashMap<i32, Script>,
    fallback: Option<Vec<Record>>,
}

/// A [`StatusStore`] that replays scripted records per task.
///
/// Tasks with no script of their own, such as workers whose TIDs are only known at run
/// time, each get a fresh copy of the fallback script.
#[derive(Clone, Default)]
pub struct ScriptedStatus {
    scripts: Arc<Mutex<Scripts>>,
}

impl ScriptedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, pid: i32, records: Vec<Record>) -> Self {
        self.scripts.lock().unwrap().tasks.insert(pid, Script::new(records));
        self
    }

    /// Script a task through a sequence of `State:` values.
    pub fn states(self, pid: i32, states: &[&str]) -> Self {
        let records = states.iter().map(|s| Record::Text(status(s, 0))).collect();
        self.script(pid, records)
    }

    pub fn fallback_states(self, states: &[&str]) -> Self {
        let records = states.iter().map(|s| Record::Text(status(s, 0))).collect();
        self.scripts.lock().unwrap().fallback = Some(records);
        self
    }

    /// Number of times the record of `pid` has been opened.
    pub fn opens(&self, pid: i32) -> usize {
        self.scripts.lock().unwrap().tasks.get(&pid).map(|s| s.opens).unwrap_or(0)
    }
}

impl StatusStore for ScriptedStatus {
    fn path(&self, id: Pid) -> String {
        format!("scripted/{}/status", id)
    }

    fn open(&self, id: Pid) -> io::Result<Box<dyn BufRead>> {
        let record = {
            let mut scripts = self.scripts.lock().unwrap();
            let Scripts { tasks, fallback } = &mut *scripts;

            let script = match (tasks.contains_key(&id.as_raw()), fallback) {
                (true, _) => tasks.get_mut(&id.as_raw()).unwrap(),
                (false, Some(fallback)) => tasks
                    .entry(id.as_raw())
                    .or_insert_with(|| Script::new(fallback.clone())),
                (false, None) => return Err(io::Error::from(io::ErrorKind::NotFound)),
            };

            script.advance()
        };

        match record {
            Record::Text(text) => Ok(Box::new(Cursor::new(text.into_bytes()))),
            Record::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes))),
            Record::Vanished => Err(io::Error::from(io::ErrorKind::NotFound)),
            Record::Truncated(text) => {
                let reader = Cursor::new(text.into_bytes()).chain(Failing);
                Ok(Box::new(BufReader::new(reader)))
            },
        }
    }
}

struct Failing;

impl Read for Failing {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "record went away"))
    }
}

/// A clock that only moves when a polling loop relaxes, by a fixed step.
pub struct TickingClock {
    nanos: AtomicU64,
    step: Duration,
}

impl TickingClock {
    pub fn new(step: Duration) -> Self {
        let nanos = AtomicU64::new(0);
        Self { nanos, step }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    pub fn step(&self) -> Duration {
        self.step
    }
}

impl Clock for TickingClock {
    fn now(&self) -> Duration {
        self.elapsed()
    }

    fn relax(&self, _pace: Pace) -> watchthreads::Result<()> {
        self.nanos.fetch_add(self.step.as_nanos() as u64, Ordering::SeqCst);
        Ok(())
    }
}

/// A [`Tracer`] that counts requests instead of sending signals.
#[derive(Default)]
pub struct RecordingTracer {
    suspends: AtomicUsize,
    resumes: AtomicUsize,
    last_resumed: AtomicI32,
}

impl RecordingTracer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn last_resumed(&self) -> Option<Pid> {
        match self.last_resumed.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }
}

impl Tracer for RecordingTracer {
    fn suspend(&self, _tracer: Pid) -> watchthreads::Result<()> {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self, tracer: Pid) -> watchthreads::Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.last_resumed.store(tracer.as_raw(), Ordering::SeqCst);
        Ok(())
    }
}
