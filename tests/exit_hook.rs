use std::os::unix::io::RawFd;
use std::sync::Arc;

use anyhow::Result;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, pipe, read, write, ForkResult};
use ntest::timeout;
use pretty_assertions::assert_eq;
use watchthreads::{exit_hook, CleanupGuard, Pid, Tracer};

const TRACER: i32 = 4321;

/// A [`Tracer`] that reports each resume to the parent as one native-endian `i32`.
struct PipeTracer {
    fd: RawFd,
}

impl Tracer for PipeTracer {
    fn suspend(&self, _tracer: Pid) -> watchthreads::Result<()> {
        Ok(())
    }

    fn resume(&self, tracer: Pid) -> watchthreads::Result<()> {
        write(self.fd, &tracer.as_raw().to_ne_bytes())?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Exit {
    /// `exit(3)`, with the guard still armed.
    Exit,

    /// `exit(3)` after the guard was released by hand.
    ExitAfterRelease,

    /// Killed by a terminating signal.
    Raise(Signal),
}

// Runs in the forked child, and never returns into the test harness.
fn child(fd: RawFd, exit: Exit) -> ! {
    let guard = Arc::new(CleanupGuard::new(Arc::new(PipeTracer { fd })));

    if guard.arm(Pid::from_raw(TRACER)).is_err() || exit_hook::install(guard.clone()).is_err() {
        unsafe { libc::_exit(10) };
    }

    // One hook per process.
    if !exit_hook::installed() || exit_hook::install(guard.clone()).is_ok() {
        unsafe { libc::_exit(11) };
    }

    match exit {
        Exit::Exit => {},
        Exit::ExitAfterRelease => {
            if !matches!(guard.release(), Ok(true)) {
                unsafe { libc::_exit(12) };
            }
        },
        Exit::Raise(signal) => unsafe {
            libc::raise(signal as libc::c_int);
        },
    }

    std::process::exit(1)
}

/// Run `exit` in a child, and return how it ended and the tracers it resumed.
fn run_child(exit: Exit) -> Result<(WaitStatus, Vec<i32>)> {
    let (rx, tx) = pipe()?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            let _ = close(rx);
            child(tx, exit)
        },
        ForkResult::Parent { child } => {
            close(tx)?;

            let mut bytes = vec![];
            let mut buf = [0u8; 64];

            loop {
                let len = read(rx, &mut buf)?;

                if len == 0 {
                    break;
                }

                bytes.extend_from_slice(&buf[..len]);
            }

            close(rx)?;

            let status = waitpid(child, None)?;
            eprintln!("exit = {:?}, status = {:?}, bytes = {:?}", exit, status, bytes);

            let resumed = bytes
                .chunks(4)
                .map(|chunk| i32::from_ne_bytes(chunk.try_into().unwrap()))
                .collect();

            Ok((status, resumed))
        },
    }
}

#[test]
#[timeout(5000)]
fn test_exit_resumes_tracer_once() -> Result<()> {
    let (status, resumed) = run_child(Exit::Exit)?;

    assert!(matches!(status, WaitStatus::Exited(_, 1)));
    assert_eq!(resumed, vec![TRACER]);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_exit_after_release_resumes_tracer_once() -> Result<()> {
    let (status, resumed) = run_child(Exit::ExitAfterRelease)?;

    assert!(matches!(status, WaitStatus::Exited(_, 1)));
    assert_eq!(resumed, vec![TRACER]);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_fatal_signal_resumes_tracer_once() -> Result<()> {
    for signal in [Signal::SIGTERM, Signal::SIGSEGV] {
        let (status, resumed) = run_child(Exit::Raise(signal))?;

        assert!(matches!(status, WaitStatus::Signaled(_, s, _) if s == signal));
        assert_eq!(resumed, vec![TRACER]);
    }

    Ok(())
}
