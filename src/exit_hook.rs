//! Process-wide registration of the [`CleanupGuard`], so the tracer is thawed however the
//! process ends.
//!
//! The guard runs from `atexit(3)`, which covers returning from `main()` and every
//! `std::process::exit()`. It also runs from handlers for the fatal and terminating
//! signals, which then restore the default disposition and re-raise. A stopped tracer
//! can never be left behind by a crash of the subject.

use std::sync::{Arc, OnceLock};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::error::Result;
use crate::guard::CleanupGuard;


static GUARD: OnceLock<Arc<CleanupGuard>> = OnceLock::new();

const FATAL_SIGNALS: [Signal; 7] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
    Signal::SIGINT,
    Signal::SIGTERM,
];

/// Install `guard` as the process exit hook. Only one guard can be installed per process.
pub fn install(guard: Arc<CleanupGuard>) -> Result<()> {
    if GUARD.set(guard).is_err() {
        internal_error!("exit hook already installed");
    }

    // SAFETY: `at_exit` only touches the installed guard, and never unwinds.
    if unsafe { libc::atexit(at_exit) } != 0 {
        internal_error!("could not register atexit() handler");
    }

    // The handler resets to `SIG_DFL` on entry, so the re-raise terminates the process.
    let action = SigAction::new(
        SigHandler::Handler(on_fatal_signal),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );

    for signal in FATAL_SIGNALS {
        // SAFETY: `on_fatal_signal` is async-signal-safe: it does an atomic swap, `kill(2)`
        // and `raise(3)`, and nothing else.
        unsafe { sigaction(signal, &action)? };
    }

    debug!(signals = ?FATAL_SIGNALS, "installed exit hook");

    Ok(())
}

pub fn installed() -> bool {
    GUARD.get().is_some()
}

extern "C" fn at_exit() {
    if let Some(guard) = GUARD.get() {
        let _ = guard.release_quiet();
    }
}

extern "C" fn on_fatal_signal(signal: libc::c_int) {
    if let Some(guard) = GUARD.get() {
        let _ = guard.release_quiet();
    }

    // SAFETY: `raise(3)` is async-signal-safe.
    unsafe {
        libc::raise(signal);
    }
}
