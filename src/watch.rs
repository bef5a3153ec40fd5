//! Memory the tracer arms with read watchpoints, and symbols it can break on.

/// Layout of the watched memory.
///
/// The decoys sit at lower addresses than the targets. A debugger that allocates debug
/// registers in address order spends its first slots on them, so the per-thread targets
/// land in the later slots.
#[repr(C)]
#[derive(Debug)]
pub struct WatchArea {
    pub decoys: [i32; 2],
    pub targets: [i32; 2],
}

/// Exported unmangled, for `rwatch WATCHTHREADS_AREA.targets[N]`.
#[no_mangle]
pub static WATCHTHREADS_AREA: WatchArea = WatchArea {
    decoys: [0; 2],
    targets: [0; 2],
};

/// Read the watch target of worker `index` exactly once.
///
/// If the tracer armed a read watchpoint on it, this is where the calling thread traps.
pub fn touch(index: usize) -> i32 {
    let target = &WATCHTHREADS_AREA.targets[index];

    // SAFETY: `target` is a valid, aligned reference into a static.
    unsafe { std::ptr::read_volatile(target) }
}

/// Address of the watch target of worker `index`.
pub fn target_addr(index: usize) -> usize {
    &WATCHTHREADS_AREA.targets[index] as *const i32 as usize
}

pub fn decoy_addr(index: usize) -> usize {
    &WATCHTHREADS_AREA.decoys[index] as *const i32 as usize
}

/// Called once the rendezvous has completed, as a breakpoint site for the tracer.
#[no_mangle]
#[inline(never)]
pub extern "C" fn watchthreads_break_at_exit() {
    std::hint::black_box(());
}
