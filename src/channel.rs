//! One-shot handoff of a worker's TID to the controller.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::TimedWait;
use crate::error::{Error, Result};
use crate::Pid;


const UNHELD: i32 = 0;

/// Longest single condvar sleep, so deadlines and cancellation are rechecked regularly.
const WAKE_SLICE: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    Empty,
    Published(Pid),
    Consumed,
}

/// Single-assignment cell holding the TID of one worker.
///
/// The worker publishes exactly once. The controller consumes exactly once, through a
/// [`Handoff`] it may take before the worker has published.
///
/// The handoff lock is error-checking like a [`Gate`](crate::gate::Gate): it records
/// the TID of its holder, so taking it again from the holding thread is a
/// [`Error::Relock`] instead of a spin until the deadline.
#[derive(Debug)]
pub struct IdentitySlot {
    index: usize,
    slot: Mutex<Slot>,
    published: Condvar,

    /// Raw TID of the handoff holder, or `UNHELD`. Cleared while the holder sleeps on
    /// `published`, since the mutex is released then.
    holder: AtomicI32,
}

/// The handoff lock of an [`IdentitySlot`], held by the controller.
pub struct Handoff<'a> {
    channel: &'a IdentitySlot,
    owner: Pid,

    /// Only `None` while the condvar holds the guard.
    slot: Option<MutexGuard<'a, Slot>>,
}

impl IdentitySlot {
    pub fn new(index: usize) -> Self {
        let slot = Mutex::new(Slot::Empty);
        let published = Condvar::new();
        let holder = AtomicI32::new(UNHELD);

        Self { index, slot, published, holder }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Take the handoff lock for `owner`, spinning on `try_lock()` until `wait` expires.
    pub fn handoff(&self, owner: Pid, wait: &TimedWait) -> Result<Handoff<'_>> {
        let slot = wait.poll(|| match self.slot.try_lock() {
            Ok(slot) => {
                self.holder.store(owner.as_raw(), Ordering::Release);
                Ok(Some(slot))
            },
            Err(TryLockError::WouldBlock) => {
                if self.holder.load(Ordering::Acquire) == owner.as_raw() {
                    return Err(Error::Relock { gate: "handoff", owner });
                }

                Ok(None)
            },
            Err(TryLockError::Poisoned(_)) => Err(self.poisoned()),
        })?;

        match slot {
            Some(slot) => Ok(Handoff { channel: self, owner, slot: Some(slot) }),
            None => Err(Error::IdentityTimeout { index: self.index }),
        }
    }

    /// Store `tid` and wake the controller.
    pub fn publish(&self, tid: Pid, wait: &TimedWait) -> Result<()> {
        let mut handoff = self.handoff(tid, wait)?;
        let slot = handoff.slot()?;

        if **slot != Slot::Empty {
            return Err(Error::AlreadyPublished { index: self.index });
        }

        **slot = Slot::Published(tid);
        self.published.notify_one();

        debug!(index = self.index, tid = tid.as_raw(), "published worker TID");

        Ok(())
    }

    fn poisoned(&self) -> Error {
        Error::Internal(format!("identity slot {} poisoned", self.index))
    }
}

impl<'a> Handoff<'a> {
    fn slot(&mut self) -> Result<&mut MutexGuard<'a, Slot>> {
        let channel = self.channel;
        self.slot.as_mut().ok_or_else(|| channel.poisoned())
    }

    /// Consume the published TID, waiting for the worker to publish it if needed.
    pub fn wait(mut self, wait: &TimedWait) -> Result<Pid> {
        let channel = self.channel;
        let index = channel.index;
        let start = wait.start();

        loop {
            wait.check_cancelled()?;

            let slot = self.slot()?;

            match **slot {
                Slot::Published(tid) => {
                    **slot = Slot::Consumed;

                    if tid.as_raw() <= 0 {
                        return Err(Error::InvalidIdentity { index, tid });
                    }

                    debug!(index, tid = tid.as_raw(), "consumed worker TID");
                    return Ok(tid);
                },
                Slot::Consumed => {
                    return Err(Error::AlreadyConsumed { index });
                },
                Slot::Empty => {},
            }

            if wait.expired(start) {
                return Err(Error::IdentityTimeout { index });
            }

            let slice = wait.remaining(start).min(WAKE_SLICE);
            trace!(index, ?slice, "waiting for worker TID");

            let slot = self.slot.take().ok_or_else(|| channel.poisoned())?;
            channel.holder.store(UNHELD, Ordering::Release);

            let (guard, _) = channel
                .published
                .wait_timeout(slot, slice)
                .map_err(|_| channel.poisoned())?;

            channel.holder.store(self.owner.as_raw(), Ordering::Release);
            self.slot = Some(guard);

            wait.relax()?;
        }
    }
}

impl Drop for Handoff<'_> {
    fn drop(&mut self) {
        // Clear the holder while the mutex is still ours.
        if self.slot.is_some() {
            self.channel.holder.store(UNHELD, Ordering::Release);
        }
    }
}
