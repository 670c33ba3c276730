//! Process-shared reader/writer lock with upgradable mode
//!
//! The lock lives inside the channel header, so it is built from plain
//! atomics instead of OS mutexes. All state that decides ownership sits in a
//! single 64-bit word:
//!
//! ```text
//! 63            32 31  30  29 28            0
//! +---------------+---+---+---+--------------+
//! |     epoch     | W | U | P | reader count |
//! +---------------+---+---+---+--------------+
//! ```
//!
//! - `W`: held exclusively
//! - `U`: held upgradable (coexists with readers)
//! - `P`: an upgrade is waiting; new readers back off so existing ones drain
//!
//! The epoch fences guards across a forced reset: every guard remembers the
//! epoch it was acquired in, and releasing a guard from an older epoch is a
//! no-op. A holder that was written off by [`ShmRwLock::reset`] can therefore
//! never corrupt the freshly built lock.

use rustix::io::Errno;
use rustix::process::{test_kill_process, Pid};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const WRITER: u64 = 1 << 31;
const UPGRADABLE: u64 = 1 << 30;
const PENDING: u64 = 1 << 29;
const READERS_MASK: u64 = PENDING - 1;
const LOCK_MASK: u64 = WRITER | UPGRADABLE | PENDING | READERS_MASK;
const EPOCH_SHIFT: u32 = 32;

#[inline(always)]
fn epoch_of(state: u64) -> u32 {
    (state >> EPOCH_SHIFT) as u32
}

#[inline(always)]
fn pid_of_self() -> u32 {
    std::process::id()
}

/// Lock word plus holder bookkeeping, stored in shared memory
#[repr(C)]
pub struct ShmRwLock {
    state: AtomicU64,
    /// Bumped on every release; lets a waiter tell "busy" from "wedged"
    releases: AtomicU32,
    /// Process id of the exclusive or upgradable holder, 0 if none
    owner_pid: AtomicU32,
}

/// Point-in-time view of the lock word, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    pub epoch: u32,
    pub readers: u32,
    pub exclusive: bool,
    pub upgradable: bool,
    pub upgrade_pending: bool,
    pub owner_pid: u32,
    pub releases: u32,
}

impl LockSnapshot {
    /// Nobody holds the lock in any mode
    pub fn is_free(&self) -> bool {
        self.readers == 0 && !self.exclusive && !self.upgradable
    }
}

impl Default for ShmRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmRwLock {
    /// An unlocked lock in epoch 0
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            releases: AtomicU32::new(0),
            owner_pid: AtomicU32::new(0),
        }
    }

    /// Put the lock into the unlocked state of `epoch`
    ///
    /// Used when a region is (re)initialized. Any guard from another epoch
    /// becomes inert.
    pub fn init(&self, epoch: u32) {
        self.owner_pid.store(0, Ordering::Relaxed);
        self.releases.store(0, Ordering::Relaxed);
        self.state
            .store((epoch as u64) << EPOCH_SHIFT, Ordering::Release);
    }

    /// Forcefully unlock by moving to the next epoch
    ///
    /// Returns the new epoch.
    pub fn reset(&self) -> u32 {
        let next = self.epoch().wrapping_add(1);
        self.owner_pid.store(0, Ordering::Relaxed);
        self.state
            .store((next as u64) << EPOCH_SHIFT, Ordering::Release);
        next
    }

    /// Current epoch
    #[inline]
    pub fn epoch(&self) -> u32 {
        epoch_of(self.state.load(Ordering::Acquire))
    }

    /// Number of releases so far (wrapping)
    #[inline]
    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.load(Ordering::Acquire);
        LockSnapshot {
            epoch: epoch_of(state),
            readers: (state & READERS_MASK) as u32,
            exclusive: state & WRITER != 0,
            upgradable: state & UPGRADABLE != 0,
            upgrade_pending: state & PENDING != 0,
            owner_pid: self.owner_pid.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }

    /// Whether the recorded exclusive/upgradable holder is a process that
    /// no longer exists
    ///
    /// Readers are anonymous, so a lock held only in shared mode never
    /// counts as abandoned here.
    pub fn owner_is_dead(&self) -> bool {
        let state = self.state.load(Ordering::Acquire);
        if state & (WRITER | UPGRADABLE) == 0 {
            return false;
        }

        let owner = self.owner_pid.load(Ordering::Relaxed);
        if owner == 0 || owner == pid_of_self() {
            return false;
        }

        match i32::try_from(owner).ok().and_then(Pid::from_raw) {
            Some(pid) => matches!(test_kill_process(pid), Err(e) if e == Errno::SRCH),
            None => false,
        }
    }

    /// Apply `f` to the lock word as long as it is still in `epoch`
    ///
    /// `f` returning `None` leaves the word untouched. Returns `false` if the
    /// epoch moved on or `f` declined.
    fn update(&self, epoch: u32, mut f: impl FnMut(u64) -> Option<u64>) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if epoch_of(state) != epoch {
                return false;
            }
            let Some(next) = f(state) else {
                return false;
            };
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Acquire with `f` deciding the next word; returns the epoch acquired in
    fn acquire(&self, mut f: impl FnMut(u64) -> Option<u64>) -> Option<u32> {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let next = f(state)?;
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Some(epoch_of(state)),
                Err(actual) => state = actual,
            }
        }
    }

    fn release(&self, epoch: u32, f: impl FnMut(u64) -> Option<u64>) -> bool {
        let released = self.update(epoch, f);
        if released {
            self.releases.fetch_add(1, Ordering::Release);
        }
        released
    }

    fn clear_owner(&self) {
        let _ = self.owner_pid.compare_exchange(
            pid_of_self(),
            0,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Try to take a shared (read) lock without waiting
    pub fn try_lock_shared(&self) -> Option<SharedGuard<'_>> {
        let epoch = self.acquire(|state| {
            if state & (WRITER | PENDING) != 0 || state & READERS_MASK == READERS_MASK {
                None
            } else {
                Some(state + 1)
            }
        })?;
        Some(SharedGuard { lock: self, epoch })
    }

    /// Take a shared lock, waiting at most `timeout`
    pub fn lock_shared(&self, timeout: Duration) -> Option<SharedGuard<'_>> {
        wait_until(Instant::now() + timeout, || self.try_lock_shared())
    }

    /// Try to take an upgradable lock without waiting
    ///
    /// Upgradable holders coexist with readers but exclude writers and other
    /// upgradable holders.
    pub fn try_lock_upgradable(&self) -> Option<UpgradableGuard<'_>> {
        let epoch = self.acquire(|state| {
            if state & (WRITER | UPGRADABLE) != 0 {
                None
            } else {
                Some(state | UPGRADABLE)
            }
        })?;
        self.owner_pid.store(pid_of_self(), Ordering::Relaxed);
        Some(UpgradableGuard { lock: self, epoch })
    }

    /// Take an upgradable lock, waiting until `deadline`
    pub fn lock_upgradable_until(&self, deadline: Instant) -> Option<UpgradableGuard<'_>> {
        wait_until(deadline, || self.try_lock_upgradable())
    }

    /// Try to take an exclusive lock without waiting
    pub fn try_lock_exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        let epoch = self.acquire(|state| {
            if state & LOCK_MASK != 0 {
                None
            } else {
                Some(state | WRITER)
            }
        })?;
        self.owner_pid.store(pid_of_self(), Ordering::Relaxed);
        Some(ExclusiveGuard { lock: self, epoch })
    }

    /// Take an exclusive lock, waiting at most `timeout`
    pub fn lock_exclusive(&self, timeout: Duration) -> Option<ExclusiveGuard<'_>> {
        wait_until(Instant::now() + timeout, || self.try_lock_exclusive())
    }
}

/// Shared (read) access; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedGuard<'a> {
    lock: &'a ShmRwLock,
    epoch: u32,
}

impl SharedGuard<'_> {
    /// Whether the lock has not been reset since this guard was taken
    #[inline]
    pub fn is_current(&self) -> bool {
        self.lock.epoch() == self.epoch
    }

    /// Release now; returns `false` if the lock was reset while held, in
    /// which case anything read under this guard may be torn
    pub fn release(self) -> bool {
        let released = self.unlock();
        std::mem::forget(self);
        released
    }

    fn unlock(&self) -> bool {
        self.lock.release(self.epoch, |state| {
            (state & READERS_MASK != 0).then(|| state - 1)
        })
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Upgradable access; coexists with readers
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct UpgradableGuard<'a> {
    lock: &'a ShmRwLock,
    epoch: u32,
}

impl<'a> UpgradableGuard<'a> {
    #[inline]
    pub fn is_current(&self) -> bool {
        self.lock.epoch() == self.epoch
    }

    /// Promote to exclusive, waiting until `deadline` for readers to drain
    ///
    /// While waiting, new readers are turned away. On timeout the pending
    /// mark is withdrawn and the upgradable guard is handed back.
    pub fn upgrade_until(self, deadline: Instant) -> Result<ExclusiveGuard<'a>, Self> {
        let lock = self.lock;
        let epoch = self.epoch;

        if !lock.update(epoch, |state| Some(state | PENDING)) {
            return Err(self);
        }

        let mut backoff = Backoff::new();
        loop {
            let upgraded = lock.update(epoch, |state| {
                (state & READERS_MASK == 0).then(|| (state & !(UPGRADABLE | PENDING)) | WRITER)
            });
            if upgraded {
                std::mem::forget(self);
                return Ok(ExclusiveGuard { lock, epoch });
            }
            if !self.is_current() || Instant::now() >= deadline {
                lock.update(epoch, |state| Some(state & !PENDING));
                return Err(self);
            }
            backoff.snooze();
        }
    }
}

impl Drop for UpgradableGuard<'_> {
    fn drop(&mut self) {
        if self.is_current() {
            self.lock.clear_owner();
        }
        self.lock.release(self.epoch, |state| {
            (state & UPGRADABLE != 0).then(|| state & !(UPGRADABLE | PENDING))
        });
    }
}

/// Exclusive (write) access; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ExclusiveGuard<'a> {
    lock: &'a ShmRwLock,
    epoch: u32,
}

impl ExclusiveGuard<'_> {
    #[inline]
    pub fn is_current(&self) -> bool {
        self.lock.epoch() == self.epoch
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if self.is_current() {
            self.lock.clear_owner();
        }
        self.lock.release(self.epoch, |state| {
            (state & WRITER != 0).then(|| state & !WRITER)
        });
    }
}

/// Escalating wait: spin briefly, then yield, then sleep in short steps
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;
    const MAX_SLEEP: Duration = Duration::from_millis(1);

    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let shift = (self.step - Self::YIELD_LIMIT).min(5);
            let nap = Duration::from_micros(50u64 << shift).min(Self::MAX_SLEEP);
            std::thread::sleep(nap);
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Retry `attempt` with backoff until it succeeds or `deadline` passes
///
/// Always makes at least one attempt.
pub(crate) fn wait_until<T>(deadline: Instant, mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
    let mut backoff = Backoff::new();
    loop {
        if let Some(value) = attempt() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        backoff.snooze();
    }
}
