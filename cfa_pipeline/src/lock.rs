//! Spin-then-block mutex over a word in shared memory
//!
//! The lock word lives inside the mapped region, so the same `ShmMutex` works
//! between threads of one process and between processes mapping the same
//! session file. Word states:
//!
//! | value | meaning                      |
//! |-------|------------------------------|
//! | 0     | unlocked                     |
//! | 1     | locked, no sleepers          |
//! | 2     | locked, sleepers may exist   |
//!
//! A contender first spins, then yields, then (if the policy allows) sleeps
//! on the word with a futex. A thread that has slept only ever reacquires the
//! word as `2`, so the releasing side never misses a sleeper.

use crate::platform::{futex_wait, futex_wake};
use cfa_common::config::BackoffConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// How long a waiter spins and yields before it sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// `spin_loop` iterations before yielding
    pub spin_limit: u32,
    /// `yield_now` iterations before blocking
    pub yield_limit: u32,
    /// Sleep on a futex after spinning and yielding; otherwise keep yielding
    pub block: bool,
}

impl BackoffPolicy {
    /// Never sleep in the kernel.
    pub const fn spinning(spin_limit: u32, yield_limit: u32) -> Self {
        Self {
            spin_limit,
            yield_limit,
            block: false,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffConfig::default().into()
    }
}

impl From<BackoffConfig> for BackoffPolicy {
    fn from(config: BackoffConfig) -> Self {
        Self {
            spin_limit: config.spin_limit,
            yield_limit: config.yield_limit,
            block: config.block,
        }
    }
}

/// Per-wait backoff state.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: BackoffPolicy,
    step: u32,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self { policy, step: 0 }
    }

    /// True once the caller should sleep instead of snoozing again.
    #[inline]
    pub(crate) fn should_block(&self) -> bool {
        self.policy.block
            && self.step >= self.policy.spin_limit.saturating_add(self.policy.yield_limit)
    }

    /// One spin or yield step.
    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.step < self.policy.spin_limit {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Mutex over a shared-memory `AtomicU32`.
#[derive(Debug, Clone, Copy)]
pub struct ShmMutex<'a> {
    word: &'a AtomicU32,
    policy: BackoffPolicy,
}

impl<'a> ShmMutex<'a> {
    /// Wrap a lock word. The word must start at zero.
    pub fn new(word: &'a AtomicU32, policy: BackoffPolicy) -> Self {
        Self { word, policy }
    }

    /// Acquire the lock, spinning, yielding and then sleeping per the policy.
    pub fn lock(&self) -> ShmMutexGuard<'a> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return ShmMutexGuard { word: self.word };
        }

        let mut backoff = Backoff::new(self.policy);
        while !backoff.should_block() {
            if self.word.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .word
                    .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ShmMutexGuard { word: self.word };
            }
            backoff.snooze();
        }

        while self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex_wait(self.word, CONTENDED, None);
        }
        ShmMutexGuard { word: self.word }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'a>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard { word: self.word })
    }

    /// True while some holder owns the word.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }
}

/// RAII guard; releases the word on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ShmMutexGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(self.word, 1);
        }
    }
}

/// Low bit of a signal word: a waiter may be asleep on it. The publish
/// sequence counts above it in steps of `SIGNAL_STEP`.
const SIGNAL_SLEEPER: u32 = 1;
const SIGNAL_STEP: u32 = 2;

/// Advance the sequence in a signal word and wake its sleepers.
///
/// The wake syscall is only made when a waiter has marked the word.
pub fn notify(word: &AtomicU32) {
    let previous = word.fetch_add(SIGNAL_STEP, Ordering::Release);
    if previous & SIGNAL_SLEEPER != 0 {
        word.fetch_and(!SIGNAL_SLEEPER, Ordering::Relaxed);
        futex_wake(word, i32::MAX);
    }
}

/// Sequence of a signal word, without the sleeper bit.
#[inline]
pub fn signal_sequence(word: &AtomicU32) -> u32 {
    word.load(Ordering::Acquire) & !SIGNAL_SLEEPER
}

/// Wait until the sequence in `word` moves past `seen` or `deadline` passes.
///
/// Returns `true` if it moved. Waiting follows `policy`; with `block` set
/// the final phase marks the word and sleeps on it until `notify`.
pub fn wait_for_change(word: &AtomicU32, seen: u32, policy: BackoffPolicy, deadline: Instant) -> bool {
    let seen = seen & !SIGNAL_SLEEPER;
    let mut backoff = Backoff::new(policy);
    loop {
        if signal_sequence(word) != seen {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        if backoff.should_block() {
            // A notify that lands after the mark changes the value the
            // futex compares against, so the sleep cannot miss it.
            let marked = seen | SIGNAL_SLEEPER;
            let current = match word.compare_exchange(seen, marked, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => marked,
                Err(value) => value,
            };
            if current == marked {
                futex_wait(word, marked, Some(deadline - now));
            }
        } else {
            backoff.snooze();
        }
    }
}
