//! Global logical clock.
//!
//! A single word-sized counter stamps every commit. It lives in its own
//! cache line so that the fetch-and-increment traffic of committers does
//! not false-share with the lock array or the quiescence state.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::lock::{Word, LOCK_BITS};

/// Upper bound on the number of registered threads.
///
/// The clock may exceed `VERSION_MAX` by up to one increment per thread
/// before the rollover barrier drains everyone, so the headroom must cover
/// all of them.
#[cfg_attr(feature = "small-clock", allow(dead_code))]
pub(crate) const MAX_THREADS: usize = 8192;

/// Largest timestamp that still fits in the version field of a lock word,
/// minus the per-thread overshoot headroom. A transaction that starts at
/// or above this value must trigger a quiescence-protected rollover.
#[cfg(not(feature = "small-clock"))]
pub(crate) const VERSION_MAX: Word = (!0 >> LOCK_BITS) - MAX_THREADS;

/// Shrunk version space so the rollover path is reachable from a test.
#[cfg(feature = "small-clock")]
pub(crate) const VERSION_MAX: Word = 1024;

pub(crate) struct GlobalClock {
    word: CachePadded<AtomicUsize>,
}

impl GlobalClock {
    pub(crate) fn new() -> Self {
        Self {
            word: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Current clock value.
    #[inline]
    pub(crate) fn get(&self) -> Word {
        self.word.load(Ordering::Acquire)
    }

    /// Full-fenced fetch-and-increment. The commit timestamp of the
    /// calling transaction is the returned value plus one.
    #[inline]
    pub(crate) fn fetch_inc(&self) -> Word {
        self.word.fetch_add(1, Ordering::SeqCst)
    }

    /// Reset to zero. Only called from the rollover task while every
    /// transaction is drained on the quiescence barrier.
    pub(crate) fn reset(&self) {
        self.word.store(0, Ordering::SeqCst);
    }
}
