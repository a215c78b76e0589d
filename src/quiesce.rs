//! Quiescence: a protocol-level global pause.
//!
//! Three clients need the world stopped or drained:
//!
//! - clock rollover, which must zero the clock and every lock word while
//!   no transaction is live anywhere,
//! - external callers that want all in-flight transactions finished,
//! - external callers that additionally want new transactions stalled
//!   until they release the pause.
//!
//! Rollover uses a counting barrier rather than a reader-writer scheme:
//! every registered thread has to drain before the lock array mutates, and
//! the last one through runs the task. The pause path instead publishes a
//! flag that `check` observes at activation time, before the transaction
//! has touched any stripe.

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::tx::{is_active, Tx, TX_IDLE};

/// Quiesce word states.
const QUIESCE_NONE: usize = 0;
const QUIESCE_BARRIER: usize = 1;
const QUIESCE_PAUSE: usize = 2;

/// Descriptor pointer stored on the live list. Foreign threads only read
/// the atomic status through it.
pub(crate) struct TxPtr(pub(crate) *mut Tx);

unsafe impl Send for TxPtr {}

pub(crate) struct Threads {
    list: Vec<TxPtr>,
    /// Registered threads not currently blocked on the barrier. Tracked
    /// separately from the list so barrier participants stay registered.
    nb: usize,
}

pub(crate) struct Quiesce {
    inner: Mutex<Threads>,
    cond: Condvar,
    word: AtomicUsize,
}

impl Quiesce {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Threads {
                list: Vec::new(),
                nb: 0,
            }),
            cond: Condvar::new(),
            word: AtomicUsize::new(QUIESCE_NONE),
        }
    }

    pub(crate) fn enter_thread(&self, tx: *mut Tx) {
        let mut g = self.inner.lock().unwrap();
        g.list.push(TxPtr(tx));
        g.nb += 1;
    }

    pub(crate) fn exit_thread(&self, tx: *mut Tx) {
        let mut g = self.inner.lock().unwrap();
        g.list.retain(|p| !core::ptr::eq(p.0, tx));
        g.nb -= 1;
        if self.word.load(Ordering::Relaxed) != QUIESCE_NONE {
            // Our departure may be what a barrier is waiting for.
            self.cond.notify_one();
        }
    }

    /// Counting barrier. Blocks until every registered thread has either
    /// reached the barrier or exited; whoever observes the count dropping
    /// to zero runs its task exactly once, then everyone is released.
    ///
    /// `tx` must be inactive (or `None` for an unregistered caller, which
    /// participates without being counted).
    pub(crate) fn barrier(&self, tx: Option<&Tx>, task: impl FnOnce()) {
        if let Some(tx) = tx {
            debug_assert!(!is_active(tx.status()));
        }
        log::debug!("quiesce barrier enter");
        let counted = tx.is_some();
        let mut g = self.inner.lock().unwrap();
        if counted {
            g.nb -= 1;
        }
        if self.word.load(Ordering::Relaxed) == QUIESCE_NONE {
            self.word.store(QUIESCE_BARRIER, Ordering::Release);
        }
        let mut task = Some(task);
        while self.word.load(Ordering::Relaxed) != QUIESCE_NONE {
            if g.nb == 0 {
                if let Some(f) = task.take() {
                    f();
                }
                self.word.store(QUIESCE_NONE, Ordering::Release);
                self.cond.notify_all();
            } else {
                g = self.cond.wait(g).unwrap();
            }
        }
        if counted {
            g.nb += 1;
        }
        log::debug!("quiesce barrier exit");
    }

    /// Called at every activation, before the transaction touches any
    /// stripe. When a pause is pending, drops to `IDLE`, waits it out,
    /// then restores the saved status. Returns whether it waited.
    #[inline]
    pub(crate) fn check(&self, tx: &Tx) -> bool {
        debug_assert!(is_active(tx.status()));
        // SeqCst pairs with the pause publication: either we see the pause
        // word, or the pauser sees our ACTIVE status.
        if self.word.load(Ordering::SeqCst) != QUIESCE_PAUSE {
            return false;
        }
        let saved = tx.status.load(Ordering::Relaxed);
        tx.status.store(TX_IDLE, Ordering::SeqCst);
        while self.word.load(Ordering::SeqCst) == QUIESCE_PAUSE {
            std::hint::spin_loop();
        }
        tx.status.store(saved, Ordering::SeqCst);
        true
    }

    /// Wait until every transaction live at call time has finished. When
    /// `pause` is set, also stall new transactions; the caller then holds
    /// the returned guard until it wants them released.
    ///
    /// Must be called from a thread with no active transaction.
    pub(crate) fn drain(&self, pause: bool) -> MutexGuard<'_, Threads> {
        let g = self.inner.lock().unwrap();
        if pause {
            self.word.store(QUIESCE_PAUSE, Ordering::SeqCst);
            log::debug!("transactions paused");
        }
        // See the latest status words before scanning.
        fence(Ordering::SeqCst);
        for p in &g.list {
            // Sequential scan; a thread can turn active again right after
            // we pass it unless the pause word is up, which is exactly the
            // difference between the two modes.
            while is_active(unsafe { (*p.0).status.load(Ordering::SeqCst) }) {
                std::hint::spin_loop();
            }
        }
        g
    }

    /// Release a pause taken with `drain(true)`.
    pub(crate) fn release(&self) {
        self.word.store(QUIESCE_NONE, Ordering::SeqCst);
        log::debug!("transactions resumed");
    }
}
