//! Public entry layer.
//!
//! [`Stm`] owns the shared engine state: the striped lock array, the
//! global clock, the quiescence machinery and the module callback tables.
//! Threads register once and get a [`ThreadTx`] handle wrapping their
//! transaction descriptor; every transactional operation is a thin
//! dispatch from the handle into the engine.

use core::marker::PhantomData;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::MutexGuard;

use once_cell::race::OnceBox;

use crate::abort::Abort;
use crate::callback::Callbacks;
use crate::clock::GlobalClock;
use crate::lock::{LockArray, Word};
use crate::quiesce::{Quiesce, Threads};
use crate::set::RW_SET_SIZE;
use crate::tx::{is_active, Tx, TxAttr, MAX_SPECIFIC, TX_ABORTED, TX_COMMITTED, TX_IRREVOCABLE, TX_KILLED};
use crate::wbetl;

/// Value of a queried engine parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    /// Textual parameter.
    Str(&'static str),
    /// Numeric parameter.
    Size(usize),
}

/// A word-based software transactional memory engine.
///
/// All shared state lives here; independent `Stm` instances are fully
/// isolated from each other. For the common single-engine case see
/// [`global`].
pub struct Stm {
    pub(crate) locks: LockArray,
    pub(crate) clock: GlobalClock,
    pub(crate) quiesce: Quiesce,
    pub(crate) callbacks: Callbacks,
    nb_specific: AtomicUsize,
}

impl Stm {
    /// Create an engine. Allocates the lock array up front; stripes and
    /// clock start at version zero.
    pub fn new() -> Self {
        log::debug!("stm init, word size {}", core::mem::size_of::<Word>());
        Self {
            locks: LockArray::new(),
            clock: GlobalClock::new(),
            quiesce: Quiesce::new(),
            callbacks: Callbacks::new(),
            nb_specific: AtomicUsize::new(0),
        }
    }

    /// Register the calling thread and return its transaction handle.
    ///
    /// One handle per thread; the descriptor is created here, linked on
    /// the quiescence list and reclaimed when the handle drops.
    pub fn register_thread(&self) -> ThreadTx<'_> {
        let tx = Box::into_raw(Box::new(Tx::new()));
        self.quiesce.enter_thread(tx);
        self.callbacks.thread_init.fire();
        log::trace!("thread registered");
        ThreadTx {
            stm: self,
            tx: unsafe { NonNull::new_unchecked(tx) },
            _not_send: PhantomData,
        }
    }

    /// Current value of the global clock.
    #[inline]
    pub fn clock(&self) -> Word {
        self.clock.get()
    }

    /// Advance the clock by one. Development helper only.
    #[doc(hidden)]
    pub fn inc_clock(&self) {
        self.clock.fetch_inc();
    }

    /// Allocate a transaction-specific data slot, usable on every
    /// descriptor of this engine. Returns `None` once all slots are taken.
    pub fn create_specific(&self) -> Option<usize> {
        self.nb_specific
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < MAX_SPECIFIC {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .ok()
    }

    #[inline]
    pub(crate) fn nb_specific(&self) -> usize {
        self.nb_specific.load(Ordering::Acquire)
    }

    /// Query an engine parameter. Known names: `"contention_manager"`,
    /// `"design"`, `"initial_rw_set_size"`.
    pub fn parameter(&self, name: &str) -> Option<Parameter> {
        match name {
            "contention_manager" => Some(Parameter::Str("SUICIDE")),
            "design" => Some(Parameter::Str("WRITE-BACK (ETL)")),
            "initial_rw_set_size" => Some(Parameter::Size(RW_SET_SIZE)),
            _ => None,
        }
    }

    /// Register a callback fired when a thread registers.
    /// Returns `false` when the hook table is full.
    pub fn on_thread_init<F: Fn() + Send + Sync + 'static>(&self, f: F) -> bool {
        self.callbacks.thread_init.register(Box::new(f))
    }

    /// Register a callback fired when a thread unregisters.
    pub fn on_thread_exit<F: Fn() + Send + Sync + 'static>(&self, f: F) -> bool {
        self.callbacks.thread_exit.register(Box::new(f))
    }

    /// Register a callback fired at every top-level transaction start.
    pub fn on_start<F: Fn() + Send + Sync + 'static>(&self, f: F) -> bool {
        self.callbacks.start.register(Box::new(f))
    }

    /// Register a callback fired right before a top-level commit.
    pub fn on_precommit<F: Fn() + Send + Sync + 'static>(&self, f: F) -> bool {
        self.callbacks.precommit.register(Box::new(f))
    }

    /// Register a callback fired after a successful commit.
    pub fn on_commit<F: Fn() + Send + Sync + 'static>(&self, f: F) -> bool {
        self.callbacks.commit.register(Box::new(f))
    }

    /// Register a callback fired after every abort.
    pub fn on_abort<F: Fn() + Send + Sync + 'static>(&self, f: F) -> bool {
        self.callbacks.abort.register(Box::new(f))
    }

    /// Wait until every transaction live at call time has finished.
    ///
    /// Must be called from a thread with no active transaction. New
    /// transactions may start while the scan runs; use
    /// [`pause_transactions`](Stm::pause_transactions) to keep them out.
    pub fn wait_quiescent(&self) {
        drop(self.quiesce.drain(false));
    }

    /// Drain all live transactions and stall new ones until the returned
    /// guard is dropped.
    ///
    /// Must be called from a thread with no active transaction. While the
    /// guard is held, activating transactions park in `check_quiesce` and
    /// thread registration blocks.
    pub fn pause_transactions(&self) -> PauseGuard<'_> {
        let guard = self.quiesce.drain(true);
        PauseGuard { stm: self, _guard: guard }
    }

    /// Load outside any transaction. Unit transactions are not enabled in
    /// this configuration.
    ///
    /// # Panics
    ///
    /// Always.
    pub fn unit_load(&self, _addr: *const Word) -> Word {
        panic!("unit transactions are not enabled");
    }

    /// Store outside any transaction. Unit transactions are not enabled
    /// in this configuration.
    ///
    /// # Panics
    ///
    /// Always.
    pub fn unit_store(&self, _addr: *mut Word, _value: Word) {
        panic!("unit transactions are not enabled");
    }

    /// Rollover task: restart the version epoch. Runs with every
    /// transaction drained on the quiescence barrier.
    pub(crate) fn rollover(&self) {
        log::debug!("clock rollover");
        self.clock.reset();
        self.locks.reset();
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps new transactions stalled until dropped.
/// Created by [`Stm::pause_transactions`].
pub struct PauseGuard<'a> {
    stm: &'a Stm,
    _guard: MutexGuard<'a, Threads>,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        // Clear the pause word before the quiescence mutex unlocks.
        self.stm.quiesce.release();
    }
}

static GLOBAL: OnceBox<Stm> = OnceBox::new();

/// Process-wide engine, created on first use.
pub fn global() -> &'static Stm {
    GLOBAL.get_or_init(|| Box::new(Stm::new()))
}

/// Per-thread transaction handle.
///
/// Wraps the thread's descriptor; not sendable, a descriptor belongs to
/// the thread that registered it. Dropping the handle unregisters the
/// thread, which must not happen mid-transaction.
pub struct ThreadTx<'s> {
    stm: &'s Stm,
    tx: NonNull<Tx>,
    _not_send: PhantomData<*mut ()>,
}

impl<'s> ThreadTx<'s> {
    #[inline]
    fn tx(&self) -> &Tx {
        unsafe { self.tx.as_ref() }
    }

    /// Start a transaction, or join the enclosing one.
    ///
    /// Returns `true` for a new top-level transaction and `false` when the
    /// call only deepened the flat-nesting counter; in the latter case the
    /// attributes of the enclosing transaction stay in force.
    pub fn start(&self, attr: TxAttr) -> bool {
        let tx = self.tx();
        let nesting = tx.nesting.get();
        tx.nesting.set(nesting + 1);
        if nesting > 0 {
            return false;
        }
        tx.attr.set(attr);
        wbetl::prepare(self.stm, tx);
        self.stm.callbacks.start.fire();
        log::trace!("start [{}-{}]", tx.start.get(), tx.end.get());
        true
    }

    /// Commit the innermost transaction.
    ///
    /// A nested commit only pops the nesting counter and returns
    /// `Ok(false)`. The top-level commit performs the write-back protocol
    /// and returns `Ok(true)`; on a validation conflict the transaction is
    /// rolled back (and re-prepared unless retry is suppressed) and the
    /// reason is returned as the error.
    pub fn commit(&self) -> Result<bool, Abort> {
        let tx = self.tx();
        let nesting = tx.nesting.get() - 1;
        tx.nesting.set(nesting);
        if nesting > 0 {
            return Ok(false);
        }
        self.stm.callbacks.precommit.fire();
        debug_assert!(self.active());
        let has_entries = unsafe { (*tx.wset.get()).len() } != 0;
        if has_entries {
            wbetl::commit(self.stm, tx)?;
        }
        // A transaction without writes commits at no cost.
        tx.status.store(TX_COMMITTED, Ordering::Release);
        self.stm.callbacks.commit.fire();
        Ok(true)
    }

    /// Abort the transaction on purpose. `extra` is OR'd into the reason
    /// next to `EXPLICIT`; pass [`Abort::NO_RETRY`] to also suppress the
    /// automatic re-preparation.
    ///
    /// Returns the final reason mask, which the caller should propagate
    /// as the `Err` of the transactional block.
    pub fn abort(&self, extra: Abort) -> Abort {
        wbetl::rollback(self.stm, self.tx(), extra | Abort::EXPLICIT)
    }

    /// Transactional load of one word.
    ///
    /// # Safety
    ///
    /// `addr` must be word aligned, valid until the transaction has
    /// committed or aborted, and concurrently accessed only through this
    /// engine or word-sized atomics.
    pub unsafe fn load(&self, addr: *const Word) -> Result<Word, Abort> {
        unsafe { wbetl::read(self.stm, self.tx(), addr) }
    }

    /// Transactional store of one word.
    ///
    /// # Safety
    ///
    /// Same contract as [`load`](ThreadTx::load), and `addr` must be valid
    /// for writes.
    pub unsafe fn store(&self, addr: *mut Word, value: Word) -> Result<(), Abort> {
        unsafe { wbetl::write(self.stm, self.tx(), addr, value, !0) }
    }

    /// Transactional store of the bits selected by `mask`. Unselected bits
    /// keep their pre-transaction value; successive masked stores to one
    /// word compose.
    ///
    /// # Safety
    ///
    /// Same contract as [`store`](ThreadTx::store).
    pub unsafe fn store_masked(
        &self,
        addr: *mut Word,
        value: Word,
        mask: Word,
    ) -> Result<(), Abort> {
        unsafe { wbetl::write(self.stm, self.tx(), addr, value, mask) }
    }

    /// Acquire the stripe for `addr` without scheduling a store and read
    /// the word directly from memory. Later loads of `addr` keep reading
    /// memory until a store schedules a value.
    ///
    /// # Safety
    ///
    /// Same contract as [`store`](ThreadTx::store).
    pub unsafe fn read_for_write(&self, addr: *mut Word) -> Result<Word, Abort> {
        unsafe {
            wbetl::write(self.stm, self.tx(), addr, 0, 0)?;
            // The stripe is ours, a direct read cannot tear.
            Ok((*(addr as *const AtomicUsize)).load(Ordering::Acquire))
        }
    }

    /// Run `f` atomically, retrying on conflicts.
    ///
    /// The closure must propagate every `Err` it receives from the
    /// transactional operations (and from [`abort`](ThreadTx::abort));
    /// swallowing one leaves the re-prepared transaction out of sync with
    /// the control flow. Nested calls join the enclosing transaction and
    /// propagate aborts outward, so the whole flat nest re-runs.
    pub fn atomically<T, F>(&self, attr: TxAttr, mut f: F) -> Result<T, Abort>
    where
        F: FnMut(&ThreadTx<'s>) -> Result<T, Abort>,
    {
        let outermost = self.start(attr);
        loop {
            match f(self) {
                Ok(v) => match self.commit() {
                    Ok(_) => return Ok(v),
                    Err(reason) => {
                        if !outermost || !self.active() {
                            return Err(reason);
                        }
                        // Re-prepared by the rollback; run the block again.
                    }
                },
                Err(reason) => {
                    if !outermost || !self.active() {
                        return Err(reason);
                    }
                }
            }
        }
    }

    /// Is a transaction currently active on this thread?
    #[inline]
    pub fn active(&self) -> bool {
        is_active(self.tx().status())
    }

    /// Did the last transaction on this thread abort without retry?
    #[inline]
    pub fn aborted(&self) -> bool {
        self.tx().status() == TX_ABORTED
    }

    /// Has this transaction been killed by a contention manager? The base
    /// engine has none, so this stays `false`.
    #[inline]
    pub fn killed(&self) -> bool {
        self.tx().status() == TX_KILLED
    }

    /// Is this transaction irrevocable? The base engine never makes one.
    #[inline]
    pub fn irrevocable(&self) -> bool {
        self.tx().status() == TX_IRREVOCABLE
    }

    /// Attributes of the current (or last) transaction.
    #[inline]
    pub fn attributes(&self) -> TxAttr {
        self.tx().attr.get()
    }

    /// Make this transaction irrevocable. Not supported in this
    /// configuration.
    ///
    /// # Panics
    ///
    /// Always.
    pub fn set_irrevocable(&self, _serial: bool) -> bool {
        panic!("irrevocability is not supported in this configuration");
    }

    /// Query a per-transaction statistic. Known names:
    /// `"read_set_size"`, `"write_set_size"`, `"read_set_nb_entries"`,
    /// `"write_set_nb_entries"`, `"read_only"` (0 or 1).
    pub fn stat(&self, name: &str) -> Option<usize> {
        let tx = self.tx();
        match name {
            "read_set_size" => Some(unsafe { &*tx.rset.get() }.capacity()),
            "write_set_size" => Some(unsafe { &*tx.wset.get() }.capacity()),
            "read_set_nb_entries" => Some(unsafe { &*tx.rset.get() }.len()),
            "write_set_nb_entries" => Some(unsafe { &*tx.wset.get() }.len()),
            "read_only" => Some(tx.attr.get().read_only as usize),
            _ => None,
        }
    }

    /// Attach module data to this descriptor. The key must come from
    /// [`Stm::create_specific`] on the same engine.
    pub fn set_specific(&self, key: usize, data: *mut ()) {
        assert!(key < self.stm.nb_specific(), "invalid specific-data key");
        self.tx().specific[key].store(data, Ordering::Release);
    }

    /// Fetch module data from this descriptor.
    pub fn get_specific(&self, key: usize) -> *mut () {
        assert!(key < self.stm.nb_specific(), "invalid specific-data key");
        self.tx().specific[key].load(Ordering::Acquire)
    }
}

impl Drop for ThreadTx<'_> {
    fn drop(&mut self) {
        debug_assert!(!self.active(), "thread exited mid-transaction");
        self.stm.callbacks.thread_exit.fire();
        self.stm.quiesce.exit_thread(self.tx.as_ptr());
        log::trace!("thread unregistered");
        unsafe { drop(Box::from_raw(self.tx.as_ptr())) };
    }
}
