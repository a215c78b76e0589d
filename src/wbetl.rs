//! Write-back encounter-time locking engine.
//!
//! Reads are invisible: they log the observed stripe version and re-check
//! it at validation instead of announcing themselves. Writes acquire the
//! stripe at encounter time by CASing the lock word to the address of the
//! buffered write-log entry. Commit stamps a fresh clock value, validates
//! the read log when anyone committed in between, writes the buffered
//! values back and reopens the stripes with the new version. The snapshot
//! can be extended mid-flight so a read that trips over a newer version is
//! not necessarily fatal.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::abort::Abort;
use crate::clock::VERSION_MAX;
use crate::lock::{self, Word};
use crate::set::WriteEntry;
use crate::stm::Stm;
use crate::tx::{is_active, Tx, TX_ABORTED, TX_ACTIVE};

/// Word-sized shared memory is accessed through its atomic view.
///
/// # Safety
///
/// `addr` must be non-null and aligned for `Word`; the caller guarantees
/// the pointee outlives the reference.
#[inline]
unsafe fn atomic_word<'a>(addr: *const Word) -> &'a AtomicUsize {
    unsafe { &*(addr as *const AtomicUsize) }
}

/// Re-check every logged read against the current lock state. Stripes we
/// own ourselves are trivially valid, we are the pending writer.
pub(crate) fn validate(tx: &Tx) -> bool {
    let rset = unsafe { &*tx.rset.get() };
    for r in rset.iter() {
        let l = unsafe { (*r.lock).load(Ordering::Acquire) };
        if lock::is_owned(l) {
            if !unsafe { &*tx.wset.get() }.contains(lock::entry_of(l)) {
                return false;
            }
        } else if lock::timestamp_of(l) != r.version {
            return false;
        }
    }
    true
}

/// Move the snapshot upper bound to the current clock if every logged
/// read still holds.
pub(crate) fn extend(stm: &Stm, tx: &Tx) -> bool {
    // No overflow check here: the clock can overshoot VERSION_MAX by at
    // most one step per thread, absorbed at the next rollover.
    let now = stm.clock.get();
    if validate(tx) {
        tx.end.set(now);
        return true;
    }
    false
}

/// Reset the logs and take a fresh snapshot, rolling the clock over first
/// when the version space is exhausted. Leaves the descriptor `ACTIVE`.
pub(crate) fn prepare(stm: &Stm, tx: &Tx) {
    unsafe {
        (*tx.rset.get()).clear();
        (*tx.wset.get()).clear();
    }
    loop {
        let now = stm.clock.get();
        tx.start.set(now);
        tx.end.set(now);
        if now < VERSION_MAX {
            break;
        }
        stm.quiesce.barrier(Some(tx), || stm.rollover());
    }
    // SeqCst pairs with the pause publication in the quiescence scan.
    tx.status.store(TX_ACTIVE, Ordering::SeqCst);
    stm.quiesce.check(tx);
}

/// Drop every owned stripe, flip to `ABORTED`, then either hand the
/// reason to the caller (retry suppressed) or re-prepare and tag the
/// reason for re-entry.
#[cold]
pub(crate) fn rollback(stm: &Stm, tx: &Tx, reason: Abort) -> Abort {
    debug_assert!(is_active(tx.status()));
    log::trace!("rollback [{}-{}]: {}", tx.start.get(), tx.end.get(), reason);

    unsafe {
        let ws = tx.wset.get();
        let n = (*ws).len();
        if n > 0 {
            for i in 0..n {
                let w = (*ws).entry(i);
                if (*w).next.is_null() {
                    // Only chain tails reopen the stripe; interior entries
                    // leave the word to their tail.
                    (*(*w).lock)
                        .store(lock::set_timestamp((*w).version), Ordering::Release);
                }
            }
            // All restorations become visible before the status change.
            fence(Ordering::Release);
        }
    }

    tx.status.store(TX_ABORTED, Ordering::Release);

    if reason.contains(Abort::EXTEND_WS) {
        // Every lock is released, nothing points into the log any more:
        // the one safe moment to move its storage.
        unsafe { (*tx.wset.get()).grow() };
    }

    tx.nesting.set(1);
    stm.callbacks.abort.fire();

    if tx.attr.get().no_retry || reason.contains(Abort::NO_RETRY) {
        tx.nesting.set(0);
        return reason;
    }

    prepare(stm, tx);
    reason | Abort::PATH_INSTRUMENTED
}

/// Invisible read.
///
/// # Safety
///
/// `addr` must be a word-aligned pointer to memory that stays valid for
/// the whole transaction and is only written through this engine or other
/// word atomics.
pub(crate) unsafe fn read(stm: &Stm, tx: &Tx, addr: *const Word) -> Result<Word, Abort> {
    debug_assert!(is_active(tx.status()));
    let lock = stm.locks.lock_of(addr as usize);

    let mut l = lock.load(Ordering::Acquire);
    loop {
        if lock::is_write(l) {
            let first = lock::entry_of(l);
            let mine = unsafe { (*tx.wset.get()).contains(first) };
            if !mine {
                // Foreign owner.
                return Err(rollback(stm, tx, Abort::RW_CONFLICT));
            }
            // Our stripe: serve the read from the chain, or from memory
            // when the matching entry never carried a value. No read-log
            // entry is needed, the stripe stays valid while we own it.
            let mut w = first;
            unsafe {
                loop {
                    if (*w).addr as *const Word == addr {
                        return Ok(if (*w).mask == 0 {
                            atomic_word(addr).load(Ordering::Acquire)
                        } else {
                            (*w).value
                        });
                    }
                    if (*w).next.is_null() {
                        return Ok(atomic_word(addr).load(Ordering::Acquire));
                    }
                    w = (*w).next;
                }
            }
        }

        // Free stripe: load the value, then re-read the lock. A writer
        // acquiring between the two loads would otherwise hand us a value
        // that exists in no consistent snapshot.
        let value = unsafe { atomic_word(addr) }.load(Ordering::Acquire);
        let l2 = lock.load(Ordering::Acquire);
        if l != l2 {
            l = l2;
            continue;
        }

        let version = lock::timestamp_of(l);
        if version > tx.end.get() {
            // Newer than our snapshot. Read-only transactions keep no
            // read log and cannot extend.
            if tx.attr.get().read_only || !extend(stm, tx) {
                return Err(rollback(stm, tx, Abort::VAL_READ));
            }
            // The value is not in the read log yet, so the extension did
            // not cover it. Re-check the stripe by hand.
            let l2 = lock.load(Ordering::Acquire);
            if l != l2 {
                l = l2;
                continue;
            }
        }

        if !tx.attr.get().read_only {
            unsafe { (*tx.rset.get()).append(version, lock as *const AtomicUsize) };
        }
        return Ok(value);
    }
}

/// Buffered write with encounter-time stripe acquisition.
///
/// A zero `mask` acquires the stripe without scheduling a store, which is
/// how read-for-write primes a location. A partial mask merges with the
/// current memory content, so sub-word stores compose.
///
/// # Safety
///
/// Same contract as [`read`], plus `addr` must be valid for writes.
pub(crate) unsafe fn write(
    stm: &Stm,
    tx: &Tx,
    addr: *mut Word,
    value: Word,
    mask: Word,
) -> Result<(), Abort> {
    debug_assert!(is_active(tx.status()));
    let lock = stm.locks.lock_of(addr as usize);

    loop {
        let l = lock.load(Ordering::Acquire);
        if lock::is_owned(l) {
            let first = lock::entry_of(l) as *mut WriteEntry;
            let mine = unsafe { (*tx.wset.get()).contains(first) };
            if !mine {
                return Err(rollback(stm, tx, Abort::WW_CONFLICT));
            }
            if mask == 0 {
                // Priming acquisition and the stripe is already ours.
                return Ok(());
            }
            unsafe {
                let mut prev = first;
                loop {
                    if (*prev).addr as *const Word == addr as *const Word {
                        // Merge into the existing entry.
                        let mut v = value;
                        if mask != !0 {
                            if (*prev).mask == 0 {
                                (*prev).value = atomic_word(addr).load(Ordering::Acquire);
                            }
                            v = ((*prev).value & !mask) | (v & mask);
                        }
                        (*prev).value = v;
                        (*prev).mask |= mask;
                        return Ok(());
                    }
                    if (*prev).next.is_null() {
                        break;
                    }
                    prev = (*prev).next;
                }
                // New address on an owned stripe: append behind the chain
                // tail. The whole chain shares the pre-acquisition version.
                let version = (*prev).version;
                if (*tx.wset.get()).is_full() {
                    return Err(rollback(stm, tx, Abort::EXTEND_WS));
                }
                let w = (*tx.wset.get()).next_slot();
                init_entry(w, addr, value, mask, version, lock);
                (*prev).next = w;
                (*tx.wset.get()).bump();
            }
            return Ok(());
        }

        // Free stripe.
        let version = lock::timestamp_of(l);
        if version > tx.end.get() {
            let read_before = unsafe { (*tx.rset.get()).has_read(lock as *const AtomicUsize) };
            if read_before {
                // We read this stripe under an older snapshot; acquiring
                // the newer version now could never validate.
                return Err(rollback(stm, tx, Abort::VAL_WRITE));
            }
        }
        let full = unsafe { (*tx.wset.get()).is_full() };
        if full {
            return Err(rollback(stm, tx, Abort::EXTEND_WS));
        }

        let w = unsafe { (*tx.wset.get()).next_slot() };
        if lock
            .compare_exchange(l, lock::tagged_write(w), Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }
        // We own the stripe. The published entry address is only ever
        // dereferenced by us, so initializing after the CAS is fine.
        unsafe {
            init_entry(w, addr, value, mask, version, lock);
            (*tx.wset.get()).bump();
        }
        return Ok(());
    }
}

/// # Safety
///
/// `w` must be a writable slot of the transaction's write log and `addr`
/// readable when the mask is partial.
unsafe fn init_entry(
    w: *mut WriteEntry,
    addr: *mut Word,
    mut value: Word,
    mask: Word,
    version: Word,
    lock: &AtomicUsize,
) {
    if mask == 0 {
        value = 0;
    } else if mask != !0 {
        // Materialize the untouched bits so commit can store whole words.
        value = (unsafe { atomic_word(addr) }.load(Ordering::Acquire) & !mask) | (value & mask);
    }
    unsafe {
        w.write(WriteEntry {
            addr,
            value,
            mask,
            version,
            lock: lock as *const AtomicUsize,
            next: core::ptr::null_mut(),
        });
    }
}

/// Write-back commit of a transaction that holds at least one stripe.
pub(crate) fn commit(stm: &Stm, tx: &Tx) -> Result<(), Abort> {
    let t = stm.clock.fetch_inc() + 1;

    // Validation is only needed when someone else committed since we
    // started; otherwise the snapshot is trivially current.
    if tx.start.get() != t - 1 && !validate(tx) {
        return Err(rollback(stm, tx, Abort::VALIDATE));
    }

    unsafe {
        let ws = tx.wset.get();
        let n = (*ws).len();
        for i in 0..n {
            let w = (*ws).entry(i);
            if (*w).mask != 0 {
                // Plain atomic store. Readers re-check the lock after the
                // value, so the release below is the only publication edge
                // the protocol needs.
                atomic_word((*w).addr).store((*w).value, Ordering::Relaxed);
            }
            if (*w).next.is_null() {
                // The tail reopens the stripe with the commit timestamp,
                // publishing every store of its chain.
                (*(*w).lock).store(lock::set_timestamp(t), Ordering::Release);
            }
        }
    }
    log::trace!("commit at {}", t);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockArray;
    use crate::tx::TxAttr;

    fn same_stripe_pair(mem: &[AtomicUsize]) -> (usize, usize) {
        for i in 0..mem.len() {
            for j in i + 1..mem.len() {
                if LockArray::index_of(mem[i].as_ptr() as usize)
                    == LockArray::index_of(mem[j].as_ptr() as usize)
                {
                    return (i, j);
                }
            }
        }
        panic!("no colliding pair in test buffer");
    }

    #[test]
    fn same_stripe_writes_chain_and_reopen_once() {
        let stm = Stm::new();
        let thr = stm.register_thread();
        let mem: Vec<AtomicUsize> = (0..16).map(|_| AtomicUsize::new(0)).collect();
        let (i, j) = same_stripe_pair(&mem);

        thr.start(TxAttr::default());
        unsafe {
            thr.store(mem[i].as_ptr(), 11).unwrap();
            thr.store(mem[j].as_ptr(), 22).unwrap();
            assert_eq!(thr.load(mem[i].as_ptr()).unwrap(), 11);
            assert_eq!(thr.load(mem[j].as_ptr()).unwrap(), 22);
        }
        thr.commit().unwrap();

        assert_eq!(mem[i].load(Ordering::SeqCst), 11);
        assert_eq!(mem[j].load(Ordering::SeqCst), 22);
        let l = stm
            .locks
            .lock_of(mem[i].as_ptr() as usize)
            .load(Ordering::SeqCst);
        assert!(!lock::is_owned(l));
        assert_eq!(lock::timestamp_of(l), stm.clock());
    }

    #[test]
    fn rollback_restores_preacquisition_version() {
        let stm = Stm::new();
        let thr = stm.register_thread();
        let a = AtomicUsize::new(0);

        thr.start(TxAttr::default());
        unsafe { thr.store(a.as_ptr(), 1).unwrap() };
        thr.commit().unwrap();

        let before = stm.locks.lock_of(a.as_ptr() as usize).load(Ordering::SeqCst);

        thr.start(TxAttr {
            no_retry: true,
            ..TxAttr::default()
        });
        unsafe { thr.store(a.as_ptr(), 2).unwrap() };
        let reason = thr.abort(Abort::NONE);
        assert!(reason.contains(Abort::EXPLICIT));
        assert!(thr.aborted());

        let after = stm.locks.lock_of(a.as_ptr() as usize).load(Ordering::SeqCst);
        assert_eq!(before, after);
        assert_eq!(a.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn commit_after_clean_run_skips_validation() {
        // A transaction alone on the clock commits with start == t - 1.
        let stm = Stm::new();
        let thr = stm.register_thread();
        let a = AtomicUsize::new(7);

        thr.start(TxAttr::default());
        let c0 = stm.clock();
        unsafe {
            assert_eq!(thr.load(a.as_ptr()).unwrap(), 7);
            thr.store(a.as_ptr(), 8).unwrap();
        }
        thr.commit().unwrap();
        assert_eq!(stm.clock(), c0 + 1);
        assert_eq!(a.load(Ordering::SeqCst), 8);
    }
}
