//! Clock rollover under the shrunk version space.
//!
//! Built only with `--features small-clock`, where the version space ends
//! at 1024 and a few hundred commits are enough to exhaust it.

#![cfg(feature = "small-clock")]

use petek::{Stm, TxAttr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const STRIDE: usize = 8;

fn make_words(n: usize) -> Vec<AtomicUsize> {
    (0..n * STRIDE).map(|_| AtomicUsize::new(0)).collect()
}

fn word(mem: &[AtomicUsize], i: usize) -> *mut usize {
    mem[i * STRIDE].as_ptr()
}

fn peek(mem: &[AtomicUsize], i: usize) -> usize {
    mem[i * STRIDE].load(Ordering::SeqCst)
}

#[test]
fn solo_thread_rolls_the_clock_over() {
    const COMMITS: usize = 1100;

    let stm = Stm::new();
    let mem = make_words(1);
    let thr = stm.register_thread();

    for _ in 0..COMMITS {
        thr.atomically(TxAttr::default(), |tx| unsafe {
            let v = tx.load(word(&mem, 0))?;
            tx.store(word(&mem, 0), v + 1)?;
            Ok(())
        })
        .unwrap();
    }

    // More commits ran than the version space holds, so the epoch
    // restarted at least once and no increment was lost.
    assert_eq!(peek(&mem, 0), COMMITS);
    assert!(stm.clock() < 1024);
}

#[test]
fn concurrent_threads_survive_the_rollover() {
    const THREADS: usize = 2;
    const PER_THREAD: usize = 800;

    let stm = Stm::new();
    let mem = make_words(THREADS);

    thread::scope(|s| {
        for i in 0..THREADS {
            let stm = &stm;
            let mem = &mem;
            s.spawn(move || {
                let thr = stm.register_thread();
                for _ in 0..PER_THREAD {
                    thr.atomically(TxAttr::default(), |tx| unsafe {
                        let v = tx.load(word(mem, i))?;
                        tx.store(word(mem, i), v + 1)?;
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
    });

    for i in 0..THREADS {
        assert_eq!(peek(&mem, i), PER_THREAD);
    }
    assert!(stm.clock() < 1024);
}
