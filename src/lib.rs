//! Petek: word-based software transactional memory.
//!
//! Petek gives multiple threads opacity-preserving atomic execution of
//! arbitrary read/write sequences over shared word-sized memory locations.
//!
//! # Architecture
//!
//! The engine is write-back with encounter-time locking over a global
//! version clock:
//!
//! - **Reads**: invisible and optimistic. The observed stripe version is
//!   logged and re-validated; a read that trips over a newer version first
//!   tries to extend the snapshot instead of giving up.
//! - **Writes**: buffered in a per-thread log. The stripe lock is acquired
//!   at the first write by CASing the write-log entry's address into the
//!   lock word.
//! - **Commit**: stamps a fresh clock value, validates the read log if
//!   anyone committed in between, writes the buffer back and reopens every
//!   owned stripe with the new version.
//! - **Conflicts**: abort and retry. The retry driver re-runs the
//!   transactional block with a fresh snapshot and the same attributes.
//!
//! Addresses hash onto a fixed array of 2^20 version locks, so unrelated
//! locations can share a stripe; the protocol tolerates that as false
//! sharing.
//!
//! # Example
//!
//! ```
//! use petek::{Stm, TxAttr};
//! use std::sync::atomic::AtomicUsize;
//!
//! let stm = Stm::new();
//! let thr = stm.register_thread();
//! let counter = AtomicUsize::new(0);
//!
//! thr.atomically(TxAttr::default(), |tx| unsafe {
//!     let v = tx.load(counter.as_ptr())?;
//!     tx.store(counter.as_ptr(), v + 1)?;
//!     Ok(())
//! })
//! .unwrap();
//! ```
//!
//! DANGER AHEAD: don't run IO inside a transactional block. Conflicting
//! blocks re-run, and so would the IO. Use the commit callbacks for
//! side effects.

#![warn(missing_docs)]

mod abort;
mod callback;
mod clock;
mod lock;
mod quiesce;
mod set;
mod stm;
mod tx;
mod wbetl;

pub use abort::Abort;
pub use lock::Word;
pub use stm::{global, Parameter, PauseGuard, Stm, ThreadTx};
pub use tx::TxAttr;
