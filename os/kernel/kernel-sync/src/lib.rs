//! # Kernel synchronization primitives
//!
//! Spin-based locks for code that must never sleep: memory reclaim paths,
//! allocator fast paths and anything that may run with interrupts disabled.
//!
//! | Type | Use |
//! |------|-----|
//! | [`SpinLock`] | Plain test-and-test-and-set lock with a RAII guard. |
//! | [`SpinMutex`] | [`SpinLock`] that is only taken with interrupts disabled, via [`SpinMutex::lock_irq`]. |
//! | [`RwSpinLock`] | Reader/writer spin lock whose write guard can be downgraded to a read guard. |
//! | [`IrqGuard`] | Saves and disables the local interrupt flag for a scope. |
//!
//! None of the locks are fair and none of them are reentrant.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod rw_spin;
mod spin_lock;

pub use irq::IrqGuard;
pub use mutex::{IrqMutexGuard, SpinMutex};
pub use rw_spin::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
