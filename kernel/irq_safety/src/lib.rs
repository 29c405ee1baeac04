//! Irq-safe locking, and saving and restoring the local CPU's interrupt state.
//!
//! A lock that can be taken both by a thread and by an interrupt handler must be
//! held with interrupts disabled. Otherwise the handler can interrupt the holder
//! on the same CPU and spin on the lock forever.

#![cfg_attr(not(any(test, feature = "host")), no_std)]

extern crate spin;
#[cfg(all(target_arch = "x86_64", not(any(test, feature = "host"))))]
extern crate x86_64;

pub use held_interrupts::*;
pub use mutex_irqsafe::*;

mod held_interrupts;
mod mutex_irqsafe;
