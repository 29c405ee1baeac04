use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};
use crate::held_interrupts::{hold_interrupts, HeldInterrupts};

/// This type provides interrupt-safe MUTual EXclusion based on [spin::Mutex].
///
/// Interrupts on the current CPU are disabled before the lock is taken
/// and are restored only after it has been released, so an interrupt handler
/// that takes the same lock can never preempt its holder on that CPU.
pub struct MutexIrqSafe<T: ?Sized> {
    lock: Mutex<T>,
}

/// A guard to which the protected data can be accessed
///
/// When the guard falls out of scope it will release the lock
/// and then restore the interrupt state that was saved when it was acquired.
pub struct MutexGuardIrqSafe<'a, T: ?Sized + 'a> {
    held_irq: ManuallyDrop<HeldInterrupts>,
    guard: ManuallyDrop<MutexGuard<'a, T>>,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for MutexIrqSafe<T> {}
unsafe impl<T: ?Sized + Send> Send for MutexIrqSafe<T> {}

impl<T> MutexIrqSafe<T> {
    /// Creates a new spinlock wrapping the supplied data.
    pub const fn new(user_data: T) -> MutexIrqSafe<T> {
        MutexIrqSafe {
            lock: Mutex::new(user_data),
        }
    }

    /// Consumes this MutexIrqSafe, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.lock.into_inner()
    }
}

impl<T: ?Sized> MutexIrqSafe<T> {
    /// Disables interrupts, then locks the spinlock and returns a guard.
    pub fn lock(&self) -> MutexGuardIrqSafe<T> {
        let held_irq = hold_interrupts();
        MutexGuardIrqSafe {
            held_irq: ManuallyDrop::new(held_irq),
            guard: ManuallyDrop::new(self.lock.lock()),
        }
    }

    /// Tries to lock the MutexIrqSafe. If it is already locked, it will return None
    /// and the interrupt state is left as it was. Otherwise it returns a guard within Some.
    pub fn try_lock(&self) -> Option<MutexGuardIrqSafe<T>> {
        let held_irq = hold_interrupts();
        self.lock.try_lock().map(|guard| MutexGuardIrqSafe {
            held_irq: ManuallyDrop::new(held_irq),
            guard: ManuallyDrop::new(guard),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexIrqSafe<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "MutexIrqSafe {{ data: {:?} }}", &*guard),
            None => write!(f, "MutexIrqSafe {{ <locked> }}"),
        }
    }
}

impl<T: Default> Default for MutexIrqSafe<T> {
    fn default() -> MutexIrqSafe<T> {
        MutexIrqSafe::new(Default::default())
    }
}

impl<'a, T: ?Sized> Deref for MutexGuardIrqSafe<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuardIrqSafe<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// NOTE: we need explicit calls to .drop() to ensure that HeldInterrupts are not released
//       until the inner lock is also released.
impl<'a, T: ?Sized> Drop for MutexGuardIrqSafe<'a, T> {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            ManuallyDrop::drop(&mut self.held_irq);
        }
    }
}
