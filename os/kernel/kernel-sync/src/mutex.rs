use crate::irq::IrqGuard;
use crate::spin_lock::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// A [`SpinLock`] that is only ever held with local interrupts disabled.
///
/// For state that is also reached from interrupt-adjacent paths, where a
/// handler spinning on a lock held by the code it interrupted would never
/// make progress. Hold times must stay short: interrupts are off for the
/// whole critical section.
pub struct SpinMutex<T> {
    lock: SpinLock<T>,
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: SpinLock::new(value),
        }
    }

    /// Disable local interrupts, then spin until the lock is ours.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutexGuard<'_, T> {
        let irq = IrqGuard::new();
        IrqMutexGuard {
            guard: self.lock.lock(),
            _irq: irq,
        }
    }

    /// Single attempt; interrupts are restored right away on failure.
    #[inline]
    pub fn try_lock_irq(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq = IrqGuard::new();
        let guard = self.lock.try_lock()?;
        Some(IrqMutexGuard { guard, _irq: irq })
    }

    /// Racy snapshot of the lock state; diagnostics only.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.lock.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.lock.into_inner()
    }
}

/// Guard of a [`SpinMutex`].
///
/// Field order matters: the lock is released before interrupts are restored.
pub struct IrqMutexGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
