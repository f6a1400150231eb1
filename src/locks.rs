//! Thin newtype wrappers over `spin`'s primitives.
//!
//! Grounded on `crates/kernel/src/utils/locks.rs`'s `Mutex`/`RwLock` shape
//! (a transparent newtype with `lock()`/`read()`/`write()`) — kept the
//! shape, swapped the backing implementation from the teacher's
//! `lock_api`-custom-raw-mutex-with-cooperative-yield (`thread_yield` after
//! `SPIN_AMOUNT` failed spins — a kernel-scheduler hook this standalone
//! crate has no equivalent of) for `spin::Mutex`/`spin::RwLock` directly,
//! which the teacher already depends on for exactly this no-scheduler case.

use core::ops::{Deref, DerefMut};

pub type MutexGuard<'a, T> = spin::mutex::SpinMutexGuard<'a, T>;
pub type RwLockReadGuard<'a, T> = spin::rwlock::RwLockReadGuard<'a, T>;
pub type RwLockWriteGuard<'a, T> = spin::rwlock::RwLockWriteGuard<'a, T>;

#[derive(Debug)]
#[repr(transparent)]
pub struct Mutex<T>(spin::mutex::SpinMutex<T>);

#[derive(Debug)]
#[repr(transparent)]
pub struct RwLock<T>(spin::rwlock::RwLock<T>);

impl<T> Mutex<T> {
    pub const fn new(inner: T) -> Self {
        Self(spin::mutex::SpinMutex::new(inner))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

impl<T> RwLock<T> {
    pub const fn new(inner: T) -> Self {
        Self(spin::rwlock::RwLock::new(inner))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

impl<T> Deref for Mutex<T> {
    type Target = spin::mutex::SpinMutex<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Mutex<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_lock_grants_exclusive_access_to_the_inner_value() {
        let mutex = Mutex::new(5);
        *mutex.lock() += 1;
        assert_eq!(*mutex.lock(), 6);
    }

    #[test]
    fn mutex_get_mut_bypasses_locking_entirely() {
        let mut mutex = Mutex::new(0);
        *mutex.get_mut() = 42;
        assert_eq!(*mutex.lock(), 42);
    }

    #[test]
    fn rwlock_allows_concurrent_reads_and_exclusive_writes() {
        let lock = RwLock::new(10);
        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!(*a, 10);
            assert_eq!(*b, 10);
        }
        *lock.write() = 20;
        assert_eq!(*lock.read(), 20);
    }
}
