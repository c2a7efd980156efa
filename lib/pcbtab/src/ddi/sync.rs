// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Safe abstractions for synchronization primitives.
//!
//! These wrap the std locks with the API shape the table code is
//! written against. Poisoning is never exposed: a panic while holding
//! a table lock leaves the table corrupt and is propagated. The
//! non-blocking `try_*` entry points are for use inside epoch read
//! sections.
use core::ops::Deref;
use core::ops::DerefMut;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::sync::TryLockError;

fn poisoned<E: core::fmt::Display>(e: E) -> ! {
    panic!("lock poisoned: {e}")
}

/// The lock is currently held by someone else.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LockTaken;

/// A mutex guarding `T`.
///
/// Semantics follow an adaptive kernel mutex rather than the std
/// `Mutex`: no poisoning is exposed and `try_lock` never blocks.
pub struct KMutex<T> {
    inner: Mutex<T>,
}

pub struct KMutexGuard<'a, T: 'a> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KMutex<T> {
    pub fn new(val: T) -> Self {
        KMutex { inner: Mutex::new(val) }
    }

    /// Acquire the mutex, blocking until it is available. The mutex is
    /// released when the guard is dropped.
    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(|e| poisoned(e));
        KMutexGuard { guard }
    }

    /// Acquire the mutex only if it is immediately available.
    pub fn try_lock(&self) -> Result<KMutexGuard<'_, T>, LockTaken> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(KMutexGuard { guard }),
            Err(TryLockError::WouldBlock) => Err(LockTaken),
            Err(TryLockError::Poisoned(e)) => poisoned(e),
        }
    }
}

/// A reader/writer lock guarding `T`.
pub struct KRwLock<T> {
    inner: RwLock<T>,
}

pub struct KRwLockReadGuard<'a, T: 'a> {
    guard: RwLockReadGuard<'a, T>,
}

pub struct KRwLockWriteGuard<'a, T: 'a> {
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for KRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> Deref for KRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KRwLock<T> {
    pub fn new(val: T) -> Self {
        KRwLock { inner: RwLock::new(val) }
    }

    pub fn read(&self) -> KRwLockReadGuard<'_, T> {
        let guard = self.inner.read().unwrap_or_else(|e| poisoned(e));
        KRwLockReadGuard { guard }
    }

    pub fn write(&self) -> KRwLockWriteGuard<'_, T> {
        let guard = self.inner.write().unwrap_or_else(|e| poisoned(e));
        KRwLockWriteGuard { guard }
    }

    pub fn try_read(&self) -> Result<KRwLockReadGuard<'_, T>, LockTaken> {
        match self.inner.try_read() {
            Ok(guard) => Ok(KRwLockReadGuard { guard }),
            Err(TryLockError::WouldBlock) => Err(LockTaken),
            Err(TryLockError::Poisoned(e)) => poisoned(e),
        }
    }

    pub fn try_write(&self) -> Result<KRwLockWriteGuard<'_, T>, LockTaken> {
        match self.inner.try_write() {
            Ok(guard) => Ok(KRwLockWriteGuard { guard }),
            Err(TryLockError::WouldBlock) => Err(LockTaken),
            Err(TryLockError::Poisoned(e)) => poisoned(e),
        }
    }
}
