// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Safe memory reclamation.
//!
//! Readers enter a read section ([`Smr::enter`]) before touching any
//! bucket chain and must not block while inside it. Writers never
//! modify a chain in place: they build a replacement, publish it, and
//! defer destruction of the old one until every reader which could
//! have loaded it has exited its section. The epoch machinery itself
//! is provided by `crossbeam-epoch`.
//!
//! On top of deferred destruction, [`Smr::advance`] hands out a
//! sequence number which a writer can later [`Smr::poll`] or
//! [`Smr::wait`] on. Once a sequence has elapsed, no reader can still
//! be acting on state it observed before the sequence was issued. The
//! table uses this to delay visibility of a record that moved between
//! buckets.

use crossbeam_epoch as epoch;
use crossbeam_epoch::Atomic;
use crossbeam_epoch::Guard;
use crossbeam_epoch::Owned;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A grace-period goal returned by [`Smr::advance`].
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct SmrSeq(u64);

/// A read section. Dropping the guard exits the section.
///
/// The guard is `!Send`: a section begins and ends on one thread.
pub struct SmrGuard {
    guard: Guard,
}

impl SmrGuard {
    /// Exit the read section.
    pub fn exit(self) {}
}

/// Proof of holding the table's writer lock, required to publish.
pub struct SmrWriter {
    _priv: (),
}

impl SmrWriter {
    pub(crate) fn new() -> Self {
        Self { _priv: () }
    }
}

/// The reclamation domain of one table.
pub struct Smr {
    /// The last sequence handed out.
    wr_seq: AtomicU64,

    /// The highest sequence known to have elapsed. Shared with the
    /// deferred functions which bump it.
    rd_seq: Arc<AtomicU64>,
}

impl Default for Smr {
    fn default() -> Self {
        Self::new()
    }
}

impl Smr {
    pub fn new() -> Self {
        Self { wr_seq: AtomicU64::new(0), rd_seq: Arc::new(AtomicU64::new(0)) }
    }

    /// Enter a read section.
    pub fn enter(&self) -> SmrGuard {
        SmrGuard { guard: epoch::pin() }
    }

    /// Start a new grace period and return its goal.
    pub fn advance(&self) -> SmrSeq {
        let goal = self.wr_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let rd_seq = Arc::clone(&self.rd_seq);
        let guard = epoch::pin();
        guard.defer(move || {
            rd_seq.fetch_max(goal, Ordering::AcqRel);
        });
        guard.flush();
        SmrSeq(goal)
    }

    /// Has the grace period for `seq` elapsed?
    ///
    /// This never blocks and may be called from inside a read section,
    /// though a section held by the caller keeps the answer `false`.
    pub fn poll(&self, seq: SmrSeq) -> bool {
        if self.rd_seq.load(Ordering::Acquire) >= seq.0 {
            return true;
        }

        // Push any deferred work to the global queue and give the
        // collector a chance to advance.
        epoch::pin().flush();
        self.rd_seq.load(Ordering::Acquire) >= seq.0
    }

    /// Block until the grace period for `seq` has elapsed.
    ///
    /// # Panics
    ///
    /// The calling thread must not be inside a read section; it would
    /// wait on itself.
    pub fn wait(&self, seq: SmrSeq) {
        assert!(!epoch::is_pinned(), "smr wait inside a read section");
        while !self.poll(seq) {
            std::thread::yield_now();
        }
    }

    /// Wait for every reader currently inside a section to exit.
    pub fn synchronize(&self) {
        let seq = self.advance();
        self.wait(seq);
    }
}

/// A copy-on-write list readable from within a read section.
///
/// Updates replace the whole list; the previous list is destroyed
/// once no reader can hold a reference to it.
pub struct SmrList<T> {
    head: Atomic<Vec<T>>,
}

impl<T> Default for SmrList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SmrList<T> {
    pub fn new() -> Self {
        Self { head: Atomic::new(Vec::new()) }
    }

    /// Read the current list.
    pub fn read<'a>(&'a self, guard: &'a SmrGuard) -> &'a [T] {
        let shared = self.head.load(Ordering::Acquire, &guard.guard);
        // SAFETY: The head is never null while `self` is alive, and a
        // list unlinked by `publish()` is only destroyed after every
        // guard that could have loaded it has been dropped.
        unsafe { shared.deref() }.as_slice()
    }

    /// Copy out the current list.
    pub fn snapshot(&self, smr: &Smr) -> Vec<T>
    where
        T: Clone,
    {
        let guard = smr.enter();
        self.read(&guard).to_vec()
    }

    /// Replace the list with `list`.
    pub fn publish(&self, _writer: &SmrWriter, list: Vec<T>)
    where
        T: Send,
    {
        let guard = epoch::pin();
        let old = self.head.swap(Owned::new(list), Ordering::AcqRel, &guard);
        // SAFETY: `old` is no longer reachable through `head`. Readers
        // which loaded it are pinned, and destruction is deferred until
        // they have all unpinned. Only the holder of the writer token
        // swaps the head, so `old` is unlinked exactly once.
        unsafe { guard.defer_destroy(old) };
    }
}

impl<T> Drop for SmrList<T> {
    fn drop(&mut self) {
        let head = std::mem::replace(&mut self.head, Atomic::null());
        // SAFETY: We have exclusive access to the list, and every slice
        // handed out by `read()` borrows `self`.
        unsafe { drop(head.into_owned()) };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn advance_then_wait() {
        let smr = Smr::new();
        let s1 = smr.advance();
        let s2 = smr.advance();
        assert!(s2 > s1);
        smr.wait(s2);
        assert!(smr.poll(s1));
        assert!(smr.poll(s2));
    }

    #[test]
    fn reader_holds_grace_period() {
        let smr = Arc::new(Smr::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let smr2 = Arc::clone(&smr);
        let reader = thread::spawn(move || {
            let guard = smr2.enter();
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            guard.exit();
        });

        entered_rx.recv().unwrap();
        let seq = smr.advance();
        for _ in 0..100 {
            assert!(!smr.poll(seq));
        }
        release_tx.send(()).unwrap();
        reader.join().unwrap();
        smr.wait(seq);
    }

    #[test]
    fn list_publish_read() {
        let smr = Smr::new();
        let w = SmrWriter::new();
        let list = SmrList::new();
        assert!(list.snapshot(&smr).is_empty());

        let guard = smr.enter();
        let before = list.read(&guard);
        list.publish(&w, vec![1, 2, 3]);
        // A reader keeps the list it loaded.
        assert!(before.is_empty());
        drop(guard);

        assert_eq!(list.snapshot(&smr), vec![1, 2, 3]);
    }
}
