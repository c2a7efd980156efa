// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Table counters.

use crate::api::TableStatsDump;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

/// Counters updated as a table is used. Every counter is a relaxed
/// atomic: they are for observation only and order nothing.
#[derive(Debug, Default)]
pub struct TableStats {
    pub(crate) lookups: AtomicU64,
    pub(crate) lookup_fallbacks: AtomicU64,
    pub(crate) lookups_locked: AtomicU64,
    pub(crate) port_allocs: AtomicU64,
    pub(crate) port_exhausted: AtomicU64,
    pub(crate) lbgroup_resizes: AtomicU64,
}

impl TableStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dump(&self) -> TableStatsDump {
        TableStatsDump {
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_fallbacks: self.lookup_fallbacks.load(Ordering::Relaxed),
            lookups_locked: self.lookups_locked.load(Ordering::Relaxed),
            port_allocs: self.port_allocs.load(Ordering::Relaxed),
            port_exhausted: self.port_exhausted.load(Ordering::Relaxed),
            lbgroup_resizes: self.lbgroup_resizes.load(Ordering::Relaxed),
        }
    }
}
