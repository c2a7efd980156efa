// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Lookups.
//!
//! A flow resolves to the connected record owning its 4-tuple if there
//! is one. Failing that, and when wildcard matching is requested, to a
//! member of the best load-balance group on the local port, or else to
//! the first wildcard binding accepting it.
//!
//! [`PcbTable::lookup()`] runs without the table lock. It searches
//! inside a read section, then either try-locks the candidate on the
//! spot or takes a reference, leaves the section and blocks on the
//! record's lock. Either way the match is checked again under the
//! lock. A record which changed in the meantime sends the lookup to
//! [`PcbTable::lookup_locked()`], once.

use super::PcbTable;
use super::pcb::Cred;
use super::pcb::Inpcb;
use super::pcb::InpcbRef;
use super::pcb::LockIntent;
use super::pcb::PcbFlags;
use super::pcb::PcbLock;
use super::pcb::PcbState;
use super::pcb::VFlags;
use super::stat::TableStats;
use super::table::HashEntry;
use super::table::HashState;
use super::table::PcbKey;
use crate::api::AddrFamily;
use crate::api::IpAddr;
use crate::ddi::smr::SmrGuard;
use crate::ddi::sync::LockTaken;
use crate::engine::fib_matches;
use bitflags::bitflags;
use std::sync::Arc;

/// The extra wildcard cost of a dual-stack record answering an IPv4
/// local lookup: any IPv4-only record on the port is preferred.
const MAPPED_COST: u32 = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct LookupFlags: u8 {
        /// Consider load-balance groups and wildcard bindings when no
        /// connected record owns the flow.
        const WILDCARD = 1 << 0;
        /// Lock the record for reading. This is the default.
        const RLOCKPCB = 1 << 1;
        /// Lock the record for writing. Takes precedence over
        /// `RLOCKPCB`.
        const WLOCKPCB = 1 << 2;
    }
}

impl LookupFlags {
    pub fn intent(&self) -> LockIntent {
        if self.contains(Self::WLOCKPCB) {
            LockIntent::Write
        } else {
            LockIntent::Read
        }
    }
}

/// A flow to resolve, from the point of view of the receiving host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlowQuery {
    pub faddr: IpAddr,
    pub fport: u16,
    pub laddr: IpAddr,
    pub lport: u16,
    /// Prefer load-balance groups pinned to this NUMA domain.
    pub numa: Option<u8>,
    /// Restrict the search to this routing table.
    pub fib: Option<u16>,
}

impl FlowQuery {
    pub fn new(faddr: IpAddr, fport: u16, laddr: IpAddr, lport: u16) -> Self {
        Self { faddr, fport, laddr, lport, numa: None, fib: None }
    }

    pub fn with_numa(mut self, numa: u8) -> Self {
        self.numa = Some(numa);
        self
    }

    pub fn with_fib(mut self, fib: u16) -> Self {
        self.fib = Some(fib);
        self
    }
}

/// How a candidate was found, and so how to check it again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MatchKind {
    Exact,
    Group,
    Wild,
}

impl MatchKind {
    fn revalidate(&self, q: &FlowQuery, pcb: &Inpcb, st: &PcbState) -> bool {
        let flags = pcb.flags();
        if flags.contains(PcbFlags::FREED) {
            return false;
        }

        match self {
            Self::Exact => {
                flags.contains(PcbFlags::INHASH)
                    && PcbKey::of(pcb, st).matches_exact(q)
            }
            Self::Wild => {
                flags.contains(PcbFlags::INHASH)
                    && PcbKey::of(pcb, st).matches_wild(q)
            }
            Self::Group => {
                flags.contains(PcbFlags::INLBGROUP) && st.lport == q.lport
            }
        }
    }
}

pub(crate) struct Candidate<'a> {
    pub(crate) pcb: &'a InpcbRef,
    pub(crate) kind: MatchKind,
}

fn lookup_fallback_probe(table: &str, lport: u16, reason: &str) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::pcbtab_provider::lookup__fallback!(
                || (table, u64::from(lport), reason)
            );
        } else {
            let (_, _, _) = (table, lport, reason);
        }
    }
}

impl PcbTable {
    /// Search the chains for a flow. Pure traversal: nothing is locked.
    ///
    /// With `skip_pending` set, entries still inside their disconnect
    /// grace period are passed over.
    pub(crate) fn find_hash<'a>(
        &'a self,
        guard: &'a SmrGuard,
        q: &FlowQuery,
        flags: LookupFlags,
        skip_pending: bool,
    ) -> Option<Candidate<'a>> {
        let visible = |e: &HashEntry| {
            !skip_pending || e.visible_after.is_none_or(|s| self.smr.poll(s))
        };

        let idx = self.exact_bucket(&q.faddr, q.lport, q.fport);
        let exact = self.hash_exact[idx]
            .read(guard)
            .iter()
            .find(|e| e.key.matches_exact(q) && visible(*e));
        if let Some(e) = exact {
            return Some(Candidate { pcb: &e.pcb, kind: MatchKind::Exact });
        }

        if !flags.contains(LookupFlags::WILDCARD) {
            return None;
        }

        if let Some(pcb) = self.lbgroup_select(guard, q) {
            return Some(Candidate { pcb, kind: MatchKind::Group });
        }

        // First match wins: the chain is in precedence order.
        let wild = self.hash_wild[self.wild_bucket(q.lport)]
            .read(guard)
            .iter()
            .find(|e| {
                e.key.matches_wild(q)
                    && (!e.key.cred.is_isolated()
                        || self.env.check_domain_addr(&e.key.cred, &q.laddr))
                    && visible(*e)
            });

        wild.map(|e| Candidate { pcb: &e.pcb, kind: MatchKind::Wild })
    }

    /// Find the record owning a flow without taking the table lock.
    pub fn lookup(
        &self,
        q: &FlowQuery,
        flags: LookupFlags,
    ) -> Option<InpcbRef> {
        self.lookup_with(q, flags, |pcb, _| Arc::clone(pcb))
    }

    /// Find the record owning a flow without taking the table lock,
    /// and call `f` with the record locked as `flags` asks.
    ///
    /// `f` may run inside a read section and must not block.
    pub fn lookup_with<R, F>(
        &self,
        q: &FlowQuery,
        flags: LookupFlags,
        f: F,
    ) -> Option<R>
    where
        F: FnOnce(&InpcbRef, PcbLock<'_>) -> R,
    {
        TableStats::incr(&self.stats.lookups);
        let intent = flags.intent();

        let escalate = {
            let guard = self.smr.enter();
            let cand = self.find_hash(&guard, q, flags, true)?;
            let escalate = match cand.pcb.try_lock(intent) {
                Ok(lock) => {
                    if cand.kind.revalidate(q, cand.pcb, &lock) {
                        return Some(f(cand.pcb, lock));
                    }
                    None
                }
                Err(LockTaken) => Some((Arc::clone(cand.pcb), cand.kind)),
            };
            escalate
        };

        // The read section is over; the reference keeps the record
        // alive while we wait for its lock.
        if let Some((pcb, kind)) = escalate {
            let lock = pcb.lock(intent);
            if kind.revalidate(q, &pcb, &lock) {
                return Some(f(&pcb, lock));
            }
        }

        TableStats::incr(&self.stats.lookup_fallbacks);
        lookup_fallback_probe(self.name(), q.lport, "revalidate");
        self.lookup_locked_with(q, flags, f)
    }

    /// Find the record owning a flow, serialized against table
    /// updates.
    pub fn lookup_locked(
        &self,
        q: &FlowQuery,
        flags: LookupFlags,
    ) -> Option<InpcbRef> {
        self.lookup_locked_with(q, flags, |pcb, _| Arc::clone(pcb))
    }

    /// Find the record owning a flow under the table lock, and call
    /// `f` with the record locked as `flags` asks.
    ///
    /// The table lock is released before `f` runs. A record freed
    /// while the lookup waited for its lock is reported absent.
    pub fn lookup_locked_with<R, F>(
        &self,
        q: &FlowQuery,
        flags: LookupFlags,
        f: F,
    ) -> Option<R>
    where
        F: FnOnce(&InpcbRef, PcbLock<'_>) -> R,
    {
        TableStats::incr(&self.stats.lookups_locked);
        let intent = flags.intent();

        let st = self.hash_lock.lock();
        let guard = self.smr.enter();
        let cand = self.find_hash(&guard, q, flags, true)?;
        let pcb = match cand.pcb.try_lock(intent) {
            Ok(lock) => {
                drop(st);
                return Some(f(cand.pcb, lock));
            }
            Err(LockTaken) => Arc::clone(cand.pcb),
        };

        drop(st);
        drop(guard);
        let lock = pcb.lock(intent);
        if pcb.is_freed() {
            return None;
        }
        Some(f(&pcb, lock))
    }

    /// Find a record bound to a local address and port.
    ///
    /// Without `wildcard`, only an unconnected record bound to exactly
    /// `laddr` in the isolation domain of `cred` is returned. With it,
    /// the best fit among every record on the port is, fewest
    /// wildcards first.
    pub fn lookup_local(
        &self,
        laddr: &IpAddr,
        lport: u16,
        wildcard: bool,
        cred: &Cred,
    ) -> Option<InpcbRef> {
        let st = self.hash_lock.lock();
        self.find_local(&st, laddr, lport, None, wildcard, cred)
            .map(|e| e.pcb)
    }

    pub(crate) fn find_local(
        &self,
        st: &HashState,
        laddr: &IpAddr,
        lport: u16,
        fib: Option<u16>,
        wildcard: bool,
        cred: &Cred,
    ) -> Option<HashEntry> {
        let family = laddr.family();

        if !wildcard {
            let guard = self.smr.enter();
            return self.hash_wild[self.wild_bucket(lport)]
                .read(&guard)
                .iter()
                .find(|e| {
                    e.key.lport == lport
                        && !e.key.is_connected()
                        && same_local(&e.key.laddr, laddr)
                        && e.key.vflag.serves(family)
                        && fib_matches(e.key.fib, fib)
                        && e.key.cred.same_domain(cred)
                })
                .cloned();
        }

        let mut best = None;
        let mut matchwild = 3 + MAPPED_COST;
        for e in st.ports.get(&lport)? {
            if !e.key.cred.same_domain(cred)
                || !e.key.vflag.serves(family)
                || !fib_matches(e.key.fib, fib)
            {
                continue;
            }

            let mut cost = 0;
            if family == AddrFamily::Inet && e.key.vflag.contains(VFlags::IPV6)
            {
                cost += MAPPED_COST;
            }
            if e.key.is_connected() {
                cost += 1;
            }
            if !e.key.laddr.is_unspecified() {
                if laddr.is_unspecified() {
                    cost += 1;
                } else if e.key.laddr != *laddr {
                    continue;
                }
            } else if !laddr.is_unspecified() {
                cost += 1;
            }

            if cost < matchwild {
                best = Some(e);
                matchwild = cost;
                if matchwild == 0 {
                    break;
                }
            }
        }

        best.cloned()
    }
}

/// Are two local addresses the same binding? The unspecified
/// addresses of both families are one.
fn same_local(a: &IpAddr, b: &IpAddr) -> bool {
    a == b || (a.is_unspecified() && b.is_unspecified())
}
