// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Load-balance groups.
//!
//! Records bound with `REUSEPORT_LB` to the same local address and
//! port, by the same isolation domain, form a group. A flow that finds
//! no connected record is handed to one member of the best group,
//! chosen by hashing the flow, so each flow sticks to one member for as
//! long as the membership is unchanged.
//!
//! Groups are immutable once published. Joining or leaving builds a
//! replacement group and republishes the group bucket.

use super::PcbTable;
use super::fib_matches;
use super::lookup::FlowQuery;
use super::pcb::Cred;
use super::pcb::InpcbRef;
use super::pcb::IsolationDomain;
use super::pcb::PcbFlags;
use super::pcb::VFlags;
use super::stat::TableStats;
use super::table::HashState;
use super::table::PcbKey;
use super::table::Result;
use super::tuple_hash;
use crate::api::IpAddr;
use crate::api::LbGroupDump;
use crate::api::PcbError;
use crate::ddi::smr::SmrGuard;
use std::sync::Arc;
use std::vec::Vec;

/// The capacity of a new group, and the floor it shrinks to.
pub const LBGROUP_MIN: usize = 8;

/// The largest group. Records joining a full group are not added.
pub const LBGROUP_MAX: usize = 256;

/// What makes two records members of the same group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct LbKey {
    pub(crate) domain: Option<IsolationDomain>,
    pub(crate) vflag: VFlags,
    pub(crate) lport: u16,
    pub(crate) laddr: IpAddr,
    pub(crate) numa: Option<u8>,
    pub(crate) fib: Option<u16>,
}

impl LbKey {
    pub(crate) fn of(key: &PcbKey, numa: Option<u8>) -> Self {
        Self {
            domain: key.cred.domain,
            vflag: key.vflag,
            lport: key.lport,
            laddr: key.laddr,
            numa,
            fib: key.fib,
        }
    }
}

/// A set of records sharing one local binding.
pub struct LbGroup {
    key: LbKey,
    /// The owner of the record that created the group.
    cred: Cred,
    capacity: usize,
    members: Vec<InpcbRef>,
}

impl LbGroup {
    fn build<I>(
        key: LbKey,
        cred: Cred,
        capacity: usize,
        members: I,
    ) -> Result<Self>
    where
        I: Iterator<Item = InpcbRef>,
    {
        let mut v = Vec::new();
        v.try_reserve_exact(capacity)
            .map_err(|_| PcbError::ResourceExhausted)?;
        v.extend(members);
        debug_assert!(v.len() <= capacity);
        Ok(Self { key, cred, capacity, members: v })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[InpcbRef] {
        &self.members
    }

    pub fn numa(&self) -> Option<u8> {
        self.key.numa
    }

    /// The member serving a flow with hash `hash`.
    pub fn select(&self, hash: u32) -> &InpcbRef {
        &self.members[hash as usize % self.members.len()]
    }

    fn contains(&self, pcb: &InpcbRef) -> bool {
        self.members.iter().any(|m| Arc::ptr_eq(m, pcb))
    }

    pub(crate) fn dump(&self) -> LbGroupDump {
        LbGroupDump {
            laddr: self.key.laddr,
            lport: self.key.lport,
            domain: self.key.domain.map(|d| d.0),
            numa: self.key.numa,
            capacity: self.capacity,
            members: self.members.iter().map(|m| m.id()).collect(),
        }
    }
}

fn lbgroup_resize_probe(table: &str, lport: u16, old: usize, new: usize) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::pcbtab_provider::lbgroup__resize!(
                || (table, u64::from(lport), old as u64, new as u64)
            );
        } else {
            let (_, _, _, _) = (table, lport, old, new);
        }
    }
}

fn lbgroup_full_probe(table: &str, lport: u16, size: usize) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::pcbtab_provider::lbgroup__full!(
                || (table, u64::from(lport), size as u64)
            );
        } else {
            let (_, _, _) = (table, lport, size);
        }
    }
}

impl PcbTable {
    /// Add a record to the group for `lk`, creating or growing the
    /// group as needed.
    ///
    /// Returns `false`, leaving everything as it was, if the group is
    /// already at [`LBGROUP_MAX`]. On allocation failure nothing is
    /// changed either.
    pub(crate) fn lbgroup_join(
        &self,
        st: &mut HashState,
        pcb: &InpcbRef,
        lk: &LbKey,
    ) -> Result<bool> {
        let list = &self.lbgroups[self.lb_bucket(lk.lport)];
        let cur = list.snapshot(&self.smr);
        let pos = cur.iter().position(|g| g.key == *lk);

        let grp = match pos {
            Some(i) => {
                let g = &cur[i];
                let mut capacity = g.capacity;
                if g.len() == capacity {
                    if capacity >= LBGROUP_MAX {
                        lbgroup_full_probe(self.name(), lk.lport, capacity);
                        return Ok(false);
                    }
                    capacity = (capacity * 2).min(LBGROUP_MAX);
                }

                let members =
                    g.members.iter().cloned().chain([Arc::clone(pcb)]);
                let grp = LbGroup::build(*lk, g.cred, capacity, members)?;
                if capacity != g.capacity {
                    TableStats::incr(&self.stats.lbgroup_resizes);
                    lbgroup_resize_probe(
                        self.name(),
                        lk.lport,
                        g.capacity,
                        capacity,
                    );
                }
                grp
            }

            None => LbGroup::build(
                *lk,
                *pcb.cred(),
                LBGROUP_MIN,
                [Arc::clone(pcb)].into_iter(),
            )?,
        };

        let mut groups = Vec::new();
        groups
            .try_reserve_exact(cur.len() + 1)
            .map_err(|_| PcbError::ResourceExhausted)?;
        match pos {
            Some(i) => {
                groups.extend_from_slice(&cur);
                groups[i] = Arc::new(grp);
            }
            None => {
                groups.push(Arc::new(grp));
                groups.extend_from_slice(&cur);
            }
        }

        list.publish(&st.writer, groups);
        Ok(true)
    }

    /// Remove a record from the group for `lk`. Remaining members keep
    /// their relative order. Returns whether the record was found.
    pub(crate) fn lbgroup_leave(
        &self,
        st: &mut HashState,
        pcb: &InpcbRef,
        lk: &LbKey,
    ) -> bool {
        let list = &self.lbgroups[self.lb_bucket(lk.lport)];
        let cur = list.snapshot(&self.smr);
        let pos = cur.iter().position(|g| g.key == *lk && g.contains(pcb));
        let Some(i) = pos else {
            return false;
        };

        let g = &cur[i];
        let mut groups: Vec<Arc<LbGroup>> = Vec::with_capacity(cur.len());
        groups.extend_from_slice(&cur[..i]);

        if g.len() > 1 {
            let remaining = g.len() - 1;
            let mut capacity = g.capacity;
            if remaining <= capacity / 4 && capacity > LBGROUP_MIN {
                capacity = (capacity / 2).max(LBGROUP_MIN);
            }

            let mut members = Vec::with_capacity(capacity);
            members.extend(
                g.members.iter().filter(|m| !Arc::ptr_eq(m, pcb)).cloned(),
            );
            let grp = LbGroup { key: *lk, cred: g.cred, capacity, members };

            if grp.capacity != g.capacity {
                TableStats::incr(&self.stats.lbgroup_resizes);
                lbgroup_resize_probe(
                    self.name(),
                    lk.lport,
                    g.capacity,
                    grp.capacity,
                );
            }
            groups.push(Arc::new(grp));
        }

        groups.extend_from_slice(&cur[i + 1..]);
        list.publish(&st.writer, groups);
        true
    }

    /// Pick the member of the best group serving a flow.
    ///
    /// Isolated groups are preferred over unscoped ones, then groups
    /// bound to the flow's local address over wildcard groups. Among
    /// equals, a group pinned to the query's NUMA domain wins.
    pub(crate) fn lbgroup_select<'a>(
        &'a self,
        guard: &'a SmrGuard,
        q: &FlowQuery,
    ) -> Option<&'a InpcbRef> {
        let family = q.laddr.family();
        let numa_match = |g: &LbGroup| g.key.numa == q.numa;

        let mut jail_exact = None;
        let mut jail_wild = None;
        let mut local_exact = None;
        let mut local_wild = None;

        for g in self.lbgroups[self.lb_bucket(q.lport)].read(guard) {
            let g: &LbGroup = g;
            if g.key.lport != q.lport
                || !g.key.vflag.serves(family)
                || !fib_matches(g.key.fib, q.fib)
            {
                continue;
            }

            let injail = g.cred.is_isolated();
            if injail && !self.env.check_domain_addr(&g.cred, &q.laddr) {
                continue;
            }

            if g.key.laddr == q.laddr {
                if injail {
                    jail_exact = Some(g);
                    if numa_match(g) {
                        // Nothing can beat this one.
                        break;
                    }
                } else if local_exact.is_none() || numa_match(g) {
                    local_exact = Some(g);
                }
            } else if g.key.laddr.is_unspecified() {
                if injail {
                    if jail_wild.is_none() || numa_match(g) {
                        jail_wild = Some(g);
                    }
                } else if local_wild.is_none() || numa_match(g) {
                    local_wild = Some(g);
                }
            }
        }

        let grp = jail_exact.or(jail_wild).or(local_exact).or(local_wild)?;
        if grp.members.is_empty() {
            return None;
        }
        Some(grp.select(self.flow_hash(q)))
    }

    /// The hash selecting a group member for a flow.
    pub fn flow_hash(&self, q: &FlowQuery) -> u32 {
        tuple_hash(self.seed, &q.faddr, q.lport, q.fport)
    }

    /// Move a record to the group pinned to NUMA domain `numa`.
    ///
    /// An unhashed record just remembers the domain for when it joins.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the domain is out of range, `InvalidState`
    /// if the record is hashed but not a group member and
    /// `ResourceExhausted` if the target group is full or could not
    /// grow. On error the record stays in its current group.
    pub fn set_numa_domain(
        &self,
        pcb: &InpcbRef,
        numa: Option<u8>,
    ) -> Result<()> {
        if let Some(d) = numa {
            if d >= self.cfg.numa_domains {
                return Err(PcbError::InvalidArgument(format!(
                    "numa domain {d} out of range"
                )));
            }
        }

        let mut ps = pcb.write();
        let flags = pcb.flags();
        if !flags.contains(PcbFlags::INHASH) {
            ps.numa = numa;
            return Ok(());
        }
        if !flags.contains(PcbFlags::INLBGROUP) {
            return Err(PcbError::InvalidState(
                "not a load-balance group member".into(),
            ));
        }

        let mut st = self.hash_lock.lock();
        let key = PcbKey::of(pcb, &ps);
        let old = LbKey::of(&key, ps.numa);
        let new = LbKey::of(&key, numa);
        if old == new {
            return Ok(());
        }

        if !self.lbgroup_join(&mut st, pcb, &new)? {
            return Err(PcbError::ResourceExhausted);
        }
        self.lbgroup_leave(&mut st, pcb, &old);
        ps.numa = numa;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::AddrFamily;
    use crate::api::TableCfg;
    use crate::engine::env::HostEnv;
    use crate::engine::lookup::LookupFlags;
    use crate::engine::pcb::SockOpts;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn table() -> PcbTable {
        let cfg = TableCfg {
            seed: Some(3),
            numa_domains: 2,
            ..Default::default()
        };
        PcbTable::new("lb", cfg, Arc::new(HostEnv::new())).unwrap()
    }

    fn listener(t: &PcbTable, port: u16) -> InpcbRef {
        let pcb = t.create(AddrFamily::Inet, Cred::new(1000));
        t.set_options(&pcb, SockOpts::REUSEPORT_LB).unwrap();
        t.bind(&pcb, ip("0.0.0.0"), port).unwrap();
        pcb
    }

    #[test]
    fn grow_and_shrink() {
        let t = table();
        let pcbs: Vec<_> = (0..20).map(|_| listener(&t, 9000)).collect();

        let groups = t.dump().lbgroups;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].capacity, 32);
        assert_eq!(groups[0].members.len(), 20);
        assert_eq!(t.stats().lbgroup_resizes, 2);

        for pcb in &pcbs[..19] {
            t.remove(pcb);
        }

        let groups = t.dump().lbgroups;
        assert_eq!(groups[0].capacity, LBGROUP_MIN);
        assert_eq!(groups[0].members, vec![pcbs[19].id()]);

        t.remove(&pcbs[19]);
        assert!(t.dump().lbgroups.is_empty());
    }

    #[test]
    fn full_group_declines() {
        let t = table();
        let pcbs: Vec<_> =
            (0..LBGROUP_MAX + 1).map(|_| listener(&t, 9001)).collect();

        let groups = t.dump().lbgroups;
        assert_eq!(groups[0].capacity, LBGROUP_MAX);
        assert_eq!(groups[0].members.len(), LBGROUP_MAX);

        let last = &pcbs[LBGROUP_MAX];
        let flags = last.flags();
        assert!(flags.contains(PcbFlags::INHASH));
        assert!(!flags.contains(PcbFlags::INLBGROUP));
    }

    #[test]
    fn retarget_numa() {
        let t = table();
        let a = listener(&t, 9002);
        let b = listener(&t, 9002);

        assert!(matches!(
            t.set_numa_domain(&a, Some(2)),
            Err(PcbError::InvalidArgument(_))
        ));
        t.set_numa_domain(&a, Some(1)).unwrap();
        assert_eq!(a.read().numa(), Some(1));

        let groups = t.dump().lbgroups;
        assert_eq!(groups.len(), 2);
        let pinned = groups.iter().find(|g| g.numa == Some(1)).unwrap();
        assert_eq!(pinned.members, vec![a.id()]);

        t.set_numa_domain(&b, Some(0)).unwrap();
        let q = FlowQuery::new(ip("192.0.2.1"), 5555, ip("10.0.0.2"), 9002);
        let got = t.lookup(&q.with_numa(1), LookupFlags::WILDCARD).unwrap();
        assert!(Arc::ptr_eq(&got, &a));
        let got = t.lookup(&q.with_numa(0), LookupFlags::WILDCARD).unwrap();
        assert!(Arc::ptr_eq(&got, &b));

        // Unhashed records just remember the domain.
        let idle = t.create(AddrFamily::Inet, Cred::new(1000));
        t.set_numa_domain(&idle, Some(1)).unwrap();
        assert_eq!(idle.read().numa(), Some(1));

        let plain = t.create(AddrFamily::Inet, Cred::new(1000));
        t.bind(&plain, ip("0.0.0.0"), 9003).unwrap();
        assert!(matches!(
            t.set_numa_domain(&plain, Some(0)),
            Err(PcbError::InvalidState(_))
        ));
    }
}
