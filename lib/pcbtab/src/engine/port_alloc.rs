// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The ephemeral port allocator.

use super::PcbTable;
use super::lookup::FlowQuery;
use super::lookup::LookupFlags;
use super::pcb::Inpcb;
use super::pcb::PcbState;
use super::pcb::SockOpts;
use super::stat::TableStats;
use super::table::HashState;
use super::table::Result;
use crate::api::IpAddr;
use crate::api::PcbError;
use crate::api::PortRange;
use rand::Rng;

fn port_exhausted_probe(table: &str, first: u16, last: u16) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::pcbtab_provider::port__exhausted!(
                || (table, u64::from(first), u64::from(last))
            );
        } else {
            let (_, _, _) = (table, first, last);
        }
    }
}

impl PcbTable {
    /// Choose a free local port for a record about to be hashed at
    /// `laddr`.
    ///
    /// With a `dest`, the record is connecting and a port is free when
    /// no record owns the resulting flow. Otherwise it is binding and a
    /// port is free when no conflicting local binding exists.
    ///
    /// The scan starts just past the range's cursor, or at a random
    /// point if the table randomizes ports, and visits each port of the
    /// range at most once.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the record asks for the privileged range
    /// without authorization; `ResourceExhausted` if every port in the
    /// range is taken.
    pub(crate) fn alloc_port(
        &self,
        st: &mut HashState,
        pcb: &Inpcb,
        ps: &PcbState,
        laddr: &IpAddr,
        dest: Option<(IpAddr, u16)>,
    ) -> Result<u16> {
        let ports = &self.cfg.ports;
        let range = ports.range(ps.range);
        let (first, last) = (*range.start(), *range.end());

        if ps.range == PortRange::Low
            && !self.env.is_bind_authorized(pcb.cred(), laddr, first)?
        {
            return Err(PcbError::PermissionDenied);
        }

        let mut cursor = match ps.range {
            PortRange::Low => st.last_low,
            PortRange::Default => st.last_port,
            PortRange::High => st.last_hi,
        };
        if ports.randomized && last > first {
            cursor = first + st.rng.random_range(0..last - first);
        }

        let reuse =
            ps.opts.intersects(SockOpts::REUSEADDR | SockOpts::REUSEPORT);
        let mut count = i32::from(last - first);
        let found = loop {
            if count < 0 {
                break None;
            }
            count -= 1;

            cursor = cursor.wrapping_add(1);
            if cursor < first || cursor > last {
                cursor = first;
            }
            if cursor == 0 {
                continue;
            }

            let busy = match dest {
                Some((faddr, fport)) => {
                    let mut q = FlowQuery::new(faddr, fport, *laddr, cursor);
                    q.fib = ps.fib;
                    let flags = if reuse {
                        LookupFlags::empty()
                    } else {
                        LookupFlags::WILDCARD
                    };
                    let guard = self.smr.enter();
                    self.find_hash(&guard, &q, flags, false).is_some()
                }
                None => self
                    .find_local(st, laddr, cursor, None, !reuse, pcb.cred())
                    .is_some(),
            };

            if !busy {
                break Some(cursor);
            }
        };

        match ps.range {
            PortRange::Low => st.last_low = cursor,
            PortRange::Default => st.last_port = cursor,
            PortRange::High => st.last_hi = cursor,
        }

        match found {
            Some(port) => {
                TableStats::incr(&self.stats.port_allocs);
                Ok(port)
            }
            None => {
                TableStats::incr(&self.stats.port_exhausted);
                port_exhausted_probe(self.name(), first, last);
                Err(PcbError::ResourceExhausted)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::AddrFamily;
    use crate::api::PortRangeCfg;
    use crate::api::TableCfg;
    use crate::engine::env::HostEnv;
    use crate::engine::pcb::Cred;
    use crate::engine::pcb::PcbFlags;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn table(first: u16, last: u16, randomized: bool) -> PcbTable {
        let cfg = TableCfg {
            seed: Some(5),
            ports: PortRangeCfg {
                first,
                last,
                randomized,
                ..Default::default()
            },
            ..Default::default()
        };
        let env = HostEnv::new().with_local(ip("10.0.0.2"));
        PcbTable::new("alloc", cfg, Arc::new(env)).unwrap()
    }

    #[test]
    fn sequential_from_cursor() {
        let t = table(40000, 40009, false);
        let mut ports = Vec::new();
        for _ in 0..3 {
            let pcb = t.create(AddrFamily::Inet, Cred::new(1000));
            t.bind(&pcb, ip("0.0.0.0"), 0).unwrap();
            assert!(pcb.flags().contains(PcbFlags::ANONPORT));
            ports.push(pcb.read().lport());
        }

        assert_eq!(ports, vec![40000, 40001, 40002]);
        assert_eq!(t.stats().port_allocs, 3);
    }

    #[test]
    fn skips_occupied_then_exhausts() {
        let t = table(40000, 40009, true);
        let taken = t.create(AddrFamily::Inet, Cred::new(1000));
        t.bind(&taken, ip("0.0.0.0"), 40004).unwrap();

        let mut seen = BTreeSet::new();
        for _ in 0..9 {
            let pcb = t.create(AddrFamily::Inet, Cred::new(1000));
            t.bind(&pcb, ip("0.0.0.0"), 0).unwrap();
            let port = pcb.read().lport();
            assert!((40000..=40009).contains(&port));
            assert_ne!(port, 40004);
            assert!(seen.insert(port));
        }

        let pcb = t.create(AddrFamily::Inet, Cred::new(1000));
        assert_eq!(
            t.bind(&pcb, ip("0.0.0.0"), 0),
            Err(PcbError::ResourceExhausted)
        );
        assert!(!pcb.read().is_bound());
        assert_eq!(t.stats().port_exhausted, 1);
    }

    #[test]
    fn low_range_needs_privilege() {
        let t = table(40000, 40009, false);
        let user = t.create(AddrFamily::Inet, Cred::new(1000));
        t.set_port_range(&user, PortRange::Low);
        assert_eq!(user.read().port_range(), PortRange::Low);
        assert_eq!(
            t.bind(&user, ip("0.0.0.0"), 0),
            Err(PcbError::PermissionDenied)
        );

        let root = t.create(AddrFamily::Inet, Cred::new(0));
        t.set_port_range(&root, PortRange::Low);
        t.bind(&root, ip("0.0.0.0"), 0).unwrap();
        assert_eq!(root.read().lport(), 600);

        let next = t.create(AddrFamily::Inet, Cred::new(0));
        t.set_port_range(&next, PortRange::Low);
        t.bind(&next, ip("0.0.0.0"), 0).unwrap();
        assert_eq!(next.read().lport(), 601);
    }

    // A connecting record only needs its own flow to be unique.
    #[test]
    fn connect_shares_local_port() {
        let t = table(40000, 40000, false);
        let a = t.create(AddrFamily::Inet, Cred::new(1000));
        t.connect(&a, ip("192.0.2.1"), 80).unwrap();
        let b = t.create(AddrFamily::Inet, Cred::new(1000));
        t.connect(&b, ip("192.0.2.2"), 80).unwrap();
        assert_eq!(a.read().lport(), 40000);
        assert_eq!(b.read().lport(), 40000);

        let c = t.create(AddrFamily::Inet, Cred::new(1000));
        assert_eq!(
            t.connect(&c, ip("192.0.2.1"), 80),
            Err(PcbError::ResourceExhausted)
        );
    }
}
