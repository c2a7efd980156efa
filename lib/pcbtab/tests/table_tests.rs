// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Integration tests.
//!
//! These drive a table the way a transport would: records are created,
//! bound, connected and torn down through the public API, and inbound
//! flows are resolved against the result.

mod common;

use common::*;
use itertools::Itertools;
use pcbtab::engine::lbgroup::LBGROUP_MIN;
use pcbtab::print::print_table_into;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

// ================================================================
// Scenarios
// ================================================================

// An anonymous bind draws a port from the ephemeral range.
#[test]
fn bind_anonymous_port() {
    let t = table();
    let a = bound(&t, USER, SockOpts::empty(), "0.0.0.0", 0);

    let port = a.read().lport();
    let range = t.cfg().ports.range(PortRange::Default);
    assert!(range.contains(&port), "{port} outside {range:?}");

    let got = t.lookup_local(&ip("0.0.0.0"), port, false, &USER).unwrap();
    assert!(Arc::ptr_eq(&got, &a));
}

// Connecting moves a record from the wildcard to the exact chains.
#[test]
fn connect_moves_to_exact() {
    let t = table();
    let a = bound(&t, USER, SockOpts::empty(), "0.0.0.0", 0);
    let port = a.read().lport();

    // Before connecting, any remote reaches it.
    assert_resolves(&t, &flow("192.0.2.7", 1234, "10.0.0.2", port), &a);

    t.connect(&a, ip("10.0.0.1"), 80).unwrap();
    let laddr = a.read().laddr();
    assert_eq!(laddr, ip("10.0.0.2"));

    let dump = t.dump();
    assert_eq!(dump.exact.len(), 1);
    assert_eq!(dump.exact[0].id, a.id());
    assert!(dump.wild.is_empty());

    let q = FlowQuery::new(ip("10.0.0.1"), 80, laddr, port);
    let got = t.lookup(&q, LookupFlags::empty()).unwrap();
    assert!(Arc::ptr_eq(&got, &a));

    let other = flow("192.0.2.7", 1234, "10.0.0.2", port);
    assert!(resolve(&t, &other).is_none());
}

// Same-owner records asking for reuse share a port.
#[test]
fn same_owner_reuse() {
    let t = table();
    let b = bound(&t, USER, SockOpts::REUSEPORT, "0.0.0.0", 9000);
    let c = t.create(AddrFamily::Inet, USER);
    t.set_options(&c, SockOpts::REUSEPORT).unwrap();
    assert_eq!(t.bind(&c, ip("0.0.0.0"), 9000), Ok(()));

    assert_eq!(t.len(), 2);
    assert!(b.read().is_bound());
    assert!(c.read().is_bound());
}

// A reserved port needs authorization and a refusal changes nothing.
#[test]
fn reserved_port_refused() {
    let t = table();
    let _other = bound(&t, USER, SockOpts::empty(), "10.0.0.2", 5000);
    let before = t.dump();

    let d = t.create(AddrFamily::Inet, USER);
    assert_eq!(
        t.bind(&d, ip("0.0.0.0"), 80),
        Err(PcbError::PermissionDenied)
    );

    assert!(!d.read().is_bound());
    let after = t.dump();
    assert_eq!(before.exact, after.exact);
    assert_eq!(before.wild, after.wild);
    assert!(resolve(&t, &flow("192.0.2.1", 1, "10.0.0.2", 80)).is_none());

    let root = t.create(AddrFamily::Inet, Cred::new(0));
    t.bind(&root, ip("0.0.0.0"), 80).unwrap();
}

// A one-port range that is already taken is exhausted.
#[test]
fn single_port_range_exhausted() {
    let t = table_with_range(40000, 40000);
    let _held = bound(&t, USER, SockOpts::empty(), "0.0.0.0", 40000);

    let pcb = t.create(AddrFamily::Inet, USER);
    assert_eq!(
        t.bind(&pcb, ip("0.0.0.0"), 0),
        Err(PcbError::ResourceExhausted)
    );
    assert_eq!(t.stats().port_exhausted, 1);
    assert_eq!(t.len(), 1);
}

// Group members split flows evenly; after members leave, each flow's
// member is the one at its hash modulo the new member count.
#[test]
fn lbgroup_distribution() {
    let t = table();
    let members: Vec<InpcbRef> = (0..4)
        .map(|_| bound(&t, USER, SockOpts::REUSEPORT_LB, "0.0.0.0", 4443))
        .collect();

    let flows: Vec<FlowQuery> = (0..1000u32)
        .map(|i| {
            let faddr = format!("198.51.{}.{}", i / 250, i % 250 + 1);
            let fport = 1024 + (i * 7 % 50000) as u16;
            FlowQuery::new(ip(&faddr), fport, ip("10.0.0.2"), 4443)
        })
        .collect();

    let order = |t: &PcbTable| -> Vec<u64> {
        let groups = t.dump().lbgroups;
        assert_eq!(groups.len(), 1);
        groups[0].members.clone()
    };

    let ids = order(&t);
    let mut split: BTreeMap<u64, usize> = BTreeMap::new();
    for q in &flows {
        let got = resolve(&t, q).unwrap();
        let idx = t.flow_hash(q) as usize % ids.len();
        assert_eq!(got.id(), ids[idx]);
        *split.entry(got.id()).or_default() += 1;

        // Unchanged membership, unchanged choice.
        assert_eq!(resolve(&t, q).unwrap().id(), got.id());
    }

    assert_eq!(split.len(), 4);
    for (id, n) in &split {
        assert!((150..=350).contains(n), "member {id} got {n} of 1000");
    }

    t.destroy(Arc::clone(&members[1]));
    t.destroy(Arc::clone(&members[2]));

    let ids = order(&t);
    assert_eq!(ids, vec![members[0].id(), members[3].id()]);
    for q in &flows {
        let got = resolve(&t, q).unwrap();
        let idx = t.flow_hash(q) as usize % 2;
        assert_eq!(got.id(), ids[idx]);
    }
}

// ================================================================
// Properties
// ================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Shape {
    JailExact,
    JailAny,
    HostExact,
    HostAny,
    Mapped,
}

const SHAPES: [Shape; 5] = [
    Shape::JailExact,
    Shape::JailAny,
    Shape::HostExact,
    Shape::HostAny,
    Shape::Mapped,
];

fn bind_shape(t: &PcbTable, shape: Shape, port: u16) -> InpcbRef {
    let (family, cred, laddr) = match shape {
        Shape::JailExact => (AddrFamily::Inet, jailed(), JAIL_ADDR),
        Shape::JailAny => (AddrFamily::Inet, jailed(), "0.0.0.0"),
        Shape::HostExact => (AddrFamily::Inet, USER, JAIL_ADDR),
        Shape::HostAny => (AddrFamily::Inet, USER, "0.0.0.0"),
        Shape::Mapped => (AddrFamily::Inet6, USER, "::"),
    };

    let pcb = t.create(family, cred);
    t.set_options(&pcb, SockOpts::REUSEPORT).unwrap();
    t.bind(&pcb, ip(laddr), port).unwrap();
    pcb
}

// Whatever order the records were bound in, the most specific one
// wins, and removing it hands the flow to the next.
#[test]
fn precedence_any_bind_order() {
    for perm in SHAPES.iter().copied().permutations(SHAPES.len()) {
        let t = table();
        let pcbs: BTreeMap<usize, InpcbRef> = perm
            .iter()
            .map(|&s| {
                let idx = SHAPES.iter().position(|&x| x == s).unwrap();
                (idx, bind_shape(&t, s, 5000))
            })
            .collect();

        // Outside the jail, the host records are the only candidates.
        let outside = flow("192.0.2.1", 999, "10.0.0.3", 5000);
        assert_resolves(&t, &outside, &pcbs[&3]);

        let inside = flow("192.0.2.1", 999, JAIL_ADDR, 5000);
        for (idx, pcb) in &pcbs {
            assert_resolves(&t, &inside, pcb);
            t.remove(pcb);
            if *idx == 3 {
                assert_resolves(&t, &outside, &pcbs[&4]);
            }
        }
        assert!(resolve(&t, &inside).is_none());
    }
}

// Connected records never share a 4-tuple, and the allocator stops
// cleanly when no tuple is left.
#[test]
fn connected_tuples_unique() {
    let t = table_with_range(40000, 40049);
    let mut tuples = BTreeSet::new();
    let mut pcbs = Vec::new();

    for _ in 0..50 {
        let pcb = t.create(AddrFamily::Inet, USER);
        t.connect(&pcb, ip("192.0.2.1"), 443).unwrap();
        let q = flow_of(&pcb);
        assert!(tuples.insert((q.laddr, q.lport, q.faddr, q.fport)));
        pcbs.push(pcb);
    }

    let extra = t.create(AddrFamily::Inet, USER);
    assert_eq!(
        t.connect(&extra, ip("192.0.2.1"), 443),
        Err(PcbError::ResourceExhausted)
    );

    // Another destination has a fresh set of tuples.
    t.connect(&extra, ip("192.0.2.2"), 443).unwrap();

    for pcb in &pcbs {
        let got = t.lookup(&flow_of(pcb), LookupFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&got, pcb));
    }
}

#[test]
fn insert_lookup_remove() {
    let t = table();
    let pcb = bound(&t, USER, SockOpts::empty(), "10.0.0.2", 7000);
    t.connect(&pcb, ip("203.0.113.5"), 53).unwrap();
    let q = flow_of(&pcb);

    assert_resolves(&t, &q, &pcb);
    let got = t.lookup_locked(&q, LookupFlags::WILDCARD).unwrap();
    assert!(Arc::ptr_eq(&got, &pcb));

    t.remove(&pcb);
    assert!(resolve(&t, &q).is_none());
    assert!(t.lookup_locked(&q, LookupFlags::WILDCARD).is_none());

    t.insert(&pcb).unwrap();
    assert_resolves(&t, &q, &pcb);
}

// Allocated ports avoid every occupied one and never come from the
// privileged range without authorization.
#[test]
fn allocator_safety() {
    let t = table_with_range(41000, 41019);
    let occupied: BTreeSet<u16> = [41003, 41010, 41011, 41019].into();
    let _held: Vec<InpcbRef> = occupied
        .iter()
        .map(|&p| bound(&t, USER, SockOpts::empty(), "0.0.0.0", p))
        .collect();

    let mut seen = BTreeSet::new();
    for _ in 0..16 {
        let pcb = bound(&t, USER, SockOpts::empty(), "0.0.0.0", 0);
        let port = pcb.read().lport();
        assert!(!occupied.contains(&port));
        assert!(seen.insert(port), "{port} handed out twice");
    }

    let pcb = t.create(AddrFamily::Inet, USER);
    assert_eq!(
        t.bind(&pcb, ip("0.0.0.0"), 0),
        Err(PcbError::ResourceExhausted)
    );

    t.set_port_range(&pcb, PortRange::Low);
    assert_eq!(
        t.bind(&pcb, ip("0.0.0.0"), 0),
        Err(PcbError::PermissionDenied)
    );
    assert!(!pcb.read().is_bound());
}

// A group grown to hold many members shrinks back once they leave,
// keeping the survivor.
#[test]
fn lbgroup_shrinks_to_minimum() {
    let t = table();
    let pcbs: Vec<InpcbRef> = (0..40)
        .map(|_| bound(&t, USER, SockOpts::REUSEPORT_LB, "10.0.0.2", 8443))
        .collect();
    assert_eq!(t.dump().lbgroups[0].capacity, 64);

    for pcb in &pcbs[1..] {
        t.destroy(Arc::clone(pcb));
    }

    let groups = t.dump().lbgroups;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].capacity, LBGROUP_MIN);
    assert_eq!(groups[0].members, vec![pcbs[0].id()]);
    assert_resolves(&t, &flow("192.0.2.1", 5, "10.0.0.2", 8443), &pcbs[0]);
}

// A jailed group beats a host group on the same port, for the jail's
// address only.
#[test]
fn lbgroup_prefers_jail() {
    let t = table();
    let host = bound(&t, USER, SockOpts::REUSEPORT_LB, "0.0.0.0", 8080);
    let jail = t.create(AddrFamily::Inet, jailed());
    t.set_options(&jail, SockOpts::REUSEPORT_LB).unwrap();
    t.bind(&jail, ip("0.0.0.0"), 8080).unwrap();

    assert_resolves(&t, &flow("192.0.2.1", 5, JAIL_ADDR, 8080), &jail);
    assert_resolves(&t, &flow("192.0.2.1", 5, "10.0.0.2", 8080), &host);
}

#[test]
fn disconnect_is_visible_after_grace() {
    let t = table();
    let pcb = bound(&t, USER, SockOpts::empty(), "10.0.0.2", 7100);
    t.connect(&pcb, ip("192.0.2.1"), 80).unwrap();
    t.disconnect(&pcb).unwrap();

    t.synchronize();
    assert_resolves(&t, &flow("192.0.2.9", 9, "10.0.0.3", 7100), &pcb);
}

#[test]
fn dump_prints() {
    let t = table();
    let _a = bound(&t, USER, SockOpts::REUSEPORT_LB, "0.0.0.0", 8080);
    let b = bound(&t, USER, SockOpts::empty(), "10.0.0.2", 0);
    t.connect(&b, ip("192.0.2.1"), 443).unwrap();

    let mut out = Vec::new();
    print_table_into(&mut out, &t.dump()).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("192.0.2.1:443"));
    assert!(text.contains("0.0.0.0:8080"));
}

// ================================================================
// Concurrency
// ================================================================

// Lookups racing with churn in the same chains always find the
// records that stay put, and never hand out a destroyed one.
#[test]
fn lookup_under_churn() {
    const LISTENERS: u16 = 8;
    const ROUNDS: usize = 500;

    let t = Arc::new(table());
    let listeners: Vec<InpcbRef> = (0..LISTENERS)
        .map(|i| bound(&t, USER, SockOpts::empty(), "0.0.0.0", 5000 + i))
        .collect();
    let stop = AtomicBool::new(false);

    std::thread::scope(|s| {
        for r in 0..2u16 {
            let t = &t;
            let listeners = &listeners;
            let stop = &stop;
            s.spawn(move || {
                let mut n = 0u16;
                while !stop.load(Ordering::Relaxed) {
                    n = n.wrapping_add(1);
                    let i = n % LISTENERS;
                    let q = FlowQuery::new(
                        ip("198.51.100.1"),
                        1024 + (n ^ r) % 60000,
                        ip("10.0.0.2"),
                        5000 + i,
                    );
                    let got = t
                        .lookup_with(&q, LookupFlags::WILDCARD, |pcb, _| {
                            assert!(!pcb.is_freed());
                            Arc::clone(pcb)
                        })
                        .unwrap();
                    assert!(Arc::ptr_eq(&got, &listeners[usize::from(i)]));
                }
            });
        }

        let churn: Vec<_> = (0..4u8)
            .map(|w| {
                let t = &t;
                s.spawn(move || {
                    let faddr = ip(&format!("192.0.2.{}", w + 1));
                    for k in 0..ROUNDS {
                        let pcb = t.create(AddrFamily::Inet, USER);
                        t.connect(&pcb, faddr, 80 + (k % 7) as u16).unwrap();
                        let q = flow_of(&pcb);
                        let got = t.lookup(&q, LookupFlags::empty()).unwrap();
                        assert!(Arc::ptr_eq(&got, &pcb));

                        if k % 2 == 0 {
                            t.disconnect(&pcb).unwrap();
                        }
                        t.destroy(Arc::clone(&pcb));
                        assert!(t.lookup(&q, LookupFlags::empty()).is_none());
                    }
                })
            })
            .collect();

        for h in churn {
            h.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
    });

    assert_eq!(t.len(), usize::from(LISTENERS));
    assert_eq!(t.live(), usize::from(LISTENERS));
    let stats = t.stats();
    assert!(stats.lookups > 0);
}

// Records bound and removed concurrently on one port keep the port
// index and chains consistent.
#[test]
fn bind_remove_race() {
    let t = Arc::new(table());
    std::thread::scope(|s| {
        for _ in 0..4 {
            let t = &t;
            s.spawn(move || {
                for _ in 0..200 {
                    let pcb =
                        bound(t, USER, SockOpts::REUSEPORT, "0.0.0.0", 6000);
                    let any = ip("0.0.0.0");
                    assert!(t.lookup_local(&any, 6000, true, &USER).is_some());
                    t.drop_pcb(&pcb);
                    t.destroy(pcb);
                }
            });
        }
    });

    assert_eq!(t.len(), 0);
    assert!(t.dump().wild.is_empty());
    assert!(resolve(&t, &flow("192.0.2.1", 1, "10.0.0.2", 6000)).is_none());
}
