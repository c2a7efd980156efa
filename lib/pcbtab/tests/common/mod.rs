// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than its worth here.
#![allow(dead_code)]

pub use pcbtab::api::AddrFamily;
pub use pcbtab::api::IpAddr;
pub use pcbtab::api::PcbError;
pub use pcbtab::api::PortRange;
pub use pcbtab::api::PortRangeCfg;
pub use pcbtab::api::TableCfg;
pub use pcbtab::engine::Cred;
pub use pcbtab::engine::FlowQuery;
pub use pcbtab::engine::HostEnv;
pub use pcbtab::engine::InpcbRef;
pub use pcbtab::engine::IsolationDomain;
pub use pcbtab::engine::LookupFlags;
pub use pcbtab::engine::PcbTable;
pub use pcbtab::engine::SockOpts;
pub use std::sync::Arc;

/// The owner of most records in these tests.
pub const USER: Cred = Cred::new(1000);

/// The isolation domain of [`jailed()`] records and its one address.
pub const JAIL: IsolationDomain = IsolationDomain(7);
pub const JAIL_ADDR: &str = "10.0.0.9";

pub fn jailed() -> Cred {
    Cred::isolated(1000, JAIL)
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// A host owning 10.0.0.2, 10.0.0.3 and fd00::2, with one isolation
/// domain confined to [`JAIL_ADDR`].
pub fn host_env() -> HostEnv {
    HostEnv::new()
        .with_local(ip("10.0.0.2"))
        .with_local(ip("10.0.0.3"))
        .with_local(ip("fd00::2"))
        .with_domain(JAIL, [ip(JAIL_ADDR)])
}

pub fn test_cfg() -> TableCfg {
    TableCfg { seed: Some(0x5eed), numa_domains: 2, ..Default::default() }
}

pub fn table_with(cfg: TableCfg) -> PcbTable {
    PcbTable::new("test", cfg, Arc::new(host_env())).unwrap()
}

pub fn table() -> PcbTable {
    table_with(test_cfg())
}

/// A table whose default ephemeral range is `first..=last`, scanned
/// in order.
pub fn table_with_range(first: u16, last: u16) -> PcbTable {
    let mut cfg = test_cfg();
    cfg.ports = PortRangeCfg {
        first,
        last,
        randomized: false,
        ..Default::default()
    };
    table_with(cfg)
}

/// Create and bind an IPv4 record.
pub fn bound(
    t: &PcbTable,
    cred: Cred,
    opts: SockOpts,
    laddr: &str,
    lport: u16,
) -> InpcbRef {
    let pcb = t.create(AddrFamily::Inet, cred);
    t.set_options(&pcb, opts).unwrap();
    t.bind(&pcb, ip(laddr), lport).unwrap();
    pcb
}

/// The flow `faddr:fport` -> `laddr:lport`.
pub fn flow(faddr: &str, fport: u16, laddr: &str, lport: u16) -> FlowQuery {
    FlowQuery::new(ip(faddr), fport, ip(laddr), lport)
}

/// The flow a connected record owns.
pub fn flow_of(pcb: &InpcbRef) -> FlowQuery {
    let ps = pcb.read();
    FlowQuery::new(ps.faddr(), ps.fport(), ps.laddr(), ps.lport())
}

/// Resolve a flow, wildcards allowed.
pub fn resolve(t: &PcbTable, q: &FlowQuery) -> Option<InpcbRef> {
    t.lookup(q, LookupFlags::WILDCARD)
}

#[track_caller]
pub fn assert_resolves(t: &PcbTable, q: &FlowQuery, want: &InpcbRef) {
    match resolve(t, q) {
        Some(got) => assert!(
            Arc::ptr_eq(&got, want),
            "{q:?} resolved to pcb {} instead of {}",
            got.id(),
            want.id()
        ),
        None => panic!("{q:?} resolved to nothing, wanted pcb {}", want.id()),
    }
}
