// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The connection table engine.

pub mod conn;
pub mod env;
pub mod lbgroup;
pub mod lookup;
pub mod pcb;
pub mod port_alloc;
pub mod stat;
pub mod table;

pub use env::HostEnv;
pub use env::PcbEnv;
pub use lookup::FlowQuery;
pub use lookup::LookupFlags;
pub use pcb::Cred;
pub use pcb::Inpcb;
pub use pcb::InpcbRef;
pub use pcb::IsolationDomain;
pub use pcb::SockOpts;
pub use table::IterScope;
pub use table::PcbTable;

use crate::api::IpAddr;
use core::hash::Hash;

/// Hash the remote address and the port pair of a flow.
///
/// This selects both the exact bucket of a connected record and the
/// member of a load-balance group serving a flow. The local address
/// is left out so that a record hashes the same before and after its
/// source address is chosen.
pub(crate) fn tuple_hash(
    seed: u32,
    faddr: &IpAddr,
    lport: u16,
    fport: u16,
) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    faddr.hash(&mut hasher);
    lport.hash(&mut hasher);
    fport.hash(&mut hasher);
    hasher.finalize()
}

/// Does a record pinned to routing table `pinned` serve a query in
/// routing table `query`? `None` on either side matches every table.
pub(crate) fn fib_matches(pinned: Option<u16>, query: Option<u16>) -> bool {
    match (pinned, query) {
        (Some(p), Some(q)) => p == q,
        _ => true,
    }
}
