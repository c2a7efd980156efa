// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print table dumps in a human-friendly manner.
//!
//! Shared by pcbtabadm and the integration tests.

use crate::api::DumpTableResp;
use crate::api::LbGroupDump;
use crate::api::PcbEntryDump;
use crate::api::TableStatsDump;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpTableResp`].
pub fn print_table(resp: &DumpTableResp) -> std::io::Result<()> {
    print_table_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpTableResp`] into a given writer.
pub fn print_table_into(
    writer: &mut impl Write,
    resp: &DumpTableResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Table {} ({})", resp.name, resp.proto)?;
    write_hrb(&mut t)?;
    writeln!(t, "Connected")?;
    write_hr(&mut t)?;
    print_entry_header(&mut t)?;
    for e in &resp.exact {
        print_entry(&mut t, e)?;
    }
    t.flush()?;

    writeln!(t, "\nWildcard")?;
    write_hr(&mut t)?;
    print_entry_header(&mut t)?;
    for e in &resp.wild {
        print_entry(&mut t, e)?;
    }
    t.flush()?;

    writeln!(t, "\nLoad-Balance Groups")?;
    write_hr(&mut t)?;
    print_lbgroup_header(&mut t)?;
    for g in &resp.lbgroups {
        print_lbgroup(&mut t, g)?;
    }
    t.flush()?;

    writeln!(t, "\nCounters")?;
    write_hr(&mut t)?;
    print_stats(&mut t, &resp.stats)?;
    writeln!(t)?;
    t.flush()
}

/// Print the header for the [`print_entry()`] output.
pub fn print_entry_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "ID\tLOCAL\tREMOTE\tVER\tFLAGS\tUID\tDOMAIN")
}

pub fn print_entry(
    t: &mut impl Write,
    e: &PcbEntryDump,
) -> std::io::Result<()> {
    let domain = match e.domain {
        Some(d) => d.to_string(),
        None => "-".to_string(),
    };

    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        e.id,
        endpoint(&e.laddr, e.lport),
        endpoint(&e.faddr, e.fport),
        e.vflag,
        e.flags,
        e.uid,
        domain,
    )
}

/// Print the header for the [`print_lbgroup()`] output.
pub fn print_lbgroup_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "LOCAL\tDOMAIN\tNUMA\tSIZE\tMEMBERS")
}

pub fn print_lbgroup(
    t: &mut impl Write,
    g: &LbGroupDump,
) -> std::io::Result<()> {
    let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    let members: Vec<String> =
        g.members.iter().map(|id| id.to_string()).collect();

    writeln!(
        t,
        "{}\t{}\t{}\t{}/{}\t{}",
        endpoint(&g.laddr, g.lport),
        opt(g.domain.map(|d| d.to_string())),
        opt(g.numa.map(|n| n.to_string())),
        g.members.len(),
        g.capacity,
        members.join(","),
    )
}

pub fn print_stats(
    t: &mut impl Write,
    s: &TableStatsDump,
) -> std::io::Result<()> {
    writeln!(t, "lookups\t{}", s.lookups)?;
    writeln!(t, "lookup_fallbacks\t{}", s.lookup_fallbacks)?;
    writeln!(t, "lookups_locked\t{}", s.lookups_locked)?;
    writeln!(t, "port_allocs\t{}", s.port_allocs)?;
    writeln!(t, "port_exhausted\t{}", s.port_exhausted)?;
    writeln!(t, "lbgroup_resizes\t{}", s.lbgroup_resizes)
}

fn endpoint(addr: &impl std::fmt::Display, port: u16) -> String {
    let addr = addr.to_string();
    if addr.contains(':') {
        format!("[{addr}]:{port}")
    } else {
        format!("{addr}:{port}")
    }
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
