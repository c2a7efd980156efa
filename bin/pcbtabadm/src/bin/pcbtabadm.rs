// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use tabwriter::TabWriter;

use pcbtab::api::API_VERSION;
use pcbtab::api::AddrFamily;
use pcbtab::api::IpAddr;
use pcbtab::api::PortRange;
use pcbtab::api::TableCfg;
use pcbtab::engine::Cred;
use pcbtab::engine::FlowQuery;
use pcbtab::engine::HostEnv;
use pcbtab::engine::LookupFlags;
use pcbtab::engine::PcbTable;
use pcbtab::engine::SockOpts;
use pcbtab::print::print_table;
use pcbtab::print::write_hr;

/// Administer connection identification tables.
#[derive(Debug, Parser)]
#[command(version = pkg_version())]
enum Command {
    /// Parse and validate a table configuration, then print it in
    /// normalized form.
    CheckConfig { file: PathBuf },

    /// Build a table from a configuration, bind a load-balance listener
    /// group and resolve synthetic inbound flows against it.
    Simulate {
        file: PathBuf,

        /// The number of listeners sharing the port.
        #[arg(long, default_value_t = 4)]
        listeners: u16,

        /// The number of synthetic flows to resolve.
        #[arg(long, default_value_t = 1000)]
        flows: u32,

        /// The local address flows arrive on.
        #[arg(long, default_value = "10.0.0.2")]
        laddr: IpAddr,

        /// The port the listeners bind.
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

fn pkg_version() -> String {
    format!("{} (api {API_VERSION})", env!("CARGO_PKG_VERSION"))
}

/// The on-disk configuration file.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct AdmCfg {
    /// The table's name, used in probes and dumps.
    name: Option<String>,
    table: TableCfg,
}

impl AdmCfg {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("pcbtab")
    }
}

fn init_log() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

fn load_cfg(log: &Logger, path: &Path) -> anyhow::Result<AdmCfg> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cfg: AdmCfg = toml::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    cfg.table
        .validate()
        .with_context(|| format!("invalid table in {}", path.display()))?;
    debug!(log, "loaded config"; "path" => %path.display());
    Ok(cfg)
}

fn print_ranges(cfg: &TableCfg) -> std::io::Result<()> {
    let mut t = TabWriter::new(std::io::stdout());
    writeln!(t, "\nCLASS\tFIRST\tLAST\tPORTS")?;
    write_hr(&mut t)?;
    for (name, class) in [
        ("low", PortRange::Low),
        ("default", PortRange::Default),
        ("high", PortRange::High),
    ] {
        let r = cfg.ports.range(class);
        let n = u32::from(*r.end()) - u32::from(*r.start()) + 1;
        writeln!(t, "{name}\t{}\t{}\t{n}", r.start(), r.end())?;
    }
    writeln!(
        t,
        "reserved\t{}\t{}\t-",
        cfg.ports.reserved_low, cfg.ports.reserved_high
    )?;
    t.flush()
}

fn check_config(log: &Logger, file: &Path) -> anyhow::Result<()> {
    let cfg = load_cfg(log, file)?;
    print!("{}", toml::to_string_pretty(&cfg)?);
    print_ranges(&cfg.table)?;
    info!(log, "config ok"; "table" => cfg.name());
    Ok(())
}

/// A synthetic remote endpoint for flow `n`, drawn from the benchmark
/// ranges of each family.
fn remote(family: AddrFamily, n: u32) -> anyhow::Result<(IpAddr, u16)> {
    let [_, b, c, d] = n.to_be_bytes();
    let addr = match family {
        AddrFamily::Inet => format!("198.18.{b}.{c}"),
        AddrFamily::Inet6 => format!("2001:2::{b:x}:{c:x}"),
    };
    let faddr = addr.parse().map_err(anyhow::Error::msg)?;
    Ok((faddr, 1024 + u16::from(d) * 200 + (n % 200) as u16))
}

fn simulate(
    log: &Logger,
    file: &Path,
    listeners: u16,
    flows: u32,
    laddr: IpAddr,
    port: u16,
) -> anyhow::Result<()> {
    if listeners == 0 {
        bail!("at least one listener is required");
    }

    let cfg = load_cfg(log, file)?;
    let family = laddr.family();
    let env = HostEnv::new().with_local(laddr);
    let table = PcbTable::new(cfg.name(), cfg.table.clone(), Arc::new(env))?;
    info!(log, "table created";
        "name" => cfg.name(), "proto" => %table.cfg().proto);

    let mut members = Vec::with_capacity(usize::from(listeners));
    for _ in 0..listeners {
        let pcb = table.create(family, Cred::new(0));
        table.set_options(&pcb, SockOpts::REUSEPORT_LB)?;
        table
            .bind(&pcb, IpAddr::any(family), port)
            .with_context(|| format!("failed to bind listener to {port}"))?;
        debug!(log, "listener bound"; "id" => pcb.id());
        members.push(pcb);
    }
    info!(log, "listeners bound"; "count" => listeners, "port" => port);

    let mut hits: BTreeMap<u64, u32> =
        members.iter().map(|pcb| (pcb.id(), 0)).collect();
    let mut missed = 0u32;
    for n in 0..flows {
        let (faddr, fport) = remote(family, n)?;
        let q = FlowQuery::new(faddr, fport, laddr, port);
        match table.lookup(&q, LookupFlags::WILDCARD) {
            Some(pcb) => *hits.entry(pcb.id()).or_default() += 1,
            None => missed += 1,
        }
    }

    if missed > 0 {
        warn!(log, "flows went unresolved"; "missed" => missed);
    }
    info!(log, "flows resolved"; "flows" => flows - missed);

    print_table(&table.dump())?;

    let mut t = TabWriter::new(std::io::stdout());
    writeln!(t, "MEMBER\tFLOWS\tSHARE")?;
    write_hr(&mut t)?;
    for (id, n) in &hits {
        let share = if flows == 0 {
            0.0
        } else {
            f64::from(*n) * 100.0 / f64::from(flows)
        };
        writeln!(t, "{id}\t{n}\t{share:.1}%")?;
    }
    t.flush()?;

    for pcb in members {
        table.destroy(pcb);
    }
    table.synchronize();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let log = init_log();
    usdt::register_probes().context("failed to register probes")?;

    match Command::parse() {
        Command::CheckConfig { file } => check_config(&log, &file),
        Command::Simulate { file, listeners, flows, laddr, port } => {
            simulate(&log, &file, listeners, flows, laddr, port)
        }
    }
}
