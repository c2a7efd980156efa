// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The record lifecycle, as driven by a transport.
//!
//! A record is created unbound, bound to a local address and port,
//! optionally connected to a remote endpoint and disconnected again,
//! and finally dropped and destroyed. Each step takes the record's
//! write lock first and the table lock second.

use super::PcbTable;
use super::lookup::FlowQuery;
use super::lookup::LookupFlags;
use super::pcb::Cred;
use super::pcb::Inpcb;
use super::pcb::InpcbRef;
use super::pcb::PcbFlags;
use super::pcb::PcbState;
use super::pcb::SockOpts;
use super::pcb::VFlags;
use super::table::HashEntry;
use super::table::HashState;
use super::table::Result;
use crate::api::AddrFamily;
use crate::api::IpAddr;
use crate::api::PcbError;
use crate::api::PortRange;
use std::sync::Arc;

fn check_open(pcb: &Inpcb) -> Result<()> {
    if pcb.flags().intersects(PcbFlags::DROPPED | PcbFlags::FREED) {
        return Err(PcbError::InvalidState("record is closed".into()));
    }
    Ok(())
}

/// The version flags of a socket of `family` with local address
/// `laddr`. An IPv6 socket bound to the unspecified address also takes
/// IPv4 traffic unless it is `V6ONLY`.
fn vflag_for(family: AddrFamily, laddr: &IpAddr, opts: SockOpts) -> VFlags {
    match family {
        AddrFamily::Inet => VFlags::IPV4,
        AddrFamily::Inet6 => {
            let mut vflag = VFlags::IPV6 | VFlags::IPV6PROTO;
            if laddr.is_unspecified() && !opts.contains(SockOpts::V6ONLY) {
                vflag |= VFlags::IPV4;
            }
            vflag
        }
    }
}

impl PcbTable {
    /// Create an unbound record owned by `cred`.
    pub fn create(&self, family: AddrFamily, cred: Cred) -> InpcbRef {
        Arc::new(Inpcb::new(self.next_id(), cred, family))
    }

    /// Set the socket options affecting binding.
    ///
    /// # Errors
    ///
    /// `InvalidState` once the record is bound. `InvalidArgument` for
    /// `V6ONLY` on an IPv4 socket.
    pub fn set_options(&self, pcb: &InpcbRef, opts: SockOpts) -> Result<()> {
        let mut ps = pcb.write();
        if ps.is_bound() {
            return Err(PcbError::InvalidState("already bound".into()));
        }
        if opts.contains(SockOpts::V6ONLY) && ps.family() == AddrFamily::Inet
        {
            return Err(PcbError::InvalidArgument(
                "V6ONLY on an IPv4 socket".into(),
            ));
        }

        ps.opts = opts;
        ps.vflag = vflag_for(ps.family(), &ps.laddr, opts);
        Ok(())
    }

    /// Select the range ephemeral ports are drawn from.
    pub fn set_port_range(&self, pcb: &InpcbRef, range: PortRange) {
        pcb.write().range = range;
    }

    /// Pin the record to a routing table, or to none.
    ///
    /// # Errors
    ///
    /// `InvalidState` once the record is bound.
    pub fn set_fib(&self, pcb: &InpcbRef, fib: Option<u16>) -> Result<()> {
        let mut ps = pcb.write();
        if ps.is_bound() {
            return Err(PcbError::InvalidState("already bound".into()));
        }
        ps.fib = fib;
        Ok(())
    }

    /// Bind a record to a local address and port and hash it. Port 0
    /// asks the allocator for one.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: the record is closed or already bound.
    /// - `InvalidArgument`: `laddr` is not of the socket's family.
    /// - `AddressNotAvailable`: the address is not local, or not usable
    ///   from the owner's isolation domain.
    /// - `PermissionDenied`: a reserved port without authorization, or
    ///   a port held by another owner.
    /// - `AddressInUse`: a conflicting binding exists.
    /// - `ResourceExhausted`: no ephemeral port left, or the table
    ///   could not grow.
    ///
    /// On error the record is left unbound.
    pub fn bind(
        &self,
        pcb: &InpcbRef,
        laddr: IpAddr,
        lport: u16,
    ) -> Result<()> {
        let mut ps = pcb.write();
        check_open(pcb)?;
        if ps.is_bound() {
            return Err(PcbError::InvalidState("already bound".into()));
        }
        if laddr.family() != ps.family() {
            return Err(PcbError::InvalidArgument(format!(
                "{laddr} is not an {} address",
                ps.family()
            )));
        }

        let cred = *pcb.cred();
        if !laddr.is_unspecified() && !laddr.is_multicast() {
            if cred.is_isolated() && !self.env.check_domain_addr(&cred, &laddr)
            {
                return Err(PcbError::AddressNotAvailable);
            }
            if !ps.opts.contains(SockOpts::BINDANY)
                && !self.env.is_local_addr(&laddr)
            {
                return Err(PcbError::AddressNotAvailable);
            }
        }

        if lport != 0
            && self.cfg.ports.is_reserved(lport)
            && !self.env.is_bind_authorized(&cred, &laddr, lport)?
        {
            return Err(PcbError::PermissionDenied);
        }

        self.settle(&mut ps);
        let mut st = self.hash_lock.lock();
        let vflag = vflag_for(ps.family(), &laddr, ps.opts);

        let anon = lport == 0;
        let port = if anon {
            self.alloc_port(&mut st, pcb, &ps, &laddr, None)?
        } else {
            self.check_bind(&st, pcb, &ps, &laddr, lport, vflag)?;
            lport
        };

        let saved = (ps.laddr, ps.vflag);
        ps.laddr = laddr;
        ps.lport = port;
        ps.vflag = vflag;
        if let Err(e) = self.insert_locked(&mut st, pcb, &ps) {
            (ps.laddr, ps.vflag) = saved;
            ps.lport = 0;
            return Err(e);
        }

        if anon {
            pcb.set_flags(PcbFlags::ANONPORT);
        }
        Ok(())
    }

    /// Is `laddr:lport` free for this record?
    fn check_bind(
        &self,
        st: &HashState,
        pcb: &Inpcb,
        ps: &PcbState,
        laddr: &IpAddr,
        lport: u16,
        vflag: VFlags,
    ) -> Result<()> {
        let cred = pcb.cred();
        let opts = ps.opts;

        // On a multicast group, REUSEADDR means REUSEPORT.
        let mut reuseport = opts & SockOpts::REUSEPORT;
        if laddr.is_multicast() && opts.contains(SockOpts::REUSEADDR) {
            reuseport = SockOpts::REUSEADDR | SockOpts::REUSEPORT;
        }
        let reuseport_lb = opts & SockOpts::REUSEPORT_LB;
        let shared = |t: &HashEntry| {
            t.key.opts.intersects(reuseport)
                || t.key.opts.intersects(reuseport_lb)
        };

        if !laddr.is_multicast() && !self.env.may_share_port(cred) {
            let stream = self.cfg.proto.is_stream();
            if let Some(t) = self.find_local(st, laddr, lport, None, true, cred)
            {
                if (!stream || !t.key.is_connected())
                    && (!laddr.is_unspecified()
                        || !t.key.laddr.is_unspecified()
                        || !t.key.opts.contains(SockOpts::REUSEPORT))
                    && !self.env.identities_equal(cred, &t.key.cred)
                {
                    return Err(if opts.wants_reuse() {
                        PcbError::PermissionDenied
                    } else {
                        PcbError::AddressInUse
                    });
                }
            }
        }

        let wildcard = !opts.wants_reuse();
        let hit = self.find_local(st, laddr, lport, ps.fib, wildcard, cred);
        if let Some(t) = hit {
            if !shared(&t) {
                return Err(PcbError::AddressInUse);
            }
        }

        // A dual-stack socket also claims the IPv4 wildcard. It may sit
        // beside an IPv4 socket bound there, which takes precedence for
        // IPv4 traffic.
        if laddr.is_unspecified() && vflag.is_mapped() {
            let any4 = IpAddr::any(AddrFamily::Inet);
            let hit = self.find_local(st, &any4, lport, ps.fib, wildcard, cred);
            if let Some(t) = hit {
                if !shared(&t)
                    && (!t.key.laddr.is_unspecified()
                        || t.key.vflag.contains(VFlags::IPV6PROTO))
                {
                    return Err(PcbError::AddressInUse);
                }
            }
        }

        Ok(())
    }

    /// Connect a record to a remote endpoint and move it to the exact
    /// chains. An unbound record is given a local port, and an
    /// unspecified local address is replaced by a source address.
    ///
    /// A load-balance group member leaves its group.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: the record is closed or already connected.
    /// - `AddressNotAvailable`: remote port 0 or unspecified remote
    ///   address, or no usable source address.
    /// - `InvalidArgument`: the remote address is of a family the
    ///   socket cannot reach.
    /// - `AddressInUse`: the flow is already owned.
    /// - `PermissionDenied`, `ResourceExhausted`: from the allocator.
    ///
    /// On error the record is left as it was.
    pub fn connect(
        &self,
        pcb: &InpcbRef,
        faddr: IpAddr,
        fport: u16,
    ) -> Result<()> {
        let mut ps = pcb.write();
        check_open(pcb)?;
        if fport == 0 || faddr.is_unspecified() {
            return Err(PcbError::AddressNotAvailable);
        }
        if ps.is_connected() {
            return Err(PcbError::InvalidState("already connected".into()));
        }

        let vflag = match (ps.family(), faddr.family()) {
            (AddrFamily::Inet, AddrFamily::Inet) => VFlags::IPV4,
            (AddrFamily::Inet, AddrFamily::Inet6) => {
                return Err(PcbError::InvalidArgument(
                    "IPv4 socket cannot reach an IPv6 address".into(),
                ));
            }
            (AddrFamily::Inet6, AddrFamily::Inet) => {
                if ps.opts.contains(SockOpts::V6ONLY) {
                    return Err(PcbError::InvalidArgument(
                        "V6ONLY socket cannot reach an IPv4 address".into(),
                    ));
                }
                VFlags::IPV4 | VFlags::IPV6PROTO
            }
            (AddrFamily::Inet6, AddrFamily::Inet6) => {
                VFlags::IPV6 | VFlags::IPV6PROTO
            }
        };

        let laddr = if ps.laddr.is_unspecified() {
            self.env.select_source(pcb.cred(), &faddr)?
        } else if ps.laddr.family() != faddr.family() {
            return Err(PcbError::InvalidArgument(format!(
                "bound to {} but connecting to {faddr}",
                ps.laddr
            )));
        } else {
            ps.laddr
        };

        self.settle(&mut ps);
        let mut st = self.hash_lock.lock();

        let anon = ps.lport == 0;
        let lport = if anon {
            let dest = Some((faddr, fport));
            self.alloc_port(&mut st, pcb, &ps, &laddr, dest)?
        } else {
            let mut q = FlowQuery::new(faddr, fport, laddr, ps.lport);
            q.fib = ps.fib;
            let guard = self.smr.enter();
            if self.find_hash(&guard, &q, LookupFlags::empty(), false).is_some()
            {
                return Err(PcbError::AddressInUse);
            }
            ps.lport
        };

        let saved = (ps.vflag, ps.laddr, ps.lport);
        ps.vflag = vflag;
        ps.laddr = laddr;
        ps.lport = lport;
        ps.faddr = faddr;
        ps.fport = fport;

        let res = if pcb.flags().contains(PcbFlags::INHASH) {
            self.rehash_locked(&mut st, pcb, &mut ps, false)
        } else {
            self.insert_locked(&mut st, pcb, &ps)
        };

        if let Err(e) = res {
            (ps.vflag, ps.laddr, ps.lport) = saved;
            ps.faddr = IpAddr::any(faddr.family());
            ps.fport = 0;
            return Err(e);
        }

        if anon {
            pcb.set_flags(PcbFlags::ANONPORT);
        }
        Ok(())
    }

    /// Forget a record's remote endpoint, returning it to the wildcard
    /// chains with an unspecified local address. It keeps its local
    /// port.
    ///
    /// The record is not matched by lookups at its new place until
    /// every lookup which could have seen it connected has finished. A
    /// former load-balance group member does not rejoin its group.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the record is not connected.
    pub fn disconnect(&self, pcb: &InpcbRef) -> Result<()> {
        let mut ps = pcb.write();
        if !ps.is_connected() {
            return Err(PcbError::InvalidState("not connected".into()));
        }

        self.settle(&mut ps);
        let family = ps.family();
        let saved = (ps.vflag, ps.laddr, ps.faddr, ps.fport);
        ps.laddr = IpAddr::any(family);
        ps.faddr = IpAddr::any(family);
        ps.fport = 0;
        ps.vflag = vflag_for(family, &ps.laddr, ps.opts);

        if !pcb.flags().contains(PcbFlags::INHASH) {
            return Ok(());
        }

        let mut st = self.hash_lock.lock();
        if let Err(e) = self.rehash_locked(&mut st, pcb, &mut ps, true) {
            (ps.vflag, ps.laddr, ps.faddr, ps.fport) = saved;
            return Err(e);
        }
        Ok(())
    }

    /// Mark a record dropped by its transport and unlink it. Lookups
    /// stop finding it at once.
    pub fn drop_pcb(&self, pcb: &InpcbRef) {
        let ps = pcb.write();
        pcb.set_flags(PcbFlags::DROPPED);
        if pcb.flags().contains(PcbFlags::INHASH) {
            let mut st = self.hash_lock.lock();
            self.remove_locked(&mut st, pcb, &ps);
        }
    }

    /// Release the socket's reference to a record, unlinking it if it
    /// is still hashed.
    ///
    /// The memory is reclaimed once every lookup holding a reference
    /// has let go and every chain version listing it has been retired.
    ///
    /// # Panics
    ///
    /// The record must not have been destroyed already.
    pub fn destroy(&self, pcb: InpcbRef) {
        {
            let ps = pcb.write();
            assert!(!pcb.is_freed(), "pcb {} destroyed twice", pcb.id());
            if pcb.flags().contains(PcbFlags::INHASH) {
                let mut st = self.hash_lock.lock();
                self.remove_locked(&mut st, &pcb, &ps);
            }
            pcb.set_flags(PcbFlags::FREED);
        }
        self.release_id();
    }
}
