// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The host services a table depends on.
//!
//! Authorization, address ownership and isolation policy are decided
//! outside the table. A table consults them through [`PcbEnv`].

use super::pcb::Cred;
use super::pcb::IsolationDomain;
use crate::api::AddrFamily;
use crate::api::IpAddr;
use crate::api::PcbError;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Policy callbacks consumed by a table.
///
/// `check_domain_addr()` is called from inside epoch read sections and
/// must not block.
pub trait PcbEnv: Send + Sync {
    /// May `cred` bind the reserved `port` on `addr`?
    fn is_bind_authorized(
        &self,
        cred: &Cred,
        addr: &IpAddr,
        port: u16,
    ) -> Result<bool, PcbError>;

    /// Are `a` and `b` the same owner for the purpose of port sharing?
    fn identities_equal(&self, a: &Cred, b: &Cred) -> bool;

    /// May `cred` share a port with sockets of other owners?
    fn may_share_port(&self, _cred: &Cred) -> bool {
        false
    }

    /// May a record owned by `cred` accept traffic for `addr`?
    fn check_domain_addr(&self, cred: &Cred, addr: &IpAddr) -> bool;

    /// Is `addr` assigned to this host?
    fn is_local_addr(&self, addr: &IpAddr) -> bool;

    /// Choose the local address used to reach `faddr`.
    fn select_source(
        &self,
        cred: &Cred,
        faddr: &IpAddr,
    ) -> Result<IpAddr, PcbError>;
}

/// A static host: a set of local addresses, a set of privileged users
/// and the addresses each isolation domain may use. The superuser
/// (uid 0) is always privileged.
#[derive(Clone, Debug, Default)]
pub struct HostEnv {
    local: BTreeSet<IpAddr>,
    privileged: BTreeSet<u32>,
    domains: BTreeMap<IsolationDomain, BTreeSet<IpAddr>>,
}

impl HostEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local(mut self, addr: IpAddr) -> Self {
        self.local.insert(addr);
        self
    }

    pub fn with_privileged(mut self, uid: u32) -> Self {
        self.privileged.insert(uid);
        self
    }

    /// Assign `addrs` to `domain`. The addresses become local to the
    /// host as well.
    pub fn with_domain<I>(mut self, domain: IsolationDomain, addrs: I) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let set = self.domains.entry(domain).or_default();
        for addr in addrs {
            set.insert(addr);
            self.local.insert(addr);
        }
        self
    }

    fn is_privileged(&self, cred: &Cred) -> bool {
        cred.uid == 0 || self.privileged.contains(&cred.uid)
    }

    fn first_of(
        addrs: &BTreeSet<IpAddr>,
        family: AddrFamily,
    ) -> Option<IpAddr> {
        addrs.iter().find(|a| a.family() == family).copied()
    }
}

impl PcbEnv for HostEnv {
    fn is_bind_authorized(
        &self,
        cred: &Cred,
        _addr: &IpAddr,
        _port: u16,
    ) -> Result<bool, PcbError> {
        Ok(self.is_privileged(cred))
    }

    fn identities_equal(&self, a: &Cred, b: &Cred) -> bool {
        a.uid == b.uid
    }

    fn may_share_port(&self, cred: &Cred) -> bool {
        self.is_privileged(cred)
    }

    fn check_domain_addr(&self, cred: &Cred, addr: &IpAddr) -> bool {
        match cred.domain {
            None => true,
            Some(dom) => {
                self.domains.get(&dom).is_some_and(|set| set.contains(addr))
            }
        }
    }

    fn is_local_addr(&self, addr: &IpAddr) -> bool {
        self.local.contains(addr)
    }

    fn select_source(
        &self,
        cred: &Cred,
        faddr: &IpAddr,
    ) -> Result<IpAddr, PcbError> {
        let family = faddr.family();
        let found = match cred.domain {
            None => Self::first_of(&self.local, family),
            Some(dom) => self
                .domains
                .get(&dom)
                .and_then(|set| Self::first_of(set, family)),
        };

        found.ok_or(PcbError::AddressNotAvailable)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn host_policy() {
        let env = HostEnv::new()
            .with_local(ip("10.0.0.2"))
            .with_local(ip("fd00::2"))
            .with_privileged(50)
            .with_domain(IsolationDomain(1), [ip("10.0.1.2")]);

        let user = Cred::new(1000);
        let jailed = Cred::isolated(1000, IsolationDomain(1));

        assert_eq!(
            env.is_bind_authorized(&user, &ip("0.0.0.0"), 80),
            Ok(false)
        );
        assert_eq!(
            env.is_bind_authorized(&Cred::new(50), &ip("0.0.0.0"), 80),
            Ok(true)
        );
        assert!(env.is_local_addr(&ip("10.0.1.2")));
        assert!(!env.is_local_addr(&ip("10.9.9.9")));
        assert!(env.check_domain_addr(&user, &ip("10.9.9.9")));
        assert!(env.check_domain_addr(&jailed, &ip("10.0.1.2")));
        assert!(!env.check_domain_addr(&jailed, &ip("10.0.0.2")));
        assert!(env.identities_equal(&user, &jailed));
    }

    #[test]
    fn source_selection() {
        let env = HostEnv::new()
            .with_local(ip("10.0.0.2"))
            .with_domain(IsolationDomain(3), [ip("10.0.3.2")]);

        assert_eq!(
            env.select_source(&Cred::new(1), &ip("192.0.2.1")),
            Ok(ip("10.0.0.2"))
        );
        assert_eq!(
            env.select_source(
                &Cred::isolated(1, IsolationDomain(3)),
                &ip("192.0.2.1")
            ),
            Ok(ip("10.0.3.2"))
        );
        assert_eq!(
            env.select_source(&Cred::new(1), &ip("2001:db8::1")),
            Err(PcbError::AddressNotAvailable)
        );
    }
}
