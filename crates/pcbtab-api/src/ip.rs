// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::result;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// The address family of an endpoint.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum AddrFamily {
    Inet,
    Inet6,
}

impl Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AddrFamily::Inet => write!(f, "inet"),
            AddrFamily::Inet6 => write!(f, "inet6"),
        }
    }
}

/// An IP address of either family.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum IpAddr {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
}

impl IpAddr {
    /// The unspecified address of the given family.
    pub const fn any(family: AddrFamily) -> Self {
        match family {
            AddrFamily::Inet => IpAddr::Ip4(Ipv4Addr::ANY_ADDR),
            AddrFamily::Inet6 => IpAddr::Ip6(Ipv6Addr::ANY_ADDR),
        }
    }

    pub const fn family(&self) -> AddrFamily {
        match self {
            IpAddr::Ip4(_) => AddrFamily::Inet,
            IpAddr::Ip6(_) => AddrFamily::Inet6,
        }
    }

    /// Is this `0.0.0.0` or `::`?
    pub const fn is_unspecified(&self) -> bool {
        match self {
            IpAddr::Ip4(v4) => v4.is_unspecified(),
            IpAddr::Ip6(v6) => v6.is_unspecified(),
        }
    }

    pub const fn is_multicast(&self) -> bool {
        match self {
            IpAddr::Ip4(v4) => v4.is_multicast(),
            IpAddr::Ip6(v6) => v6.is_multicast(),
        }
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(ipv4: Ipv4Addr) -> Self {
        IpAddr::Ip4(ipv4)
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(ipv6: Ipv6Addr) -> Self {
        IpAddr::Ip6(ipv6)
    }
}

impl Default for IpAddr {
    fn default() -> Self {
        IpAddr::Ip4(Default::default())
    }
}

impl fmt::Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpAddr::Ip4(ip4) => write!(f, "{ip4}"),
            IpAddr::Ip6(ip6) => write!(f, "{ip6}"),
        }
    }
}

impl FromStr for IpAddr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        match val.parse::<core::net::IpAddr>() {
            Ok(core::net::IpAddr::V4(v4)) => Ok(Self::Ip4(v4.into())),
            Ok(core::net::IpAddr::V6(v6)) => Ok(Self::Ip6(v6.into())),
            Err(_) => Err(format!("not an IP address: {val}")),
        }
    }
}

/// An IPv4 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(C)]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 4] };

    pub const fn is_unspecified(&self) -> bool {
        u32::from_be_bytes(self.inner) == 0
    }

    pub const fn is_multicast(&self) -> bool {
        matches!(self.inner[0], 224..240)
    }
}

impl From<core::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip4: core::net::Ipv4Addr) -> Self {
        Self { inner: ip4.octets() }
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        val.parse::<core::net::Ipv4Addr>()
            .map(Self::from)
            .map_err(|e| format!("{val}: {e}"))
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d] = self.inner;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// An IPv6 address.
#[derive(
    Clone,
    Copy,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
#[repr(C)]
pub struct Ipv6Addr {
    inner: [u8; 16],
}

impl Ipv6Addr {
    /// The unspecified IPv6 address, i.e., `::` or all zeros.
    pub const ANY_ADDR: Self = Self { inner: [0; 16] };

    pub const fn is_unspecified(&self) -> bool {
        u128::from_be_bytes(self.inner) == 0
    }

    /// Anything in `ff00::/8`.
    pub const fn is_multicast(&self) -> bool {
        self.inner[0] == 0xff
    }

    /// Is this an IPv4-mapped address (`::ffff:a.b.c.d`)?
    pub fn is_v4_mapped(&self) -> bool {
        self.inner[..10].iter().all(|b| *b == 0)
            && self.inner[10] == 0xff
            && self.inner[11] == 0xff
    }
}

impl fmt::Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ip6 = core::net::Ipv6Addr::from(self.inner);
        write!(f, "{ip6}")
    }
}

impl Debug for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<core::net::Ipv6Addr> for Ipv6Addr {
    fn from(ip6: core::net::Ipv6Addr) -> Self {
        Self { inner: ip6.octets() }
    }
}

impl FromStr for Ipv6Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        val.parse::<core::net::Ipv6Addr>()
            .map(Self::from)
            .map_err(|e| format!("{e}"))
    }
}
