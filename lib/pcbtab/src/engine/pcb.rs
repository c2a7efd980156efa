// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection records.
//!
//! An [`Inpcb`] is the binding and connection state of one socket
//! endpoint. It is owned by its socket and shared, through
//! [`InpcbRef`], with the table and with any lookup in flight. The
//! addressing fields live behind the record's reader/writer lock; the
//! lifecycle flags are atomic so that lock-free readers may check them.

use crate::api::AddrFamily;
use crate::api::IpAddr;
use crate::api::PortRange;
use crate::ddi::smr::SmrSeq;
use crate::ddi::sync::KRwLock;
use crate::ddi::sync::KRwLockReadGuard;
use crate::ddi::sync::KRwLockWriteGuard;
use crate::ddi::sync::LockTaken;
use bitflags::bitflags;
use core::fmt;
use core::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

bitflags! {
    /// The protocol versions a record serves.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct VFlags: u8 {
        const IPV4 = 1 << 0;
        const IPV6 = 1 << 1;
        /// The record belongs to an IPv6 socket. Combined with `IPV4`
        /// it marks a dual-stack socket accepting mapped traffic.
        const IPV6PROTO = 1 << 2;
    }
}

impl VFlags {
    pub fn for_family(family: AddrFamily) -> Self {
        match family {
            AddrFamily::Inet => Self::IPV4,
            AddrFamily::Inet6 => Self::IPV6,
        }
    }

    /// Does the record accept traffic of this family?
    pub fn serves(&self, family: AddrFamily) -> bool {
        self.contains(Self::for_family(family))
    }

    /// Is this an IPv6 socket which also accepts IPv4 traffic?
    pub fn is_mapped(&self) -> bool {
        self.contains(Self::IPV6PROTO | Self::IPV4)
    }
}

impl fmt::Display for VFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Self::IPV4) {
            write!(f, "4")?;
        }
        if self.contains(Self::IPV6) {
            write!(f, "6")?;
        }
        if self.contains(Self::IPV6PROTO) {
            write!(f, "p")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Lifecycle flags of a record.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PcbFlags: u32 {
        /// Linked into the table's buckets and port index.
        const INHASH = 1 << 0;
        /// A member of a load-balance group.
        const INLBGROUP = 1 << 1;
        /// The local port was chosen by the ephemeral allocator.
        const ANONPORT = 1 << 2;
        /// The transport has dropped the connection.
        const DROPPED = 1 << 3;
        /// The record has been destroyed. Lookups never return it.
        const FREED = 1 << 4;
    }
}

impl fmt::Display for PcbFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::INHASH, 'H'),
            (Self::INLBGROUP, 'L'),
            (Self::ANONPORT, 'A'),
            (Self::DROPPED, 'D'),
            (Self::FREED, 'F'),
        ];

        let mut any = false;
        for (flag, c) in names {
            if self.contains(flag) {
                write!(f, "{c}")?;
                any = true;
            }
        }
        if !any {
            write!(f, "-")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Per-socket options which affect binding.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct SockOpts: u16 {
        const REUSEADDR = 1 << 0;
        const REUSEPORT = 1 << 1;
        /// Share the port with other sockets of the same owner and
        /// spread incoming connections across them.
        const REUSEPORT_LB = 1 << 2;
        /// Allow binding an address the host does not own.
        const BINDANY = 1 << 3;
        /// An IPv6 socket that refuses IPv4 traffic.
        const V6ONLY = 1 << 4;
    }
}

impl SockOpts {
    /// Does the socket ask to share its port in any way?
    pub fn wants_reuse(&self) -> bool {
        self.intersects(Self::REUSEADDR | Self::REUSEPORT | Self::REUSEPORT_LB)
    }
}

/// An isolation domain: a namespace restricting which addresses its
/// members may bind or connect to.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
pub struct IsolationDomain(pub u32);

/// The identity owning a record.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Cred {
    pub uid: u32,
    pub domain: Option<IsolationDomain>,
}

impl Cred {
    pub const fn new(uid: u32) -> Self {
        Self { uid, domain: None }
    }

    pub const fn isolated(uid: u32, domain: IsolationDomain) -> Self {
        Self { uid, domain: Some(domain) }
    }

    pub fn is_isolated(&self) -> bool {
        self.domain.is_some()
    }

    /// Do both identities live in the same isolation domain? Two
    /// unisolated identities share the host domain.
    pub fn same_domain(&self, other: &Cred) -> bool {
        self.domain == other.domain
    }
}

/// The lock-protected state of a record.
#[derive(Debug)]
pub struct PcbState {
    pub(crate) vflag: VFlags,
    pub(crate) laddr: IpAddr,
    pub(crate) lport: u16,
    pub(crate) faddr: IpAddr,
    pub(crate) fport: u16,
    pub(crate) opts: SockOpts,
    pub(crate) range: PortRange,
    pub(crate) fib: Option<u16>,
    pub(crate) numa: Option<u8>,

    /// Set on disconnect. The record may not be published at a new
    /// location until this grace period has elapsed.
    pub(crate) smr_seq: Option<SmrSeq>,

    // Transport-owned values. The table never reads these.
    pub ip_ttl: u8,
    pub ip_tos: u8,
    pub flowid: u32,
}

impl PcbState {
    fn new(family: AddrFamily) -> Self {
        let vflag = match family {
            AddrFamily::Inet => VFlags::IPV4,
            AddrFamily::Inet6 => VFlags::IPV6 | VFlags::IPV6PROTO,
        };

        Self {
            vflag,
            laddr: IpAddr::any(family),
            lport: 0,
            faddr: IpAddr::any(family),
            fport: 0,
            opts: SockOpts::empty(),
            range: PortRange::Default,
            fib: None,
            numa: None,
            smr_seq: None,
            ip_ttl: 64,
            ip_tos: 0,
            flowid: 0,
        }
    }

    pub fn vflag(&self) -> VFlags {
        self.vflag
    }

    pub fn laddr(&self) -> IpAddr {
        self.laddr
    }

    pub fn lport(&self) -> u16 {
        self.lport
    }

    pub fn faddr(&self) -> IpAddr {
        self.faddr
    }

    pub fn fport(&self) -> u16 {
        self.fport
    }

    pub fn opts(&self) -> SockOpts {
        self.opts
    }

    pub fn port_range(&self) -> PortRange {
        self.range
    }

    pub fn fib(&self) -> Option<u16> {
        self.fib
    }

    pub fn numa(&self) -> Option<u8> {
        self.numa
    }

    /// The address family the socket was created with.
    pub fn family(&self) -> AddrFamily {
        if self.vflag.contains(VFlags::IPV6PROTO) {
            AddrFamily::Inet6
        } else {
            AddrFamily::Inet
        }
    }

    pub fn is_bound(&self) -> bool {
        self.lport != 0
    }

    pub fn is_connected(&self) -> bool {
        !self.faddr.is_unspecified()
    }
}

/// Which lock a caller wants on a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockIntent {
    Read,
    Write,
}

/// A held record lock of either intent.
pub enum PcbLock<'a> {
    Read(KRwLockReadGuard<'a, PcbState>),
    Write(KRwLockWriteGuard<'a, PcbState>),
}

impl PcbLock<'_> {
    pub fn intent(&self) -> LockIntent {
        match self {
            Self::Read(_) => LockIntent::Read,
            Self::Write(_) => LockIntent::Write,
        }
    }

    /// Mutable access, when the lock was taken for writing.
    pub fn state_mut(&mut self) -> Option<&mut PcbState> {
        match self {
            Self::Read(_) => None,
            Self::Write(g) => Some(&mut *g),
        }
    }
}

impl Deref for PcbLock<'_> {
    type Target = PcbState;

    fn deref(&self) -> &PcbState {
        match self {
            Self::Read(g) => g,
            Self::Write(g) => g,
        }
    }
}

/// A connection record.
pub struct Inpcb {
    id: u64,
    cred: Cred,
    flags: AtomicU32,
    state: KRwLock<PcbState>,
}

/// A counted reference to a record. The strong count is the record's
/// reference count: the socket holds one, the table holds one per
/// bucket, index and group it is linked into, and a lookup in flight
/// holds one while it blocks on the record's lock.
pub type InpcbRef = Arc<Inpcb>;

impl fmt::Debug for Inpcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inpcb")
            .field("id", &self.id)
            .field("cred", &self.cred)
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

impl Inpcb {
    pub(crate) fn new(id: u64, cred: Cred, family: AddrFamily) -> Self {
        Self {
            id,
            cred,
            flags: AtomicU32::new(0),
            state: KRwLock::new(PcbState::new(family)),
        }
    }

    /// The generation number assigned when the record was created.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cred(&self) -> &Cred {
        &self.cred
    }

    pub fn flags(&self) -> PcbFlags {
        PcbFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_freed(&self) -> bool {
        self.flags().contains(PcbFlags::FREED)
    }

    pub(crate) fn set_flags(&self, flags: PcbFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: PcbFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn read(&self) -> KRwLockReadGuard<'_, PcbState> {
        self.state.read()
    }

    pub fn write(&self) -> KRwLockWriteGuard<'_, PcbState> {
        self.state.write()
    }

    pub fn lock(&self, intent: LockIntent) -> PcbLock<'_> {
        match intent {
            LockIntent::Read => PcbLock::Read(self.state.read()),
            LockIntent::Write => PcbLock::Write(self.state.write()),
        }
    }

    pub fn try_lock(
        &self,
        intent: LockIntent,
    ) -> Result<PcbLock<'_>, LockTaken> {
        match intent {
            LockIntent::Read => self.state.try_read().map(PcbLock::Read),
            LockIntent::Write => self.state.try_write().map(PcbLock::Write),
        }
    }
}
