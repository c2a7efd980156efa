// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::Protocol;
use super::ip::IpAddr;
use alloc::string::String;
use alloc::vec::Vec;
use core::ffi::c_int;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors returned by mutating table operations.
///
/// A failed lookup is not an error: absence is reported as `None`.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum PcbError {
    /// A conflicting binding exists and reuse is not permitted.
    #[error("address already in use")]
    AddressInUse,

    /// The requested address is not owned by this host or isolation
    /// domain, or the remote port is zero.
    #[error("address not available")]
    AddressNotAvailable,

    /// A privileged port was requested without authorization, or the
    /// binding would share a port across owners.
    #[error("permission denied")]
    PermissionDenied,

    /// The port range is exhausted or an allocation failed.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// The operation is invalid for the record's lifecycle stage.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl PcbError {
    /// Convert to an errno value, as surfaced by the socket API.
    pub fn to_errno(&self) -> c_int {
        match self {
            Self::AddressInUse => libc::EADDRINUSE,
            Self::AddressNotAvailable => libc::EADDRNOTAVAIL,
            Self::PermissionDenied => libc::EACCES,
            Self::ResourceExhausted => libc::ENOBUFS,
            Self::InvalidState(_) => libc::EINVAL,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// A single connection record, as seen by a table dump.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PcbEntryDump {
    /// The generation number assigned at creation.
    pub id: u64,
    pub laddr: IpAddr,
    pub lport: u16,
    pub faddr: IpAddr,
    pub fport: u16,
    /// Rendered version flags, e.g. `4`, `6p`, `46p`.
    pub vflag: String,
    /// Rendered lifecycle flags.
    pub flags: String,
    pub uid: u32,
    pub domain: Option<u32>,
}

/// A load-balance group, as seen by a table dump.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LbGroupDump {
    pub laddr: IpAddr,
    pub lport: u16,
    pub domain: Option<u32>,
    pub numa: Option<u8>,
    pub capacity: usize,
    /// Member ids, in selection order.
    pub members: Vec<u64>,
}

/// Counters maintained by a table.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct TableStatsDump {
    /// Lock-free lookups started.
    pub lookups: u64,
    /// Lock-free lookups which fell back to the locked variant.
    pub lookup_fallbacks: u64,
    /// Locked lookups started, including fallbacks.
    pub lookups_locked: u64,
    /// Ports handed out by the ephemeral allocator.
    pub port_allocs: u64,
    /// Allocator scans which found no free port.
    pub port_exhausted: u64,
    /// Load-balance group reallocations.
    pub lbgroup_resizes: u64,
}

/// The response to a table dump.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DumpTableResp {
    pub name: String,
    pub proto: Protocol,
    /// Connected records, from the exact buckets.
    pub exact: Vec<PcbEntryDump>,
    /// Bound but unconnected records, from the wildcard buckets, in
    /// bucket order.
    pub wild: Vec<PcbEntryDump>,
    pub lbgroups: Vec<LbGroupDump>,
    pub stats: TableStatsDump,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(PcbError::AddressInUse.to_errno(), libc::EADDRINUSE);
        assert_eq!(PcbError::PermissionDenied.to_errno(), libc::EACCES);
        assert_eq!(
            PcbError::InvalidState("connected".into()).to_errno(),
            libc::EINVAL
        );
    }
}
