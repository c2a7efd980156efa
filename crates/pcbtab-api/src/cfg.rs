// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Table configuration.

use super::Protocol;
use super::cmd::PcbError;
use core::ops::RangeInclusive;
use serde::Deserialize;
use serde::Serialize;

/// The default number of exact and wildcard hash buckets.
pub const DEF_HASH_SIZE: u32 = 512;

/// The default number of load-balance group hash buckets.
pub const DEF_LBGROUP_HASH_SIZE: u32 = 64;

/// A class of local port requested from the ephemeral allocator.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum PortRange {
    /// The regular ephemeral range.
    #[default]
    Default,
    /// The "high" range, traditionally 49152-65535.
    High,
    /// The privileged range, traditionally 600-1023. Configured top
    /// down, scanned like the others once normalized.
    Low,
}

/// The port ranges used by the ephemeral allocator and the window of
/// reserved ports which require authorization to bind explicitly.
///
/// The `first`/`last` pairs may be given in either order; the
/// allocator normalizes each range before scanning it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PortRangeCfg {
    pub lowfirst: u16,
    pub lowlast: u16,
    pub first: u16,
    pub last: u16,
    pub hifirst: u16,
    pub hilast: u16,
    pub reserved_low: u16,
    pub reserved_high: u16,

    /// Start each allocation scan at a random point in the range
    /// rather than just after the last port handed out.
    pub randomized: bool,
}

impl Default for PortRangeCfg {
    fn default() -> Self {
        Self {
            lowfirst: 1023,
            lowlast: 600,
            first: 10000,
            last: 65535,
            hifirst: 49152,
            hilast: 65535,
            reserved_low: 0,
            reserved_high: 1023,
            randomized: true,
        }
    }
}

impl PortRangeCfg {
    /// Return the normalized (ascending) range for a port class.
    pub fn range(&self, class: PortRange) -> RangeInclusive<u16> {
        let (a, b) = match class {
            PortRange::Default => (self.first, self.last),
            PortRange::High => (self.hifirst, self.hilast),
            PortRange::Low => (self.lowfirst, self.lowlast),
        };

        if a > b { b..=a } else { a..=b }
    }

    /// Is `port` inside the reserved window?
    pub fn is_reserved(&self, port: u16) -> bool {
        port >= self.reserved_low && port <= self.reserved_high
    }
}

/// Configuration of a single connection table.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TableCfg {
    /// The protocol served by this table.
    pub proto: Protocol,

    /// Number of exact and wildcard hash buckets. Must be a power of
    /// two.
    pub hash_size: u32,

    /// Number of load-balance group buckets. Must be a power of two.
    pub lbgroup_hash_size: u32,

    /// Seed for bucket hashing and port randomization. When absent a
    /// seed is drawn from the OS at table creation.
    pub seed: Option<u64>,

    /// The number of NUMA domains a load-balance group may be pinned
    /// to.
    pub numa_domains: u8,

    pub ports: PortRangeCfg,
}

impl Default for TableCfg {
    fn default() -> Self {
        Self {
            proto: Protocol::TCP,
            hash_size: DEF_HASH_SIZE,
            lbgroup_hash_size: DEF_LBGROUP_HASH_SIZE,
            seed: None,
            numa_domains: 1,
            ports: PortRangeCfg::default(),
        }
    }
}

impl TableCfg {
    pub fn validate(&self) -> Result<(), PcbError> {
        if !self.hash_size.is_power_of_two() {
            return Err(PcbError::InvalidArgument(format!(
                "hash_size must be a power of two: {}",
                self.hash_size
            )));
        }

        if !self.lbgroup_hash_size.is_power_of_two() {
            return Err(PcbError::InvalidArgument(format!(
                "lbgroup_hash_size must be a power of two: {}",
                self.lbgroup_hash_size
            )));
        }

        if self.numa_domains == 0 {
            return Err(PcbError::InvalidArgument(
                "numa_domains must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
