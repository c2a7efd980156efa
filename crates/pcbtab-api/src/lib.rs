// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the connection table and its consumers: IP
//! addresses, table configuration, errors, and the serialized dump
//! formats used by administration tooling.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cfg;
pub mod cmd;
pub mod ip;

pub use cfg::*;
pub use cmd::*;
pub use ip::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified, this number should increment. It lets
/// tooling verify that a dump was produced by a compatible table.
pub const API_VERSION: u64 = 3;

/// The transport protocol a table serves.
///
/// The table itself is protocol agnostic, but binding rules differ
/// slightly between stream and datagram sockets.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum Protocol {
    #[default]
    TCP,
    UDP,
}

impl Protocol {
    /// Is this a connection-oriented (stream) protocol?
    pub fn is_stream(&self) -> bool {
        matches!(self, Protocol::TCP)
    }
}

impl core::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::TCP),
            "udp" => Ok(Protocol::UDP),
            _ => Err(format!("invalid protocol: {}", s)),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Protocol::TCP => "TCP",
            Protocol::UDP => "UDP",
        };

        write!(f, "{}", s)
    }
}
