// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A transport-layer connection identification table.
//!
//! The table maps local and remote endpoints to connection records
//! (protocol control blocks). It is consulted on every inbound packet
//! to find the owning socket, and on every bind/connect to arbitrate
//! use of local addresses and ports. Lookups run lock-free inside an
//! epoch-protected read section, falling back to a serialized search
//! when a candidate changes underneath them.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
// Enable features needed for USDT, if needed.
#![cfg_attr(all(feature = "usdt", not(usdt_stable_asm)), feature(asm))]
#![cfg_attr(
    all(feature = "usdt", target_os = "macos", not(usdt_stable_asm_sym)),
    feature(asm_sym)
)]

#[macro_use]
extern crate cfg_if;

pub mod api;
pub mod ddi;
pub mod engine;
pub mod print;

// ================================================================
// DTrace USDT Provider
//
// Probes fired by the table. Consumers must call
// `usdt::register_probes()` before they become visible.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod pcbtab_provider {
    fn lookup__fallback(table: &str, lport: u64, reason: &str) {}
    fn port__exhausted(table: &str, first: u64, last: u64) {}
    fn lbgroup__resize(table: &str, lport: u64, old: u64, new: u64) {}
    fn lbgroup__full(table: &str, lport: u64, size: u64) {}
}
