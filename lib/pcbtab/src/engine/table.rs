// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The connection table and its hash chains.
//!
//! A hashed record lives in exactly one chain: an exact chain, keyed
//! by the hash of its remote address and port pair, while it is
//! connected; a wildcard chain, keyed by local port, otherwise. It is
//! also listed in the port index, which holds every record bound to a
//! given local port and serves conflict checks.
//!
//! Chains are copy-on-write lists published through the table's
//! [`Smr`]. Each entry carries a snapshot of the record's addressing
//! ([`PcbKey`]) taken when it was linked, so that readers can match
//! without touching the record's lock. A reader that finds a candidate
//! must lock the record and check the match again.
//!
//! Wildcard chains are kept in precedence order (see [`WildClass`]):
//! lookups take the first matching entry.
//!
//! # Locking
//!
//! Mutations take the record's write lock, then the table lock. Code
//! holding the table lock may only try-lock records.

use super::env::PcbEnv;
use super::fib_matches;
use super::lbgroup::LbGroup;
use super::lbgroup::LbKey;
use super::lookup::FlowQuery;
use super::pcb::Cred;
use super::pcb::Inpcb;
use super::pcb::InpcbRef;
use super::pcb::LockIntent;
use super::pcb::PcbFlags;
use super::pcb::PcbLock;
use super::pcb::PcbState;
use super::pcb::SockOpts;
use super::pcb::VFlags;
use super::stat::TableStats;
use super::tuple_hash;
use crate::api::DumpTableResp;
use crate::api::IpAddr;
use crate::api::PcbEntryDump;
use crate::api::PcbError;
use crate::api::TableCfg;
use crate::api::TableStatsDump;
use crate::ddi::smr::Smr;
use crate::ddi::smr::SmrList;
use crate::ddi::smr::SmrSeq;
use crate::ddi::smr::SmrWriter;
use crate::ddi::sync::KMutex;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::string::String;
use std::string::ToString;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::vec::Vec;

pub(crate) type Result<T> = core::result::Result<T, PcbError>;

/// A snapshot of a record's addressing, stored with each chain entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PcbKey {
    pub(crate) vflag: VFlags,
    pub(crate) laddr: IpAddr,
    pub(crate) lport: u16,
    pub(crate) faddr: IpAddr,
    pub(crate) fport: u16,
    pub(crate) cred: Cred,
    pub(crate) opts: SockOpts,
    pub(crate) fib: Option<u16>,
}

impl PcbKey {
    pub(crate) fn of(pcb: &Inpcb, st: &PcbState) -> Self {
        Self {
            vflag: st.vflag,
            laddr: st.laddr,
            lport: st.lport,
            faddr: st.faddr,
            fport: st.fport,
            cred: *pcb.cred(),
            opts: st.opts,
            fib: st.fib,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.faddr.is_unspecified()
    }

    /// Does this connected record own the flow?
    pub(crate) fn matches_exact(&self, q: &FlowQuery) -> bool {
        self.faddr == q.faddr
            && self.fport == q.fport
            && self.lport == q.lport
            && self.laddr == q.laddr
            && self.vflag.serves(q.laddr.family())
            && fib_matches(self.fib, q.fib)
    }

    /// Could this unconnected record accept the flow? Isolation is
    /// checked separately.
    pub(crate) fn matches_wild(&self, q: &FlowQuery) -> bool {
        self.lport == q.lport
            && self.faddr.is_unspecified()
            && (self.laddr.is_unspecified() || self.laddr == q.laddr)
            && self.vflag.serves(q.laddr.family())
            && fib_matches(self.fib, q.fib)
    }

    pub(crate) fn wild_class(&self) -> WildClass {
        WildClass::of(&self.cred, self.vflag, &self.laddr)
    }
}

/// The precedence classes of a wildcard chain, highest first.
///
/// Within a chain every entry of a class precedes every entry of the
/// classes after it, so the first entry matching a query is the most
/// specific one regardless of the order records were bound in.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum WildClass {
    /// Isolated, bound to a specific local address.
    IsolatedExact,
    /// Isolated, bound to the unspecified address.
    IsolatedAny,
    /// Bound to a specific local address.
    Exact,
    /// Bound to the unspecified address.
    Any,
    /// A dual-stack IPv6 socket bound to the unspecified address. It
    /// receives IPv4 traffic only when nothing else wants it.
    Mapped,
}

impl WildClass {
    pub fn of(cred: &Cred, vflag: VFlags, laddr: &IpAddr) -> Self {
        let bound = !laddr.is_unspecified();
        if !bound && vflag.is_mapped() {
            return Self::Mapped;
        }

        match (cred.is_isolated(), bound) {
            (true, true) => Self::IsolatedExact,
            (true, false) => Self::IsolatedAny,
            (false, true) => Self::Exact,
            (false, false) => Self::Any,
        }
    }
}

/// Return the index at which an entry of `class` is inserted into a
/// wildcard chain whose entries have the classes yielded by `chain`.
///
/// An entry goes ahead of its own class, mapped entries go last.
pub fn wild_insert_pos<I>(chain: I, class: WildClass) -> usize
where
    I: IntoIterator<Item = WildClass>,
{
    let mut len = 0;
    for (i, c) in chain.into_iter().enumerate() {
        if class != WildClass::Mapped && c >= class {
            return i;
        }
        len = i + 1;
    }
    len
}

/// An entry of a hash chain or of the port index.
#[derive(Clone)]
pub(crate) struct HashEntry {
    pub(crate) key: PcbKey,
    pub(crate) pcb: InpcbRef,

    /// Lookups ignore the entry until this grace period has elapsed.
    pub(crate) visible_after: Option<SmrSeq>,
}

impl HashEntry {
    fn dump(&self) -> PcbEntryDump {
        PcbEntryDump {
            id: self.pcb.id(),
            laddr: self.key.laddr,
            lport: self.key.lport,
            faddr: self.key.faddr,
            fport: self.key.fport,
            vflag: self.key.vflag.to_string(),
            flags: self.pcb.flags().to_string(),
            uid: self.key.cred.uid,
            domain: self.key.cred.domain.map(|d| d.0),
        }
    }
}

/// State serialized by the table lock.
pub(crate) struct HashState {
    pub(crate) writer: SmrWriter,

    /// Every hashed record, by local port.
    pub(crate) ports: BTreeMap<u16, Vec<HashEntry>>,

    // Allocator cursors, one per port class.
    pub(crate) last_low: u16,
    pub(crate) last_port: u16,
    pub(crate) last_hi: u16,

    pub(crate) rng: StdRng,
    pub(crate) count: usize,

    /// Make the next staging allocation fail.
    #[cfg(test)]
    pub(crate) fail_alloc: bool,
}

impl HashState {
    pub(crate) fn port_entry(
        &self,
        pcb: &InpcbRef,
        lport: u16,
    ) -> Option<&HashEntry> {
        self.ports.get(&lport)?.iter().find(|e| Arc::ptr_eq(&e.pcb, pcb))
    }
}

/// A connection table serving one protocol.
pub struct PcbTable {
    name: String,
    pub(crate) cfg: TableCfg,
    pub(crate) env: Arc<dyn PcbEnv>,
    pub(crate) smr: Smr,

    /// Seed of [`tuple_hash()`] for this table.
    pub(crate) seed: u32,
    hashmask: usize,
    lbmask: usize,

    pub(crate) hash_exact: Box<[SmrList<HashEntry>]>,
    pub(crate) hash_wild: Box<[SmrList<HashEntry>]>,
    pub(crate) lbgroups: Box<[SmrList<Arc<LbGroup>>]>,

    pub(crate) hash_lock: KMutex<HashState>,

    gencnt: AtomicU64,
    live: AtomicUsize,
    pub(crate) stats: TableStats,
}

impl PcbTable {
    pub fn new(
        name: &str,
        cfg: TableCfg,
        env: Arc<dyn PcbEnv>,
    ) -> Result<Self> {
        cfg.validate()?;

        let seed: u64 = match cfg.seed {
            Some(seed) => seed,
            None => rand::rng().random(),
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let hash_seed = rng.random();
        let hash_size = cfg.hash_size as usize;
        let lb_size = cfg.lbgroup_hash_size as usize;

        let state = HashState {
            writer: SmrWriter::new(),
            ports: BTreeMap::new(),
            last_low: 0,
            last_port: 0,
            last_hi: 0,
            rng,
            count: 0,
            #[cfg(test)]
            fail_alloc: false,
        };

        Ok(Self {
            name: name.to_string(),
            cfg,
            env,
            smr: Smr::new(),
            seed: hash_seed,
            hashmask: hash_size - 1,
            lbmask: lb_size - 1,
            hash_exact: (0..hash_size).map(|_| SmrList::new()).collect(),
            hash_wild: (0..hash_size).map(|_| SmrList::new()).collect(),
            lbgroups: (0..lb_size).map(|_| SmrList::new()).collect(),
            hash_lock: KMutex::new(state),
            gencnt: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            stats: TableStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cfg(&self) -> &TableCfg {
        &self.cfg
    }

    pub fn smr(&self) -> &Smr {
        &self.smr
    }

    pub fn stats(&self) -> TableStatsDump {
        self.stats.dump()
    }

    /// The number of hashed records.
    pub fn len(&self) -> usize {
        self.hash_lock.lock().count
    }

    /// The number of records created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Wait until every lookup currently in a read section has left
    /// it. Records moved before the call are visible afterwards.
    pub fn synchronize(&self) {
        self.smr.synchronize();
    }

    /// The exact chain serving a flow.
    pub fn exact_bucket(
        &self,
        faddr: &IpAddr,
        lport: u16,
        fport: u16,
    ) -> usize {
        tuple_hash(self.seed, faddr, lport, fport) as usize & self.hashmask
    }

    /// The wildcard chain serving a local port.
    pub fn wild_bucket(&self, lport: u16) -> usize {
        usize::from(lport) & self.hashmask
    }

    pub(crate) fn lb_bucket(&self, lport: u16) -> usize {
        usize::from(lport) & self.lbmask
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.live.fetch_add(1, Ordering::Relaxed);
        self.gencnt.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn release_id(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Link a bound record into the table.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the record is unbound, closed or already
    /// hashed; `ResourceExhausted` if the table could not grow. On
    /// error the table is unchanged.
    pub fn insert(&self, pcb: &InpcbRef) -> Result<()> {
        let mut ps = pcb.write();
        let flags = pcb.flags();
        if flags.intersects(PcbFlags::DROPPED | PcbFlags::FREED) {
            return Err(PcbError::InvalidState("record is closed".into()));
        }
        if flags.contains(PcbFlags::INHASH) {
            return Err(PcbError::InvalidState("already hashed".into()));
        }
        if !ps.is_bound() {
            return Err(PcbError::InvalidState("not bound".into()));
        }

        self.settle(&mut ps);
        let mut st = self.hash_lock.lock();
        self.insert_locked(&mut st, pcb, &ps)
    }

    /// Unlink a record from the table.
    ///
    /// # Panics
    ///
    /// The record must be hashed.
    pub fn remove(&self, pcb: &InpcbRef) {
        let ps = pcb.write();
        let mut st = self.hash_lock.lock();
        self.remove_locked(&mut st, pcb, &ps);
    }

    /// Wait out the record's disconnect grace period, if any, before it
    /// is linked somewhere new. Must be called before taking the table
    /// lock.
    pub(crate) fn settle(&self, ps: &mut PcbState) {
        if let Some(seq) = ps.smr_seq.take() {
            self.smr.wait(seq);
        }
    }

    fn chain_of(&self, key: &PcbKey) -> &SmrList<HashEntry> {
        if key.is_connected() {
            let idx = self.exact_bucket(&key.faddr, key.lport, key.fport);
            &self.hash_exact[idx]
        } else {
            &self.hash_wild[self.wild_bucket(key.lport)]
        }
    }

    /// Copy `cur` with `entry` linked at its place.
    fn chain_insert(
        cur: &[HashEntry],
        entry: HashEntry,
    ) -> Result<Vec<HashEntry>> {
        let mut chain = Vec::new();
        chain
            .try_reserve_exact(cur.len() + 1)
            .map_err(|_| PcbError::ResourceExhausted)?;

        // Connected records are unique on their tuple; order is
        // irrelevant and the head is cheapest to find again.
        let pos = if entry.key.is_connected() {
            0
        } else {
            wild_insert_pos(
                cur.iter().map(|e| e.key.wild_class()),
                entry.key.wild_class(),
            )
        };

        chain.extend_from_slice(&cur[..pos]);
        chain.push(entry);
        chain.extend_from_slice(&cur[pos..]);
        Ok(chain)
    }

    fn chain_with(
        &self,
        list: &SmrList<HashEntry>,
        entry: HashEntry,
    ) -> Result<Vec<HashEntry>> {
        let guard = self.smr.enter();
        Self::chain_insert(list.read(&guard), entry)
    }

    fn chain_without(
        &self,
        list: &SmrList<HashEntry>,
        pcb: &InpcbRef,
    ) -> Vec<HashEntry> {
        let guard = self.smr.enter();
        list.read(&guard)
            .iter()
            .filter(|e| !Arc::ptr_eq(&e.pcb, pcb))
            .cloned()
            .collect()
    }

    /// Allocate everything needed to hash `entry`, without publishing
    /// anything. Returns the chain to publish and its new contents.
    fn stage_insert(
        &self,
        st: &mut HashState,
        entry: &HashEntry,
    ) -> Result<(&SmrList<HashEntry>, Vec<HashEntry>)> {
        #[cfg(test)]
        if core::mem::take(&mut st.fail_alloc) {
            return Err(PcbError::ResourceExhausted);
        }

        let lport = entry.key.lport;
        let created = !st.ports.contains_key(&lport);
        let plist = st.ports.entry(lport).or_default();
        if plist.try_reserve(1).is_err() {
            if created {
                st.ports.remove(&lport);
            }
            return Err(PcbError::ResourceExhausted);
        }

        let list = self.chain_of(&entry.key);
        match self.chain_with(list, entry.clone()) {
            Ok(chain) => Ok((list, chain)),
            Err(e) => {
                if created {
                    st.ports.remove(&lport);
                }
                Err(e)
            }
        }
    }

    /// Link a record into its chain and the port index, joining its
    /// load-balance group if it asks for one.
    pub(crate) fn insert_locked(
        &self,
        st: &mut HashState,
        pcb: &InpcbRef,
        ps: &PcbState,
    ) -> Result<()> {
        let key = PcbKey::of(pcb, ps);
        let lk = LbKey::of(&key, ps.numa);
        let joined = if !key.is_connected()
            && key.opts.contains(SockOpts::REUSEPORT_LB)
        {
            self.lbgroup_join(st, pcb, &lk)?
        } else {
            false
        };

        let entry =
            HashEntry { key, pcb: Arc::clone(pcb), visible_after: None };
        let (list, chain) = match self.stage_insert(st, &entry) {
            Ok(staged) => staged,
            Err(e) => {
                if joined {
                    self.lbgroup_leave(st, pcb, &lk);
                }
                return Err(e);
            }
        };

        list.publish(&st.writer, chain);
        st.ports.entry(key.lport).or_default().push(entry);
        if joined {
            pcb.set_flags(PcbFlags::INLBGROUP);
        }
        pcb.set_flags(PcbFlags::INHASH);
        st.count += 1;
        Ok(())
    }

    /// Unlink a record from its chain, its load-balance group and the
    /// port index.
    pub(crate) fn remove_locked(
        &self,
        st: &mut HashState,
        pcb: &InpcbRef,
        ps: &PcbState,
    ) {
        assert!(
            pcb.flags().contains(PcbFlags::INHASH),
            "pcb {} removed while not hashed",
            pcb.id()
        );

        let lport = ps.lport;
        let Some(plist) = st.ports.get_mut(&lport) else {
            panic!("pcb {} hashed without port {lport} indexed", pcb.id());
        };
        let Some(pos) = plist.iter().position(|e| Arc::ptr_eq(&e.pcb, pcb))
        else {
            panic!("pcb {} missing from port {lport} index", pcb.id());
        };
        let entry = plist.remove(pos);
        if plist.is_empty() {
            st.ports.remove(&lport);
        }

        if pcb.flags().contains(PcbFlags::INLBGROUP) {
            self.lbgroup_leave(st, pcb, &LbKey::of(&entry.key, ps.numa));
            pcb.clear_flags(PcbFlags::INLBGROUP);
        }

        let list = self.chain_of(&entry.key);
        let chain = self.chain_without(list, pcb);
        list.publish(&st.writer, chain);
        pcb.clear_flags(PcbFlags::INHASH);
        st.count -= 1;
    }

    /// Move a hashed record to the chain matching its current remote
    /// tuple. The local port must be the one it was hashed with.
    ///
    /// With `stamp` set, the record is given a fresh disconnect
    /// sequence after leaving its old chain, and stays invisible to
    /// lookups at its new place until that grace period has elapsed.
    pub(crate) fn rehash_locked(
        &self,
        st: &mut HashState,
        pcb: &InpcbRef,
        ps: &mut PcbState,
        stamp: bool,
    ) -> Result<()> {
        let lport = ps.lport;
        let Some(old) = st.port_entry(pcb, lport).map(|e| e.key) else {
            panic!("pcb {} rehashed while not hashed on {lport}", pcb.id());
        };
        let key = PcbKey::of(pcb, ps);
        assert_eq!(old.lport, key.lport, "local port changed across rehash");

        // A rehash always crosses between the exact and wild chains.
        let old_list = self.chain_of(&old);
        let new_list = self.chain_of(&key);
        debug_assert!(!core::ptr::eq(old_list, new_list));
        let entry =
            HashEntry { key, pcb: Arc::clone(pcb), visible_after: None };

        // Stage both chains before publishing either.
        let removed = self.chain_without(old_list, pcb);
        let mut inserted = self.chain_with(new_list, entry)?;
        old_list.publish(&st.writer, removed);

        let visible_after = if stamp {
            let seq = self.smr.advance();
            ps.smr_seq = Some(seq);
            if let Some(e) =
                inserted.iter_mut().find(|e| Arc::ptr_eq(&e.pcb, pcb))
            {
                e.visible_after = Some(seq);
            }
            Some(seq)
        } else {
            None
        };

        new_list.publish(&st.writer, inserted);

        if key.is_connected() && pcb.flags().contains(PcbFlags::INLBGROUP) {
            self.lbgroup_leave(st, pcb, &LbKey::of(&old, ps.numa));
            pcb.clear_flags(PcbFlags::INLBGROUP);
        }

        if let Some(pe) = st
            .ports
            .get_mut(&lport)
            .and_then(|v| v.iter_mut().find(|e| Arc::ptr_eq(&e.pcb, pcb)))
        {
            pe.key = key;
            pe.visible_after = visible_after;
        }

        Ok(())
    }

    /// Iterate over a snapshot of the records hashed in `scope`.
    pub fn iter(&self, scope: IterScope) -> PcbIter {
        let lists: Vec<&SmrList<HashEntry>> = match scope {
            IterScope::All => {
                self.hash_exact.iter().chain(self.hash_wild.iter()).collect()
            }
            IterScope::Exact(idx) => {
                self.hash_exact.get(idx).into_iter().collect()
            }
            IterScope::Wild(idx) => {
                self.hash_wild.get(idx).into_iter().collect()
            }
        };

        let guard = self.smr.enter();
        let pcbs: Vec<InpcbRef> = lists
            .iter()
            .flat_map(|l| l.read(&guard).iter())
            .map(|e| Arc::clone(&e.pcb))
            .collect();

        PcbIter { inner: pcbs.into_iter() }
    }

    /// Visit every record in `scope` with its lock held.
    ///
    /// Records may be unlinked or destroyed concurrently; a record found
    /// freed once its lock is held is skipped. `f` must not call back
    /// into the table for the record it is given.
    pub fn for_each<F>(&self, scope: IterScope, intent: LockIntent, mut f: F)
    where
        F: FnMut(&InpcbRef, &mut PcbLock<'_>),
    {
        for pcb in self.iter(scope) {
            let mut lock = pcb.lock(intent);
            if pcb.is_freed() {
                continue;
            }
            f(&pcb, &mut lock);
        }
    }

    /// Snapshot the table for administration tooling.
    pub fn dump(&self) -> DumpTableResp {
        let guard = self.smr.enter();
        let exact = self
            .hash_exact
            .iter()
            .flat_map(|l| l.read(&guard).iter())
            .map(HashEntry::dump)
            .collect();
        let wild = self
            .hash_wild
            .iter()
            .flat_map(|l| l.read(&guard).iter())
            .map(HashEntry::dump)
            .collect();
        let lbgroups = self
            .lbgroups
            .iter()
            .flat_map(|l| l.read(&guard).iter())
            .map(|g| g.dump())
            .collect();

        DumpTableResp {
            name: self.name.clone(),
            proto: self.cfg.proto,
            exact,
            wild,
            lbgroups,
            stats: self.stats.dump(),
        }
    }
}

/// The part of a table to iterate over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IterScope {
    All,
    /// One exact chain, by index.
    Exact(usize),
    /// One wildcard chain, by index, in precedence order.
    Wild(usize),
}

/// An iterator over a snapshot of hashed records. Records destroyed
/// after the snapshot was taken are skipped.
pub struct PcbIter {
    inner: std::vec::IntoIter<InpcbRef>,
}

impl Iterator for PcbIter {
    type Item = InpcbRef;

    fn next(&mut self) -> Option<InpcbRef> {
        self.inner.by_ref().find(|pcb| !pcb.is_freed())
    }
}
