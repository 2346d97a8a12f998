//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Identifier allocators.
//
// Every allocator is a plain state object: it owns its used-set and hint and
// has no side effects outside itself. Exhaustion never aborts; it logs a
// rate-limited warning and returns a sentinel the caller checks for.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use holo_utils::ip::Ipv4NetworkExt;
use holo_utils::mac_addr::{MacAddr, MacPrefix};
use ipnetwork::Ipv4Network;

use crate::error::{Error, RateLimit};

// Datapath tunnel keys are 24-bit.
pub const DP_TNL_KEY_MIN: u32 = 1;
pub const DP_TNL_KEY_MAX: u32 = (1 << 24) - 1;

// Port tunnel keys are 15-bit, scoped to their datapath.
pub const PORT_TNL_KEY_MIN: u32 = 1;
pub const PORT_TNL_KEY_MAX: u32 = (1 << 15) - 1;

// Multicast group keys live above the port key range.
pub const MCAST_KEY_MIN: u32 = 32768;
pub const MCAST_KEY_MAX: u32 = 65530;

// Per-chassis QoS queue ids.
pub const QDISC_MIN_QUEUE_ID: u32 = 0;
pub const QDISC_MAX_QUEUE_ID: u32 = 0xff;

// Nested-container VLAN tags.
pub const TAG_MIN: u16 = 1;
pub const TAG_MAX: u16 = 4095;

const MAC_ADDR_SPACE: u32 = 0xffffff;

// ===== TnlKeySpace =====

// Tunnel-key allocator with wrap-around.
//
// Returns the smallest unused integer strictly above the hint, wrapping at
// `max` back to `min`; 0 on exhaustion.
#[derive(Debug)]
pub struct TnlKeySpace {
    name: &'static str,
    min: u32,
    max: u32,
    in_use: BTreeSet<u32>,
    hint: u32,
    warn: RateLimit,
}

impl TnlKeySpace {
    pub fn new(name: &'static str, min: u32, max: u32) -> TnlKeySpace {
        TnlKeySpace {
            name,
            min,
            max,
            in_use: Default::default(),
            hint: max,
            warn: RateLimit::per_5s(),
        }
    }

    pub fn hint(&self) -> u32 {
        self.hint
    }

    // Seeds the hint so the next allocation starts probing above `hint`.
    pub fn set_hint(&mut self, hint: u32) {
        if hint >= self.min && hint <= self.max {
            self.hint = hint;
        }
    }

    pub fn mark(&mut self, key: u32) -> bool {
        self.in_use.insert(key)
    }

    pub fn contains(&self, key: u32) -> bool {
        self.in_use.contains(&key)
    }

    pub fn allocate(&mut self) -> u32 {
        let mut key = self.next(self.hint);
        while key != self.hint {
            if self.in_use.insert(key) {
                self.hint = key;
                return key;
            }
            key = self.next(key);
        }
        // The hint itself is the last candidate.
        if self.in_use.insert(key) {
            return key;
        }

        if self.warn.check() {
            Error::TnlKeyExhaustion(self.name).log();
        }
        0
    }

    fn next(&self, key: u32) -> u32 {
        if key >= self.max {
            self.min
        } else {
            key + 1
        }
    }
}

// ===== QueueIdAllocator =====

// Per-chassis allocator for 8-bit QoS queue ids.
#[derive(Debug, Default)]
pub struct QueueIdAllocator {
    in_use: BTreeMap<String, BTreeSet<u32>>,
    warn: RateLimit,
}

impl QueueIdAllocator {
    pub fn mark(&mut self, chassis: &str, queue_id: u32) {
        self.in_use
            .entry(chassis.to_owned())
            .or_default()
            .insert(queue_id);
    }

    pub fn allocate(&mut self, chassis: &str) -> u32 {
        let used = self.in_use.entry(chassis.to_owned()).or_default();
        for queue_id in QDISC_MIN_QUEUE_ID + 1..=QDISC_MAX_QUEUE_ID {
            if used.insert(queue_id) {
                return queue_id;
            }
        }

        if self.warn.check() {
            Error::QueueIdExhaustion(chassis.to_owned()).log();
        }
        0
    }

    pub fn release(&mut self, chassis: &str, queue_id: u32) {
        if let Some(used) = self.in_use.get_mut(chassis) {
            used.remove(&queue_id);
        }
    }
}

// ===== TagAllocator =====

// Per-parent allocator for nested-container VLAN tags (1..4095). Tag 0 is
// never valid; tags already present on sibling ports are pre-marked by the
// caller.
#[derive(Debug, Default)]
pub struct TagAllocator {
    in_use: BTreeMap<String, BTreeSet<u16>>,
    warn: RateLimit,
}

impl TagAllocator {
    pub fn mark(&mut self, parent: &str, tag: u16) {
        self.in_use.entry(parent.to_owned()).or_default().insert(tag);
    }

    pub fn allocate(&mut self, parent: &str) -> u16 {
        let used = self.in_use.entry(parent.to_owned()).or_default();
        for tag in TAG_MIN..=TAG_MAX {
            if used.insert(tag) {
                return tag;
            }
        }

        if self.warn.check() {
            Error::TagExhaustion(parent.to_owned()).log();
        }
        0
    }
}

// ===== MacSet =====

// Process-wide set of every MAC address allocated (or observed) under the
// configured 24-bit prefix. Survives across reconciliation passes.
#[derive(Debug)]
pub struct MacSet {
    prefix: MacPrefix,
    suffixes: BTreeSet<u32>,
    warn: RateLimit,
}

impl MacSet {
    pub fn new(prefix: MacPrefix) -> MacSet {
        MacSet {
            prefix,
            suffixes: Default::default(),
            warn: RateLimit::per_5s(),
        }
    }

    pub fn prefix(&self) -> MacPrefix {
        self.prefix
    }

    // Registers an address. Addresses outside the configured prefix are
    // ignored; with `check_dup`, an already-present address is reported.
    pub fn add(&mut self, mac: MacAddr, check_dup: bool, object: &str) {
        if mac.prefix() != self.prefix {
            return;
        }
        if !self.suffixes.insert(mac.suffix()) && check_dup {
            Error::DuplicateMacAddr(object.to_owned(), mac.to_string()).log();
        }
    }

    pub fn contains(&self, mac: &MacAddr) -> bool {
        mac.prefix() == self.prefix && self.suffixes.contains(&mac.suffix())
    }

    // Finds an unused address. The probe starts at a suffix derived from the
    // target IPv4 address, so that MACs correlate with IPs when possible, and
    // walks the 24-bit suffix space linearly.
    pub fn allocate(&mut self, ip: Option<Ipv4Addr>) -> Option<MacAddr> {
        let base = ip.map(|ip| u32::from(ip) & MAC_ADDR_SPACE).unwrap_or(0);
        for i in 0..MAC_ADDR_SPACE - 1 {
            let suffix = (base.wrapping_add(i) % (MAC_ADDR_SPACE - 1)) + 1;
            if !self.suffixes.contains(&suffix) {
                return Some(MacAddr::from_parts(self.prefix, suffix));
            }
        }

        if self.warn.check() {
            Error::MacExhaustion.log();
        }
        None
    }
}

// ===== Ipam =====

// Per-switch IPv4 allocation state: the first assignable address, the number
// of assignable addresses (network and broadcast excluded) and an allocation
// bitmap. The subnet's first host address is reserved for the attached
// router port and is pre-marked.
#[derive(Debug)]
pub struct Ipam {
    subnet: Ipv4Network,
    start: u32,
    total: u32,
    allocated: Vec<u64>,
    warn: RateLimit,
}

impl Ipam {
    pub fn new(subnet: Ipv4Network) -> Option<Ipam> {
        let total = subnet.host_count();
        if total == 0 {
            return None;
        }

        let start = u32::from(subnet.network()) + 1;
        let words = (total as usize).div_ceil(64);
        let mut ipam = Ipam {
            subnet,
            start,
            total,
            allocated: vec![0; words],
            warn: RateLimit::per_5s(),
        };
        // First address of the subnet.
        ipam.set_bit(0);
        Some(ipam)
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    // Applies an exclusion specification: whitespace-separated single
    // addresses and "A..B" ranges. Addresses outside the subnet are reported
    // and skipped.
    pub fn exclude(&mut self, spec: &str, object: &str) {
        for token in spec.split_whitespace() {
            let (lo, hi) = match token.split_once("..") {
                Some((lo, hi)) => (lo, hi),
                None => (token, token),
            };
            let (Ok(lo), Ok(hi)) =
                (lo.parse::<Ipv4Addr>(), hi.parse::<Ipv4Addr>())
            else {
                Error::BadExcludeIp(object.to_owned(), token.to_owned()).log();
                continue;
            };
            if self.index_of(lo).is_none() || self.index_of(hi).is_none() {
                Error::BadExcludeIp(object.to_owned(), token.to_owned()).log();
                continue;
            }
            let mut addr = u32::from(lo);
            while addr <= u32::from(hi) {
                self.set_bit(addr - self.start);
                addr += 1;
            }
        }
    }

    // Marks an address as in use. Returns false if the address is outside
    // the assignable range or already taken.
    pub fn mark(&mut self, addr: Ipv4Addr) -> bool {
        match self.index_of(addr) {
            Some(index) if !self.get_bit(index) => {
                self.set_bit(index);
                true
            }
            _ => false,
        }
    }

    pub fn is_assignable(&self, addr: Ipv4Addr) -> bool {
        matches!(self.index_of(addr), Some(index) if !self.get_bit(index))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.index_of(addr).is_some()
    }

    // First-free-bit scan.
    pub fn allocate(&mut self, object: &str) -> Option<Ipv4Addr> {
        for (word_index, word) in self.allocated.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let index = word_index as u32 * 64 + bit;
            if index >= self.total {
                break;
            }
            *word |= 1 << bit;
            return Some(Ipv4Addr::from(self.start + index));
        }

        if self.warn.check() {
            Error::Ipv4Exhaustion(object.to_owned()).log();
        }
        None
    }

    fn index_of(&self, addr: Ipv4Addr) -> Option<u32> {
        let addr = u32::from(addr);
        if addr < self.start || addr - self.start >= self.total {
            return None;
        }
        Some(addr - self.start)
    }

    fn set_bit(&mut self, index: u32) {
        self.allocated[index as usize / 64] |= 1 << (index % 64);
    }

    fn get_bit(&self, index: u32) -> bool {
        self.allocated[index as usize / 64] & (1 << (index % 64)) != 0
    }
}
