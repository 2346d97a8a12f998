//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use holo_northd::allocator::{Ipam, MacSet, TagAllocator, TnlKeySpace};
use holo_utils::mac_addr::{MacAddr, MacPrefix};

#[test]
fn tnl_key_smallest_above_hint() {
    let mut space = TnlKeySpace::new("test", 1, 10);
    space.set_hint(5);
    assert_eq!(space.allocate(), 6);
    assert_eq!(space.allocate(), 7);
}

#[test]
fn tnl_key_skips_marked() {
    let mut space = TnlKeySpace::new("test", 1, 10);
    space.set_hint(5);
    space.mark(6);
    space.mark(7);
    assert_eq!(space.allocate(), 8);
}

#[test]
fn tnl_key_wraps_at_max() {
    let mut space = TnlKeySpace::new("test", 1, 10);
    space.set_hint(9);
    assert_eq!(space.allocate(), 10);
    assert_eq!(space.allocate(), 1);
}

#[test]
fn tnl_key_exhaustion_returns_zero() {
    let mut space = TnlKeySpace::new("test", 1, 3);
    assert_ne!(space.allocate(), 0);
    assert_ne!(space.allocate(), 0);
    assert_ne!(space.allocate(), 0);
    assert_eq!(space.allocate(), 0);
}

#[test]
fn tnl_key_uniqueness() {
    let mut space = TnlKeySpace::new("test", 1, 100);
    let mut keys = std::collections::BTreeSet::new();
    for _ in 0..100 {
        let key = space.allocate();
        assert_ne!(key, 0);
        assert!(keys.insert(key), "duplicate key {key}");
    }
}

#[test]
fn tag_lowest_free() {
    let mut tags = TagAllocator::default();
    tags.mark("parent", 1);
    tags.mark("parent", 3);
    assert_eq!(tags.allocate("parent"), 2);
    assert_eq!(tags.allocate("parent"), 4);
    // Other parents have their own space.
    assert_eq!(tags.allocate("other"), 1);
}

#[test]
fn mac_suffix_derived_from_ipv4() {
    let prefix: MacPrefix = "0a:00:02".parse().unwrap();
    let mut macs = MacSet::new(prefix);
    let mac = macs
        .allocate(Some(Ipv4Addr::new(10, 0, 0, 2)))
        .expect("allocation");
    // The probe starts at the low 24 bits of the address.
    assert_eq!(mac.to_string(), "0a:00:02:00:00:03");
}

#[test]
fn mac_probe_skips_collisions() {
    let prefix: MacPrefix = "0a:00:02".parse().unwrap();
    let mut macs = MacSet::new(prefix);
    let taken: MacAddr = "0a:00:02:00:00:03".parse().unwrap();
    macs.add(taken, false, "p0");
    let mac = macs
        .allocate(Some(Ipv4Addr::new(10, 0, 0, 2)))
        .expect("allocation");
    assert_eq!(mac.to_string(), "0a:00:02:00:00:04");
}

#[test]
fn mac_foreign_prefix_ignored() {
    let prefix: MacPrefix = "0a:00:02".parse().unwrap();
    let mut macs = MacSet::new(prefix);
    let foreign: MacAddr = "02:00:00:00:00:01".parse().unwrap();
    macs.add(foreign, true, "p0");
    assert!(!macs.contains(&foreign));
}

#[test]
fn ipam_first_free_skips_reserved() {
    let subnet = "10.0.0.0/24".parse().unwrap();
    let mut ipam = Ipam::new(subnet).expect("usable subnet");
    // The first host address is reserved.
    assert_eq!(ipam.allocate("ls0"), Some(Ipv4Addr::new(10, 0, 0, 2)));
    assert_eq!(ipam.allocate("ls0"), Some(Ipv4Addr::new(10, 0, 0, 3)));
}

#[test]
fn ipam_exclusions() {
    let subnet = "10.0.0.0/28".parse().unwrap();
    let mut ipam = Ipam::new(subnet).expect("usable subnet");
    ipam.exclude("10.0.0.2 10.0.0.4..10.0.0.6", "ls0");
    assert_eq!(ipam.allocate("ls0"), Some(Ipv4Addr::new(10, 0, 0, 3)));
    assert_eq!(ipam.allocate("ls0"), Some(Ipv4Addr::new(10, 0, 0, 7)));
}

#[test]
fn ipam_exclusion_outside_subnet_reported() {
    let subnet = "10.0.0.0/28".parse().unwrap();
    let mut ipam = Ipam::new(subnet).expect("usable subnet");
    // Ignored, does not panic and does not consume anything.
    ipam.exclude("10.1.0.1", "ls0");
    assert_eq!(ipam.allocate("ls0"), Some(Ipv4Addr::new(10, 0, 0, 2)));
}

#[test]
fn ipam_exhaustion() {
    let subnet = "10.0.0.0/30".parse().unwrap();
    let mut ipam = Ipam::new(subnet).expect("usable subnet");
    // A /30 has two hosts and the first is reserved.
    assert_eq!(ipam.allocate("ls0"), Some(Ipv4Addr::new(10, 0, 0, 2)));
    assert_eq!(ipam.allocate("ls0"), None);
}

#[test]
fn ipam_mark_rejects_taken_and_foreign() {
    let subnet = "10.0.0.0/24".parse().unwrap();
    let mut ipam = Ipam::new(subnet).expect("usable subnet");
    assert!(ipam.mark(Ipv4Addr::new(10, 0, 0, 50)));
    assert!(!ipam.mark(Ipv4Addr::new(10, 0, 0, 50)));
    assert!(!ipam.mark(Ipv4Addr::new(10, 0, 1, 1)));
    // The network's own address is never assignable.
    assert!(!ipam.mark(Ipv4Addr::new(10, 0, 0, 0)));
}
