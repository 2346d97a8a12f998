//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use crate::Fixture;

// A switch with one dynamic and one static port: the dynamic port gets the
// first free address (the subnet's first host and the exclusions are
// skipped) and a MAC under the configured prefix; the static port is
// registered as declared.
#[test]
fn dynamic_and_static_assignment() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.set_subnet(ls0, "10.0.0.0/24");
    fixture.set_exclude_ips(ls0, "10.0.0.4");
    let p1 = fixture.add_switch_port(ls0, "p1", &["dynamic"]);
    fixture.add_switch_port(ls0, "p2", &["02:00:00:00:00:10 10.0.0.50"]);
    fixture.run();

    let p1_row = fixture.nb.switch_ports.get(&p1).unwrap();
    let dynamic = p1_row.dynamic_addresses.as_deref().expect("assignment");
    assert_eq!(dynamic, "0a:00:02:00:00:03 10.0.0.2");

    // Both ports are bound and carry their effective addresses.
    let p1_binding = fixture.port_binding("p1").expect("binding");
    assert_eq!(p1_binding.mac, vec![dynamic.to_owned()]);
    let p2_binding = fixture.port_binding("p2").expect("binding");
    assert_eq!(p2_binding.mac, vec!["02:00:00:00:00:10 10.0.0.50".to_owned()]);

    // The expected admission and lookup flows exist.
    let dp = fixture.dp("ls0");
    assert!(fixture.has_flow(
        dp,
        "ls_in_port_sec_l2",
        100,
        "vlan.present || eth.src[40]"
    ));
    assert!(fixture.has_flow(dp, "ls_in_port_sec_l2", 50, "inport == \"p1\""));
    assert!(fixture.has_flow(dp, "ls_in_port_sec_l2", 50, "inport == \"p2\""));
    assert_eq!(
        fixture.flow_actions(
            dp,
            "ls_in_l2_lkup",
            50,
            "eth.dst == 02:00:00:00:00:10"
        ),
        Some("outport = \"p2\"; output;".to_owned())
    );
    assert_eq!(
        fixture.flow_actions(
            dp,
            "ls_in_l2_lkup",
            50,
            "eth.dst == 0a:00:02:00:00:03"
        ),
        Some("outport = \"p1\"; output;".to_owned())
    );
}

// Running a pass with no northbound changes produces zero writes, and
// dynamic addresses survive across passes.
#[test]
fn idempotence() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.set_subnet(ls0, "10.0.0.0/24");
    let p1 = fixture.add_switch_port(ls0, "p1", &["dynamic"]);
    fixture.add_switch_port(ls0, "p2", &["02:00:00:00:00:10 10.0.0.50"]);
    fixture.run();

    let first = fixture
        .nb
        .switch_ports
        .get(&p1)
        .unwrap()
        .dynamic_addresses
        .clone();
    assert!(first.is_some());

    let txn = fixture.run();
    assert!(
        txn.is_empty(),
        "second pass should be a no-op, got {} ops",
        txn.len()
    );
    let second = fixture
        .nb
        .switch_ports
        .get(&p1)
        .unwrap()
        .dynamic_addresses
        .clone();
    assert_eq!(first, second);
}

// Every dynamically assigned IPv4 lies in the subnet, avoids the exclusion
// set and the first address, and every assigned MAC carries the prefix.
#[test]
fn conservation() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.set_subnet(ls0, "10.0.0.0/28");
    fixture.set_exclude_ips(ls0, "10.0.0.3..10.0.0.5");
    let mut ports = Vec::new();
    for i in 0..6 {
        ports.push(fixture.add_switch_port(
            ls0,
            &format!("p{i}"),
            &["dynamic"],
        ));
    }
    fixture.run();

    let subnet: ipnetwork::Ipv4Network = "10.0.0.0/28".parse().unwrap();
    let mut seen = std::collections::BTreeSet::new();
    for port in &ports {
        let row = fixture.nb.switch_ports.get(port).unwrap();
        let dynamic = row.dynamic_addresses.as_deref().expect("assignment");
        let mut tokens = dynamic.split_whitespace();
        let mac = tokens.next().unwrap();
        let ip: std::net::Ipv4Addr = tokens.next().unwrap().parse().unwrap();

        assert!(mac.starts_with(crate::MAC_PREFIX));
        assert!(subnet.contains(ip));
        assert_ne!(ip, std::net::Ipv4Addr::new(10, 0, 0, 1));
        assert!(!(3..=5).contains(&ip.octets()[3]), "excluded ip {ip}");
        assert!(seen.insert(ip), "duplicate assignment {ip}");
    }
}

// A specifically requested address inside the subnet is honored; a taken
// one degrades to a fresh allocation.
#[test]
fn specific_requests() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.set_subnet(ls0, "10.0.0.0/24");
    fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:10 10.0.0.7"]);
    let p2 = fixture.add_switch_port(ls0, "p2", &["dynamic 10.0.0.9"]);
    let p3 = fixture.add_switch_port(ls0, "p3", &["dynamic 10.0.0.7"]);
    fixture.run();

    let p2_dynamic = fixture
        .nb
        .switch_ports
        .get(&p2)
        .unwrap()
        .dynamic_addresses
        .clone()
        .expect("assignment");
    assert!(p2_dynamic.ends_with(" 10.0.0.9"));

    // 10.0.0.7 is statically taken; p3 gets a dynamic address instead.
    let p3_dynamic = fixture
        .nb
        .switch_ports
        .get(&p3)
        .unwrap()
        .dynamic_addresses
        .clone()
        .expect("assignment");
    assert!(!p3_dynamic.ends_with(" 10.0.0.7"));
    assert!(p3_dynamic.contains(" 10.0.0."));
}

// EUI-64 IPv6 assignment from the switch prefix.
#[test]
fn ipv6_from_prefix() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.set_subnet(ls0, "10.0.0.0/24");
    fixture
        .nb
        .switches
        .get_mut(&ls0)
        .unwrap()
        .other_config
        .insert("ipv6_prefix".to_owned(), "fd00::".to_owned());
    let p1 = fixture.add_switch_port(ls0, "p1", &["dynamic"]);
    fixture.run();

    let dynamic = fixture
        .nb
        .switch_ports
        .get(&p1)
        .unwrap()
        .dynamic_addresses
        .clone()
        .expect("assignment");
    // MAC 0a:00:02:00:00:03 -> EUI-64 interface id 0800:02ff:fe00:3.
    assert_eq!(
        dynamic,
        "0a:00:02:00:00:03 10.0.0.2 fd00::800:2ff:fe00:3"
    );
}
