//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use holo_northd::nb::{AclAction, AclDirection};

use crate::Fixture;

// Load-balancer plumbing: defrag marking on the VIP, the ct_lb dispatch on
// new connections, and the established-connection NAT flag.
#[test]
fn load_balancer() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);
    fixture.add_load_balancer(
        ls0,
        "10.0.0.100:80",
        "10.0.0.5:8080,10.0.0.6:8080",
    );
    fixture.run();

    let dp = fixture.dp("ls0");
    assert_eq!(
        fixture.flow_actions(
            dp,
            "ls_in_pre_lb",
            100,
            "ip && ip4.dst == 10.0.0.100"
        ),
        Some("reg0[0] = 1; next;".to_owned())
    );
    assert_eq!(
        fixture.flow_actions(
            dp,
            "ls_in_stateful",
            120,
            "ct.new && ip4.dst == 10.0.0.100 && tcp.dst == 80"
        ),
        Some("ct_lb(10.0.0.5:8080,10.0.0.6:8080);".to_owned())
    );
    assert_eq!(
        fixture.flow_actions(
            dp,
            "ls_in_lb",
            u16::MAX,
            "ct.est && !ct.rel && !ct.new && !ct.inv"
        ),
        Some("reg0[2] = 1; next;".to_owned())
    );
    // The VIP marks egress too.
    assert!(fixture.has_flow(dp, "ls_out_pre_lb", 100, "ip"));
}

// A VIP without a port dispatches at priority 110.
#[test]
fn load_balancer_no_port() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);
    fixture.add_load_balancer(ls0, "10.0.0.100", "10.0.0.5:8080");
    fixture.run();

    let dp = fixture.dp("ls0");
    assert!(fixture.has_flow(
        dp,
        "ls_in_stateful",
        110,
        "ct.new && ip4.dst == 10.0.0.100"
    ));
}

// Reject ACLs synthesize TCP resets (both families) ten priority points
// above the ICMP unreachable handlers.
#[test]
fn reject_acl() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);
    fixture.add_acl(
        ls0,
        AclDirection::FromLport,
        100,
        "ip4.dst == 10.0.0.99",
        AclAction::Reject,
    );
    fixture.run();

    let dp = fixture.dp("ls0");
    let flows = fixture.stage_flows(dp, "ls_in_acl");
    let rst_v4 = flows.iter().any(|(priority, match_, actions)| {
        *priority == 1110
            && match_.starts_with("tcp && ip4 && ")
            && actions.starts_with("tcp_reset {")
    });
    let rst_v6 = flows.iter().any(|(priority, match_, actions)| {
        *priority == 1110
            && match_.starts_with("tcp && ip6 && ")
            && actions.starts_with("tcp_reset {")
    });
    let unreach = flows.iter().any(|(priority, match_, actions)| {
        *priority == 1100
            && match_.starts_with("ip4 && ")
            && actions.starts_with("icmp4 {")
    });
    assert!(rst_v4, "missing IPv4 TCP reset handler");
    assert!(rst_v6, "missing IPv6 TCP reset handler");
    assert!(unreach, "missing ICMP unreachable handler");
}

// With a stateful ACL present, every IP packet is defrag-marked in PRE_ACL
// and the universal priority-65535 patterns appear in both directions.
#[test]
fn stateful_closure() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);
    fixture.add_acl(
        ls0,
        AclDirection::ToLport,
        100,
        "tcp.dst == 22",
        AclAction::AllowRelated,
    );
    fixture.run();

    let dp = fixture.dp("ls0");
    for stage in ["ls_in_pre_acl", "ls_out_pre_acl"] {
        assert_eq!(
            fixture.flow_actions(dp, stage, 100, "ip"),
            Some("reg0[0] = 1; next;".to_owned())
        );
    }
    for stage in ["ls_in_acl", "ls_out_acl"] {
        assert_eq!(
            fixture.flow_actions(
                dp,
                stage,
                u16::MAX,
                "ct.inv || (ct.est && ct.rpl && ct_label.blocked == 1)"
            ),
            Some("drop;".to_owned())
        );
    }
    // User priority is offset by 1000.
    let flows = fixture.stage_flows(dp, "ls_out_acl");
    assert!(flows.iter().any(|(priority, match_, _)| {
        *priority == 1100 && match_.contains("(tcp.dst == 22)")
    }));
}

// Without stateful ACLs no conntrack marking happens.
#[test]
fn stateless_acl() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);
    fixture.add_acl(
        ls0,
        AclDirection::FromLport,
        100,
        "tcp.dst == 22",
        AclAction::Allow,
    );
    fixture.run();

    let dp = fixture.dp("ls0");
    assert!(!fixture.has_flow(dp, "ls_in_pre_acl", 100, "ip"));
    assert_eq!(
        fixture.flow_actions(dp, "ls_in_acl", 1100, "tcp.dst == 22"),
        Some("next;".to_owned())
    );
}

// Synthetic per-port-group address sets: one per family, union of member
// addresses; the IPv6 one stays empty here.
#[test]
fn port_group_address_sets() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    let p1 = fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.2"]);
    let p2 =
        fixture.add_switch_port(ls0, "p2", &["02:00:00:00:00:02 10.0.0.50"]);
    fixture.add_port_group("pg0", &[p1, p2]);
    fixture.run();

    let ip4 = fixture
        .sb
        .address_sets
        .values()
        .find(|set| set.name == "pg0_ip4")
        .expect("pg0_ip4");
    assert_eq!(ip4.addresses, vec!["10.0.0.2", "10.0.0.50"]);
    let ip6 = fixture
        .sb
        .address_sets
        .values()
        .find(|set| set.name == "pg0_ip6")
        .expect("pg0_ip6");
    assert!(ip6.addresses.is_empty());

    // The southbound port group carries the member names.
    let pg = fixture
        .sb
        .port_groups
        .values()
        .find(|pg| pg.name == "pg0")
        .expect("pg0");
    assert_eq!(pg.ports, vec!["p1", "p2"]);
}

// Port security: admission constrains the source MAC, the ARP/ND stage
// pins the protocol addresses, and egress reception is filtered.
#[test]
fn port_security() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    let p1 = fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);
    fixture
        .nb
        .switch_ports
        .get_mut(&p1)
        .unwrap()
        .port_security
        .push("02:00:00:00:00:01 10.0.0.5".to_owned());
    fixture.run();

    let dp = fixture.dp("ls0");
    assert!(fixture.has_flow(
        dp,
        "ls_in_port_sec_l2",
        50,
        "inport == \"p1\" && eth.src == {02:00:00:00:00:01}"
    ));
    assert!(fixture.has_flow(
        dp,
        "ls_in_port_sec_ip",
        90,
        "inport == \"p1\" && eth.src == 02:00:00:00:00:01 && ip4.src == \
         {10.0.0.5/32}"
    ));
    assert!(fixture.has_flow(
        dp,
        "ls_in_port_sec_nd",
        80,
        "inport == \"p1\" && (arp || nd)"
    ));
    assert!(fixture.has_flow(
        dp,
        "ls_out_port_sec_ip",
        90,
        "outport == \"p1\" && eth.dst == 02:00:00:00:00:01 && ip4.dst == \
         {255.255.255.255, 224.0.0.0/4, 10.0.0.5/32}"
    ));
}

// Disabled ports get no admission flow and an egress flood guard.
#[test]
fn disabled_port() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    let p1 = fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);
    fixture.nb.switch_ports.get_mut(&p1).unwrap().enabled = Some(false);
    fixture.run();

    let dp = fixture.dp("ls0");
    assert!(!fixture.has_flow(dp, "ls_in_port_sec_l2", 50, "inport == \"p1\""));
    assert_eq!(
        fixture.flow_actions(
            dp,
            "ls_out_port_sec_l2",
            150,
            "outport == \"p1\""
        ),
        Some("drop;".to_owned())
    );
}

// ARP responses are answered for known addresses, with the owner exempted
// so duplicate address detection keeps working.
#[test]
fn arp_responder() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);
    fixture.run();

    let dp = fixture.dp("ls0");
    assert_eq!(
        fixture.flow_actions(
            dp,
            "ls_in_arp_rsp",
            100,
            "arp.tpa == 10.0.0.5 && arp.op == 1 && inport == \"p1\""
        ),
        Some("next;".to_owned())
    );
    let reply = fixture
        .flow_actions(dp, "ls_in_arp_rsp", 50, "arp.tpa == 10.0.0.5 && arp.op == 1")
        .expect("responder flow");
    assert!(reply.contains("eth.src = 02:00:00:00:00:01;"));
    assert!(reply.contains("arp.spa = 10.0.0.5;"));
}

// Unknown-MAC handling: ports declaring "unknown" join the reserved group
// and the table miss forwards there.
#[test]
fn unknown_addresses() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "p1", &["unknown"]);
    fixture.run();

    let dp = fixture.dp("ls0");
    assert_eq!(
        fixture.flow_actions(dp, "ls_in_l2_lkup", 0, "1"),
        Some("outport = \"_MC_unknown\"; output;".to_owned())
    );
    let group = fixture
        .sb
        .multicast_groups
        .values()
        .find(|group| group.datapath == dp && group.name == "_MC_unknown")
        .expect("unknown group");
    assert_eq!(group.ports, vec!["p1"]);
    assert_eq!(group.tunnel_key, 65534);
}

// DNS lookup and response flows appear once the switch carries records.
#[test]
fn dns_flows() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "p1", &["02:00:00:00:00:01 10.0.0.5"]);

    let dns_uuid = uuid::Uuid::new_v4();
    let mut records = std::collections::BTreeMap::new();
    records.insert("vm1.local".to_owned(), "10.0.0.5".to_owned());
    fixture.nb.dns_records.insert(
        dns_uuid,
        holo_northd::nb::Dns {
            uuid: dns_uuid,
            records,
            external_ids: Default::default(),
        },
    );
    fixture
        .nb
        .switches
        .get_mut(&ls0)
        .unwrap()
        .dns_records
        .push(dns_uuid);
    fixture.run();

    let dp = fixture.dp("ls0");
    assert_eq!(
        fixture.flow_actions(dp, "ls_in_dns_lookup", 100, "udp.dst == 53"),
        Some("reg0[4] = dns_lookup(); next;".to_owned())
    );
    assert!(fixture.has_flow(
        dp,
        "ls_in_dns_response",
        100,
        "udp.dst == 53 && reg0[4] && ip4"
    ));

    // The record set is mirrored with its identity stamped.
    let row = fixture
        .sb
        .dns
        .values()
        .find(|row| {
            row.external_ids.get("dns_id").map(String::as_str)
                == Some(&dns_uuid.to_string())
        })
        .expect("dns row");
    assert_eq!(row.datapaths, vec![dp]);
}
