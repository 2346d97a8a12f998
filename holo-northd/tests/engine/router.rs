//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use holo_northd::nb::NatType;

use crate::Fixture;

// A static route through the second port: the priority encodes the prefix
// length and the actions program the next hop registers.
#[test]
fn static_route() {
    let mut fixture = Fixture::new();
    let lr0 = fixture.add_router("lr0");
    fixture.add_router_port(
        lr0,
        "lr0-a",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.add_router_port(
        lr0,
        "lr0-b",
        "40:00:00:00:00:02",
        &["10.0.1.1/24"],
    );
    fixture.add_static_route(lr0, "10.0.2.0/24", "10.0.1.2");
    fixture.run();

    let dp = fixture.dp("lr0");
    assert_eq!(
        fixture.flow_actions(
            dp,
            "lr_in_ip_routing",
            49,
            "ip4.dst == 10.0.2.0/24"
        ),
        Some(
            "ip.ttl--; reg0 = 10.0.1.2; reg1 = 10.0.1.1; eth.src = \
             40:00:00:00:00:02; outport = \"lr0-b\"; flags.loopback = 1; \
             next;"
                .to_owned()
        )
    );

    // Connected routes for both ports at the same priority.
    assert!(fixture.has_flow(
        dp,
        "lr_in_ip_routing",
        49,
        "ip4.dst == 10.0.0.0/24"
    ));
    assert!(fixture.has_flow(
        dp,
        "lr_in_ip_routing",
        49,
        "ip4.dst == 10.0.1.0/24"
    ));
}

// Longest-prefix ordering: a longer prefix always wins, and for the same
// length a destination route beats a source route by exactly one.
#[test]
fn route_priorities() {
    let mut fixture = Fixture::new();
    let lr0 = fixture.add_router("lr0");
    fixture.add_router_port(
        lr0,
        "lr0-a",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.add_static_route(lr0, "172.16.0.0/16", "10.0.0.2");
    fixture.add_static_route(lr0, "172.16.1.0/24", "10.0.0.2");
    let src = fixture.add_static_route(lr0, "172.16.2.0/24", "10.0.0.2");
    fixture
        .nb
        .static_routes
        .get_mut(&src)
        .unwrap()
        .policy = Some(holo_northd::nb::RoutePolicy::SrcIp);
    fixture.run();

    let dp = fixture.dp("lr0");
    assert!(fixture.has_flow(
        dp,
        "lr_in_ip_routing",
        33,
        "ip4.dst == 172.16.0.0/16"
    ));
    assert!(fixture.has_flow(
        dp,
        "lr_in_ip_routing",
        49,
        "ip4.dst == 172.16.1.0/24"
    ));
    assert!(fixture.has_flow(
        dp,
        "lr_in_ip_routing",
        48,
        "ip4.src == 172.16.2.0/24"
    ));
}

// Distributed gateway with a fully distributed dnat_and_snat rule: derived
// redirect port, HA group, and the admission/DNAT/UNDNAT flows bound to
// the right chassis.
#[test]
fn distributed_gateway_nat() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "vm1", &["02:00:00:00:00:05 10.0.0.5"]);
    let lr0 = fixture.add_router("lr0");
    fixture.add_router_port(
        lr0,
        "lr0-sw",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.connect(ls0, "lr0-sw");
    let ext = fixture.add_router_port(
        lr0,
        "lr0-ext",
        "40:00:00:00:00:02",
        &["172.16.0.1/24"],
    );
    fixture.add_gateway_chassis(ext, "hv1", 0);
    let nat = fixture.add_nat(
        lr0,
        NatType::DnatAndSnat,
        "172.16.0.10",
        "10.0.0.5",
    );
    {
        let nat = fixture.nb.nat_rules.get_mut(&nat).unwrap();
        nat.external_mac = Some("aa:aa:aa:aa:aa:aa".to_owned());
        nat.logical_port = Some("vm1".to_owned());
    }
    fixture.run();

    // The derived redirect port shadows the gateway port.
    let redirect = fixture.port_binding("cr-lr0-ext").expect("redirect port");
    assert_eq!(redirect.port_type, "chassisredirect");
    assert_eq!(
        redirect.options.get("distributed-port").map(String::as_str),
        Some("lr0-ext")
    );

    // One HA group named after the gateway port, with the lone chassis.
    let group = fixture
        .sb
        .ha_chassis_groups
        .values()
        .find(|group| group.name == "lr0-ext")
        .expect("ha group");
    assert_eq!(group.ha_chassis.len(), 1);
    assert_eq!(group.ha_chassis[0].chassis, "hv1");
    assert_eq!(redirect.ha_chassis_group, Some(group.uuid));

    let dp = fixture.dp("lr0");
    assert!(fixture.has_flow(
        dp,
        "lr_in_admission",
        50,
        "eth.dst == aa:aa:aa:aa:aa:aa && inport == \"lr0-ext\" && \
         is_chassis_resident(\"vm1\")"
    ));
    assert_eq!(
        fixture.flow_actions(
            dp,
            "lr_in_dnat",
            100,
            "ip && ip4.dst == 172.16.0.10 && inport == \"lr0-ext\""
        ),
        Some("ct_dnat(10.0.0.5);".to_owned())
    );
    let undnat = fixture
        .flow_actions(
            dp,
            "lr_out_undnat",
            100,
            "ip && ip4.src == 10.0.0.5 && outport == \"lr0-ext\" && \
             is_chassis_resident(\"vm1\")",
        )
        .expect("undnat flow");
    assert_eq!(undnat, "eth.src = aa:aa:aa:aa:aa:aa; ct_dnat;");

    // The gateway redirect bypass keeps the flow distributed, and the
    // general redirect still exists underneath.
    assert!(fixture.has_flow(
        dp,
        "lr_in_gw_redirect",
        100,
        "ip4.src == 10.0.0.5 && outport == \"lr0-ext\""
    ));
    assert_eq!(
        fixture.flow_actions(dp, "lr_in_gw_redirect", 50, "outport == \"lr0-ext\""),
        Some("outport = \"cr-lr0-ext\"; next;".to_owned())
    );
}

// A gateway router (bound to a chassis) applies NAT without residency
// guards and SNAT priority encodes the logical prefix length.
#[test]
fn gateway_router_snat() {
    let mut fixture = Fixture::new();
    let lr0 = fixture.add_router("lr0");
    fixture
        .nb
        .routers
        .get_mut(&lr0)
        .unwrap()
        .options
        .insert("chassis".to_owned(), "hv1".to_owned());
    fixture.add_router_port(
        lr0,
        "lr0-a",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.add_nat(lr0, NatType::Snat, "172.16.0.10", "10.0.0.0/24");
    fixture.run();

    let dp = fixture.dp("lr0");
    assert_eq!(
        fixture.flow_actions(
            dp,
            "lr_in_unsnat",
            90,
            "ip && ip4.dst == 172.16.0.10"
        ),
        Some("ct_snat;".to_owned())
    );
    assert_eq!(
        fixture.flow_actions(
            dp,
            "lr_out_snat",
            25,
            "ip && ip4.src == 10.0.0.0/24"
        ),
        Some("ct_snat(172.16.0.10);".to_owned())
    );
    // The port binding reflects the chassis-bound router.
    let binding = fixture.port_binding("lr0-a").expect("binding");
    assert_eq!(binding.port_type, "l3gateway");
}

// IP input basics: echo replies, ARP ownership, TTL exceeded, and the
// router-owned-address drop that spares SNAT addresses.
#[test]
fn ip_input() {
    let mut fixture = Fixture::new();
    let lr0 = fixture.add_router("lr0");
    fixture
        .nb
        .routers
        .get_mut(&lr0)
        .unwrap()
        .options
        .insert("chassis".to_owned(), "hv1".to_owned());
    fixture.add_router_port(
        lr0,
        "lr0-a",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.add_nat(lr0, NatType::Snat, "10.0.0.1", "10.0.0.0/24");
    fixture.run();

    let dp = fixture.dp("lr0");
    assert!(fixture.has_flow(
        dp,
        "lr_in_ip_input",
        90,
        "ip4.dst == {10.0.0.1} && icmp4.type == 8 && icmp4.code == 0"
    ));
    assert!(fixture.has_flow(
        dp,
        "lr_in_ip_input",
        90,
        "inport == \"lr0-a\" && arp.spa == 10.0.0.0/24 && arp.tpa == \
         10.0.0.1 && arp.op == 1"
    ));
    assert!(fixture.has_flow(
        dp,
        "lr_in_ip_input",
        40,
        "inport == \"lr0-a\" && ip4 && ip.ttl == {0, 1} && !ip.later_frag"
    ));
    // 10.0.0.1 is a SNAT address and must stay receivable: no drop flow.
    assert!(!fixture.has_flow(dp, "lr_in_ip_input", 60, "ip4.dst == {10.0.0.1}"));
    assert!(fixture.has_flow(dp, "lr_in_ip_input", 85, "arp || nd"));
}

// Neighbor lookup and learning stages.
#[test]
fn neighbor_stages() {
    let mut fixture = Fixture::new();
    let lr0 = fixture.add_router("lr0");
    fixture.add_router_port(
        lr0,
        "lr0-a",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.run();

    let dp = fixture.dp("lr0");
    assert_eq!(
        fixture.flow_actions(dp, "lr_in_lookup_neighbor", 100, "arp.op == 2"),
        Some(
            "reg9[4] = lookup_arp(inport, arp.spa, arp.sha); next;"
                .to_owned()
        )
    );
    assert_eq!(
        fixture.flow_actions(dp, "lr_in_learn_neighbor", 100, "reg9[4] == 1"),
        Some("next;".to_owned())
    );
    assert_eq!(
        fixture.flow_actions(dp, "lr_in_learn_neighbor", 90, "arp"),
        Some("put_arp(inport, arp.spa, arp.sha);".to_owned())
    );
}

// ARP resolution knows the MAC of every address on an attached switch.
#[test]
fn arp_resolve_known_hosts() {
    let mut fixture = Fixture::new();
    let ls0 = fixture.add_switch("ls0");
    fixture.add_switch_port(ls0, "vm1", &["02:00:00:00:00:05 10.0.0.5"]);
    let lr0 = fixture.add_router("lr0");
    fixture.add_router_port(
        lr0,
        "lr0-sw",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.connect(ls0, "lr0-sw");
    fixture.run();

    let dp = fixture.dp("lr0");
    assert_eq!(
        fixture.flow_actions(
            dp,
            "lr_in_arp_resolve",
            100,
            "outport == \"lr0-sw\" && reg0 == 10.0.0.5"
        ),
        Some("eth.dst = 02:00:00:00:00:05; next;".to_owned())
    );
    assert_eq!(
        fixture.flow_actions(dp, "lr_in_arp_resolve", 0, "ip4"),
        Some("get_arp(outport, reg0); next;".to_owned())
    );

    // The switch in turn learns the router MAC.
    let ls_dp = fixture.dp("ls0");
    assert!(fixture.has_flow(
        ls_dp,
        "ls_in_l2_lkup",
        50,
        "eth.dst == 40:00:00:00:00:01"
    ));
}

// ARP requests for unresolved destinations, with precise solicitations for
// IPv6 static-route next hops.
#[test]
fn arp_request() {
    let mut fixture = Fixture::new();
    let lr0 = fixture.add_router("lr0");
    fixture.add_router_port(
        lr0,
        "lr0-a",
        "40:00:00:00:00:01",
        &["10.0.0.1/24", "fd00::1/64"],
    );
    fixture.add_static_route(lr0, "fd01::/64", "fd00::2");
    fixture.run();

    let dp = fixture.dp("lr0");
    assert_eq!(
        fixture.flow_actions(
            dp,
            "lr_in_arp_request",
            100,
            "eth.dst == 00:00:00:00:00:00 && ip4"
        ),
        Some(
            "arp { eth.dst = ff:ff:ff:ff:ff:ff; arp.spa = reg1; arp.tpa = \
             reg0; arp.op = 1; output; };"
                .to_owned()
        )
    );
    let solicit = fixture
        .flow_actions(
            dp,
            "lr_in_arp_request",
            200,
            "eth.dst == 00:00:00:00:00:00 && ip6 && xxreg0 == fd00::2",
        )
        .expect("precise solicitation");
    assert!(solicit.contains("nd.target = fd00::2;"));
    assert!(solicit.contains("ip6.dst = ff02::1:ff00:2;"));
    assert_eq!(
        fixture.flow_actions(dp, "lr_in_arp_request", 0, "1"),
        Some("output;".to_owned())
    );
}

// Delivery outputs enabled ports only; redirect ports never get one.
#[test]
fn delivery() {
    let mut fixture = Fixture::new();
    let lr0 = fixture.add_router("lr0");
    let a = fixture.add_router_port(
        lr0,
        "lr0-a",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.add_gateway_chassis(a, "hv1", 10);
    fixture.run();

    let dp = fixture.dp("lr0");
    assert_eq!(
        fixture.flow_actions(dp, "lr_out_delivery", 100, "outport == \"lr0-a\""),
        Some("output;".to_owned())
    );
    assert!(!fixture.has_flow(
        dp,
        "lr_out_delivery",
        100,
        "outport == \"cr-lr0-a\""
    ));
}
