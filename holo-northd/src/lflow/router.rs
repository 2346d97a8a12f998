//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Logical-router pipeline generation: 16 ingress and 4 egress stages.

use std::fmt::Write;
use std::net::IpAddr;

use holo_utils::ip::Ipv6AddrExt;
use holo_utils::mac_addr::MacAddr;
use ipnetwork::IpNetwork;
use itertools::Itertools;
use uuid::Uuid;

use crate::datapath::{Datapath, DatapathKind, DpIndex, RouterData};
use crate::engine::Model;
use crate::error::Error;
use crate::lflow::{
    LflowSet, Stage, ETH_ADDR_ZERO, REGBIT_EGRESS_LOOPBACK,
    REGBIT_LOOKUP_NEIGHBOR_RESULT, REGBIT_ND_RA_OPTS_RESULT,
    REGBIT_NAT_REDIRECT, REGBIT_PKT_LARGER, REG_NEXT_HOP_IPV4,
    REG_NEXT_HOP_IPV6, REG_SRC_IPV4, REG_SRC_IPV6,
};
use crate::lflow_add;
use crate::multicast::MC_STATIC;
use crate::nb::{
    LbProtocol, LogicalRouter, NatRule, NatType, NbSnapshot, PolicyAction,
    RoutePolicy,
};
use crate::port::{json_escape, Port, PortIndex, PortKind};

// A NAT rule after validation: addresses parsed, the logical side kept as a
// network so SNAT priorities can encode the prefix length.
struct NatEntry<'a> {
    rule: &'a NatRule,
    external_ip: IpAddr,
    logical_net: IpNetwork,
    external_mac: Option<MacAddr>,
    stateless: bool,
}

impl NatEntry<'_> {
    fn is_v6(&self) -> bool {
        self.external_ip.is_ipv6()
    }

    // True for the fully distributed form: a dnat_and_snat bound to a
    // specific logical port with its own external MAC.
    fn is_distributed(&self) -> bool {
        self.rule.nat_type == NatType::DnatAndSnat
            && self.external_mac.is_some()
            && self.rule.logical_port.is_some()
    }
}

// ===== entry point =====

pub(crate) fn build(nb: &NbSnapshot, model: &Model, lflows: &mut LflowSet) {
    for (dp_index, dp) in model.datapaths.iter().enumerate() {
        let DatapathKind::Router(router) = &dp.kind else {
            continue;
        };
        let Some(nbr) = nb.routers.get(&dp.nb_uuid) else {
            continue;
        };
        let nats = parse_nats(nb, dp, nbr);

        build_admission(model, dp, router, &nats, lflows);
        build_neighbor_stages(dp, lflows);
        build_ip_input(model, dp, router, &nats, lflows);
        build_nat_lb(nb, model, dp, router, &nats, lflows);
        build_nd_ra(model, dp, lflows);
        build_routing(nb, model, dp, dp_index, router, nbr, lflows);
        build_policy(nb, model, dp, nbr, lflows);
        build_arp_resolve(model, dp, router, lflows);
        build_pkt_len(model, dp, router, lflows);
        build_gw_redirect(model, dp, router, &nats, lflows);
        build_arp_request(nb, dp, nbr, lflows);
        build_delivery(model, dp, router, lflows);
    }
}

fn parse_nats<'a>(
    nb: &'a NbSnapshot,
    dp: &Datapath,
    nbr: &LogicalRouter,
) -> Vec<NatEntry<'a>> {
    let mut entries = Vec::new();
    for nat in nbr.nat.iter().filter_map(|nat| nb.nat_rules.get(nat)) {
        let Ok(external_ip) = nat.external_ip.parse::<IpAddr>() else {
            Error::BadNatRule(dp.name.clone(), nat.external_ip.clone()).log();
            continue;
        };
        let logical_net = match nat.logical_ip.parse::<IpNetwork>() {
            Ok(net) => net,
            Err(_) => match nat.logical_ip.parse::<IpAddr>() {
                Ok(IpAddr::V4(addr)) => IpNetwork::V4(
                    ipnetwork::Ipv4Network::new(addr, 32).unwrap(),
                ),
                Ok(IpAddr::V6(addr)) => IpNetwork::V6(
                    ipnetwork::Ipv6Network::new(addr, 128).unwrap(),
                ),
                Err(_) => {
                    Error::BadNatRule(
                        dp.name.clone(),
                        nat.logical_ip.clone(),
                    )
                    .log();
                    continue;
                }
            },
        };
        // DNAT needs a specific address to translate to.
        if matches!(nat.nat_type, NatType::Dnat | NatType::DnatAndSnat)
            && logical_net.prefix()
                != match logical_net {
                    IpNetwork::V4(_) => 32,
                    IpNetwork::V6(_) => 128,
                }
        {
            Error::BadNatRule(dp.name.clone(), nat.logical_ip.clone()).log();
            continue;
        }
        if external_ip.is_ipv4() != logical_net.ip().is_ipv4() {
            Error::BadNatRule(dp.name.clone(), nat.external_ip.clone()).log();
            continue;
        }
        let external_mac = match &nat.external_mac {
            Some(mac) => match mac.parse::<MacAddr>() {
                Ok(mac) if nat.logical_port.is_some() => Some(mac),
                Ok(_) => {
                    // An external MAC without a bound port cannot be
                    // distributed; fall back to the centralized form.
                    Error::BadNatRule(dp.name.clone(), mac.clone()).log();
                    None
                }
                Err(_) => {
                    Error::BadMacAddr(dp.name.clone(), mac.clone()).log();
                    continue;
                }
            },
            None => None,
        };
        entries.push(NatEntry {
            rule: nat,
            external_ip,
            logical_net,
            external_mac,
            stateless: nat.is_stateless()
                && nat.nat_type == NatType::DnatAndSnat,
        });
    }
    entries
}

// NAT and load-balancer processing only happens on gateway routers and on
// distributed routers anchored by a distributed gateway port.
fn nat_capable(dp: &Datapath, router: &RouterData) -> bool {
    dp.is_gateway_router() || router.l3dgw_port.is_some()
}

fn redirect_guard(model: &Model, router: &RouterData) -> String {
    router
        .l3redirect_port
        .map(|redirect| {
            format!(
                " && is_chassis_resident({})",
                model.ports[redirect].json_name
            )
        })
        .unwrap_or_default()
}

// ===== ingress stage 0: admission =====

fn build_admission(
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    nats: &[NatEntry<'_>],
    lflows: &mut LflowSet,
) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_ADMISSION,
        100,
        "vlan.present || eth.src[40]",
        "drop;"
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let PortKind::Lrp(lrp) = &port.kind else {
            continue;
        };
        if !lrp.enabled {
            continue;
        }

        let resident = if router.l3dgw_port == Some(port_index) {
            redirect_guard(model, router)
        } else {
            String::new()
        };
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_ADMISSION,
            50,
            format!("eth.mcast && inport == {}", port.json_name),
            "next;",
            port.nb_uuid
        );
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_ADMISSION,
            50,
            format!(
                "eth.dst == {} && inport == {}{resident}",
                lrp.mac, port.json_name
            ),
            "next;",
            port.nb_uuid
        );
    }

    // Distributed dnat_and_snat: traffic for the dedicated external MAC is
    // admitted on the chassis hosting the bound logical port.
    if let Some(l3dgw) = router.l3dgw_port {
        for nat in nats.iter().filter(|nat| nat.is_distributed()) {
            let logical_port =
                nat.rule.logical_port.as_deref().unwrap_or_default();
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_ADMISSION,
                50,
                format!(
                    "eth.dst == {} && inport == {} && \
                     is_chassis_resident({})",
                    nat.external_mac.unwrap(),
                    model.ports[l3dgw].json_name,
                    json_escape(logical_port)
                ),
                "next;",
                nat.rule.uuid
            );
        }
    }
}

// ===== ingress stages 1-2: neighbor lookup and learning =====

fn build_neighbor_stages(dp: &Datapath, lflows: &mut LflowSet) {
    for (match_, lookup) in [
        ("arp.op == 2", "lookup_arp(inport, arp.spa, arp.sha)"),
        ("nd_na", "lookup_nd(inport, nd.target, nd.tll)"),
        ("nd_ns", "lookup_nd(inport, ip6.src, nd.sll)"),
    ] {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_LOOKUP_NEIGHBOR,
            100,
            match_,
            format!("{REGBIT_LOOKUP_NEIGHBOR_RESULT} = {lookup}; next;")
        );
    }
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_LOOKUP_NEIGHBOR,
        0,
        "1",
        "next;"
    );

    // Learn only when the lookup missed.
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_LEARN_NEIGHBOR,
        100,
        format!("{REGBIT_LOOKUP_NEIGHBOR_RESULT} == 1"),
        "next;"
    );
    for (match_, learn) in [
        ("arp", "put_arp(inport, arp.spa, arp.sha)"),
        ("nd_na", "put_nd(inport, nd.target, nd.tll)"),
        ("nd_ns", "put_nd(inport, ip6.src, nd.sll)"),
    ] {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_LEARN_NEIGHBOR,
            90,
            match_,
            format!("{learn};")
        );
    }
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_LEARN_NEIGHBOR,
        0,
        "1",
        "next;"
    );
}

// ===== ingress stage 3: IP input =====

fn build_ip_input(
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    nats: &[NatEntry<'_>],
    lflows: &mut LflowSet,
) {
    // Martian sources and destinations.
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_IP_INPUT,
        100,
        "ip4.src_mcast || ip4.src == 255.255.255.255 || ip4.src == \
         127.0.0.0/8 || ip4.dst == 127.0.0.0/8 || ip4.src == 0.0.0.0/8 || \
         ip4.dst == 0.0.0.0/8",
        "drop;"
    );
    // Without relay there is nothing useful to do with IP multicast.
    if !router.mcast_relay {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_IP_INPUT,
            100,
            "ip4.mcast || ip6.mcast",
            "drop;"
        );
    }
    // ARP and ND are never forwarded; the dedicated handlers above this
    // priority answer for the router's own addresses.
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_IP_INPUT,
        85,
        "arp || nd",
        "drop;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_IP_INPUT,
        50,
        "eth.bcast",
        "drop;"
    );
    lflow_add!(lflows, dp.sb_uuid, Stage::ROUTER_IN_IP_INPUT, 0, "1", "next;");

    // Per-port handlers.
    let is_gateway = dp.is_gateway_router();
    let has_dgw = router.l3dgw_port.is_some();
    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let PortKind::Lrp(lrp) = &port.kind else {
            continue;
        };
        if !lrp.enabled {
            continue;
        }
        let resident = if router.l3dgw_port == Some(port_index) {
            redirect_guard(model, router)
        } else {
            String::new()
        };

        // ICMP echo.
        if !lrp.networks.ipv4.is_empty() {
            let addrs = lrp
                .networks
                .ipv4
                .iter()
                .map(|ip| ip.addr.to_string())
                .join(", ");
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_IP_INPUT,
                90,
                format!(
                    "ip4.dst == {{{addrs}}} && icmp4.type == 8 && \
                     icmp4.code == 0"
                ),
                "ip4.dst <-> ip4.src; ip.ttl = 255; icmp4.type = 0; \
                 flags.loopback = 1; next; ",
                port.nb_uuid
            );
        }

        for ipv4 in &lrp.networks.ipv4 {
            // ARP for the port's own address, scoped to its network.
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_IP_INPUT,
                90,
                format!(
                    "inport == {} && arp.spa == {} && arp.tpa == {} && \
                     arp.op == 1{resident}",
                    port.json_name,
                    ipv4.network_str(),
                    ipv4.addr
                ),
                format!(
                    "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; /* \
                     ARP reply */ arp.tha = arp.sha; arp.sha = {mac}; \
                     arp.tpa = arp.spa; arp.spa = {addr}; outport = \
                     inport; flags.loopback = 1; output;",
                    mac = lrp.mac,
                    addr = ipv4.addr
                ),
                port.nb_uuid
            );

            // Time exceeded.
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_IP_INPUT,
                40,
                format!(
                    "inport == {} && ip4 && ip.ttl == {{0, 1}} && \
                     !ip.later_frag",
                    port.json_name
                ),
                format!(
                    "icmp4 {{ eth.dst <-> eth.src; icmp4.type = 11; /* \
                     Time exceeded */ icmp4.code = 0; ip4.dst = ip4.src; \
                     ip4.src = {}; ip.ttl = 255; next; }};",
                    ipv4.addr
                ),
                port.nb_uuid
            );
        }

        // ND and ICMPv6 echo.
        for ipv6 in &lrp.networks.ipv6 {
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_IP_INPUT,
                90,
                format!(
                    "inport == {} && nd_ns && ip6.dst == {{{addr}, {sn}}} \
                     && nd.target == {addr}{resident}",
                    port.json_name,
                    addr = ipv6.addr,
                    sn = ipv6.solicited_node()
                ),
                format!(
                    "nd_na_router {{ eth.src = {mac}; ip6.src = {addr}; \
                     nd.target = {addr}; nd.tll = {mac}; outport = inport; \
                     flags.loopback = 1; output; }};",
                    mac = lrp.mac,
                    addr = ipv6.addr
                ),
                port.nb_uuid
            );
        }
        if !lrp.networks.ipv6.is_empty() {
            let addrs = lrp
                .networks
                .ipv6
                .iter()
                .map(|ip| ip.addr.to_string())
                .join(", ");
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_IP_INPUT,
                90,
                format!(
                    "ip6.dst == {{{addrs}}} && icmp6.type == 128 && \
                     icmp6.code == 0"
                ),
                "ip6.dst <-> ip6.src; ip.ttl = 255; icmp6.type = 129; \
                 flags.loopback = 1; next; ",
                port.nb_uuid
            );
        }

        // Traffic addressed to the router itself is answered with an
        // unreachable, except on gateways where NAT owns those addresses.
        if !is_gateway && !has_dgw {
            for ipv4 in &lrp.networks.ipv4 {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_IP_INPUT,
                    80,
                    format!(
                        "ip4 && ip4.dst == {} && !ip.later_frag && udp",
                        ipv4.addr
                    ),
                    "icmp4 { eth.dst <-> eth.src; ip4.dst <-> ip4.src; \
                     ip.ttl = 255; icmp4.type = 3; icmp4.code = 3; next; \
                     };",
                    port.nb_uuid
                );
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_IP_INPUT,
                    80,
                    format!(
                        "ip4 && ip4.dst == {} && !ip.later_frag && tcp",
                        ipv4.addr
                    ),
                    "tcp_reset { eth.dst <-> eth.src; ip4.dst <-> ip4.src; \
                     next; };",
                    port.nb_uuid
                );
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_IP_INPUT,
                    70,
                    format!(
                        "ip4 && ip4.dst == {} && !ip.later_frag",
                        ipv4.addr
                    ),
                    "icmp4 { eth.dst <-> eth.src; ip4.dst <-> ip4.src; \
                     ip.ttl = 255; icmp4.type = 3; icmp4.code = 2; next; \
                     };",
                    port.nb_uuid
                );
            }
        }
    }

    // ARP/ND ownership of the NAT external addresses.
    build_nat_arp_responders(model, dp, router, nats, lflows);

    // Anything still addressed to a router-owned IP is dropped, except the
    // SNAT addresses which must remain receivable for un-SNATing.
    let mut owned_v4 = Vec::new();
    let mut owned_v6 = Vec::new();
    for &port_index in &dp.ports {
        if let PortKind::Lrp(lrp) = &model.ports[port_index].kind {
            owned_v4.extend(lrp.networks.ipv4.iter().map(|ip| ip.addr));
            owned_v6.extend(lrp.networks.ipv6.iter().map(|ip| ip.addr));
        }
    }
    let snat_ips: Vec<IpAddr> = nats
        .iter()
        .filter(|nat| {
            matches!(nat.rule.nat_type, NatType::Snat | NatType::DnatAndSnat)
        })
        .map(|nat| nat.external_ip)
        .collect();
    owned_v4.retain(|addr| !snat_ips.contains(&IpAddr::V4(*addr)));
    owned_v6.retain(|addr| !snat_ips.contains(&IpAddr::V6(*addr)));
    if !owned_v4.is_empty() {
        let addrs = owned_v4.iter().map(ToString::to_string).join(", ");
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_IP_INPUT,
            60,
            format!("ip4.dst == {{{addrs}}}"),
            "drop;"
        );
    }
    if !owned_v6.is_empty() {
        let addrs = owned_v6.iter().map(ToString::to_string).join(", ");
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_IP_INPUT,
            60,
            format!("ip6.dst == {{{addrs}}}"),
            "drop;"
        );
    }
}

fn build_nat_arp_responders(
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    nats: &[NatEntry<'_>],
    lflows: &mut LflowSet,
) {
    for nat in nats {
        // Pick the port anchoring the external address.
        let port_index = match router.l3dgw_port {
            Some(l3dgw) => l3dgw,
            None => {
                let Some(port_index) = port_for_address(
                    model,
                    dp,
                    &nat.external_ip,
                ) else {
                    continue;
                };
                port_index
            }
        };
        let port = &model.ports[port_index];
        let PortKind::Lrp(lrp) = &port.kind else {
            continue;
        };

        // On a distributed router the reply is bound to a chassis: the
        // bound logical port's for the fully distributed form, the
        // redirect port's otherwise.
        let (mac, resident) = if nat.is_distributed() {
            (
                nat.external_mac.unwrap(),
                format!(
                    " && is_chassis_resident({})",
                    json_escape(
                        nat.rule.logical_port.as_deref().unwrap_or_default()
                    )
                ),
            )
        } else if router.l3dgw_port.is_some() {
            (lrp.mac, redirect_guard(model, router))
        } else {
            (lrp.mac, String::new())
        };

        match nat.external_ip {
            IpAddr::V4(external_ip) => {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_IP_INPUT,
                    90,
                    format!(
                        "inport == {} && arp.op == 1 && arp.tpa == \
                         {external_ip}{resident}",
                        port.json_name
                    ),
                    format!(
                        "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; \
                         /* ARP reply */ arp.tha = arp.sha; arp.sha = \
                         {mac}; arp.tpa = arp.spa; arp.spa = \
                         {external_ip}; outport = inport; flags.loopback = \
                         1; output;"
                    ),
                    nat.rule.uuid
                );
            }
            IpAddr::V6(external_ip) => {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_IP_INPUT,
                    90,
                    format!(
                        "inport == {} && nd_ns && nd.target == \
                         {external_ip}{resident}",
                        port.json_name
                    ),
                    format!(
                        "nd_na {{ eth.src = {mac}; ip6.src = \
                         {external_ip}; nd.target = {external_ip}; nd.tll \
                         = {mac}; outport = inport; flags.loopback = 1; \
                         output; }};"
                    ),
                    nat.rule.uuid
                );
            }
        }
    }
}

// The router port whose configured networks contain the address.
fn port_for_address(
    model: &Model,
    dp: &Datapath,
    address: &IpAddr,
) -> Option<PortIndex> {
    dp.ports.iter().copied().find(|&port_index| {
        match &model.ports[port_index].kind {
            PortKind::Lrp(lrp) => match address {
                IpAddr::V4(addr) => lrp
                    .networks
                    .ipv4
                    .iter()
                    .any(|ip| ip.network.contains(*addr)),
                IpAddr::V6(addr) => lrp
                    .networks
                    .ipv6
                    .iter()
                    .any(|ip| ip.network.contains(*addr)),
            },
            _ => false,
        }
    })
}

// ===== ingress stages 4-6 / egress stages 0-1: NAT and load balancing =====

fn build_nat_lb(
    nb: &NbSnapshot,
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    nats: &[NatEntry<'_>],
    lflows: &mut LflowSet,
) {
    for stage in [
        Stage::ROUTER_IN_DEFRAG,
        Stage::ROUTER_IN_UNSNAT,
        Stage::ROUTER_IN_DNAT,
        Stage::ROUTER_OUT_UNDNAT,
        Stage::ROUTER_OUT_SNAT,
        Stage::ROUTER_OUT_EGR_LOOP,
    ] {
        lflow_add!(lflows, dp.sb_uuid, stage, 0, "1", "next;");
    }

    if !nat_capable(dp, router) {
        return;
    }
    let is_gateway = dp.is_gateway_router();
    let l3dgw_name = router
        .l3dgw_port
        .map(|index| model.ports[index].json_name.clone());
    let resident = redirect_guard(model, router);

    for nat in nats {
        let (ip_dst, ip_src) = if nat.is_v6() {
            ("ip6.dst", "ip6.src")
        } else {
            ("ip4.dst", "ip4.src")
        };
        let external_ip = nat.external_ip;
        let logical_addr = nat.logical_net.ip();
        let distributed = nat.is_distributed();

        // UNSNAT.
        if matches!(nat.rule.nat_type, NatType::Snat | NatType::DnatAndSnat) {
            if nat.stateless {
                // Stateless rewrites happen in DNAT/SNAT directly.
            } else if is_gateway {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_UNSNAT,
                    90,
                    format!("ip && {ip_dst} == {external_ip}"),
                    "ct_snat;",
                    nat.rule.uuid
                );
            } else if let Some(l3dgw) = &l3dgw_name {
                let guard = if distributed {
                    String::new()
                } else {
                    resident.clone()
                };
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_UNSNAT,
                    100,
                    format!(
                        "ip && {ip_dst} == {external_ip} && inport == \
                         {l3dgw}{guard}"
                    ),
                    "ct_snat;",
                    nat.rule.uuid
                );
                // Traffic entering elsewhere is pushed to the gateway.
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_UNSNAT,
                    50,
                    format!("ip && {ip_dst} == {external_ip}"),
                    format!("{REGBIT_NAT_REDIRECT} = 1; next;"),
                    nat.rule.uuid
                );
            }
        }

        // DNAT.
        if matches!(nat.rule.nat_type, NatType::Dnat | NatType::DnatAndSnat) {
            let actions = if nat.stateless {
                format!("{ip_dst} = {logical_addr}; next;")
            } else if is_gateway {
                format!("flags.loopback = 1; ct_dnat({logical_addr});")
            } else {
                format!("ct_dnat({logical_addr});")
            };
            if is_gateway {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_DNAT,
                    100,
                    format!("ip && {ip_dst} == {external_ip}"),
                    actions,
                    nat.rule.uuid
                );
            } else if let Some(l3dgw) = &l3dgw_name {
                let guard = if distributed {
                    String::new()
                } else {
                    resident.clone()
                };
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_DNAT,
                    100,
                    format!(
                        "ip && {ip_dst} == {external_ip} && inport == \
                         {l3dgw}{guard}"
                    ),
                    actions,
                    nat.rule.uuid
                );
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_DNAT,
                    50,
                    format!("ip && {ip_dst} == {external_ip}"),
                    format!("{REGBIT_NAT_REDIRECT} = 1; next;"),
                    nat.rule.uuid
                );
            }

            // UNDNAT reverses the translation on replies leaving through
            // the gateway port.
            if let Some(l3dgw) = &l3dgw_name {
                let (guard, actions) = if distributed {
                    (
                        format!(
                            " && is_chassis_resident({})",
                            json_escape(
                                nat.rule
                                    .logical_port
                                    .as_deref()
                                    .unwrap_or_default()
                            )
                        ),
                        if nat.stateless {
                            format!(
                                "eth.src = {}; {ip_src} = {external_ip}; \
                                 next;",
                                nat.external_mac.unwrap()
                            )
                        } else {
                            format!(
                                "eth.src = {}; ct_dnat;",
                                nat.external_mac.unwrap()
                            )
                        },
                    )
                } else {
                    (
                        resident.clone(),
                        if nat.stateless {
                            format!("{ip_src} = {external_ip}; next;")
                        } else {
                            "ct_dnat;".to_owned()
                        },
                    )
                };
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_OUT_UNDNAT,
                    100,
                    format!(
                        "ip && {ip_src} == {logical_addr} && outport == \
                         {l3dgw}{guard}"
                    ),
                    actions,
                    nat.rule.uuid
                );
            }
        }

        // SNAT.
        if matches!(nat.rule.nat_type, NatType::Snat | NatType::DnatAndSnat) {
            let priority = nat.logical_net.prefix() as u16 + 1;
            let logical_net = nat.logical_net;
            let actions = if nat.stateless {
                format!("{ip_src} = {external_ip}; next;")
            } else {
                format!("ct_snat({external_ip});")
            };
            if is_gateway {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_OUT_SNAT,
                    priority,
                    format!("ip && {ip_src} == {logical_net}"),
                    actions,
                    nat.rule.uuid
                );
            } else if let Some(l3dgw) = &l3dgw_name {
                let (guard, actions) = if distributed {
                    (
                        format!(
                            " && is_chassis_resident({})",
                            json_escape(
                                nat.rule
                                    .logical_port
                                    .as_deref()
                                    .unwrap_or_default()
                            )
                        ),
                        if nat.stateless {
                            format!(
                                "eth.src = {}; {ip_src} = {external_ip}; \
                                 next;",
                                nat.external_mac.unwrap()
                            )
                        } else {
                            format!(
                                "eth.src = {}; ct_snat({external_ip});",
                                nat.external_mac.unwrap()
                            )
                        },
                    )
                } else {
                    (resident.clone(), actions)
                };
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_OUT_SNAT,
                    priority,
                    format!(
                        "ip && {ip_src} == {logical_net} && outport == \
                         {l3dgw}{guard}"
                    ),
                    actions,
                    nat.rule.uuid
                );
            }
        }

        // Distributed dnat_and_snat hairpins between two NAT addresses
        // re-enter the ingress pipeline on the same chassis.
        if distributed {
            if let Some(l3dgw) = &l3dgw_name {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_OUT_EGR_LOOP,
                    100,
                    format!(
                        "{ip_dst} == {external_ip} && outport == {l3dgw} \
                         && is_chassis_resident({})",
                        json_escape(
                            nat.rule
                                .logical_port
                                .as_deref()
                                .unwrap_or_default()
                        )
                    ),
                    format!(
                        "clone {{ ct_clear; inport = outport; outport = \
                         \"\"; flags = 0; flags.loopback = 1; reg0 = 0; \
                         reg1 = 0; reg2 = 0; reg3 = 0; reg4 = 0; reg5 = 0; \
                         reg6 = 0; reg7 = 0; reg8 = 0; reg9 = 0; \
                         {REGBIT_EGRESS_LOOPBACK} = 1; next(pipeline=\
                         ingress, table=0); }};"
                    ),
                    nat.rule.uuid
                );
            }
        }
    }

    // A gateway router with NAT rules lets established traffic hairpin
    // back through conntrack.
    if is_gateway && !nats.is_empty() {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_DNAT,
            50,
            "ip",
            "flags.loopback = 1; ct_dnat;"
        );
    }

    // Force-SNAT plumbing.
    if is_gateway {
        if let Some(force_ip) = &router.dnat_force_snat_ip {
            build_force_snat(dp, "dnat", force_ip, lflows);
        }
        if let Some(force_ip) = &router.lb_force_snat_ip {
            build_force_snat(dp, "lb", force_ip, lflows);
        }
    }

    build_load_balancers(nb, model, dp, router, lflows);
}

fn build_force_snat(
    dp: &Datapath,
    context: &str,
    force_ip: &IpAddr,
    lflows: &mut LflowSet,
) {
    let ip_dst = if force_ip.is_ipv6() { "ip6.dst" } else { "ip4.dst" };
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_UNSNAT,
        110,
        format!("ip && {ip_dst} == {force_ip}"),
        "ct_snat;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_OUT_SNAT,
        100,
        format!("flags.force_snat_for_{context} == 1 && ip"),
        format!("ct_snat({force_ip});")
    );
}

fn build_load_balancers(
    nb: &NbSnapshot,
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    lflows: &mut LflowSet,
) {
    let Some(nbr) = nb.routers.get(&dp.nb_uuid) else {
        return;
    };
    let force_snat = router.lb_force_snat_ip.is_some();
    let l3dgw_name = router
        .l3dgw_port
        .map(|index| model.ports[index].json_name.clone());
    let resident = redirect_guard(model, router);

    for lb in nbr
        .load_balancer
        .iter()
        .filter_map(|lb| nb.load_balancers.get(lb))
    {
        let proto = lb.protocol.unwrap_or(LbProtocol::Tcp);
        for (vip, backends) in &lb.vips {
            let Some((addr, port)) = super::switch::parse_vip(vip) else {
                Error::BadVip(lb.name.clone(), vip.clone()).log();
                continue;
            };
            let ip_dst = match addr {
                IpAddr::V4(_) => "ip4.dst",
                IpAddr::V6(_) => "ip6.dst",
            };

            // Fragmented VIP traffic is reassembled before translation.
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_DEFRAG,
                100,
                format!("ip && {ip_dst} == {addr}"),
                "ct_next;",
                lb.uuid
            );
            if backends.is_empty() {
                continue;
            }

            let mut match_new =
                format!("ct.new && ip && {ip_dst} == {addr}");
            let mut match_est =
                format!("ct.est && ip && {ip_dst} == {addr}");
            let priority = match port {
                Some(port) => {
                    write!(
                        match_new,
                        " && {proto}.dst == {port}",
                        proto = proto.as_str()
                    )
                    .unwrap();
                    write!(
                        match_est,
                        " && {proto}.dst == {port}",
                        proto = proto.as_str()
                    )
                    .unwrap();
                    120
                }
                None => 110,
            };
            match_new.push_str(&resident);

            let force = if force_snat {
                "flags.force_snat_for_lb = 1; "
            } else {
                ""
            };
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_DNAT,
                priority,
                match_new,
                format!("{force}ct_lb({backends});"),
                lb.uuid
            );
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_DNAT,
                priority,
                match_est,
                format!("{force}ct_dnat;"),
                lb.uuid
            );

            // Reply direction on distributed gateways.
            if let Some(l3dgw) = &l3dgw_name {
                let mut match_undnat =
                    format!("ip && {ip_dst} == {addr}");
                if let Some(port) = port {
                    write!(
                        match_undnat,
                        " && {proto}.dst == {port}",
                        proto = proto.as_str()
                    )
                    .unwrap();
                }
                write!(
                    match_undnat,
                    " && outport == {l3dgw}{resident}"
                )
                .unwrap();
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_OUT_UNDNAT,
                    120,
                    match_undnat,
                    "ct_dnat;",
                    lb.uuid
                );
            }
        }
    }
}

// ===== ingress stages 7-8: IPv6 router advertisements =====

fn build_nd_ra(model: &Model, dp: &Datapath, lflows: &mut LflowSet) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_ND_RA_OPTIONS,
        0,
        "1",
        "next;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_ND_RA_RESPONSE,
        0,
        "1",
        "next;"
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let PortKind::Lrp(lrp) = &port.kind else {
            continue;
        };
        if !lrp.enabled || lrp.networks.ipv6.is_empty() {
            continue;
        }
        let Some(address_mode) = lrp.ipv6_ra_configs.get("address_mode")
        else {
            continue;
        };
        if !matches!(
            address_mode.as_str(),
            "slaac" | "dhcpv6_stateful" | "dhcpv6_stateless"
        ) {
            continue;
        }

        let mut opts = format!(
            "addr_mode = \"{address_mode}\", slla = {}",
            lrp.mac
        );
        if let Some(mtu) =
            lrp.ipv6_ra_configs.get("mtu").and_then(|mtu| mtu.parse::<u32>().ok())
        {
            write!(opts, ", mtu = {mtu}").unwrap();
        }
        // Announce the on-link prefixes unless the mode is fully stateful.
        if address_mode != "dhcpv6_stateful" {
            for ipv6 in &lrp.networks.ipv6 {
                if ipv6.addr.is_unicast_link_local() {
                    continue;
                }
                write!(opts, ", prefix = {}", ipv6.network_str()).unwrap();
            }
        }

        let ll = lrp.mac.to_link_local();
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_ND_RA_OPTIONS,
            50,
            format!(
                "inport == {} && ip6.dst == ff02::2 && nd_rs",
                port.json_name
            ),
            format!(
                "{REGBIT_ND_RA_OPTS_RESULT} = put_nd_ra_opts({opts}); next;"
            ),
            port.nb_uuid
        );
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_ND_RA_RESPONSE,
            50,
            format!(
                "inport == {} && ip6.dst == ff02::2 && nd_ra && \
                 {REGBIT_ND_RA_OPTS_RESULT}",
                port.json_name
            ),
            format!(
                "eth.dst = eth.src; eth.src = {mac}; ip6.dst = ip6.src; \
                 ip6.src = {ll}; outport = inport; flags.loopback = 1; \
                 output;",
                mac = lrp.mac
            ),
            port.nb_uuid
        );
    }
}

// ===== ingress stage 9: IP routing =====

// Longest-prefix match is priority-encoded: twice the prefix length, plus
// one for destination routes so they win over source routes of the same
// length.
fn route_priority(plen: u8, is_src: bool) -> u16 {
    2 * plen as u16 + if is_src { 0 } else { 1 }
}

#[allow(clippy::too_many_arguments)]
fn add_route(
    lflows: &mut LflowSet,
    dp: &Datapath,
    out_port: &Port,
    lrp_addr: &IpAddr,
    prefix: &IpNetwork,
    nexthop: Option<&IpAddr>,
    is_src: bool,
    inport: Option<&str>,
    hint: Uuid,
) {
    let PortKind::Lrp(lrp) = &out_port.kind else {
        return;
    };
    let v6 = matches!(prefix, IpNetwork::V6(_));
    let dir = if is_src { "src" } else { "dst" };
    let (ip_field, reg_hop, reg_src) = if v6 {
        ("ip6", REG_NEXT_HOP_IPV6, REG_SRC_IPV6)
    } else {
        ("ip4", REG_NEXT_HOP_IPV4, REG_SRC_IPV4)
    };

    let mut match_ = String::new();
    if let Some(inport) = inport {
        write!(match_, "inport == {inport} && ").unwrap();
    }
    write!(
        match_,
        "{ip_field}.{dir} == {}/{}",
        prefix.network(),
        prefix.prefix()
    )
    .unwrap();

    let hop = match nexthop {
        Some(nexthop) => nexthop.to_string(),
        None => format!("{ip_field}.dst"),
    };
    let actions = format!(
        "ip.ttl--; {reg_hop} = {hop}; {reg_src} = {lrp_addr}; eth.src = \
         {}; outport = {}; flags.loopback = 1; next;",
        lrp.mac, out_port.json_name
    );

    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_IP_ROUTING,
        route_priority(prefix.prefix(), is_src),
        match_,
        actions,
        hint
    );
}

#[allow(clippy::too_many_arguments)]
fn build_routing(
    nb: &NbSnapshot,
    model: &Model,
    dp: &Datapath,
    dp_index: DpIndex,
    router: &RouterData,
    nbr: &LogicalRouter,
    lflows: &mut LflowSet,
) {
    // Connected routes.
    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let PortKind::Lrp(lrp) = &port.kind else {
            continue;
        };
        if !lrp.enabled {
            continue;
        }
        for ipv4 in &lrp.networks.ipv4 {
            add_route(
                lflows,
                dp,
                port,
                &IpAddr::V4(ipv4.addr),
                &IpNetwork::V4(ipv4.network),
                None,
                false,
                None,
                port.nb_uuid,
            );
        }
        for ipv6 in &lrp.networks.ipv6 {
            // Link-local scopes are only meaningful relative to the
            // receiving port.
            let inport = ipv6
                .addr
                .is_unicast_link_local()
                .then_some(port.json_name.as_str());
            add_route(
                lflows,
                dp,
                port,
                &IpAddr::V6(ipv6.addr),
                &IpNetwork::V6(ipv6.network),
                None,
                false,
                inport,
                port.nb_uuid,
            );
        }
    }

    // Static routes.
    for route in nbr
        .static_routes
        .iter()
        .filter_map(|route| nb.static_routes.get(route))
    {
        let Ok(prefix) = route.ip_prefix.parse::<IpNetwork>() else {
            Error::BadRoutePrefix(dp.name.clone(), route.ip_prefix.clone())
                .log();
            continue;
        };
        let Ok(nexthop) = route.nexthop.parse::<IpAddr>() else {
            Error::BadRouteNexthop(dp.name.clone(), route.nexthop.clone())
                .log();
            continue;
        };
        if prefix.ip().is_ipv4() != nexthop.is_ipv4() {
            Error::BadRouteNexthop(dp.name.clone(), route.nexthop.clone())
                .log();
            continue;
        }

        // The output port is explicit or inferred from the next hop.
        let out = match &route.output_port {
            Some(name) => {
                let Some(&port_index) = model.port_by_name.get(name) else {
                    Error::MissingRouteOutputPort(
                        dp.name.clone(),
                        name.clone(),
                    )
                    .log();
                    continue;
                };
                Some(port_index)
            }
            None => port_for_address(model, dp, &nexthop),
        };
        let Some(out) = out.filter(|&out| model.ports[out].dp == dp_index)
        else {
            Error::BadRouteNexthop(dp.name.clone(), route.nexthop.clone())
                .log();
            continue;
        };
        let out_port = &model.ports[out];
        let Some(lrp_addr) = router_port_address(out_port, nexthop.is_ipv4())
        else {
            continue;
        };

        let is_src = route.policy == Some(RoutePolicy::SrcIp);
        add_route(
            lflows,
            dp,
            out_port,
            &lrp_addr,
            &prefix,
            Some(&nexthop),
            is_src,
            None,
            route.uuid,
        );
    }

    // Multicast relay bypasses the longest-prefix-match layer.
    if router.mcast_relay {
        for aggregate in
            model.igmp_aggregates.iter().filter(|agg| agg.dp == dp_index)
        {
            let field = match aggregate.address {
                IpAddr::V4(_) => "ip4",
                IpAddr::V6(_) => "ip6",
            };
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_IP_ROUTING,
                500,
                format!(
                    "{field} && {field}.dst == {}",
                    aggregate.address
                ),
                format!(
                    "outport = \"{}\"; ip.ttl--; next;",
                    aggregate.address
                )
            );
        }
        if router.mcast_flood_static {
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_IN_IP_ROUTING,
                450,
                "ip4.mcast || ip6.mcast",
                format!(
                    "outport = \"{}\"; ip.ttl--; next;",
                    MC_STATIC.0
                )
            );
        }
    }
}

// First configured address of the requested family on a router port.
fn router_port_address(port: &Port, v4: bool) -> Option<IpAddr> {
    let PortKind::Lrp(lrp) = &port.kind else {
        return None;
    };
    if v4 {
        lrp.networks.ipv4.first().map(|ip| IpAddr::V4(ip.addr))
    } else {
        lrp.networks.ipv6.first().map(|ip| IpAddr::V6(ip.addr))
    }
}

// ===== ingress stage 10: policy =====

fn build_policy(
    nb: &NbSnapshot,
    model: &Model,
    dp: &Datapath,
    nbr: &LogicalRouter,
    lflows: &mut LflowSet,
) {
    lflow_add!(lflows, dp.sb_uuid, Stage::ROUTER_IN_POLICY, 0, "1", "next;");

    for policy in nbr
        .policies
        .iter()
        .filter_map(|policy| nb.policies.get(policy))
    {
        match policy.action {
            PolicyAction::Allow => {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_POLICY,
                    policy.priority,
                    policy.match_.clone(),
                    "next;",
                    policy.uuid
                );
            }
            PolicyAction::Drop => {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_POLICY,
                    policy.priority,
                    policy.match_.clone(),
                    "drop;",
                    policy.uuid
                );
            }
            PolicyAction::Reroute => {
                let Some(nexthop) = policy
                    .nexthop
                    .as_ref()
                    .and_then(|nexthop| nexthop.parse::<IpAddr>().ok())
                else {
                    Error::BadRouteNexthop(
                        dp.name.clone(),
                        policy.nexthop.clone().unwrap_or_default(),
                    )
                    .log();
                    continue;
                };
                // The next hop must be reachable from one of this router's
                // ports.
                let Some(out) = port_for_address(model, dp, &nexthop) else {
                    Error::PolicyNexthopUnreachable(
                        dp.name.clone(),
                        nexthop.to_string(),
                    )
                    .log();
                    continue;
                };
                let out_port = &model.ports[out];
                let Some(lrp_addr) =
                    router_port_address(out_port, nexthop.is_ipv4())
                else {
                    continue;
                };
                let PortKind::Lrp(lrp) = &out_port.kind else {
                    continue;
                };
                let (reg_hop, reg_src) = if nexthop.is_ipv4() {
                    (REG_NEXT_HOP_IPV4, REG_SRC_IPV4)
                } else {
                    (REG_NEXT_HOP_IPV6, REG_SRC_IPV6)
                };
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::ROUTER_IN_POLICY,
                    policy.priority,
                    policy.match_.clone(),
                    format!(
                        "{reg_hop} = {nexthop}; {reg_src} = {lrp_addr}; \
                         eth.src = {}; outport = {}; flags.loopback = 1; \
                         next;",
                        lrp.mac, out_port.json_name
                    ),
                    policy.uuid
                );
            }
        }
    }
}

// ===== ingress stage 11: ARP resolution =====

fn build_arp_resolve(
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    lflows: &mut LflowSet,
) {
    if router.mcast_relay {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_ARP_RESOLVE,
            500,
            "ip4.mcast || ip6.mcast",
            "next;"
        );
    }
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_ARP_RESOLVE,
        0,
        "ip4",
        format!("get_arp(outport, {REG_NEXT_HOP_IPV4}); next;")
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_ARP_RESOLVE,
        0,
        "ip6",
        format!("get_nd(outport, {REG_NEXT_HOP_IPV6}); next;")
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        if !matches!(port.kind, PortKind::Lrp(_)) {
            continue;
        }
        let Some(peer) = port.peer else {
            continue;
        };

        match &model.ports[peer].kind {
            // Directly peered routers resolve to the peer port.
            PortKind::Lrp(peer_lrp) => {
                add_neighbor_resolution(
                    lflows,
                    dp,
                    port,
                    &peer_lrp.networks,
                    peer_lrp.mac,
                    model.ports[peer].nb_uuid,
                );
            }
            // Routers attached to a switch know every address the switch
            // knows at build time.
            PortKind::Lsp(_) => {
                let switch_dp = model.ports[peer].dp;
                for &lsp_index in &model.datapaths[switch_dp].ports {
                    let lsp_port = &model.ports[lsp_index];
                    let Some(lsp) = lsp_port.kind.as_lsp() else {
                        continue;
                    };
                    if lsp.has_router_addresses {
                        if let Some(lrp2) = lsp_port.peer {
                            if let PortKind::Lrp(lrp2_data) =
                                &model.ports[lrp2].kind
                            {
                                add_neighbor_resolution(
                                    lflows,
                                    dp,
                                    port,
                                    &lrp2_data.networks,
                                    lrp2_data.mac,
                                    model.ports[lrp2].nb_uuid,
                                );
                            }
                        }
                        continue;
                    }
                    let mut entries = lsp.addresses.clone();
                    if let Some(dynamic) = &lsp.dynamic {
                        entries.push(dynamic.clone());
                    }
                    for entry in &entries {
                        add_neighbor_resolution(
                            lflows,
                            dp,
                            port,
                            entry,
                            entry.ea,
                            lsp_port.nb_uuid,
                        );
                    }
                }
            }
            PortKind::LrpRedirect(_) => {}
        }
    }
}

fn add_neighbor_resolution(
    lflows: &mut LflowSet,
    dp: &Datapath,
    out_port: &Port,
    addresses: &crate::addresses::LportAddresses,
    mac: MacAddr,
    hint: Uuid,
) {
    for ipv4 in &addresses.ipv4 {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_ARP_RESOLVE,
            100,
            format!(
                "outport == {} && {REG_NEXT_HOP_IPV4} == {}",
                out_port.json_name, ipv4.addr
            ),
            format!("eth.dst = {mac}; next;"),
            hint
        );
    }
    for ipv6 in &addresses.ipv6 {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_ARP_RESOLVE,
            100,
            format!(
                "outport == {} && {REG_NEXT_HOP_IPV6} == {}",
                out_port.json_name, ipv6.addr
            ),
            format!("eth.dst = {mac}; next;"),
            hint
        );
    }
}

// ===== ingress stages 12-13: gateway MTU enforcement =====

fn build_pkt_len(
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    lflows: &mut LflowSet,
) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_CHK_PKT_LEN,
        0,
        "1",
        "next;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_LARGER_PKTS,
        0,
        "1",
        "next;"
    );

    let Some(l3dgw) = router.l3dgw_port else {
        return;
    };
    let l3dgw_port = &model.ports[l3dgw];
    let Some(mtu) = l3dgw_port
        .kind
        .as_lrp()
        .and_then(|lrp| lrp.options.get("gateway_mtu"))
        .and_then(|mtu| mtu.parse::<u32>().ok())
    else {
        return;
    };

    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_CHK_PKT_LEN,
        50,
        format!("outport == {}", l3dgw_port.json_name),
        format!("{REGBIT_PKT_LARGER} = check_pkt_larger({mtu}); next;"),
        l3dgw_port.nb_uuid
    );

    // Oversized packets bounce back as ICMP fragmentation-needed, sourced
    // from the port the packet entered through.
    for &port_index in &dp.ports {
        if port_index == l3dgw {
            continue;
        }
        let port = &model.ports[port_index];
        let PortKind::Lrp(lrp) = &port.kind else {
            continue;
        };
        let Some(ipv4) = lrp.networks.ipv4.first() else {
            continue;
        };
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_LARGER_PKTS,
            50,
            format!(
                "inport == {} && outport == {} && ip4 && \
                 {REGBIT_PKT_LARGER}",
                port.json_name, l3dgw_port.json_name
            ),
            format!(
                "icmp4 {{ icmp4.type = 3; /* Destination Unreachable */ \
                 icmp4.code = 4; /* Fragmentation Needed */ icmp4.frag_mtu \
                 = {frag_mtu}; eth.dst = {mac}; ip4.dst = ip4.src; ip4.src \
                 = {addr}; ip.ttl = 255; {REGBIT_EGRESS_LOOPBACK} = 1; \
                 next(pipeline=ingress, table=0); }};",
                frag_mtu = mtu - 18,
                mac = lrp.mac,
                addr = ipv4.addr
            ),
            port.nb_uuid
        );
    }
}

// ===== ingress stage 14: gateway redirect =====

fn build_gw_redirect(
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    nats: &[NatEntry<'_>],
    lflows: &mut LflowSet,
) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_GW_REDIRECT,
        0,
        "1",
        "next;"
    );

    let (Some(l3dgw), Some(redirect)) =
        (router.l3dgw_port, router.l3redirect_port)
    else {
        return;
    };
    let l3dgw_port = &model.ports[l3dgw];
    let redirect_port = &model.ports[redirect];

    // NAT rules that already chose a chassis stay distributed.
    for nat in nats.iter().filter(|nat| nat.is_distributed()) {
        let ip_src = if nat.is_v6() { "ip6.src" } else { "ip4.src" };
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_GW_REDIRECT,
            100,
            format!(
                "{ip_src} == {} && outport == {}",
                nat.logical_net.ip(),
                l3dgw_port.json_name
            ),
            "next;",
            nat.rule.uuid
        );
    }

    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_GW_REDIRECT,
        200,
        format!("{REGBIT_NAT_REDIRECT} == 1"),
        format!("outport = {}; next;", redirect_port.json_name)
    );
    // Unresolved Ethernet destinations centralize so the ARP request is
    // emitted on the gateway chassis.
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_GW_REDIRECT,
        150,
        format!(
            "outport == {} && eth.dst == {ETH_ADDR_ZERO} && \
             !is_chassis_resident({})",
            l3dgw_port.json_name, redirect_port.json_name
        ),
        format!("outport = {}; next;", redirect_port.json_name)
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_GW_REDIRECT,
        50,
        format!("outport == {}", l3dgw_port.json_name),
        format!("outport = {}; next;", redirect_port.json_name)
    );
}

// ===== ingress stage 15: ARP request =====

fn build_arp_request(
    nb: &NbSnapshot,
    dp: &Datapath,
    nbr: &LogicalRouter,
    lflows: &mut LflowSet,
) {
    // Static-route next hops get a precise neighbor solicitation.
    for route in nbr
        .static_routes
        .iter()
        .filter_map(|route| nb.static_routes.get(route))
    {
        let Ok(IpAddr::V6(nexthop)) = route.nexthop.parse::<IpAddr>() else {
            continue;
        };
        let sn_addr = nexthop.solicited_node_multicast();
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_IN_ARP_REQUEST,
            200,
            format!(
                "eth.dst == {ETH_ADDR_ZERO} && ip6 && {REG_NEXT_HOP_IPV6} \
                 == {nexthop}"
            ),
            format!(
                "nd_ns {{ eth.dst = {mac}; ip6.dst = {sn_addr}; nd.target \
                 = {nexthop}; output; }};",
                mac = ipv6_multicast_mac(&sn_addr)
            ),
            route.uuid
        );
    }

    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_ARP_REQUEST,
        100,
        format!("eth.dst == {ETH_ADDR_ZERO} && ip4"),
        format!(
            "arp {{ eth.dst = ff:ff:ff:ff:ff:ff; arp.spa = \
             {REG_SRC_IPV4}; arp.tpa = {REG_NEXT_HOP_IPV4}; arp.op = 1; \
             output; }};"
        )
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_ARP_REQUEST,
        100,
        format!("eth.dst == {ETH_ADDR_ZERO} && ip6"),
        format!("nd_ns {{ nd.target = {REG_NEXT_HOP_IPV6}; output; }};")
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::ROUTER_IN_ARP_REQUEST,
        0,
        "1",
        "output;"
    );
}

// Ethernet multicast address corresponding to an IPv6 multicast address.
fn ipv6_multicast_mac(addr: &std::net::Ipv6Addr) -> String {
    let octets = addr.octets();
    format!(
        "33:33:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[12], octets[13], octets[14], octets[15]
    )
}

// ===== egress stage 3: delivery =====

fn build_delivery(
    model: &Model,
    dp: &Datapath,
    router: &RouterData,
    lflows: &mut LflowSet,
) {
    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let PortKind::Lrp(lrp) = &port.kind else {
            continue;
        };
        if !lrp.enabled {
            continue;
        }

        // Multicast leaves with the port's own source address.
        if router.mcast_relay {
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::ROUTER_OUT_DELIVERY,
                110,
                format!(
                    "(ip4.mcast || ip6.mcast) && outport == {}",
                    port.json_name
                ),
                format!("eth.src = {}; output;", lrp.mac),
                port.nb_uuid
            );
        }
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::ROUTER_OUT_DELIVERY,
            100,
            format!("outport == {}", port.json_name),
            "output;",
            port.nb_uuid
        );
    }
}
