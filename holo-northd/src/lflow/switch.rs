//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Logical-switch pipeline generation: 18 ingress and 10 egress stages.

use std::collections::BTreeSet;
use std::fmt::Write;
use std::net::IpAddr;

use itertools::Itertools;
use uuid::Uuid;

use crate::addresses::LportAddresses;
use crate::datapath::{Datapath, DatapathKind, DpIndex, SwitchData};
use crate::engine::Model;
use crate::error::Error;
use crate::lflow::{
    DsBuilder, LflowSet, Stage, ETH_ADDR_ZERO, REGBIT_CONNTRACK_COMMIT,
    REGBIT_CONNTRACK_DEFRAG, REGBIT_CONNTRACK_NAT, REGBIT_DHCP_OPTS_RESULT,
    REGBIT_DNS_LOOKUP_RESULT,
};
use crate::lflow_add;
use crate::multicast::{
    McGroups, MC_FLOOD, MC_MROUTER_FLOOD, MC_STATIC, MC_UNKNOWN,
};
use crate::nb::{
    Acl, AclAction, AclDirection, LbProtocol, LoadBalancer, NbSnapshot,
};
use crate::port::{LspType, Port, PortKind};

// User ACL priorities are offset so the engine-reserved priorities stay
// above them.
pub const ACL_PRIO_OFFSET: u16 = 1000;

// ===== entry point =====

pub(crate) fn build(
    nb: &NbSnapshot,
    model: &Model,
    mc: &McGroups,
    lflows: &mut LflowSet,
) {
    for (dp_index, dp) in model.datapaths.iter().enumerate() {
        let DatapathKind::Switch(switch) = &dp.kind else {
            continue;
        };
        build_admission(model, dp, lflows);
        build_port_sec_ip(model, dp, lflows);
        build_port_sec_nd(model, dp, lflows);
        build_pre_acls(model, dp, switch, lflows);
        build_pre_lb(nb, dp, lflows);
        build_pre_stateful(dp, lflows);
        build_acls(nb, dp, switch, lflows);
        build_qos(nb, dp, lflows);
        build_lb(dp, switch, lflows);
        build_stateful(nb, dp, lflows);
        build_arp_nd_responder(model, dp, lflows);
        build_dhcp(nb, model, dp, switch, lflows);
        build_dns(dp, switch, lflows);
        build_external_ports(model, dp, switch, lflows);
        build_l2_lookup(model, dp, dp_index, switch, mc, lflows);
        build_egress_port_sec(model, dp, lflows);
    }
}

// Effective L2/L3 address entries of a switch port: static declarations,
// the dynamic assignment and, for router ports, the peer's networks.
fn effective_addresses(model: &Model, port: &Port) -> Vec<LportAddresses> {
    let Some(lsp) = port.kind.as_lsp() else {
        return Vec::new();
    };
    let mut entries = lsp.addresses.clone();
    if let Some(dynamic) = &lsp.dynamic {
        entries.push(dynamic.clone());
    }
    if lsp.has_router_addresses {
        if let Some(peer) = port.peer {
            if let PortKind::Lrp(lrp) = &model.ports[peer].kind {
                entries.push(lrp.networks.clone());
            }
        }
    }
    entries
}

// ===== ingress stage 0: admission and L2 port security =====

fn build_admission(model: &Model, dp: &Datapath, lflows: &mut LflowSet) {
    // No VLAN tags and no Ethernet multicast sources make it in.
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_PORT_SEC_L2,
        100,
        "vlan.present || eth.src[40]",
        "drop;"
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };
        if !lsp.enabled || lsp.lsp_type == LspType::External {
            continue;
        }

        let mut match_ = format!("inport == {}", port.json_name);
        if !lsp.port_security.is_empty() {
            let macs = lsp
                .port_security
                .iter()
                .map(|entry| entry.ea.to_string())
                .join(" ");
            write!(match_, " && eth.src == {{{macs}}}").unwrap();
        }
        let actions = match lsp.queue_id {
            Some(queue_id) => format!("set_queue({queue_id}); next;"),
            None => "next;".to_owned(),
        };
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_PORT_SEC_L2,
            50,
            match_,
            actions,
            port.nb_uuid
        );
    }
}

// ===== ingress stages 1-2: IP and ND port security =====

fn build_port_sec_ip(model: &Model, dp: &Datapath, lflows: &mut LflowSet) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_PORT_SEC_IP,
        0,
        "1",
        "next;"
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };
        if !lsp.enabled || lsp.port_security.is_empty() {
            continue;
        }

        let mut has_ip = false;
        for entry in &lsp.port_security {
            if !entry.ipv4.is_empty() {
                has_ip = true;
                let addrs = entry
                    .ipv4
                    .iter()
                    .map(|ip| ip.network_str())
                    .join(", ");
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::SWITCH_IN_PORT_SEC_IP,
                    90,
                    format!(
                        "inport == {} && eth.src == {} && ip4.src == \
                         {{{addrs}}}",
                        port.json_name, entry.ea
                    ),
                    "next;",
                    port.nb_uuid
                );
                // DHCPv4 discovery is sourced from the unspecified address.
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::SWITCH_IN_PORT_SEC_IP,
                    90,
                    format!(
                        "inport == {} && eth.src == {} && ip4.src == \
                         0.0.0.0 && ip4.dst == 255.255.255.255 && udp.src \
                         == 68 && udp.dst == 67",
                        port.json_name, entry.ea
                    ),
                    "next;",
                    port.nb_uuid
                );
            }
            if !entry.ipv6.is_empty() {
                has_ip = true;
                // "::" admits duplicate address detection probes; the
                // EUI-64 link-local is always legal.
                let ll = entry.ea.to_link_local();
                let addrs = entry
                    .ipv6
                    .iter()
                    .map(|ip| ip.network_str())
                    .join(", ");
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::SWITCH_IN_PORT_SEC_IP,
                    90,
                    format!(
                        "inport == {} && eth.src == {} && ip6.src == {{::, \
                         {ll}, {addrs}}}",
                        port.json_name, entry.ea
                    ),
                    "next;",
                    port.nb_uuid
                );
            }
        }

        if has_ip {
            let macs = lsp
                .port_security
                .iter()
                .map(|entry| entry.ea.to_string())
                .join(" ");
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_PORT_SEC_IP,
                80,
                format!(
                    "inport == {} && eth.src == {{{macs}}} && ip",
                    port.json_name
                ),
                "drop;",
                port.nb_uuid
            );
        }
    }
}

fn build_port_sec_nd(model: &Model, dp: &Datapath, lflows: &mut LflowSet) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_PORT_SEC_ND,
        0,
        "1",
        "next;"
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };
        if !lsp.enabled || lsp.port_security.is_empty() {
            continue;
        }

        for entry in &lsp.port_security {
            // ARP: the hardware address must match; the protocol address,
            // when constrained, must come from the declared networks.
            let mut match_ = format!(
                "inport == {} && eth.src == {} && arp.sha == {}",
                port.json_name, entry.ea, entry.ea
            );
            if !entry.ipv4.is_empty() {
                let addrs = entry
                    .ipv4
                    .iter()
                    .map(|ip| ip.network_str())
                    .join(", ");
                write!(match_, " && arp.spa == {{{addrs}}}").unwrap();
            }
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_PORT_SEC_ND,
                90,
                match_,
                "next;",
                port.nb_uuid
            );

            // ND: solicitations and advertisements carry the link-layer
            // address in their options, when present it must match.
            let ll = entry.ea.to_link_local();
            let mut targets = format!("{ll}");
            for ip in &entry.ipv6 {
                write!(targets, ", {}", ip.network_str()).unwrap();
            }
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_PORT_SEC_ND,
                90,
                format!(
                    "inport == {} && eth.src == {} && ip6 && nd && \
                     ((nd.sll == {} || nd.sll == {}) || ((nd.tll == {} || \
                     nd.tll == {}) && nd.target == {{{targets}}}))",
                    port.json_name,
                    entry.ea,
                    ETH_ADDR_ZERO,
                    entry.ea,
                    ETH_ADDR_ZERO,
                    entry.ea
                ),
                "next;",
                port.nb_uuid
            );
        }

        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_PORT_SEC_ND,
            80,
            format!("inport == {} && (arp || nd)", port.json_name),
            "drop;",
            port.nb_uuid
        );
    }
}

// ===== ingress stage 3 / egress stage 1: PRE_ACL =====

fn build_pre_acls(
    model: &Model,
    dp: &Datapath,
    switch: &SwitchData,
    lflows: &mut LflowSet,
) {
    lflow_add!(lflows, dp.sb_uuid, Stage::SWITCH_IN_PRE_ACL, 0, "1", "next;");
    lflow_add!(lflows, dp.sb_uuid, Stage::SWITCH_OUT_PRE_ACL, 0, "1", "next;");

    if !switch.has_stateful_acl {
        return;
    }

    // Traffic entering or leaving through a router or localnet port would
    // otherwise hit conntrack in two zones.
    for &port_index in
        switch.router_ports.iter().chain(switch.localnet_ports.iter())
    {
        let port = &model.ports[port_index];
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_PRE_ACL,
            110,
            format!("ip && inport == {}", port.json_name),
            "next;",
            port.nb_uuid
        );
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_OUT_PRE_ACL,
            110,
            format!("ip && outport == {}", port.json_name),
            "next;",
            port.nb_uuid
        );
    }

    // Neighbor discovery, ICMP errors and bare resets never enter
    // conntrack.
    let skip = "nd || nd_rs || nd_ra || icmp4.type == 3 || \
                icmp6.type == 1 || (tcp && tcp.flags == 4)";
    for stage in [Stage::SWITCH_IN_PRE_ACL, Stage::SWITCH_OUT_PRE_ACL] {
        lflow_add!(lflows, dp.sb_uuid, stage, 110, skip, "next;");
        lflow_add!(
            lflows,
            dp.sb_uuid,
            stage,
            100,
            "ip",
            format!("{REGBIT_CONNTRACK_DEFRAG} = 1; next;")
        );
    }
}

// ===== ingress stage 4 / egress stage 0: PRE_LB =====

// Parses a VIP key: "ip", "ip:port" or "[ip6]:port".
pub(crate) fn parse_vip(vip: &str) -> Option<(IpAddr, Option<u16>)> {
    if let Some(rest) = vip.strip_prefix('[') {
        let (addr, port) = rest.split_once("]:")?;
        let addr = addr.parse().ok()?;
        let port = port.parse().ok()?;
        return Some((IpAddr::V6(addr), Some(port)));
    }
    if let Ok(addr) = vip.parse::<IpAddr>() {
        return Some((addr, None));
    }
    let (addr, port) = vip.rsplit_once(':')?;
    let addr = addr.parse().ok()?;
    let port = port.parse().ok()?;
    Some((IpAddr::V4(addr), Some(port)))
}

fn switch_load_balancers<'a>(
    nb: &'a NbSnapshot,
    dp: &Datapath,
) -> Vec<&'a LoadBalancer> {
    nb.switches
        .get(&dp.nb_uuid)
        .map(|switch| {
            switch
                .load_balancer
                .iter()
                .filter_map(|lb| nb.load_balancers.get(lb))
                .collect()
        })
        .unwrap_or_default()
}

fn build_pre_lb(nb: &NbSnapshot, dp: &Datapath, lflows: &mut LflowSet) {
    lflow_add!(lflows, dp.sb_uuid, Stage::SWITCH_IN_PRE_LB, 0, "1", "next;");
    lflow_add!(lflows, dp.sb_uuid, Stage::SWITCH_OUT_PRE_LB, 0, "1", "next;");
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_PRE_LB,
        110,
        "nd || nd_rs || nd_ra",
        "next;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_OUT_PRE_LB,
        110,
        "nd || nd_rs || nd_ra",
        "next;"
    );

    let mut has_vip = false;
    for lb in switch_load_balancers(nb, dp) {
        for vip in lb.vips.keys() {
            let Some((addr, _)) = parse_vip(vip) else {
                Error::BadVip(lb.name.clone(), vip.clone()).log();
                continue;
            };
            has_vip = true;
            let field = match addr {
                IpAddr::V4(_) => "ip4.dst",
                IpAddr::V6(_) => "ip6.dst",
            };
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_PRE_LB,
                100,
                format!("ip && {field} == {addr}"),
                format!("{REGBIT_CONNTRACK_DEFRAG} = 1; next;"),
                lb.uuid
            );
        }
    }
    if has_vip {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_OUT_PRE_LB,
            100,
            "ip",
            format!("{REGBIT_CONNTRACK_DEFRAG} = 1; next;")
        );
    }
}

// ===== ingress stage 5 / egress stage 2: PRE_STATEFUL =====

fn build_pre_stateful(dp: &Datapath, lflows: &mut LflowSet) {
    for stage in [Stage::SWITCH_IN_PRE_STATEFUL, Stage::SWITCH_OUT_PRE_STATEFUL]
    {
        lflow_add!(lflows, dp.sb_uuid, stage, 0, "1", "next;");
        lflow_add!(
            lflows,
            dp.sb_uuid,
            stage,
            100,
            format!("{REGBIT_CONNTRACK_DEFRAG} == 1"),
            "ct_next;"
        );
    }
}

// ===== ingress stage 6 / egress stage 4: ACL =====

// All ACLs that apply to a switch: its own plus those of the port groups
// with members on it.
pub(crate) fn switch_acls<'a>(
    nb: &'a NbSnapshot,
    switch_uuid: &Uuid,
    port_groups: &BTreeSet<Uuid>,
) -> Vec<&'a Acl> {
    let mut acls: Vec<&Acl> = Vec::new();
    if let Some(nbs) = nb.switches.get(switch_uuid) {
        acls.extend(nbs.acls.iter().filter_map(|acl| nb.acls.get(acl)));
    }
    for pg in port_groups {
        if let Some(pg) = nb.port_groups.get(pg) {
            acls.extend(pg.acls.iter().filter_map(|acl| nb.acls.get(acl)));
        }
    }
    acls
}

fn acl_log_prefix(acl: &Acl) -> String {
    if !acl.log {
        return String::new();
    }
    let mut log = DsBuilder::new();
    log.push("log(");
    if let Some(name) = &acl.name {
        write!(log, "name=\"{name}\", ").unwrap();
    }
    let verdict = match acl.action {
        AclAction::Allow | AclAction::AllowRelated => "allow",
        AclAction::Drop => "drop",
        AclAction::Reject => "reject",
    };
    write!(log, "verdict={verdict}, ").unwrap();
    if let Some(severity) = &acl.severity {
        write!(log, "severity={severity}, ").unwrap();
    }
    if let Some(meter) = &acl.meter {
        write!(log, "meter=\"{meter}\", ").unwrap();
    }
    log.strip_suffix(", ");
    log.push("); ");
    log.build()
}

fn build_acls(
    nb: &NbSnapshot,
    dp: &Datapath,
    switch: &SwitchData,
    lflows: &mut LflowSet,
) {
    lflow_add!(lflows, dp.sb_uuid, Stage::SWITCH_IN_ACL, 0, "1", "next;");
    lflow_add!(lflows, dp.sb_uuid, Stage::SWITCH_OUT_ACL, 0, "1", "next;");

    if switch.has_stateful_acl {
        for stage in [Stage::SWITCH_IN_ACL, Stage::SWITCH_OUT_ACL] {
            // Commit new connections so ACLs see them as established from
            // the second packet on; re-commit when a blocked connection is
            // allowed again.
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                1,
                "ip && (!ct.est || (ct.est && ct_label.blocked == 1))",
                format!("{REGBIT_CONNTRACK_COMMIT} = 1; next;")
            );
            // Universal patterns above every user priority.
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                u16::MAX,
                "ct.inv || (ct.est && ct.rpl && ct_label.blocked == 1)",
                "drop;"
            );
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                u16::MAX,
                "ct.est && !ct.rel && !ct.new && !ct.inv && ct.rpl && \
                 ct_label.blocked == 0",
                "next;"
            );
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                u16::MAX,
                "!ct.est && ct.rel && !ct.new && !ct.inv && \
                 ct_label.blocked == 0",
                "next;"
            );
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                u16::MAX,
                "nd || nd_rs || nd_ra",
                "next;"
            );
        }
    }

    for acl in switch_acls(nb, &dp.nb_uuid, &switch.port_groups) {
        consider_acl(dp, acl, switch.has_stateful_acl, lflows);
    }
}

fn consider_acl(
    dp: &Datapath,
    acl: &Acl,
    has_stateful: bool,
    lflows: &mut LflowSet,
) {
    let stage = match acl.direction {
        AclDirection::FromLport => Stage::SWITCH_IN_ACL,
        AclDirection::ToLport => Stage::SWITCH_OUT_ACL,
    };
    let priority = acl.priority + ACL_PRIO_OFFSET;
    let log = acl_log_prefix(acl);

    match acl.action {
        AclAction::Allow | AclAction::AllowRelated => {
            if !has_stateful {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    stage,
                    priority,
                    acl.match_.clone(),
                    format!("{log}next;"),
                    acl.uuid
                );
                return;
            }
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                priority,
                format!(
                    "((ct.new && !ct.est) || (!ct.new && ct.est && !ct.rpl \
                     && ct_label.blocked == 1)) && ({})",
                    acl.match_
                ),
                format!("{log}{REGBIT_CONNTRACK_COMMIT} = 1; next;"),
                acl.uuid
            );
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                priority,
                format!(
                    "!ct.new && ct.est && !ct.rpl && ct_label.blocked == 0 \
                     && ({})",
                    acl.match_
                ),
                format!("{log}next;"),
                acl.uuid
            );
        }
        AclAction::Drop | AclAction::Reject => {
            let gate = if has_stateful {
                "((ct.new && !ct.est) || (ct.est && ct_label.blocked == 1)) \
                 && "
            } else {
                ""
            };

            if acl.action == AclAction::Reject {
                build_reject_acl(dp, acl, stage, gate, &log, lflows);
            } else {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    stage,
                    priority,
                    format!("{gate}({})", acl.match_),
                    format!("{log}drop;"),
                    acl.uuid
                );
            }

            if has_stateful {
                // Established connections newly matching a blocking ACL are
                // labelled so their packets stop passing the universal
                // allow-established pattern.
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    stage,
                    priority,
                    format!(
                        "!ct.new && ct.est && !ct.rpl && ct_label.blocked \
                         == 0 && ({})",
                        acl.match_
                    ),
                    format!("{log}ct_commit(ct_label=1/1);"),
                    acl.uuid
                );
            }
        }
    }
}

fn build_reject_acl(
    dp: &Datapath,
    acl: &Acl,
    stage: Stage,
    gate: &str,
    log: &str,
    lflows: &mut LflowSet,
) {
    let priority = acl.priority + ACL_PRIO_OFFSET;

    // TCP gets a proper reset, everything else an ICMP unreachable; the
    // reply swaps L2/L3 addresses and inverts the ports.
    lflow_add!(
        lflows,
        dp.sb_uuid,
        stage,
        priority + 10,
        format!("tcp && ip4 && {gate}({})", acl.match_),
        format!(
            "{log}tcp_reset {{ eth.dst <-> eth.src; ip4.dst <-> ip4.src; \
             tcp.dst <-> tcp.src; outport <-> inport; flags.loopback = 1; \
             output; }};"
        ),
        acl.uuid
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        stage,
        priority + 10,
        format!("tcp && ip6 && {gate}({})", acl.match_),
        format!(
            "{log}tcp_reset {{ eth.dst <-> eth.src; ip6.dst <-> ip6.src; \
             tcp.dst <-> tcp.src; outport <-> inport; flags.loopback = 1; \
             output; }};"
        ),
        acl.uuid
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        stage,
        priority,
        format!("ip4 && {gate}({})", acl.match_),
        format!(
            "{log}icmp4 {{ eth.dst <-> eth.src; ip4.dst <-> ip4.src; \
             icmp4.type = 3; icmp4.code = 1; outport <-> inport; \
             flags.loopback = 1; output; }};"
        ),
        acl.uuid
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        stage,
        priority,
        format!("ip6 && {gate}({})", acl.match_),
        format!(
            "{log}icmp6 {{ eth.dst <-> eth.src; ip6.dst <-> ip6.src; \
             icmp6.type = 1; icmp6.code = 4; outport <-> inport; \
             flags.loopback = 1; output; }};"
        ),
        acl.uuid
    );
}

// ===== ingress stages 7-8 / egress stages 5-6: QoS =====

fn build_qos(nb: &NbSnapshot, dp: &Datapath, lflows: &mut LflowSet) {
    for stage in [
        Stage::SWITCH_IN_QOS_MARK,
        Stage::SWITCH_OUT_QOS_MARK,
        Stage::SWITCH_IN_QOS_METER,
        Stage::SWITCH_OUT_QOS_METER,
    ] {
        lflow_add!(lflows, dp.sb_uuid, stage, 0, "1", "next;");
    }

    let Some(nbs) = nb.switches.get(&dp.nb_uuid) else {
        return;
    };
    for qos in nbs.qos_rules.iter().filter_map(|qos| nb.qos_rules.get(qos)) {
        let ingress = qos.direction == AclDirection::FromLport;
        if let Some(dscp) = qos.dscp {
            let stage = if ingress {
                Stage::SWITCH_IN_QOS_MARK
            } else {
                Stage::SWITCH_OUT_QOS_MARK
            };
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                qos.priority,
                qos.match_.clone(),
                format!("ip.dscp = {dscp}; next;"),
                qos.uuid
            );
        }
        if let Some(rate) = qos.bandwidth_rate {
            let stage = if ingress {
                Stage::SWITCH_IN_QOS_METER
            } else {
                Stage::SWITCH_OUT_QOS_METER
            };
            let actions = match qos.bandwidth_burst {
                Some(burst) => format!("set_meter({rate}, {burst}); next;"),
                None => format!("set_meter({rate}); next;"),
            };
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                qos.priority,
                qos.match_.clone(),
                actions,
                qos.uuid
            );
        }
    }
}

// ===== ingress stage 9 / egress stage 3: LB =====

fn build_lb(dp: &Datapath, switch: &SwitchData, lflows: &mut LflowSet) {
    lflow_add!(lflows, dp.sb_uuid, Stage::SWITCH_IN_LB, 0, "1", "next;");
    lflow_add!(lflows, dp.sb_uuid, Stage::SWITCH_OUT_LB, 0, "1", "next;");

    if switch.has_lb_vip {
        // Established connections already went through the load balancer;
        // flag them so the stateful stage applies the NAT.
        for stage in [Stage::SWITCH_IN_LB, Stage::SWITCH_OUT_LB] {
            lflow_add!(
                lflows,
                dp.sb_uuid,
                stage,
                u16::MAX,
                "ct.est && !ct.rel && !ct.new && !ct.inv",
                format!("{REGBIT_CONNTRACK_NAT} = 1; next;")
            );
        }
    }
}

// ===== ingress stage 10 / egress stage 7: STATEFUL =====

fn build_stateful(nb: &NbSnapshot, dp: &Datapath, lflows: &mut LflowSet) {
    let controller_event = nb
        .global
        .options
        .get("controller_event")
        .map(String::as_str)
        == Some("true");
    let elb_meter = nb
        .meters
        .values()
        .any(|meter| meter.name == "event-elb");

    for stage in [Stage::SWITCH_IN_STATEFUL, Stage::SWITCH_OUT_STATEFUL] {
        lflow_add!(lflows, dp.sb_uuid, stage, 0, "1", "next;");
        lflow_add!(
            lflows,
            dp.sb_uuid,
            stage,
            100,
            format!("{REGBIT_CONNTRACK_COMMIT} == 1"),
            "ct_commit(ct_label=0/1); next;"
        );
        lflow_add!(
            lflows,
            dp.sb_uuid,
            stage,
            100,
            format!("{REGBIT_CONNTRACK_NAT} == 1"),
            "ct_lb;"
        );
    }

    for lb in switch_load_balancers(nb, dp) {
        let proto = lb.protocol.unwrap_or(LbProtocol::Tcp);
        for (vip, backends) in &lb.vips {
            let Some((addr, port)) = parse_vip(vip) else {
                continue;
            };
            let field = match addr {
                IpAddr::V4(_) => "ip4.dst",
                IpAddr::V6(_) => "ip6.dst",
            };
            let (priority, match_) = match port {
                Some(port) => (
                    120,
                    format!(
                        "ct.new && {field} == {addr} && {proto}.dst == \
                         {port}",
                        proto = proto.as_str()
                    ),
                ),
                None => (110, format!("ct.new && {field} == {addr}")),
            };

            // A VIP without backends cannot be balanced; when requested,
            // raise a controller event instead so an orchestrator can
            // react.
            if backends.is_empty() {
                if controller_event {
                    let meter = if elb_meter {
                        "meter = \"event-elb\", "
                    } else {
                        ""
                    };
                    lflow_add!(
                        lflows,
                        dp.sb_uuid,
                        Stage::SWITCH_IN_STATEFUL,
                        130,
                        match_,
                        format!(
                            "trigger_event(event = \"empty_lb_backends\", \
                             {meter}vip = \"{vip}\", protocol = \
                             \"{proto}\", load_balancer = \"{uuid}\");",
                            proto = proto.as_str(),
                            uuid = lb.uuid
                        ),
                        lb.uuid
                    );
                }
                continue;
            }

            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_STATEFUL,
                priority,
                match_,
                format!("ct_lb({backends});"),
                lb.uuid
            );
        }
    }
}

// ===== ingress stage 11: ARP/ND responder =====

fn build_arp_nd_responder(
    model: &Model,
    dp: &Datapath,
    lflows: &mut LflowSet,
) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_ARP_ND_RSP,
        0,
        "1",
        "next;"
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };
        if !lsp.enabled {
            continue;
        }

        // Virtual ports bind to whichever parent answers for the virtual
        // address.
        if lsp.lsp_type == LspType::Virtual {
            build_virtual_port_binding(model, dp, port, lflows);
            continue;
        }
        if matches!(lsp.lsp_type, LspType::Localnet | LspType::Vtep) {
            continue;
        }
        let is_router = lsp.lsp_type == LspType::Router;

        for entry in effective_addresses(model, port) {
            for ipv4 in &entry.ipv4 {
                // The owner keeps seeing its own ARP probes, preserving
                // duplicate address detection.
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::SWITCH_IN_ARP_ND_RSP,
                    100,
                    format!(
                        "arp.tpa == {} && arp.op == 1 && inport == {}",
                        ipv4.addr, port.json_name
                    ),
                    "next;",
                    port.nb_uuid
                );
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::SWITCH_IN_ARP_ND_RSP,
                    50,
                    format!("arp.tpa == {} && arp.op == 1", ipv4.addr),
                    format!(
                        "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; \
                         /* ARP reply */ arp.tha = arp.sha; arp.sha = \
                         {mac}; arp.tpa = arp.spa; arp.spa = {addr}; \
                         outport = inport; flags.loopback = 1; output;",
                        mac = entry.ea,
                        addr = ipv4.addr
                    ),
                    port.nb_uuid
                );
            }
            for ipv6 in &entry.ipv6 {
                let responder = if is_router { "nd_na_router" } else { "nd_na" };
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::SWITCH_IN_ARP_ND_RSP,
                    100,
                    format!(
                        "nd_ns && ip6.dst == {{{addr}, {sn}}} && nd.target \
                         == {addr} && inport == {}",
                        port.json_name,
                        addr = ipv6.addr,
                        sn = ipv6.solicited_node()
                    ),
                    "next;",
                    port.nb_uuid
                );
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::SWITCH_IN_ARP_ND_RSP,
                    50,
                    format!(
                        "nd_ns && ip6.dst == {{{addr}, {sn}}} && nd.target \
                         == {addr}",
                        addr = ipv6.addr,
                        sn = ipv6.solicited_node()
                    ),
                    format!(
                        "{responder} {{ eth.src = {mac}; ip6.src = {addr}; \
                         nd.target = {addr}; nd.tll = {mac}; outport = \
                         inport; flags.loopback = 1; output; }};",
                        mac = entry.ea,
                        addr = ipv6.addr
                    ),
                    port.nb_uuid
                );
            }
        }
    }
}

fn build_virtual_port_binding(
    model: &Model,
    dp: &Datapath,
    port: &Port,
    lflows: &mut LflowSet,
) {
    let Some(lsp) = port.kind.as_lsp() else {
        return;
    };
    let Some(vip) = lsp.options.get("virtual-ip") else {
        return;
    };
    let Some(parents) = lsp.options.get("virtual-parents") else {
        return;
    };
    if vip.parse::<std::net::Ipv4Addr>().is_err() {
        Error::BadIpAddr(port.name.clone(), vip.clone()).log();
        return;
    }

    for parent in parents.split(',') {
        let Some(&parent_index) = model.port_by_name.get(parent) else {
            Error::MissingVirtualParent(port.name.clone(), parent.to_owned())
                .log();
            continue;
        };
        let parent_port = &model.ports[parent_index];
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_ARP_ND_RSP,
            100,
            format!(
                "inport == {parent} && ((arp.op == 1 && arp.spa == {vip} \
                 && arp.tpa == {vip}) || (arp.op == 2 && arp.spa == \
                 {vip}))",
                parent = parent_port.json_name
            ),
            format!("bind_vport({}, inport); next;", port.json_name),
            port.nb_uuid
        );
    }
}

// ===== ingress stages 12-13: DHCP =====

fn build_dhcp(
    nb: &NbSnapshot,
    model: &Model,
    dp: &Datapath,
    switch: &SwitchData,
    lflows: &mut LflowSet,
) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DHCP_OPTIONS,
        0,
        "1",
        "next;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DHCP_RESPONSE,
        0,
        "1",
        "next;"
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };
        if !lsp.enabled
            || matches!(
                lsp.lsp_type,
                LspType::Router | LspType::Localnet | LspType::Vtep
            )
        {
            continue;
        }

        // External ports are reached through the localnet port and answer
        // only on the chassis owning them.
        let (inports, resident): (Vec<&Port>, Option<&Port>) =
            if lsp.lsp_type == LspType::External {
                if switch.localnet_ports.is_empty() {
                    continue;
                }
                (
                    switch
                        .localnet_ports
                        .iter()
                        .map(|&index| &model.ports[index])
                        .collect(),
                    Some(port),
                )
            } else {
                (vec![port], None)
            };

        for entry in effective_addresses(model, port) {
            for &inport in &inports {
                for ipv4 in &entry.ipv4 {
                    build_dhcpv4(
                        nb, dp, port, inport, resident, &entry, ipv4.addr,
                        lflows,
                    );
                }
                for ipv6 in &entry.ipv6 {
                    build_dhcpv6(
                        nb, dp, port, inport, resident, &entry, ipv6.addr,
                        lflows,
                    );
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_dhcpv4(
    nb: &NbSnapshot,
    dp: &Datapath,
    port: &Port,
    inport: &Port,
    resident: Option<&Port>,
    entry: &LportAddresses,
    offer_ip: std::net::Ipv4Addr,
    lflows: &mut LflowSet,
) {
    let Some(lsp) = port.kind.as_lsp() else {
        return;
    };
    let Some(options) =
        lsp.dhcpv4_options.and_then(|uuid| nb.dhcp_options.get(&uuid))
    else {
        return;
    };
    let Ok(cidr) = options.cidr.parse::<ipnetwork::Ipv4Network>() else {
        Error::BadCidr(port.name.clone(), options.cidr.clone()).log();
        return;
    };
    // The offered address must be coverable by the option set.
    if !cidr.contains(offer_ip) {
        return;
    }
    let (Some(server_ip), Some(server_mac)) = (
        options.options.get("server_id"),
        options.options.get("server_mac"),
    ) else {
        return;
    };
    if !options.options.contains_key("lease_time") {
        return;
    }

    let mut opts = DsBuilder::new();
    write!(opts, "offerip = {offer_ip}, ").unwrap();
    for (key, value) in &options.options {
        write!(opts, "{key} = {value}, ").unwrap();
    }
    opts.strip_suffix(", ");
    let opts = opts.build();

    let resident_guard = resident
        .map(|port| format!(" && is_chassis_resident({})", port.json_name))
        .unwrap_or_default();

    let discover = format!(
        "inport == {} && eth.src == {} && ip4.src == 0.0.0.0 && ip4.dst == \
         255.255.255.255 && udp.src == 68 && udp.dst == 67{resident_guard}",
        inport.json_name, entry.ea
    );
    let renew = format!(
        "inport == {} && eth.src == {} && ip4.src == {offer_ip} && ip4.dst \
         == {{{server_ip}, 255.255.255.255}} && udp.src == 68 && udp.dst \
         == 67{resident_guard}",
        inport.json_name, entry.ea
    );

    for request in [&discover, &renew] {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_DHCP_OPTIONS,
            100,
            request.clone(),
            format!(
                "{REGBIT_DHCP_OPTS_RESULT} = put_dhcp_opts({opts}); next;"
            ),
            port.nb_uuid
        );
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_DHCP_RESPONSE,
            100,
            format!("{request} && {REGBIT_DHCP_OPTS_RESULT}"),
            format!(
                "eth.dst = eth.src; eth.src = {server_mac}; ip4.dst = \
                 {offer_ip}; ip4.src = {server_ip}; udp.src = 67; udp.dst \
                 = 68; outport = inport; flags.loopback = 1; output;"
            ),
            port.nb_uuid
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn build_dhcpv6(
    nb: &NbSnapshot,
    dp: &Datapath,
    port: &Port,
    inport: &Port,
    resident: Option<&Port>,
    entry: &LportAddresses,
    offer_ip: std::net::Ipv6Addr,
    lflows: &mut LflowSet,
) {
    let Some(lsp) = port.kind.as_lsp() else {
        return;
    };
    let Some(options) =
        lsp.dhcpv6_options.and_then(|uuid| nb.dhcp_options.get(&uuid))
    else {
        return;
    };
    let Ok(cidr) = options.cidr.parse::<ipnetwork::Ipv6Network>() else {
        Error::BadCidr(port.name.clone(), options.cidr.clone()).log();
        return;
    };
    if !cidr.contains(offer_ip) {
        return;
    }
    let Some(server_mac) = options.options.get("server_id") else {
        return;
    };
    let Ok(server_mac_parsed) =
        server_mac.parse::<holo_utils::mac_addr::MacAddr>()
    else {
        Error::BadMacAddr(port.name.clone(), server_mac.clone()).log();
        return;
    };
    // The reply is sourced from the server link-local address.
    let server_ip = server_mac_parsed.to_link_local();

    let stateless = options.options.get("dhcpv6_stateless").map(String::as_str)
        == Some("true");
    let mut opts = DsBuilder::new();
    if !stateless {
        write!(opts, "ia_addr = {offer_ip}, ").unwrap();
    }
    for (key, value) in &options.options {
        if key == "dhcpv6_stateless" {
            continue;
        }
        write!(opts, "{key} = {value}, ").unwrap();
    }
    opts.strip_suffix(", ");
    let opts = opts.build();

    let resident_guard = resident
        .map(|port| format!(" && is_chassis_resident({})", port.json_name))
        .unwrap_or_default();

    let request = format!(
        "inport == {} && eth.src == {} && ip6.dst == {{ff02::1:2, \
         ff05::1:3}} && udp.src == 546 && udp.dst == 547{resident_guard}",
        inport.json_name, entry.ea
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DHCP_OPTIONS,
        100,
        request.clone(),
        format!("{REGBIT_DHCP_OPTS_RESULT} = put_dhcpv6_opts({opts}); next;"),
        port.nb_uuid
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DHCP_RESPONSE,
        100,
        format!("{request} && {REGBIT_DHCP_OPTS_RESULT}"),
        format!(
            "eth.dst = eth.src; eth.src = {server_mac}; ip6.dst = ip6.src; \
             ip6.src = {server_ip}; udp.src = 547; udp.dst = 546; outport \
             = inport; flags.loopback = 1; output;"
        ),
        port.nb_uuid
    );
}

// ===== ingress stages 14-15: DNS =====

fn build_dns(dp: &Datapath, switch: &SwitchData, lflows: &mut LflowSet) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DNS_LOOKUP,
        0,
        "1",
        "next;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DNS_RESPONSE,
        0,
        "1",
        "next;"
    );

    if !switch.has_dns_records {
        return;
    }

    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DNS_LOOKUP,
        100,
        "udp.dst == 53",
        format!("{REGBIT_DNS_LOOKUP_RESULT} = dns_lookup(); next;")
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DNS_RESPONSE,
        100,
        format!("udp.dst == 53 && {REGBIT_DNS_LOOKUP_RESULT} && ip4"),
        "eth.dst <-> eth.src; ip4.src <-> ip4.dst; udp.dst = udp.src; \
         udp.src = 53; outport = inport; flags.loopback = 1; output;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_DNS_RESPONSE,
        100,
        format!("udp.dst == 53 && {REGBIT_DNS_LOOKUP_RESULT} && ip6"),
        "eth.dst <-> eth.src; ip6.src <-> ip6.dst; udp.dst = udp.src; \
         udp.src = 53; outport = inport; flags.loopback = 1; output;"
    );
}

// ===== ingress stage 16: external ports =====

// ARP and ND requests for the attached router addresses are only answered
// on the chassis hosting the external port, forcing the router pipeline to
// run there.
fn build_external_ports(
    model: &Model,
    dp: &Datapath,
    switch: &SwitchData,
    lflows: &mut LflowSet,
) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_EXTERNAL_PORT,
        0,
        "1",
        "next;"
    );

    // Router addresses on this switch.
    let mut router_v4 = Vec::new();
    let mut router_v6 = Vec::new();
    for &port_index in &switch.router_ports {
        let Some(peer) = model.ports[port_index].peer else {
            continue;
        };
        if let PortKind::Lrp(lrp) = &model.ports[peer].kind {
            router_v4.extend(lrp.networks.ipv4.iter().map(|ip| ip.addr));
            router_v6.extend(lrp.networks.ipv6.iter().map(|ip| ip.addr));
        }
    }

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };
        if lsp.lsp_type != LspType::External || !lsp.enabled {
            continue;
        }

        for entry in &lsp.addresses {
            for &localnet_index in &switch.localnet_ports {
                let localnet = &model.ports[localnet_index];
                for addr in &router_v4 {
                    lflow_add!(
                        lflows,
                        dp.sb_uuid,
                        Stage::SWITCH_IN_EXTERNAL_PORT,
                        100,
                        format!(
                            "inport == {} && eth.src == {} && arp.tpa == \
                             {addr} && arp.op == 1 && \
                             !is_chassis_resident({})",
                            localnet.json_name, entry.ea, port.json_name
                        ),
                        "drop;",
                        port.nb_uuid
                    );
                }
                for addr in &router_v6 {
                    lflow_add!(
                        lflows,
                        dp.sb_uuid,
                        Stage::SWITCH_IN_EXTERNAL_PORT,
                        100,
                        format!(
                            "inport == {} && eth.src == {} && nd_ns && \
                             nd.target == {addr} && \
                             !is_chassis_resident({})",
                            localnet.json_name, entry.ea, port.json_name
                        ),
                        "drop;",
                        port.nb_uuid
                    );
                }
            }
        }
    }
}

// ===== ingress stage 17: L2 lookup =====

fn build_l2_lookup(
    model: &Model,
    dp: &Datapath,
    dp_index: DpIndex,
    switch: &SwitchData,
    mc: &McGroups,
    lflows: &mut LflowSet,
) {
    // Multicast handling: snooping punts IGMP to the controller, the local
    // network control range always floods, and everything else follows the
    // learned groups and the flood policy.
    if switch.mcast.enabled {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_L2_LKUP,
            100,
            "eth.mcast && ip4 && ip.proto == 2",
            "igmp;"
        );
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_L2_LKUP,
            85,
            "eth.mcast && ip4 && ip4.dst == 224.0.0.0/24",
            format!("outport = \"{}\"; output;", MC_FLOOD.0)
        );

        let has_mrouters = mc
            .get(dp_index, MC_MROUTER_FLOOD.0)
            .is_some_and(|group| !group.ports.is_empty());
        let has_static = mc
            .get(dp_index, MC_STATIC.0)
            .is_some_and(|group| !group.ports.is_empty());

        if !switch.mcast.flood_unregistered {
            let mut actions = DsBuilder::new();
            if has_mrouters {
                write!(
                    actions,
                    "clone {{ outport = \"{}\"; output; }}; ",
                    MC_MROUTER_FLOOD.0
                )
                .unwrap();
            }
            if has_static {
                write!(actions, "outport = \"{}\"; output;", MC_STATIC.0)
                    .unwrap();
            } else {
                actions.push("drop;");
            }
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_L2_LKUP,
                80,
                "eth.mcast && ip4.mcast",
                actions.build()
            );
        }

        // Learned groups.
        for aggregate in
            model.igmp_aggregates.iter().filter(|agg| agg.dp == dp_index)
        {
            let field = match aggregate.address {
                IpAddr::V4(_) => "ip4.dst",
                IpAddr::V6(_) => "ip6.dst",
            };
            let mut actions = DsBuilder::new();
            if has_mrouters {
                write!(
                    actions,
                    "clone {{ outport = \"{}\"; output; }}; ",
                    MC_MROUTER_FLOOD.0
                )
                .unwrap();
            }
            if has_static {
                write!(
                    actions,
                    "clone {{ outport = \"{}\"; output; }}; ",
                    MC_STATIC.0
                )
                .unwrap();
            }
            write!(actions, "outport = \"{}\"; output;", aggregate.address)
                .unwrap();
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_L2_LKUP,
                90,
                format!("eth.mcast && {field} == {}", aggregate.address),
                actions.build()
            );
        }
    }

    // Remaining multicast and broadcast floods.
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_IN_L2_LKUP,
        70,
        "eth.mcast",
        format!("outport = \"{}\"; output;", MC_FLOOD.0)
    );

    // Known unicast addresses.
    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };
        if !lsp.enabled {
            continue;
        }

        for entry in &lsp.addresses {
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_L2_LKUP,
                50,
                format!("eth.dst == {}", entry.ea),
                format!("outport = {}; output;", port.json_name),
                port.nb_uuid
            );
        }
        if let Some(dynamic) = &lsp.dynamic {
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_IN_L2_LKUP,
                50,
                format!("eth.dst == {}", dynamic.ea),
                format!("outport = {}; output;", port.json_name),
                port.nb_uuid
            );
        }
        if lsp.has_router_addresses {
            if let Some(peer) = port.peer {
                if let PortKind::Lrp(lrp) = &model.ports[peer].kind {
                    let mut match_ = format!("eth.dst == {}", lrp.mac);
                    // Learning prefers the chassis owning the gateway.
                    let peer_dp = &model.datapaths[model.ports[peer].dp];
                    if let DatapathKind::Router(router) = &peer_dp.kind {
                        if router.l3dgw_port == Some(peer) {
                            if let Some(redirect) = router.l3redirect_port {
                                write!(
                                    match_,
                                    " && is_chassis_resident({})",
                                    model.ports[redirect].json_name
                                )
                                .unwrap();
                            }
                        }
                    }
                    lflow_add!(
                        lflows,
                        dp.sb_uuid,
                        Stage::SWITCH_IN_L2_LKUP,
                        50,
                        match_,
                        format!("outport = {}; output;", port.json_name),
                        port.nb_uuid
                    );
                }
            }
        }
    }

    // Unknown destinations.
    if switch.has_unknown {
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_IN_L2_LKUP,
            0,
            "1",
            format!("outport = \"{}\"; output;", MC_UNKNOWN.0)
        );
    }
}

// ===== egress stages 8-9: port security =====

fn build_egress_port_sec(
    model: &Model,
    dp: &Datapath,
    lflows: &mut LflowSet,
) {
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_OUT_PORT_SEC_IP,
        0,
        "1",
        "next;"
    );
    lflow_add!(
        lflows,
        dp.sb_uuid,
        Stage::SWITCH_OUT_PORT_SEC_L2,
        100,
        "eth.mcast",
        "output;"
    );

    for &port_index in &dp.ports {
        let port = &model.ports[port_index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };

        if !lsp.enabled {
            // Disabled ports never receive the flood.
            lflow_add!(
                lflows,
                dp.sb_uuid,
                Stage::SWITCH_OUT_PORT_SEC_L2,
                150,
                format!("outport == {}", port.json_name),
                "drop;",
                port.nb_uuid
            );
            continue;
        }

        let mut match_ = format!("outport == {}", port.json_name);
        if !lsp.port_security.is_empty() {
            let macs = lsp
                .port_security
                .iter()
                .map(|entry| entry.ea.to_string())
                .join(" ");
            write!(match_, " && eth.dst == {{{macs}}}").unwrap();

            // Reception-side IP filtering, broadcast and multicast
            // included.
            let mut has_ip = false;
            for entry in &lsp.port_security {
                if !entry.ipv4.is_empty() {
                    has_ip = true;
                    let mut addrs =
                        "255.255.255.255, 224.0.0.0/4".to_owned();
                    for ip in &entry.ipv4 {
                        write!(addrs, ", {}", ip.network_str()).unwrap();
                        if ip.plen() < 32 {
                            write!(addrs, ", {}", ip.broadcast()).unwrap();
                        }
                    }
                    lflow_add!(
                        lflows,
                        dp.sb_uuid,
                        Stage::SWITCH_OUT_PORT_SEC_IP,
                        90,
                        format!(
                            "outport == {} && eth.dst == {} && ip4.dst == \
                             {{{addrs}}}",
                            port.json_name, entry.ea
                        ),
                        "next;",
                        port.nb_uuid
                    );
                }
                if !entry.ipv6.is_empty() {
                    has_ip = true;
                    let ll = entry.ea.to_link_local();
                    let addrs = entry
                        .ipv6
                        .iter()
                        .map(|ip| ip.network_str())
                        .join(", ");
                    lflow_add!(
                        lflows,
                        dp.sb_uuid,
                        Stage::SWITCH_OUT_PORT_SEC_IP,
                        90,
                        format!(
                            "outport == {} && eth.dst == {} && ip6.dst == \
                             {{{ll}, ff00::/8, {addrs}}}",
                            port.json_name, entry.ea
                        ),
                        "next;",
                        port.nb_uuid
                    );
                }
            }
            if has_ip {
                lflow_add!(
                    lflows,
                    dp.sb_uuid,
                    Stage::SWITCH_OUT_PORT_SEC_IP,
                    80,
                    format!(
                        "outport == {} && eth.dst == {{{macs}}} && ip",
                        port.json_name
                    ),
                    "drop;",
                    port.nb_uuid
                );
            }
        }
        lflow_add!(
            lflows,
            dp.sb_uuid,
            Stage::SWITCH_OUT_PORT_SEC_L2,
            50,
            match_,
            "output;",
            port.nb_uuid
        );
    }
}
