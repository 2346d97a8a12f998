//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::allocator::{TnlKeySpace, MCAST_KEY_MAX, MCAST_KEY_MIN};
use crate::datapath::{DatapathKind, DpIndex};
use crate::debug::Debug;
use crate::engine::Model;
use crate::error::Error;
use crate::port::{LspType, PortIndex, PortKind};
use crate::sb::SbSnapshot;

// Reserved multicast groups, installed on every datapath as needed. The
// names and keys are fixed and visible to the downstream agents.
pub const MC_FLOOD: (&str, u16) = ("_MC_flood", 65535);
pub const MC_UNKNOWN: (&str, u16) = ("_MC_unknown", 65534);
pub const MC_MROUTER_FLOOD: (&str, u16) = ("_MC_mrouter_flood", 65533);
pub const MC_MROUTER_STATIC: (&str, u16) = ("_MC_mrouter_static", 65532);
pub const MC_STATIC: (&str, u16) = ("_MC_static", 65531);

// Multicast snooping limits.
const MCAST_DEFAULT_MAX_ENTRIES: i64 = 2048;
const MCAST_MIN_IDLE_TIMEOUT_S: i64 = 15;
const MCAST_MAX_IDLE_TIMEOUT_S: i64 = 3600;
const MCAST_DEFAULT_IDLE_TIMEOUT_S: i64 = 300;
const MCAST_MIN_QUERY_INTERVAL_S: i64 = 1;
const MCAST_DEFAULT_QUERY_MAX_RESPONSE_S: i64 = 1;

// Per-switch multicast snooping configuration, clamped to the documented
// limits.
#[derive(Clone, Debug)]
pub struct McastSwitchConfig {
    pub enabled: bool,
    pub querier: bool,
    pub flood_unregistered: bool,
    pub table_size: i64,
    pub idle_timeout: i64,
    pub query_interval: i64,
    pub query_max_resp: i64,
    pub eth_src: String,
    pub ip4_src: String,
}

// One learned multicast group after folding all contributing southbound
// IGMP rows: (datapath, normalized address) with the accumulated member
// ports and the datapath-scoped key assigned to it.
#[derive(Debug)]
pub struct IgmpAggregate {
    pub dp: DpIndex,
    pub address: IpAddr,
    pub ports: BTreeSet<PortIndex>,
    pub key: u16,
}

// The computed multicast-group set: (datapath, group name) to key and
// member ports. The writer de-duplicates ports per key by construction.
#[derive(Debug, Default)]
pub struct McGroups {
    groups: BTreeMap<(DpIndex, String), McGroup>,
}

#[derive(Debug)]
pub struct McGroup {
    pub key: u16,
    pub ports: BTreeSet<PortIndex>,
}

// ===== impl McastSwitchConfig =====

impl Default for McastSwitchConfig {
    fn default() -> McastSwitchConfig {
        McastSwitchConfig {
            enabled: false,
            querier: true,
            flood_unregistered: false,
            table_size: MCAST_DEFAULT_MAX_ENTRIES,
            idle_timeout: MCAST_DEFAULT_IDLE_TIMEOUT_S,
            query_interval: MCAST_DEFAULT_IDLE_TIMEOUT_S / 2,
            query_max_resp: MCAST_DEFAULT_QUERY_MAX_RESPONSE_S,
            eth_src: String::new(),
            ip4_src: String::new(),
        }
    }
}

impl McastSwitchConfig {
    pub fn from_config(config: &BTreeMap<String, String>) -> Self {
        let get_bool = |key: &str, dflt: bool| {
            config
                .get(key)
                .map(|value| value == "true")
                .unwrap_or(dflt)
        };
        let get_i64 = |key: &str, dflt: i64| {
            config
                .get(key)
                .and_then(|value| value.parse().ok())
                .unwrap_or(dflt)
        };

        let idle_timeout = get_i64(
            "mcast_idle_timeout",
            MCAST_DEFAULT_IDLE_TIMEOUT_S,
        )
        .clamp(MCAST_MIN_IDLE_TIMEOUT_S, MCAST_MAX_IDLE_TIMEOUT_S);
        // The query interval defaults to half the idle timeout and may not
        // exceed it.
        let query_interval = get_i64("mcast_query_interval", idle_timeout / 2)
            .clamp(MCAST_MIN_QUERY_INTERVAL_S, idle_timeout);

        McastSwitchConfig {
            enabled: get_bool("mcast_snoop", false),
            querier: get_bool("mcast_querier", true),
            flood_unregistered: get_bool("mcast_flood_unregistered", false),
            table_size: get_i64(
                "mcast_table_size",
                MCAST_DEFAULT_MAX_ENTRIES,
            ),
            idle_timeout,
            query_interval,
            query_max_resp: get_i64(
                "mcast_query_max_response",
                MCAST_DEFAULT_QUERY_MAX_RESPONSE_S,
            ),
            eth_src: config.get("mcast_eth_src").cloned().unwrap_or_default(),
            ip4_src: config.get("mcast_ip4_src").cloned().unwrap_or_default(),
        }
    }
}

// ===== impl McGroups =====

impl McGroups {
    pub fn add_port(
        &mut self,
        dp: DpIndex,
        group: (&str, u16),
        port: PortIndex,
    ) {
        let (name, key) = group;
        self.groups
            .entry((dp, name.to_owned()))
            .or_insert_with(|| McGroup {
                key,
                ports: Default::default(),
            })
            .ports
            .insert(port);
    }

    pub fn get(&self, dp: DpIndex, name: &str) -> Option<&McGroup> {
        self.groups.get(&(dp, name.to_owned()))
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&(DpIndex, String), &McGroup)> {
        self.groups.iter().filter(|(_, group)| !group.ports.is_empty())
    }
}

// ===== global functions =====

// Builds the multicast model: reserved group membership, router flags and
// the IGMP aggregates folded from the southbound IGMP table.
pub(crate) fn build(sb: &SbSnapshot, model: &mut Model, mc: &mut McGroups) {
    // A router floods statically when any of its ports is flagged to flood.
    for dp_index in 0..model.datapaths.len() {
        if !model.datapaths[dp_index].is_router() {
            continue;
        }
        let flood_static =
            model.datapaths[dp_index].ports.iter().any(|&port| {
                matches!(&model.ports[port].kind, PortKind::Lrp(lrp)
                    if lrp.mcast_flood)
            });
        if let DatapathKind::Router(router) =
            &mut model.datapaths[dp_index].kind
        {
            router.mcast_flood_static = flood_static;
        }
    }

    build_reserved_groups(model, mc);
    build_igmp_aggregates(sb, model, mc);
}

fn build_reserved_groups(model: &Model, mc: &mut McGroups) {
    for (dp_index, dp) in model.datapaths.iter().enumerate() {
        for &port_index in &dp.ports {
            let port = &model.ports[port_index];
            match &port.kind {
                PortKind::Lsp(lsp) => {
                    if !lsp.enabled {
                        continue;
                    }
                    mc.add_port(dp_index, MC_FLOOD, port_index);
                    if lsp.has_unknown {
                        mc.add_port(dp_index, MC_UNKNOWN, port_index);
                    }
                    if lsp.mcast_flood {
                        mc.add_port(dp_index, MC_STATIC, port_index);
                    }
                    if lsp.mcast_flood_reports {
                        mc.add_port(dp_index, MC_MROUTER_STATIC, port_index);
                    }
                    // Ports leading to a multicast router get reports and
                    // unregistered traffic.
                    if let Some(peer) = port.peer {
                        let peer_dp = &model.datapaths[model.ports[peer].dp];
                        if matches!(&peer_dp.kind, DatapathKind::Router(router)
                            if router.mcast_relay)
                        {
                            mc.add_port(
                                dp_index,
                                MC_MROUTER_FLOOD,
                                port_index,
                            );
                        }
                    }
                }
                PortKind::Lrp(lrp) => {
                    if lrp.enabled {
                        mc.add_port(dp_index, MC_FLOOD, port_index);
                        if lrp.mcast_flood {
                            mc.add_port(dp_index, MC_STATIC, port_index);
                        }
                    }
                }
                PortKind::LrpRedirect(_) => {}
            }
        }
    }
}

fn build_igmp_aggregates(
    sb: &SbSnapshot,
    model: &mut Model,
    mc: &mut McGroups,
) {
    // Fold the southbound rows into (datapath, address) aggregates.
    let mut aggregates: BTreeMap<(DpIndex, IpAddr), BTreeSet<PortIndex>> =
        BTreeMap::new();
    for row in sb.igmp_groups.values() {
        let Some(&dp_index) = model.dp_by_sb.get(&row.datapath) else {
            continue;
        };
        if !model.datapaths[dp_index].is_switch() {
            continue;
        }
        let Ok(address) = row.address.parse::<IpAddr>() else {
            continue;
        };
        let address = normalize_address(address);

        let entry = aggregates.entry((dp_index, address)).or_default();
        for port_name in &row.ports {
            let Some(&port_index) = model.port_by_name.get(port_name) else {
                continue;
            };
            let port = &model.ports[port_index];
            if port.dp != dp_index {
                continue;
            }
            // Flooded ports receive the traffic anyway; so do ports whose
            // peer router relays multicast.
            if let PortKind::Lsp(lsp) = &port.kind {
                if lsp.mcast_flood {
                    continue;
                }
            }
            if let Some(peer) = port.peer {
                let peer_dp = &model.datapaths[model.ports[peer].dp];
                if matches!(&peer_dp.kind, DatapathKind::Router(router)
                    if router.mcast_relay)
                {
                    continue;
                }
            }
            entry.insert(port_index);
        }
    }

    // Mirror each aggregate onto the relaying routers: the router datapath
    // learns the group with the peer router port as its single member.
    let mut mirrors: BTreeMap<(DpIndex, IpAddr), BTreeSet<PortIndex>> =
        BTreeMap::new();
    for ((dp_index, address), _) in &aggregates {
        let switch_ports = match &model.datapaths[*dp_index].kind {
            DatapathKind::Switch(switch) => switch.router_ports.clone(),
            _ => continue,
        };
        for port_index in switch_ports {
            let Some(peer) = model.ports[port_index].peer else {
                continue;
            };
            let peer_dp = model.ports[peer].dp;
            if matches!(&model.datapaths[peer_dp].kind,
                DatapathKind::Router(router) if router.mcast_relay)
            {
                mirrors
                    .entry((peer_dp, *address))
                    .or_default()
                    .insert(peer);
            }
        }
    }
    aggregates.extend(mirrors);

    // Assign per-datapath keys, reusing keys of same-named groups already
    // present in the southbound so unchanged groups do not churn.
    let mut spaces: BTreeMap<DpIndex, TnlKeySpace> = BTreeMap::new();
    let mut existing: BTreeMap<(DpIndex, String), u16> = BTreeMap::new();
    for group in sb.multicast_groups.values() {
        let Some(&dp_index) = model.dp_by_sb.get(&group.datapath) else {
            continue;
        };
        if u32::from(group.tunnel_key) < MCAST_KEY_MIN
            || u32::from(group.tunnel_key) > MCAST_KEY_MAX
        {
            continue;
        }
        existing.insert(
            (dp_index, group.name.clone()),
            group.tunnel_key,
        );
    }

    let mut result = Vec::new();
    for ((dp_index, address), ports) in aggregates {
        if ports.is_empty() {
            continue;
        }
        let name = address.to_string();
        let space = spaces.entry(dp_index).or_insert_with(|| {
            let mut space =
                TnlKeySpace::new("multicast", MCAST_KEY_MIN, MCAST_KEY_MAX);
            // Keys of groups surviving from earlier passes stay taken.
            for ((dp, _), key) in &existing {
                if *dp == dp_index {
                    space.mark(u32::from(*key));
                }
            }
            space
        });

        let key = match existing.get(&(dp_index, name.clone())) {
            Some(&key) => key,
            None => {
                let key = space.allocate();
                if key == 0 {
                    Error::IgmpGroupKeyExhaustion(
                        model.datapaths[dp_index].name.clone(),
                    )
                    .log();
                    continue;
                }
                key as u16
            }
        };

        Debug::IgmpGroupLearn(&model.datapaths[dp_index].name, &name).log();
        for &port in &ports {
            mc.add_port(dp_index, (&name, key), port);
        }
        result.push(IgmpAggregate {
            dp: dp_index,
            address,
            ports,
            key,
        });
    }
    model.igmp_aggregates = result;
}

// IPv6-mapped IPv4 group addresses are folded onto their IPv4 form.
fn normalize_address(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => address,
        },
        IpAddr::V4(_) => address,
    }
}
