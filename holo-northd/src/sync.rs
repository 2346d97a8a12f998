//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Diff-based application of the computed state against the observed
// southbound database. Rows present on both sides produce no writes; the
// rest become inserts, updates or deletes batched into the pass
// transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use itertools::Itertools;
use uuid::Uuid;

use crate::engine::Model;
use crate::lflow::LflowSet;
use crate::multicast::McGroups;
use crate::nb::{MeterBand, NbSnapshot};
use crate::sb::{
    Dhcpv6OptionDef, DhcpOptionDef, IpMulticastRow, LogicalFlowRow,
    MulticastGroup, SbAddressSet, SbDns, SbMeter, SbOp, SbPortGroup,
    SbSnapshot, Transaction, EXT_ID_DNS_ID,
};

// ===== logical flows =====

pub(crate) fn flows(
    sb: &SbSnapshot,
    lflows: &LflowSet,
    txn: &mut Transaction,
) {
    type Key<'a> = (Uuid, &'a str, u8, u16, &'a str, &'a str);

    let mut observed: HashMap<Key<'_>, Uuid> = HashMap::new();
    for row in sb.logical_flows.values() {
        observed.insert(
            (
                row.datapath,
                row.pipeline.as_str(),
                row.table_id,
                row.priority,
                row.match_.as_str(),
                row.actions.as_str(),
            ),
            row.uuid,
        );
    }

    let mut seen: BTreeSet<Uuid> = BTreeSet::new();
    for flow in lflows.iter() {
        let key = (
            flow.dp,
            flow.stage.pipeline().as_str(),
            flow.stage.table(),
            flow.priority,
            flow.match_.as_str(),
            flow.actions.as_str(),
        );
        match observed.get(&key) {
            Some(uuid) => {
                seen.insert(*uuid);
            }
            None => {
                let mut external_ids = BTreeMap::new();
                external_ids.insert(
                    "stage-name".to_owned(),
                    flow.stage.name().to_owned(),
                );
                external_ids
                    .insert("source".to_owned(), flow.source.to_owned());
                if let Some(hint) = &flow.hint {
                    external_ids
                        .insert("stage-hint".to_owned(), hint.clone());
                }
                txn.sb_ops.push(SbOp::InsertLogicalFlow(LogicalFlowRow {
                    uuid: Uuid::new_v4(),
                    datapath: flow.dp,
                    pipeline: flow.stage.pipeline().as_str().to_owned(),
                    table_id: flow.stage.table(),
                    priority: flow.priority,
                    match_: flow.match_.clone(),
                    actions: flow.actions.clone(),
                    external_ids,
                }));
            }
        }
    }

    for row in sb.logical_flows.values() {
        if !seen.contains(&row.uuid) {
            txn.sb_ops.push(SbOp::DeleteLogicalFlow(row.uuid));
        }
    }
}

// ===== multicast groups =====

pub(crate) fn multicast_groups(
    sb: &SbSnapshot,
    model: &Model,
    mc: &McGroups,
    txn: &mut Transaction,
) {
    let mut observed: HashMap<(Uuid, &str), &MulticastGroup> = HashMap::new();
    for row in sb.multicast_groups.values() {
        observed.insert((row.datapath, row.name.as_str()), row);
    }

    let mut seen: BTreeSet<Uuid> = BTreeSet::new();
    for ((dp_index, name), group) in mc.iter() {
        let datapath = model.datapaths[*dp_index].sb_uuid;
        let ports: Vec<String> = group
            .ports
            .iter()
            .map(|&port| model.ports[port].name.clone())
            .sorted()
            .dedup()
            .collect();

        match observed.get(&(datapath, name.as_str())) {
            Some(row) => {
                seen.insert(row.uuid);
                if row.tunnel_key != group.key || row.ports != ports {
                    txn.sb_ops.push(SbOp::UpdateMulticastGroup(
                        MulticastGroup {
                            uuid: row.uuid,
                            datapath,
                            name: name.clone(),
                            tunnel_key: group.key,
                            ports,
                        },
                    ));
                }
            }
            None => {
                txn.sb_ops.push(SbOp::InsertMulticastGroup(
                    MulticastGroup {
                        uuid: Uuid::new_v4(),
                        datapath,
                        name: name.clone(),
                        tunnel_key: group.key,
                        ports,
                    },
                ));
            }
        }
    }

    for row in sb.multicast_groups.values() {
        if !seen.contains(&row.uuid) {
            txn.sb_ops.push(SbOp::DeleteMulticastGroup(row.uuid));
        }
    }
}

// IGMP rows are written by the downstream agents; the translator only
// collects the ones whose datapath disappeared.
pub(crate) fn igmp_groups(
    sb: &SbSnapshot,
    model: &Model,
    txn: &mut Transaction,
) {
    for row in sb.igmp_groups.values() {
        if !model.dp_by_sb.contains_key(&row.datapath) {
            txn.sb_ops.push(SbOp::DeleteIgmpGroup(row.uuid));
        }
    }
}

// ===== address sets =====

pub(crate) fn address_sets(
    nb: &NbSnapshot,
    model: &Model,
    sb: &SbSnapshot,
    txn: &mut Transaction,
) {
    let mut desired: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    // Two synthetic sets per port group, from the members' static and
    // dynamic addresses.
    for pg in nb.port_groups.values() {
        let mut ipv4: BTreeSet<String> = BTreeSet::new();
        let mut ipv6: BTreeSet<String> = BTreeSet::new();
        for port_uuid in &pg.ports {
            let Some(&port_index) = model.port_by_nb.get(port_uuid) else {
                continue;
            };
            let Some(lsp) = model.ports[port_index].kind.as_lsp() else {
                continue;
            };
            for entry in
                lsp.addresses.iter().chain(lsp.dynamic.iter())
            {
                ipv4.extend(
                    entry.ipv4.iter().map(|ip| ip.addr.to_string()),
                );
                ipv6.extend(
                    entry.ipv6.iter().map(|ip| ip.addr.to_string()),
                );
            }
        }
        desired.insert(format!("{}_ip4", pg.name), ipv4);
        desired.insert(format!("{}_ip6", pg.name), ipv6);
    }

    // User-defined sets override same-named synthetic ones.
    for set in nb.address_sets.values() {
        desired.insert(
            set.name.clone(),
            set.addresses.iter().cloned().collect(),
        );
    }

    let mut observed: HashMap<&str, &SbAddressSet> = HashMap::new();
    for row in sb.address_sets.values() {
        observed.insert(row.name.as_str(), row);
    }

    for (name, addresses) in &desired {
        let addresses: Vec<String> = addresses.iter().cloned().collect();
        match observed.get(name.as_str()) {
            Some(row) => {
                let mut current = row.addresses.clone();
                current.sort();
                if current != addresses {
                    txn.sb_ops.push(SbOp::UpdateAddressSet(SbAddressSet {
                        uuid: row.uuid,
                        name: name.clone(),
                        addresses,
                    }));
                }
            }
            None => {
                txn.sb_ops.push(SbOp::InsertAddressSet(SbAddressSet {
                    uuid: Uuid::new_v4(),
                    name: name.clone(),
                    addresses,
                }));
            }
        }
    }
    for row in sb.address_sets.values() {
        if !desired.contains_key(&row.name) {
            txn.sb_ops.push(SbOp::DeleteAddressSet(row.uuid));
        }
    }
}

// ===== port groups =====

pub(crate) fn port_groups(
    nb: &NbSnapshot,
    model: &Model,
    sb: &SbSnapshot,
    txn: &mut Transaction,
) {
    let mut desired: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pg in nb.port_groups.values() {
        let ports: Vec<String> = pg
            .ports
            .iter()
            .filter_map(|port| model.port_by_nb.get(port))
            .map(|&index| model.ports[index].name.clone())
            .sorted()
            .collect();
        desired.insert(pg.name.clone(), ports);
    }

    let mut observed: HashMap<&str, &SbPortGroup> = HashMap::new();
    for row in sb.port_groups.values() {
        observed.insert(row.name.as_str(), row);
    }

    for (name, ports) in &desired {
        match observed.get(name.as_str()) {
            Some(row) => {
                let mut current = row.ports.clone();
                current.sort();
                if current != *ports {
                    txn.sb_ops.push(SbOp::UpdatePortGroup(SbPortGroup {
                        uuid: row.uuid,
                        name: name.clone(),
                        ports: ports.clone(),
                    }));
                }
            }
            None => {
                txn.sb_ops.push(SbOp::InsertPortGroup(SbPortGroup {
                    uuid: Uuid::new_v4(),
                    name: name.clone(),
                    ports: ports.clone(),
                }));
            }
        }
    }
    for row in sb.port_groups.values() {
        if !desired.contains_key(&row.name) {
            txn.sb_ops.push(SbOp::DeletePortGroup(row.uuid));
        }
    }
}

// ===== meters =====

fn sorted_bands(bands: &[MeterBand]) -> Vec<(u64, u64, String)> {
    bands
        .iter()
        .map(|band| (band.rate, band.burst_size, band.action.clone()))
        .sorted()
        .collect()
}

pub(crate) fn meters(
    nb: &NbSnapshot,
    sb: &SbSnapshot,
    txn: &mut Transaction,
) {
    let mut observed: HashMap<&str, &SbMeter> = HashMap::new();
    for row in sb.meters.values() {
        observed.insert(row.name.as_str(), row);
    }

    let mut desired: BTreeSet<&str> = BTreeSet::new();
    for meter in nb.meters.values() {
        desired.insert(meter.name.as_str());
        match observed.get(meter.name.as_str()) {
            Some(row) => {
                if row.unit != meter.unit
                    || sorted_bands(&row.bands) != sorted_bands(&meter.bands)
                {
                    txn.sb_ops.push(SbOp::UpdateMeter(SbMeter {
                        uuid: row.uuid,
                        name: meter.name.clone(),
                        unit: meter.unit.clone(),
                        bands: meter.bands.clone(),
                    }));
                }
            }
            None => {
                txn.sb_ops.push(SbOp::InsertMeter(SbMeter {
                    uuid: Uuid::new_v4(),
                    name: meter.name.clone(),
                    unit: meter.unit.clone(),
                    bands: meter.bands.clone(),
                }));
            }
        }
    }
    for row in sb.meters.values() {
        if !desired.contains(row.name.as_str()) {
            txn.sb_ops.push(SbOp::DeleteMeter(row.uuid));
        }
    }
}

// ===== DNS =====

pub(crate) fn dns(
    nb: &NbSnapshot,
    model: &Model,
    sb: &SbSnapshot,
    txn: &mut Transaction,
) {
    // Which switches reference each record set.
    let mut datapaths_of: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for switch in nb.switches.values() {
        let Some(&dp_index) = model.dp_by_nb.get(&switch.uuid) else {
            continue;
        };
        for dns_uuid in &switch.dns_records {
            datapaths_of
                .entry(*dns_uuid)
                .or_default()
                .push(model.datapaths[dp_index].sb_uuid);
        }
    }

    let mut observed: HashMap<String, &SbDns> = HashMap::new();
    for row in sb.dns.values() {
        if let Some(dns_id) = row.external_ids.get(EXT_ID_DNS_ID) {
            observed.insert(dns_id.clone(), row);
        }
    }

    let mut desired: BTreeSet<String> = BTreeSet::new();
    for dns in nb.dns_records.values() {
        let Some(datapaths) = datapaths_of.get(&dns.uuid) else {
            continue;
        };
        if dns.records.is_empty() {
            continue;
        }
        let dns_id = dns.uuid.to_string();
        desired.insert(dns_id.clone());
        let mut datapaths = datapaths.clone();
        datapaths.sort();

        match observed.get(&dns_id) {
            Some(row) => {
                let mut current = row.datapaths.clone();
                current.sort();
                if current != datapaths || row.records != dns.records {
                    txn.sb_ops.push(SbOp::UpdateDns(SbDns {
                        uuid: row.uuid,
                        datapaths,
                        records: dns.records.clone(),
                        external_ids: row.external_ids.clone(),
                    }));
                }
            }
            None => {
                let mut external_ids = BTreeMap::new();
                external_ids.insert(EXT_ID_DNS_ID.to_owned(), dns_id);
                txn.sb_ops.push(SbOp::InsertDns(SbDns {
                    uuid: Uuid::new_v4(),
                    datapaths,
                    records: dns.records.clone(),
                    external_ids,
                }));
            }
        }
    }
    for row in sb.dns.values() {
        let orphan = row
            .external_ids
            .get(EXT_ID_DNS_ID)
            .map(|dns_id| !desired.contains(dns_id))
            .unwrap_or(true);
        if orphan {
            txn.sb_ops.push(SbOp::DeleteDns(row.uuid));
        }
    }
}

// ===== DHCP option catalogs =====

// The option definitions the translator knows how to emit. The catalogs
// are brought to exactly this set.
pub const DHCPV4_OPTION_DEFS: &[(&str, u8, &str)] = &[
    ("netmask", 1, "ipv4"),
    ("router", 3, "ipv4"),
    ("dns_server", 6, "ipv4"),
    ("log_server", 7, "ipv4"),
    ("lpr_server", 9, "ipv4"),
    ("domain_name", 15, "str"),
    ("swap_server", 16, "ipv4"),
    ("policy_filter", 21, "ipv4"),
    ("router_solicitation", 32, "ipv4"),
    ("nis_server", 41, "ipv4"),
    ("ntp_server", 42, "ipv4"),
    ("server_id", 54, "ipv4"),
    ("tftp_server", 66, "ipv4"),
    ("classless_static_route", 121, "static_routes"),
    ("ms_classless_static_route", 249, "static_routes"),
    ("ip_forward_enable", 19, "bool"),
    ("router_discovery", 31, "bool"),
    ("ethernet_encap", 36, "bool"),
    ("default_ttl", 23, "uint8"),
    ("tcp_ttl", 37, "uint8"),
    ("mtu", 26, "uint16"),
    ("lease_time", 51, "uint32"),
    ("T1", 58, "uint32"),
    ("T2", 59, "uint32"),
    ("bootfile_name", 67, "str"),
    ("wpad", 252, "str"),
];

pub const DHCPV6_OPTION_DEFS: &[(&str, u8, &str)] = &[
    ("server_id", 2, "mac"),
    ("ia_addr", 5, "ipv6"),
    ("dns_server", 23, "ipv6"),
    ("domain_search", 24, "str"),
];

pub(crate) fn dhcp_option_defs(sb: &SbSnapshot, txn: &mut Transaction) {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for row in sb.dhcp_options.values() {
        let known = DHCPV4_OPTION_DEFS.iter().any(|(name, code, kind)| {
            row.name == *name
                && row.code == *code
                && row.option_type == *kind
        });
        if !known || !seen.insert(row.name.as_str()) {
            txn.sb_ops.push(SbOp::DeleteDhcpOptionDef(row.uuid));
        }
    }
    for (name, code, kind) in DHCPV4_OPTION_DEFS {
        if !seen.contains(name) {
            txn.sb_ops.push(SbOp::InsertDhcpOptionDef(DhcpOptionDef {
                uuid: Uuid::new_v4(),
                name: (*name).to_owned(),
                code: *code,
                option_type: (*kind).to_owned(),
            }));
        }
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for row in sb.dhcpv6_options.values() {
        let known = DHCPV6_OPTION_DEFS.iter().any(|(name, code, kind)| {
            row.name == *name
                && row.code == *code
                && row.option_type == *kind
        });
        if !known || !seen.insert(row.name.as_str()) {
            txn.sb_ops.push(SbOp::DeleteDhcpv6OptionDef(row.uuid));
        }
    }
    for (name, code, kind) in DHCPV6_OPTION_DEFS {
        if !seen.contains(name) {
            txn.sb_ops.push(SbOp::InsertDhcpv6OptionDef(
                Dhcpv6OptionDef {
                    uuid: Uuid::new_v4(),
                    name: (*name).to_owned(),
                    code: *code,
                    option_type: (*kind).to_owned(),
                },
            ));
        }
    }
}

// ===== IP multicast configuration =====

pub(crate) fn ip_multicast(
    model: &Model,
    sb: &SbSnapshot,
    txn: &mut Transaction,
) {
    let mut observed: HashMap<Uuid, &IpMulticastRow> = HashMap::new();
    for row in sb.ip_multicast.values() {
        observed.insert(row.datapath, row);
    }

    let mut desired: BTreeSet<Uuid> = BTreeSet::new();
    for dp in &model.datapaths {
        let Some(switch) = dp.kind.as_switch() else {
            continue;
        };
        desired.insert(dp.sb_uuid);
        let mcast = &switch.mcast;
        let row = IpMulticastRow {
            uuid: observed
                .get(&dp.sb_uuid)
                .map(|row| row.uuid)
                .unwrap_or_else(Uuid::new_v4),
            datapath: dp.sb_uuid,
            enabled: mcast.enabled,
            querier: mcast.querier,
            eth_src: mcast.eth_src.clone(),
            ip4_src: mcast.ip4_src.clone(),
            table_size: mcast.table_size,
            idle_timeout: mcast.idle_timeout,
            query_interval: mcast.query_interval,
            query_max_resp: mcast.query_max_resp,
        };
        match observed.get(&dp.sb_uuid) {
            Some(current) => {
                if !ip_multicast_equal(current, &row) {
                    txn.sb_ops.push(SbOp::UpdateIpMulticast(row));
                }
            }
            None => {
                txn.sb_ops.push(SbOp::InsertIpMulticast(row));
            }
        }
    }
    for row in sb.ip_multicast.values() {
        if !desired.contains(&row.datapath) {
            txn.sb_ops.push(SbOp::DeleteIpMulticast(row.uuid));
        }
    }
}

fn ip_multicast_equal(a: &IpMulticastRow, b: &IpMulticastRow) -> bool {
    a.enabled == b.enabled
        && a.querier == b.querier
        && a.eth_src == b.eth_src
        && a.ip4_src == b.ip4_src
        && a.table_size == b.table_size
        && a.idle_timeout == b.idle_timeout
        && a.query_interval == b.query_interval
        && a.query_max_resp == b.query_max_resp
}

// ===== globals =====

pub(crate) fn globals(
    nb: &NbSnapshot,
    sb: &SbSnapshot,
    txn: &mut Transaction,
) {
    if sb.global.nb_cfg != nb.global.nb_cfg
        || sb.global.ipsec != nb.global.ipsec
        || sb.global.options != nb.global.options
    {
        txn.sb_ops.push(SbOp::SetGlobal {
            nb_cfg: nb.global.nb_cfg,
            ipsec: nb.global.ipsec,
            options: nb.global.options.clone(),
        });
    }

    // The northbound learns how far the southbound and the hypervisors
    // have caught up.
    if nb.global.sb_cfg != nb.global.nb_cfg {
        txn.nb_ops.push(crate::sb::NbOp::SetSbCfg(nb.global.nb_cfg));
    }
    let hv_cfg = sb.min_chassis_nb_cfg();
    if nb.global.hv_cfg != hv_cfg {
        txn.nb_ops.push(crate::sb::NbOp::SetHvCfg(hv_cfg));
    }
}
