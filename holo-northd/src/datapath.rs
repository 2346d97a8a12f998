//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;

use enum_as_inner::EnumAsInner;
use ipnetwork::Ipv6Network;
use uuid::Uuid;

use crate::allocator::{Ipam, TnlKeySpace};
use crate::debug::Debug;
use crate::engine::Model;
use crate::error::Error;
use crate::multicast::McastSwitchConfig;
use crate::nb::NbSnapshot;
use crate::port::PortIndex;
use crate::sb::{
    DatapathBinding, SbOp, SbSnapshot, Transaction, EXT_ID_LOGICAL_ROUTER,
    EXT_ID_LOGICAL_SWITCH,
};

pub type DpIndex = usize;

// One logical datapath: a logical switch or a logical router, joined with
// its southbound binding.
#[derive(Debug)]
pub struct Datapath {
    pub nb_uuid: Uuid,
    pub sb_uuid: Uuid,
    pub tunnel_key: u32,
    pub name: String,
    pub kind: DatapathKind,
    // Ports attached to this datapath, in model order.
    pub ports: Vec<PortIndex>,
}

#[derive(Debug, EnumAsInner)]
pub enum DatapathKind {
    Switch(SwitchData),
    Router(RouterData),
}

#[derive(Debug, Default)]
pub struct SwitchData {
    pub ipam: Option<Ipam>,
    pub ipv6_prefix: Option<Ipv6Network>,
    pub mac_only: bool,
    pub mcast: McastSwitchConfig,
    // Port groups with at least one member on this switch.
    pub port_groups: BTreeSet<Uuid>,
    pub has_unknown: bool,
    pub has_stateful_acl: bool,
    pub has_lb_vip: bool,
    pub has_dns_records: bool,
    pub localnet_ports: Vec<PortIndex>,
    pub router_ports: Vec<PortIndex>,
}

#[derive(Debug, Default)]
pub struct RouterData {
    // Set when the router is bound to a chassis (a gateway router).
    pub chassis: Option<String>,
    pub mcast_relay: bool,
    pub mcast_flood_static: bool,
    pub l3dgw_port: Option<PortIndex>,
    pub l3redirect_port: Option<PortIndex>,
    pub dnat_force_snat_ip: Option<IpAddr>,
    pub lb_force_snat_ip: Option<IpAddr>,
    // Connected-component id assigned by the router-group builder.
    pub group: Option<usize>,
}

// ===== impl Datapath =====

impl Datapath {
    pub fn is_switch(&self) -> bool {
        matches!(self.kind, DatapathKind::Switch(_))
    }

    pub fn is_router(&self) -> bool {
        matches!(self.kind, DatapathKind::Router(_))
    }

    // True for routers bound to a chassis ("gateway routers").
    pub fn is_gateway_router(&self) -> bool {
        matches!(&self.kind, DatapathKind::Router(router)
            if router.chassis.is_some())
    }
}

// ===== global functions =====

// Joins the northbound switches and enabled routers with the southbound
// datapath bindings, allocating tunnel keys for new datapaths and deleting
// stale or conflicting southbound rows.
pub(crate) fn build(
    nb: &NbSnapshot,
    sb: &SbSnapshot,
    model: &mut Model,
    keys: &mut TnlKeySpace,
    txn: &mut Transaction,
) {
    // Collect the northbound datapath set. A router sharing its identity
    // key with a switch is skipped.
    let mut routers = BTreeMap::new();
    for (uuid, router) in &nb.routers {
        if router.enabled == Some(false) {
            continue;
        }
        if nb.switches.contains_key(uuid) {
            Error::DuplicateNbUuid(*uuid).log();
            continue;
        }
        routers.insert(*uuid, router);
    }

    // Index the southbound bindings by their northbound key, deleting rows
    // without a proper key and rows with a conflicting tunnel key.
    let mut sb_by_nb: BTreeMap<Uuid, &DatapathBinding> = BTreeMap::new();
    let mut seen_keys: HashSet<u32> = HashSet::new();
    for binding in sb.datapaths.values() {
        let nb_uuid = binding
            .external_ids
            .get(EXT_ID_LOGICAL_SWITCH)
            .or_else(|| binding.external_ids.get(EXT_ID_LOGICAL_ROUTER))
            .and_then(|value| value.parse::<Uuid>().ok());
        let Some(nb_uuid) = nb_uuid else {
            // Stale row from an older schema or a manual edit.
            Debug::DatapathDelete(binding.uuid).log();
            txn.sb_ops.push(SbOp::DeleteDatapath(binding.uuid));
            continue;
        };
        if sb_by_nb.contains_key(&nb_uuid) || !seen_keys.insert(binding.tunnel_key)
        {
            Error::DuplicateSbDatapathKey(binding.tunnel_key).log();
            Debug::DatapathDelete(binding.uuid).log();
            txn.sb_ops.push(SbOp::DeleteDatapath(binding.uuid));
            continue;
        }
        sb_by_nb.insert(nb_uuid, binding);
    }

    // Existing bindings hold their keys before anything new is allocated.
    for binding in sb_by_nb.values() {
        keys.mark(binding.tunnel_key);
    }

    // Switches first, then routers, so that switch-scoped state (IPAM,
    // multicast) is in place before router ports resolve their peers.
    for (uuid, switch) in &nb.switches {
        let mut data = SwitchData::default();
        init_ipam(switch, &mut data);
        data.mcast = McastSwitchConfig::from_config(&switch.other_config);
        data.has_dns_records = switch
            .dns_records
            .iter()
            .filter_map(|dns| nb.dns_records.get(dns))
            .any(|dns| !dns.records.is_empty());

        join_datapath(
            model,
            keys,
            txn,
            *uuid,
            switch.name.clone(),
            EXT_ID_LOGICAL_SWITCH,
            switch.external_ids.get("name2").cloned(),
            sb_by_nb.get(uuid).copied(),
            DatapathKind::Switch(data),
        );
    }
    for (uuid, router) in routers {
        let mut data = RouterData {
            chassis: router.options.get("chassis").cloned(),
            mcast_relay: router.options.get("mcast_relay").map(String::as_str)
                == Some("true"),
            ..Default::default()
        };
        data.dnat_force_snat_ip = router
            .options
            .get("dnat_force_snat_ip")
            .and_then(|ip| ip.parse().ok());
        data.lb_force_snat_ip = router
            .options
            .get("lb_force_snat_ip")
            .and_then(|ip| ip.parse().ok());

        join_datapath(
            model,
            keys,
            txn,
            uuid,
            router.name.clone(),
            EXT_ID_LOGICAL_ROUTER,
            router.external_ids.get("name2").cloned(),
            sb_by_nb.get(&uuid).copied(),
            DatapathKind::Router(data),
        );
    }

    // Southbound rows with no northbound counterpart.
    for (nb_uuid, binding) in &sb_by_nb {
        if !model.dp_by_nb.contains_key(nb_uuid) {
            Debug::DatapathDelete(binding.uuid).log();
            txn.sb_ops.push(SbOp::DeleteDatapath(binding.uuid));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn join_datapath(
    model: &mut Model,
    keys: &mut TnlKeySpace,
    txn: &mut Transaction,
    nb_uuid: Uuid,
    name: String,
    ext_id_key: &'static str,
    name2: Option<String>,
    binding: Option<&DatapathBinding>,
    kind: DatapathKind,
) {
    let mut external_ids = BTreeMap::new();
    external_ids.insert(ext_id_key.to_owned(), nb_uuid.to_string());
    external_ids.insert("name".to_owned(), name.clone());
    if let Some(name2) = name2 {
        external_ids.insert("name2".to_owned(), name2);
    }

    let (sb_uuid, tunnel_key) = match binding {
        Some(binding) => {
            if binding.external_ids != external_ids {
                txn.sb_ops.push(SbOp::UpdateDatapath(DatapathBinding {
                    uuid: binding.uuid,
                    tunnel_key: binding.tunnel_key,
                    external_ids: external_ids.clone(),
                }));
            }
            (binding.uuid, binding.tunnel_key)
        }
        None => {
            let tunnel_key = keys.allocate();
            if tunnel_key == 0 {
                // Key space exhausted; leave this datapath unbound for now.
                return;
            }
            let sb_uuid = Uuid::new_v4();
            Debug::DatapathCreate(&name, tunnel_key).log();
            txn.sb_ops.push(SbOp::InsertDatapath(DatapathBinding {
                uuid: sb_uuid,
                tunnel_key,
                external_ids: external_ids.clone(),
            }));
            (sb_uuid, tunnel_key)
        }
    };

    let index = model.datapaths.len();
    model.datapaths.push(Datapath {
        nb_uuid,
        sb_uuid,
        tunnel_key,
        name,
        kind,
        ports: Vec::new(),
    });
    model.dp_by_nb.insert(nb_uuid, index);
    model.dp_by_sb.insert(sb_uuid, index);
}

// Initializes the switch's address-management state from its configuration:
// "subnet" enables IPv4 allocation, "ipv6_prefix" enables EUI-64 IPv6
// derivation, "mac_only" restricts dynamic assignment to MAC addresses.
fn init_ipam(switch: &crate::nb::LogicalSwitch, data: &mut SwitchData) {
    if let Some(subnet) = switch.other_config.get("subnet") {
        match subnet.parse() {
            Ok(subnet) => {
                data.ipam = Ipam::new(subnet);
                if let (Some(ipam), Some(exclude)) = (
                    data.ipam.as_mut(),
                    switch.other_config.get("exclude_ips"),
                ) {
                    ipam.exclude(exclude, &switch.name);
                }
            }
            Err(_) => {
                Error::BadCidr(switch.name.clone(), subnet.clone()).log();
            }
        }
    }

    if let Some(prefix) = switch.other_config.get("ipv6_prefix") {
        // The prefix is given without a length; /64 is implied by EUI-64.
        let prefix = format!("{prefix}/64");
        match prefix.parse() {
            Ok(prefix) => data.ipv6_prefix = Some(prefix),
            Err(_) => {
                Error::BadCidr(switch.name.clone(), prefix).log();
            }
        }
    }

    data.mac_only =
        switch.other_config.get("mac_only").map(String::as_str)
            == Some("true");
}
