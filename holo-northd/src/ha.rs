//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::datapath::{DatapathKind, DpIndex};
use crate::debug::Debug;
use crate::engine::Model;
use crate::nb::NbSnapshot;
use crate::port::{self, PortKind, GatewayDecl};
use crate::sb::{SbHaChassis, SbHaChassisGroup, SbOp, SbSnapshot, Transaction};

// ===== router groups =====

// Partitions the routers into connected components: two routers are
// adjacent when some logical switch has both as router peers. The component
// bounds how far gateway reachability extends for ref_chassis accounting.
pub(crate) fn build_router_groups(model: &mut Model) {
    let n = model.datapaths.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut Vec<usize>, index: usize) -> usize {
        let mut root = index;
        while parent[root] != root {
            root = parent[root];
        }
        let mut index = index;
        while parent[index] != root {
            let next = parent[index];
            parent[index] = root;
            index = next;
        }
        root
    }

    for dp_index in 0..n {
        if !model.datapaths[dp_index].is_switch() {
            continue;
        }
        // Routers reachable from this switch.
        let mut routers = Vec::new();
        for &port_index in &model.datapaths[dp_index].ports {
            let port = &model.ports[port_index];
            if let PortKind::Lsp(_) = &port.kind {
                if let Some(peer) = port.peer {
                    let peer_dp = model.ports[peer].dp;
                    if model.datapaths[peer_dp].is_router() {
                        routers.push(peer_dp);
                    }
                }
            }
        }
        for pair in routers.windows(2) {
            let a = find(&mut parent, pair[0]);
            let b = find(&mut parent, pair[1]);
            if a != b {
                parent[a] = b;
            }
        }
    }

    // Assign dense component ids to the router roots.
    let mut component_of_root: BTreeMap<usize, usize> = BTreeMap::new();
    let mut groups: Vec<Vec<DpIndex>> = Vec::new();
    for dp_index in 0..n {
        if !model.datapaths[dp_index].is_router() {
            continue;
        }
        let root = find(&mut parent, dp_index);
        let component = *component_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[component].push(dp_index);
        if let DatapathKind::Router(router) =
            &mut model.datapaths[dp_index].kind
        {
            router.group = Some(component);
        }
    }
    model.router_groups = groups;
}

// ===== HA chassis groups =====

// Synthesizes the southbound HA chassis groups from the gateway
// declarations found on the router ports, computes each group's ref_chassis
// from router-group reachability, and reconciles against the observed
// southbound rows. Returns the group name to southbound row uuid mapping
// for the port-binding writer.
pub(crate) fn sync_groups(
    nb: &NbSnapshot,
    sb: &SbSnapshot,
    model: &Model,
    txn: &mut Transaction,
) -> BTreeMap<String, Uuid> {
    // Desired groups, and the router component each belongs to.
    let mut desired: BTreeMap<String, (Vec<SbHaChassis>, Option<usize>)> =
        BTreeMap::new();
    for port in &model.ports {
        let PortKind::Lrp(lrp) = &port.kind else {
            continue;
        };
        let Some(gateway) = &lrp.gateway else {
            continue;
        };
        let Some(name) = port::ha_group_name(&port.name, &lrp.gateway, nb)
        else {
            continue;
        };
        let mut members = match gateway {
            GatewayDecl::HaChassisGroup(group) => nb
                .ha_chassis_groups
                .get(group)
                .map(|group| {
                    group
                        .ha_chassis
                        .iter()
                        .map(|member| SbHaChassis {
                            chassis: member.chassis_name.clone(),
                            priority: member.priority,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            GatewayDecl::GatewayChassis(chassis) => chassis
                .iter()
                .filter_map(|uuid| nb.gateway_chassis.get(uuid))
                .map(|gwc| SbHaChassis {
                    chassis: gwc.chassis_name.clone(),
                    priority: gwc.priority,
                })
                .collect::<Vec<_>>(),
            GatewayDecl::RedirectChassis(chassis) => vec![SbHaChassis {
                chassis: chassis.clone(),
                priority: 0,
            }],
        };
        members.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then(a.chassis.cmp(&b.chassis))
        });

        let component = match &model.datapaths[port.dp].kind {
            DatapathKind::Router(router) => router.group,
            _ => None,
        };
        desired.insert(name, (members, component));
    }

    let ref_chassis = component_ref_chassis(sb, model);

    let mut sb_by_name: BTreeMap<&str, &SbHaChassisGroup> = BTreeMap::new();
    for group in sb.ha_chassis_groups.values() {
        sb_by_name.insert(group.name.as_str(), group);
    }

    let mut result = BTreeMap::new();
    for (name, (members, component)) in &desired {
        let refs = component
            .and_then(|component| ref_chassis.get(&component))
            .map(|refs| refs.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        match sb_by_name.get(name.as_str()) {
            Some(group) => {
                result.insert(name.clone(), group.uuid);
                let mut observed = group.ha_chassis.clone();
                observed.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.chassis.cmp(&b.chassis))
                });
                if observed != *members || group.ref_chassis != refs {
                    Debug::HaGroupSync(name).log();
                    txn.sb_ops.push(SbOp::UpdateHaChassisGroup(
                        SbHaChassisGroup {
                            uuid: group.uuid,
                            name: name.clone(),
                            ha_chassis: members.clone(),
                            ref_chassis: refs,
                        },
                    ));
                }
            }
            None => {
                let uuid = Uuid::new_v4();
                result.insert(name.clone(), uuid);
                Debug::HaGroupSync(name).log();
                txn.sb_ops.push(SbOp::InsertHaChassisGroup(
                    SbHaChassisGroup {
                        uuid,
                        name: name.clone(),
                        ha_chassis: members.clone(),
                        ref_chassis: refs,
                    },
                ));
            }
        }
    }

    // Orphan groups, by name-set difference.
    for group in sb.ha_chassis_groups.values() {
        if !desired.contains_key(&group.name) {
            txn.sb_ops.push(SbOp::DeleteHaChassisGroup(group.uuid));
        }
    }

    result
}

// For every router component, the set of chassis currently hosting any port
// on a switch connected (directly or through transit switches) to a router
// in the component. Downstream agents use this to know which chassis might
// source traffic for the gateway.
fn component_ref_chassis(
    sb: &SbSnapshot,
    model: &Model,
) -> BTreeMap<usize, BTreeSet<String>> {
    // Port name to hosting chassis, from the observed bindings.
    let mut chassis_of_port: BTreeMap<&str, &str> = BTreeMap::new();
    for binding in sb.port_bindings.values() {
        if let Some(chassis) = &binding.chassis {
            chassis_of_port
                .insert(binding.logical_port.as_str(), chassis.as_str());
        }
    }

    let mut result: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
    for dp in model.datapaths.iter().filter(|dp| dp.is_switch()) {
        // Components this switch connects to.
        let mut components = BTreeSet::new();
        for &port_index in &dp.ports {
            let port = &model.ports[port_index];
            if let Some(peer) = port.peer {
                let peer_dp = &model.datapaths[model.ports[peer].dp];
                if let DatapathKind::Router(router) = &peer_dp.kind {
                    if let Some(component) = router.group {
                        components.insert(component);
                    }
                }
            }
        }
        if components.is_empty() {
            continue;
        }

        for &port_index in &dp.ports {
            let port = &model.ports[port_index];
            let Some(chassis) = chassis_of_port.get(port.name.as_str())
            else {
                continue;
            };
            for &component in &components {
                result
                    .entry(component)
                    .or_default()
                    .insert((*chassis).to_owned());
            }
        }
    }
    result
}
