//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::nb::MeterBand;

// External-ids keys linking southbound rows back to their northbound
// counterparts.
pub const EXT_ID_LOGICAL_SWITCH: &str = "logical-switch";
pub const EXT_ID_LOGICAL_ROUTER: &str = "logical-router";
pub const EXT_ID_DNS_ID: &str = "dns_id";

// Consistent snapshot of the southbound observed state.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct SbSnapshot {
    pub global: SbGlobal,
    pub chassis: BTreeMap<Uuid, Chassis>,
    pub datapaths: BTreeMap<Uuid, DatapathBinding>,
    pub port_bindings: BTreeMap<Uuid, PortBinding>,
    pub mac_bindings: BTreeMap<Uuid, MacBinding>,
    pub ha_chassis_groups: BTreeMap<Uuid, SbHaChassisGroup>,
    pub multicast_groups: BTreeMap<Uuid, MulticastGroup>,
    pub igmp_groups: BTreeMap<Uuid, IgmpGroup>,
    pub logical_flows: BTreeMap<Uuid, LogicalFlowRow>,
    pub address_sets: BTreeMap<Uuid, SbAddressSet>,
    pub port_groups: BTreeMap<Uuid, SbPortGroup>,
    pub meters: BTreeMap<Uuid, SbMeter>,
    pub dns: BTreeMap<Uuid, SbDns>,
    pub dhcp_options: BTreeMap<Uuid, DhcpOptionDef>,
    pub dhcpv6_options: BTreeMap<Uuid, Dhcpv6OptionDef>,
    pub ip_multicast: BTreeMap<Uuid, IpMulticastRow>,
    pub rbac_roles: BTreeMap<Uuid, RbacRole>,
    pub rbac_permissions: BTreeMap<Uuid, RbacPermission>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct SbGlobal {
    pub nb_cfg: i64,
    pub ipsec: bool,
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Chassis {
    pub uuid: Uuid,
    pub name: String,
    pub hostname: String,
    pub nb_cfg: i64,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct DatapathBinding {
    pub uuid: Uuid,
    pub tunnel_key: u32,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct PortBinding {
    pub uuid: Uuid,
    pub logical_port: String,
    pub datapath: Uuid,
    pub tunnel_key: u32,
    pub port_type: String,
    pub parent_port: Option<String>,
    pub tag: Option<u16>,
    pub mac: Vec<String>,
    pub nat_addresses: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub ha_chassis_group: Option<Uuid>,
    // Owned by the downstream agents; never written by the translator.
    pub chassis: Option<String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct MacBinding {
    pub uuid: Uuid,
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    pub datapath: Uuid,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct SbHaChassis {
    pub chassis: String,
    pub priority: u16,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct SbHaChassisGroup {
    pub uuid: Uuid,
    pub name: String,
    pub ha_chassis: Vec<SbHaChassis>,
    pub ref_chassis: Vec<String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct MulticastGroup {
    pub uuid: Uuid,
    pub datapath: Uuid,
    pub name: String,
    pub tunnel_key: u16,
    pub ports: Vec<String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct IgmpGroup {
    pub uuid: Uuid,
    pub address: String,
    pub datapath: Uuid,
    pub chassis_name: String,
    pub ports: Vec<String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct LogicalFlowRow {
    pub uuid: Uuid,
    pub datapath: Uuid,
    pub pipeline: String,
    pub table_id: u8,
    pub priority: u16,
    pub match_: String,
    pub actions: String,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct SbAddressSet {
    pub uuid: Uuid,
    pub name: String,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct SbPortGroup {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct SbMeter {
    pub uuid: Uuid,
    pub name: String,
    pub unit: String,
    pub bands: Vec<MeterBand>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct SbDns {
    pub uuid: Uuid,
    pub datapaths: Vec<Uuid>,
    pub records: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct DhcpOptionDef {
    pub uuid: Uuid,
    pub name: String,
    pub code: u8,
    pub option_type: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Dhcpv6OptionDef {
    pub uuid: Uuid,
    pub name: String,
    pub code: u8,
    pub option_type: String,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct IpMulticastRow {
    pub uuid: Uuid,
    pub datapath: Uuid,
    pub enabled: bool,
    pub querier: bool,
    pub eth_src: String,
    pub ip4_src: String,
    pub table_size: i64,
    pub idle_timeout: i64,
    pub query_interval: i64,
    pub query_max_resp: i64,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct RbacRole {
    pub uuid: Uuid,
    pub name: String,
    // Table name to RBAC_Permission row.
    pub permissions: BTreeMap<String, Uuid>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RbacPermission {
    pub uuid: Uuid,
    pub table: String,
    pub authorization: Vec<String>,
    pub insert_delete: bool,
    pub update: Vec<String>,
}

// Southbound write operations. Insert and update variants carry the full
// row; columns the translator does not own are copied from the observed row
// by whoever builds the operation.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum SbOp {
    InsertDatapath(DatapathBinding),
    UpdateDatapath(DatapathBinding),
    DeleteDatapath(Uuid),
    InsertPortBinding(PortBinding),
    UpdatePortBinding(PortBinding),
    DeletePortBinding(Uuid),
    DeleteMacBinding(Uuid),
    InsertHaChassisGroup(SbHaChassisGroup),
    UpdateHaChassisGroup(SbHaChassisGroup),
    DeleteHaChassisGroup(Uuid),
    InsertMulticastGroup(MulticastGroup),
    UpdateMulticastGroup(MulticastGroup),
    DeleteMulticastGroup(Uuid),
    DeleteIgmpGroup(Uuid),
    InsertLogicalFlow(LogicalFlowRow),
    DeleteLogicalFlow(Uuid),
    InsertAddressSet(SbAddressSet),
    UpdateAddressSet(SbAddressSet),
    DeleteAddressSet(Uuid),
    InsertPortGroup(SbPortGroup),
    UpdatePortGroup(SbPortGroup),
    DeletePortGroup(Uuid),
    InsertMeter(SbMeter),
    UpdateMeter(SbMeter),
    DeleteMeter(Uuid),
    InsertDns(SbDns),
    UpdateDns(SbDns),
    DeleteDns(Uuid),
    InsertDhcpOptionDef(DhcpOptionDef),
    DeleteDhcpOptionDef(Uuid),
    InsertDhcpv6OptionDef(Dhcpv6OptionDef),
    DeleteDhcpv6OptionDef(Uuid),
    InsertIpMulticast(IpMulticastRow),
    UpdateIpMulticast(IpMulticastRow),
    DeleteIpMulticast(Uuid),
    InsertRbacRole(RbacRole),
    UpdateRbacRole(RbacRole),
    InsertRbacPermission(RbacPermission),
    DeleteRbacPermission(Uuid),
    SetGlobal {
        nb_cfg: i64,
        ipsec: bool,
        options: BTreeMap<String, String>,
    },
}

// Northbound write-back operations.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum NbOp {
    SetDynamicAddresses {
        port: Uuid,
        addresses: Option<String>,
    },
    SetPortTag {
        port: Uuid,
        tag: u16,
    },
    SetSbCfg(i64),
    SetHvCfg(i64),
    SetMacPrefix(String),
}

// The set of writes computed by one reconciliation pass. Committed
// atomically; a failed commit discards the whole transaction and the next
// pass recomputes it from scratch.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Transaction {
    pub sb_ops: Vec<SbOp>,
    pub nb_ops: Vec<NbOp>,
}

// ===== impl SbSnapshot =====

impl SbSnapshot {
    // Applies the southbound half of a committed transaction to this mirror.
    pub fn apply(&mut self, txn: &Transaction) {
        for op in &txn.sb_ops {
            self.apply_op(op);
        }
    }

    fn apply_op(&mut self, op: &SbOp) {
        match op {
            SbOp::InsertDatapath(row) | SbOp::UpdateDatapath(row) => {
                self.datapaths.insert(row.uuid, row.clone());
            }
            SbOp::DeleteDatapath(uuid) => {
                self.datapaths.remove(uuid);
            }
            SbOp::InsertPortBinding(row) | SbOp::UpdatePortBinding(row) => {
                self.port_bindings.insert(row.uuid, row.clone());
            }
            SbOp::DeletePortBinding(uuid) => {
                self.port_bindings.remove(uuid);
            }
            SbOp::DeleteMacBinding(uuid) => {
                self.mac_bindings.remove(uuid);
            }
            SbOp::InsertHaChassisGroup(row)
            | SbOp::UpdateHaChassisGroup(row) => {
                self.ha_chassis_groups.insert(row.uuid, row.clone());
            }
            SbOp::DeleteHaChassisGroup(uuid) => {
                self.ha_chassis_groups.remove(uuid);
            }
            SbOp::InsertMulticastGroup(row)
            | SbOp::UpdateMulticastGroup(row) => {
                self.multicast_groups.insert(row.uuid, row.clone());
            }
            SbOp::DeleteMulticastGroup(uuid) => {
                self.multicast_groups.remove(uuid);
            }
            SbOp::DeleteIgmpGroup(uuid) => {
                self.igmp_groups.remove(uuid);
            }
            SbOp::InsertLogicalFlow(row) => {
                self.logical_flows.insert(row.uuid, row.clone());
            }
            SbOp::DeleteLogicalFlow(uuid) => {
                self.logical_flows.remove(uuid);
            }
            SbOp::InsertAddressSet(row) | SbOp::UpdateAddressSet(row) => {
                self.address_sets.insert(row.uuid, row.clone());
            }
            SbOp::DeleteAddressSet(uuid) => {
                self.address_sets.remove(uuid);
            }
            SbOp::InsertPortGroup(row) | SbOp::UpdatePortGroup(row) => {
                self.port_groups.insert(row.uuid, row.clone());
            }
            SbOp::DeletePortGroup(uuid) => {
                self.port_groups.remove(uuid);
            }
            SbOp::InsertMeter(row) | SbOp::UpdateMeter(row) => {
                self.meters.insert(row.uuid, row.clone());
            }
            SbOp::DeleteMeter(uuid) => {
                self.meters.remove(uuid);
            }
            SbOp::InsertDns(row) | SbOp::UpdateDns(row) => {
                self.dns.insert(row.uuid, row.clone());
            }
            SbOp::DeleteDns(uuid) => {
                self.dns.remove(uuid);
            }
            SbOp::InsertDhcpOptionDef(row) => {
                self.dhcp_options.insert(row.uuid, row.clone());
            }
            SbOp::DeleteDhcpOptionDef(uuid) => {
                self.dhcp_options.remove(uuid);
            }
            SbOp::InsertDhcpv6OptionDef(row) => {
                self.dhcpv6_options.insert(row.uuid, row.clone());
            }
            SbOp::DeleteDhcpv6OptionDef(uuid) => {
                self.dhcpv6_options.remove(uuid);
            }
            SbOp::InsertIpMulticast(row) | SbOp::UpdateIpMulticast(row) => {
                self.ip_multicast.insert(row.uuid, row.clone());
            }
            SbOp::DeleteIpMulticast(uuid) => {
                self.ip_multicast.remove(uuid);
            }
            SbOp::InsertRbacRole(row) | SbOp::UpdateRbacRole(row) => {
                self.rbac_roles.insert(row.uuid, row.clone());
            }
            SbOp::InsertRbacPermission(row) => {
                self.rbac_permissions.insert(row.uuid, row.clone());
            }
            SbOp::DeleteRbacPermission(uuid) => {
                self.rbac_permissions.remove(uuid);
            }
            SbOp::SetGlobal {
                nb_cfg,
                ipsec,
                options,
            } => {
                self.global.nb_cfg = *nb_cfg;
                self.global.ipsec = *ipsec;
                self.global.options = options.clone();
            }
        }
    }

    // Minimum nb_cfg over all registered chassis, used to report how far the
    // hypervisors have caught up.
    pub fn min_chassis_nb_cfg(&self) -> i64 {
        self.chassis
            .values()
            .map(|chassis| chassis.nb_cfg)
            .min()
            .unwrap_or(0)
    }
}

// ===== impl Transaction =====

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.sb_ops.is_empty() && self.nb_ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sb_ops.len() + self.nb_ops.len()
    }
}
