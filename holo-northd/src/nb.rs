//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sb::{NbOp, Transaction};

// Consistent snapshot of the northbound desired state.
//
// Rows are stored in identity-keyed maps; every cross-reference is by
// identity key (or by name where the schema links by name). The snapshot is
// plain data: all parsing and validation happens while the in-memory model
// is built, so that malformed values can be skipped with a warning without
// losing the rest of the row.
#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct NbSnapshot {
    pub global: NbGlobal,
    pub switches: BTreeMap<Uuid, LogicalSwitch>,
    pub switch_ports: BTreeMap<Uuid, LogicalSwitchPort>,
    pub routers: BTreeMap<Uuid, LogicalRouter>,
    pub router_ports: BTreeMap<Uuid, LogicalRouterPort>,
    pub acls: BTreeMap<Uuid, Acl>,
    pub qos_rules: BTreeMap<Uuid, QosRule>,
    pub load_balancers: BTreeMap<Uuid, LoadBalancer>,
    pub nat_rules: BTreeMap<Uuid, NatRule>,
    pub static_routes: BTreeMap<Uuid, StaticRoute>,
    pub policies: BTreeMap<Uuid, RoutingPolicy>,
    pub address_sets: BTreeMap<Uuid, AddressSet>,
    pub port_groups: BTreeMap<Uuid, PortGroup>,
    pub meters: BTreeMap<Uuid, Meter>,
    pub dns_records: BTreeMap<Uuid, Dns>,
    pub dhcp_options: BTreeMap<Uuid, DhcpOptions>,
    pub gateway_chassis: BTreeMap<Uuid, GatewayChassis>,
    pub ha_chassis_groups: BTreeMap<Uuid, HaChassisGroup>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct NbGlobal {
    pub nb_cfg: i64,
    pub sb_cfg: i64,
    pub hv_cfg: i64,
    pub ipsec: bool,
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct LogicalSwitch {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<Uuid>,
    pub acls: Vec<Uuid>,
    pub qos_rules: Vec<Uuid>,
    pub load_balancer: Vec<Uuid>,
    pub dns_records: Vec<Uuid>,
    pub other_config: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct LogicalSwitchPort {
    pub uuid: Uuid,
    pub name: String,
    // Port type: "", "router", "localnet", "vtep", "l2gateway", "virtual" or
    // "external".
    pub port_type: String,
    pub parent_name: Option<String>,
    pub tag_request: Option<u16>,
    pub tag: Option<u16>,
    pub addresses: Vec<String>,
    pub dynamic_addresses: Option<String>,
    pub port_security: Vec<String>,
    pub enabled: Option<bool>,
    pub dhcpv4_options: Option<Uuid>,
    pub dhcpv6_options: Option<Uuid>,
    pub ha_chassis_group: Option<Uuid>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct LogicalRouter {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<Uuid>,
    pub static_routes: Vec<Uuid>,
    pub policies: Vec<Uuid>,
    pub nat: Vec<Uuid>,
    pub load_balancer: Vec<Uuid>,
    pub enabled: Option<bool>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct LogicalRouterPort {
    pub uuid: Uuid,
    pub name: String,
    pub mac: String,
    pub networks: Vec<String>,
    pub peer: Option<String>,
    pub enabled: Option<bool>,
    pub ipv6_ra_configs: BTreeMap<String, String>,
    pub gateway_chassis: Vec<Uuid>,
    pub ha_chassis_group: Option<Uuid>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct GatewayChassis {
    pub uuid: Uuid,
    pub name: String,
    pub chassis_name: String,
    pub priority: u16,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct HaChassisGroup {
    pub uuid: Uuid,
    pub name: String,
    pub ha_chassis: Vec<HaChassis>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct HaChassis {
    pub uuid: Uuid,
    pub chassis_name: String,
    pub priority: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AclDirection {
    FromLport,
    ToLport,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AclAction {
    Allow,
    AllowRelated,
    Drop,
    Reject,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Acl {
    pub uuid: Uuid,
    pub direction: AclDirection,
    // User priority, 0..32767. Offset by 1000 before emission.
    pub priority: u16,
    pub match_: String,
    pub action: AclAction,
    pub log: bool,
    pub name: Option<String>,
    pub severity: Option<String>,
    pub meter: Option<String>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct QosRule {
    pub uuid: Uuid,
    pub direction: AclDirection,
    pub priority: u16,
    pub match_: String,
    pub dscp: Option<u8>,
    pub bandwidth_rate: Option<u64>,
    pub bandwidth_burst: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum LbProtocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct LoadBalancer {
    pub uuid: Uuid,
    pub name: String,
    // VIP ("ip" or "ip:port") to comma-separated "ip:port" backends.
    pub vips: BTreeMap<String, String>,
    pub protocol: Option<LbProtocol>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum NatType {
    Snat,
    Dnat,
    DnatAndSnat,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NatRule {
    pub uuid: Uuid,
    pub nat_type: NatType,
    pub external_ip: String,
    pub external_mac: Option<String>,
    pub logical_ip: String,
    pub logical_port: Option<String>,
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RoutePolicy {
    #[default]
    DstIp,
    SrcIp,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct StaticRoute {
    pub uuid: Uuid,
    pub ip_prefix: String,
    pub nexthop: String,
    pub output_port: Option<String>,
    pub policy: Option<RoutePolicy>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PolicyAction {
    Allow,
    Drop,
    Reroute,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RoutingPolicy {
    pub uuid: Uuid,
    pub priority: u16,
    pub match_: String,
    pub action: PolicyAction,
    pub nexthop: Option<String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct AddressSet {
    pub uuid: Uuid,
    pub name: String,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct PortGroup {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<Uuid>,
    pub acls: Vec<Uuid>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MeterBand {
    pub action: String,
    pub rate: u64,
    pub burst_size: u64,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Meter {
    pub uuid: Uuid,
    pub name: String,
    pub unit: String,
    pub bands: Vec<MeterBand>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct Dns {
    pub uuid: Uuid,
    pub records: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct DhcpOptions {
    pub uuid: Uuid,
    pub cidr: String,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

// ===== impl NbSnapshot =====

impl NbSnapshot {
    // Applies the northbound half of a committed transaction to this mirror.
    pub fn apply(&mut self, txn: &Transaction) {
        for op in &txn.nb_ops {
            match op {
                NbOp::SetDynamicAddresses { port, addresses } => {
                    if let Some(port) = self.switch_ports.get_mut(port) {
                        port.dynamic_addresses = addresses.clone();
                    }
                }
                NbOp::SetPortTag { port, tag } => {
                    if let Some(port) = self.switch_ports.get_mut(port) {
                        port.tag = Some(*tag);
                    }
                }
                NbOp::SetSbCfg(sb_cfg) => {
                    self.global.sb_cfg = *sb_cfg;
                }
                NbOp::SetHvCfg(hv_cfg) => {
                    self.global.hv_cfg = *hv_cfg;
                }
                NbOp::SetMacPrefix(prefix) => {
                    self.global
                        .options
                        .insert("mac_prefix".to_owned(), prefix.clone());
                }
            }
        }
    }
}

// ===== impl AclDirection =====

impl AclDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclDirection::FromLport => "from-lport",
            AclDirection::ToLport => "to-lport",
        }
    }
}

impl std::fmt::Display for AclDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ===== impl LbProtocol =====

impl LbProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            LbProtocol::Tcp => "tcp",
            LbProtocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for LbProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ===== impl NatRule =====

impl NatRule {
    pub fn is_stateless(&self) -> bool {
        self.options.get("stateless").map(String::as_str) == Some("true")
    }
}
