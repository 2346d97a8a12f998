//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use enum_as_inner::EnumAsInner;
use holo_utils::mac_addr::MacAddr;
use uuid::Uuid;

use crate::addresses::LportAddresses;
use crate::allocator::{
    QueueIdAllocator, TagAllocator, TnlKeySpace, PORT_TNL_KEY_MAX,
    PORT_TNL_KEY_MIN,
};
use crate::datapath::{DatapathKind, DpIndex};
use crate::debug::Debug;
use crate::engine::Model;
use crate::error::Error;
use crate::nb::{LogicalRouterPort, LogicalSwitchPort, NbSnapshot, NatType};
use crate::sb::{PortBinding, SbOp, SbSnapshot, Transaction};

pub type PortIndex = usize;

// One logical port in the flat port arena. Relationships (peer links,
// datapath membership) are held as indices resolved during the build; no
// owning pointers.
#[derive(Debug)]
pub struct Port {
    pub name: String,
    // JSON-escaped (quoted) name for interpolation into match strings.
    pub json_name: String,
    pub nb_uuid: Uuid,
    pub sb_uuid: Uuid,
    pub tunnel_key: u32,
    pub dp: DpIndex,
    pub peer: Option<PortIndex>,
    pub kind: PortKind,
}

#[derive(Debug, EnumAsInner)]
pub enum PortKind {
    Lsp(LspData),
    Lrp(LrpData),
    LrpRedirect(RedirectData),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LspType {
    #[default]
    Regular,
    Router,
    Localnet,
    Vtep,
    L2Gateway,
    Virtual,
    External,
}

// Outstanding dynamic-address request parsed from the "addresses" column.
#[derive(Clone, Debug, Default)]
pub struct DynamicRequest {
    pub mac: Option<MacAddr>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

#[derive(Debug, Default)]
pub struct LspData {
    pub lsp_type: LspType,
    pub enabled: bool,
    // Static address declarations.
    pub addresses: Vec<LportAddresses>,
    // Whether an "unknown" entry is present.
    pub has_unknown: bool,
    // Whether a "router" entry is present (addresses come from the peer).
    pub has_router_addresses: bool,
    pub dynamic_request: Option<DynamicRequest>,
    // Current dynamic assignment, parsed from "dynamic_addresses".
    pub dynamic: Option<LportAddresses>,
    pub port_security: Vec<LportAddresses>,
    pub parent_name: Option<String>,
    pub tag: Option<u16>,
    pub dhcpv4_options: Option<Uuid>,
    pub dhcpv6_options: Option<Uuid>,
    pub ha_chassis_group: Option<Uuid>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
    pub mcast_flood: bool,
    pub mcast_flood_reports: bool,
    pub queue_id: Option<u32>,
}

// Which of the three gateway-chassis declaration forms won for a router
// port. The preference order is fixed; concurrent declarations are
// malformed and only the winning form is honored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GatewayDecl {
    HaChassisGroup(Uuid),
    GatewayChassis(Vec<Uuid>),
    RedirectChassis(String),
}

#[derive(Debug, Default)]
pub struct LrpData {
    pub enabled: bool,
    pub mac: MacAddr,
    pub networks: LportAddresses,
    pub peer_name: Option<String>,
    pub gateway: Option<GatewayDecl>,
    pub ipv6_ra_configs: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
    pub mcast_flood: bool,
}

#[derive(Debug)]
pub struct RedirectData {
    // The distributed gateway port this port shadows.
    pub lrp: PortIndex,
}

// ===== impl Port =====

impl Port {
    pub fn is_enabled(&self) -> bool {
        match &self.kind {
            PortKind::Lsp(lsp) => lsp.enabled,
            PortKind::Lrp(lrp) => lrp.enabled,
            PortKind::LrpRedirect(_) => true,
        }
    }

    pub fn derived(&self) -> bool {
        matches!(self.kind, PortKind::LrpRedirect(_))
    }
}

// ===== impl LspType =====

impl LspType {
    fn parse(value: &str) -> LspType {
        match value {
            "router" => LspType::Router,
            "localnet" => LspType::Localnet,
            "vtep" => LspType::Vtep,
            "l2gateway" => LspType::L2Gateway,
            "virtual" => LspType::Virtual,
            "external" => LspType::External,
            _ => LspType::Regular,
        }
    }
}

// ===== global functions =====

pub(crate) fn json_escape(name: &str) -> String {
    serde_json::to_string(name).unwrap()
}

// Builds the port arena: parses every logical switch and router port,
// synthesizes redirect ports, resolves peer links, allocates container tags
// and joins the result with the southbound port bindings.
pub(crate) fn build(
    nb: &NbSnapshot,
    sb: &SbSnapshot,
    model: &mut Model,
    tags: &mut TagAllocator,
    txn: &mut Transaction,
) {
    build_switch_ports(nb, model);
    build_router_ports(nb, model);
    allocate_tags(model, tags, txn);
    resolve_peers(model);
    join_sb_bindings(sb, model, txn);
}

fn build_switch_ports(nb: &NbSnapshot, model: &mut Model) {
    for dp_index in 0..model.datapaths.len() {
        if !model.datapaths[dp_index].is_switch() {
            continue;
        }
        let nb_uuid = model.datapaths[dp_index].nb_uuid;
        let Some(switch) = nb.switches.get(&nb_uuid) else {
            continue;
        };
        for port_uuid in &switch.ports {
            let Some(lsp) = nb.switch_ports.get(port_uuid) else {
                continue;
            };
            if model.port_by_name.contains_key(&lsp.name) {
                Error::DuplicatePortName(lsp.name.clone()).log();
                continue;
            }
            add_switch_port(model, dp_index, lsp);
        }
    }
}

fn add_switch_port(
    model: &mut Model,
    dp_index: DpIndex,
    lsp: &LogicalSwitchPort,
) {
    let mut data = LspData {
        lsp_type: LspType::parse(&lsp.port_type),
        enabled: lsp.enabled.unwrap_or(true),
        parent_name: lsp.parent_name.clone(),
        tag: lsp.tag,
        dhcpv4_options: lsp.dhcpv4_options,
        dhcpv6_options: lsp.dhcpv6_options,
        ha_chassis_group: lsp.ha_chassis_group,
        options: lsp.options.clone(),
        external_ids: lsp.external_ids.clone(),
        mcast_flood: lsp.options.get("mcast_flood").map(String::as_str)
            == Some("true"),
        mcast_flood_reports: lsp
            .options
            .get("mcast_flood_reports")
            .map(String::as_str)
            == Some("true"),
        ..Default::default()
    };

    // Address declarations. Dynamic requests come in three shapes:
    // "dynamic", "dynamic <ip>..." and "<mac> dynamic".
    for entry in &lsp.addresses {
        match entry.as_str() {
            "unknown" => data.has_unknown = true,
            "router" => data.has_router_addresses = true,
            _ => {
                if let Some(request) = parse_dynamic_entry(entry, &lsp.name) {
                    if data.dynamic_request.is_some() {
                        Error::DuplicateDynamicRequest(lsp.name.clone())
                            .log();
                    } else {
                        data.dynamic_request = Some(request);
                    }
                    continue;
                }
                match LportAddresses::parse(entry) {
                    Ok(addresses) => data.addresses.push(addresses),
                    Err(_) => {
                        Error::BadAddressEntry(
                            lsp.name.clone(),
                            entry.clone(),
                        )
                        .log();
                    }
                }
            }
        }
    }

    // Current dynamic assignment, if any.
    if let Some(dynamic) = &lsp.dynamic_addresses {
        if let Ok(addresses) = LportAddresses::parse(dynamic) {
            data.dynamic = Some(addresses);
        }
    }

    for entry in &lsp.port_security {
        match LportAddresses::parse(entry) {
            Ok(addresses) => data.port_security.push(addresses),
            Err(_) => {
                Error::BadAddressEntry(lsp.name.clone(), entry.clone()).log();
            }
        }
    }

    if data.has_unknown {
        if let DatapathKind::Switch(switch) =
            &mut model.datapaths[dp_index].kind
        {
            switch.has_unknown = true;
        }
    }

    let lsp_type = data.lsp_type;
    let index = model.ports.len();
    model.ports.push(Port {
        name: lsp.name.clone(),
        json_name: json_escape(&lsp.name),
        nb_uuid: lsp.uuid,
        sb_uuid: Uuid::nil(),
        tunnel_key: 0,
        dp: dp_index,
        peer: None,
        kind: PortKind::Lsp(data),
    });
    model.port_by_name.insert(lsp.name.clone(), index);
    model.port_by_nb.insert(lsp.uuid, index);
    model.datapaths[dp_index].ports.push(index);

    if let DatapathKind::Switch(switch) = &mut model.datapaths[dp_index].kind
    {
        match lsp_type {
            LspType::Localnet => switch.localnet_ports.push(index),
            LspType::Router => switch.router_ports.push(index),
            _ => {}
        }
    }
}

// Recognizes the dynamic-address forms of an addresses entry.
fn parse_dynamic_entry(entry: &str, port: &str) -> Option<DynamicRequest> {
    let tokens: Vec<&str> = entry.split_whitespace().collect();
    match tokens.as_slice() {
        ["dynamic"] => Some(DynamicRequest::default()),
        ["dynamic", rest @ ..] => {
            let mut request = DynamicRequest::default();
            for token in rest {
                if let Ok(addr) = token.parse::<Ipv4Addr>() {
                    request.ipv4 = Some(addr);
                } else if let Ok(addr) = token.parse::<Ipv6Addr>() {
                    request.ipv6 = Some(addr);
                } else {
                    Error::BadAddressEntry(
                        port.to_owned(),
                        token.to_string(),
                    )
                    .log();
                    return None;
                }
            }
            Some(request)
        }
        [mac, "dynamic"] => {
            let Ok(mac) = MacAddr::from_str(mac) else {
                Error::BadMacAddr(port.to_owned(), mac.to_string()).log();
                return None;
            };
            Some(DynamicRequest {
                mac: Some(mac),
                ..Default::default()
            })
        }
        _ => None,
    }
}

fn build_router_ports(nb: &NbSnapshot, model: &mut Model) {
    for dp_index in 0..model.datapaths.len() {
        if !model.datapaths[dp_index].is_router() {
            continue;
        }
        let nb_uuid = model.datapaths[dp_index].nb_uuid;
        let Some(router) = nb.routers.get(&nb_uuid) else {
            continue;
        };
        for port_uuid in &router.ports {
            let Some(lrp) = nb.router_ports.get(port_uuid) else {
                continue;
            };
            if model.port_by_name.contains_key(&lrp.name) {
                Error::DuplicatePortName(lrp.name.clone()).log();
                continue;
            }
            add_router_port(model, dp_index, lrp, &router.name);
        }
    }
}

fn add_router_port(
    model: &mut Model,
    dp_index: DpIndex,
    lrp: &LogicalRouterPort,
    router_name: &str,
) {
    let networks = match LportAddresses::from_lrp(&lrp.mac, &lrp.networks) {
        Ok(networks) => networks,
        Err(_) => {
            Error::BadAddressEntry(lrp.name.clone(), lrp.mac.clone()).log();
            return;
        }
    };

    let gateway = gateway_declaration(lrp);
    let data = LrpData {
        enabled: lrp.enabled.unwrap_or(true),
        mac: networks.ea,
        networks,
        peer_name: lrp.peer.clone(),
        gateway: gateway.clone(),
        ipv6_ra_configs: lrp.ipv6_ra_configs.clone(),
        options: lrp.options.clone(),
        external_ids: lrp.external_ids.clone(),
        mcast_flood: lrp.options.get("mcast_flood").map(String::as_str)
            == Some("true"),
    };

    let index = model.ports.len();
    model.ports.push(Port {
        name: lrp.name.clone(),
        json_name: json_escape(&lrp.name),
        nb_uuid: lrp.uuid,
        sb_uuid: Uuid::nil(),
        tunnel_key: 0,
        dp: dp_index,
        peer: None,
        kind: PortKind::Lrp(data),
    });
    model.port_by_name.insert(lrp.name.clone(), index);
    model.port_by_nb.insert(lrp.uuid, index);
    model.datapaths[dp_index].ports.push(index);

    // A gateway declaration turns this port into the router's distributed
    // gateway port and synthesizes its chassis-redirect shadow.
    if gateway.is_some() {
        let DatapathKind::Router(router) =
            &mut model.datapaths[dp_index].kind
        else {
            return;
        };
        if router.l3dgw_port.is_some() {
            Error::MultipleGatewayPorts(
                router_name.to_owned(),
                lrp.name.clone(),
            )
            .log();
            return;
        }
        router.l3dgw_port = Some(index);

        let redirect_name = format!("cr-{}", lrp.name);
        let redirect_index = model.ports.len();
        model.ports.push(Port {
            name: redirect_name.clone(),
            json_name: json_escape(&redirect_name),
            nb_uuid: lrp.uuid,
            sb_uuid: Uuid::nil(),
            tunnel_key: 0,
            dp: dp_index,
            peer: None,
            kind: PortKind::LrpRedirect(RedirectData { lrp: index }),
        });
        model.port_by_name.insert(redirect_name, redirect_index);
        model.datapaths[dp_index].ports.push(redirect_index);

        let DatapathKind::Router(router) =
            &mut model.datapaths[dp_index].kind
        else {
            return;
        };
        router.l3redirect_port = Some(redirect_index);
    }
}

// Applies the gateway-form preference order. Concurrent declarations are
// malformed; the strongest form wins for this cycle.
fn gateway_declaration(lrp: &LogicalRouterPort) -> Option<GatewayDecl> {
    let mut forms = 0;
    if lrp.ha_chassis_group.is_some() {
        forms += 1;
    }
    if !lrp.gateway_chassis.is_empty() {
        forms += 1;
    }
    if lrp.options.contains_key("redirect-chassis") {
        forms += 1;
    }
    if forms > 1 {
        Error::GatewayConflict(lrp.name.clone()).log();
    }

    if let Some(group) = lrp.ha_chassis_group {
        return Some(GatewayDecl::HaChassisGroup(group));
    }
    if !lrp.gateway_chassis.is_empty() {
        return Some(GatewayDecl::GatewayChassis(lrp.gateway_chassis.clone()));
    }
    lrp.options
        .get("redirect-chassis")
        .map(|chassis| GatewayDecl::RedirectChassis(chassis.clone()))
}

// Container tags: 1..4095 per parent port, with tags already present on
// sibling ports pre-marked. Allocated tags are committed to the northbound
// row.
fn allocate_tags(
    model: &mut Model,
    tags: &mut TagAllocator,
    txn: &mut Transaction,
) {
    for port in &model.ports {
        if let PortKind::Lsp(lsp) = &port.kind {
            if let (Some(parent), Some(tag)) = (&lsp.parent_name, lsp.tag) {
                tags.mark(parent, tag);
            }
        }
    }

    for port in &mut model.ports {
        let PortKind::Lsp(lsp) = &mut port.kind else {
            continue;
        };
        let Some(parent) = lsp.parent_name.clone() else {
            continue;
        };
        if lsp.tag.is_some() {
            continue;
        }
        let tag = tags.allocate(&parent);
        if tag == 0 {
            continue;
        }
        Debug::TagAllocate(&port.name, tag).log();
        lsp.tag = Some(tag);
        txn.nb_ops.push(crate::sb::NbOp::SetPortTag {
            port: port.nb_uuid,
            tag,
        });
    }
}

// Resolves peer links: switch ports of type "router" name a router port in
// their options; router ports may name another router port in their "peer"
// column. Both link directions are set.
fn resolve_peers(model: &mut Model) {
    for index in 0..model.ports.len() {
        match &model.ports[index].kind {
            PortKind::Lsp(lsp) => {
                if lsp.lsp_type != LspType::Router {
                    continue;
                }
                let Some(peer_name) = lsp.options.get("router-port").cloned()
                else {
                    continue;
                };
                let Some(&peer) = model.port_by_name.get(&peer_name) else {
                    Error::MissingRouterPort(
                        model.ports[index].name.clone(),
                        peer_name,
                    )
                    .log();
                    continue;
                };
                if !matches!(model.ports[peer].kind, PortKind::Lrp(_)) {
                    Error::BadPeer(
                        model.ports[index].name.clone(),
                        peer_name,
                    )
                    .log();
                    continue;
                }
                model.ports[index].peer = Some(peer);
                model.ports[peer].peer = Some(index);
            }
            PortKind::Lrp(lrp) => {
                let Some(peer_name) = lrp.peer_name.clone() else {
                    continue;
                };
                let Some(&peer) = model.port_by_name.get(&peer_name) else {
                    continue;
                };
                if !matches!(model.ports[peer].kind, PortKind::Lrp(_)) {
                    Error::BadPeer(
                        model.ports[index].name.clone(),
                        peer_name,
                    )
                    .log();
                    continue;
                }
                model.ports[index].peer = Some(peer);
                model.ports[peer].peer = Some(index);
            }
            PortKind::LrpRedirect(_) => {}
        }
    }
}

// Joins the port arena with the southbound port bindings by name. New ports
// get a 15-bit key inside their datapath; stale bindings are deleted and any
// MAC bindings they left behind are purged.
fn join_sb_bindings(sb: &SbSnapshot, model: &mut Model, txn: &mut Transaction) {
    let mut sb_by_name: HashMap<&str, &PortBinding> = HashMap::new();
    for binding in sb.port_bindings.values() {
        sb_by_name.insert(binding.logical_port.as_str(), binding);
    }

    // Per-datapath key spaces, hinted at the maximum key observed in the
    // southbound so far.
    let mut spaces: HashMap<DpIndex, TnlKeySpace> = HashMap::new();
    for dp_index in 0..model.datapaths.len() {
        let mut space =
            TnlKeySpace::new("port", PORT_TNL_KEY_MIN, PORT_TNL_KEY_MAX);
        let dp_sb = model.datapaths[dp_index].sb_uuid;
        let mut max_key = 0;
        for binding in sb.port_bindings.values() {
            if binding.datapath == dp_sb {
                space.mark(binding.tunnel_key);
                max_key = max_key.max(binding.tunnel_key);
            }
        }
        if max_key > 0 && max_key < PORT_TNL_KEY_MAX {
            space.set_hint(max_key);
        }
        spaces.insert(dp_index, space);
    }

    for index in 0..model.ports.len() {
        let dp_index = model.ports[index].dp;
        let dp_sb = model.datapaths[dp_index].sb_uuid;
        let space = spaces.get_mut(&dp_index).unwrap();

        match sb_by_name.get(model.ports[index].name.as_str()) {
            Some(binding)
                if binding.datapath == dp_sb
                    && binding.tunnel_key >= PORT_TNL_KEY_MIN
                    && binding.tunnel_key <= PORT_TNL_KEY_MAX =>
            {
                model.ports[index].sb_uuid = binding.uuid;
                model.ports[index].tunnel_key = binding.tunnel_key;
            }
            Some(binding) => {
                // The port moved to another datapath (or carries a bogus
                // key); keep the row but reallocate its key.
                model.ports[index].sb_uuid = binding.uuid;
                model.ports[index].tunnel_key = space.allocate();
            }
            None => {
                let tunnel_key = space.allocate();
                if tunnel_key == 0 {
                    continue;
                }
                model.ports[index].sb_uuid = Uuid::new_v4();
                model.ports[index].tunnel_key = tunnel_key;
                Debug::PortBindingCreate(
                    &model.ports[index].name,
                    tunnel_key,
                )
                .log();
            }
        }
    }

    // Stale southbound bindings.
    let mut deleted: BTreeSet<String> = BTreeSet::new();
    for binding in sb.port_bindings.values() {
        if !model.port_by_name.contains_key(&binding.logical_port) {
            Debug::PortBindingDelete(&binding.logical_port).log();
            txn.sb_ops.push(SbOp::DeletePortBinding(binding.uuid));
            deleted.insert(binding.logical_port.clone());
        }
    }
    if !deleted.is_empty() {
        for mac_binding in sb.mac_bindings.values() {
            if deleted.contains(&mac_binding.logical_port) {
                txn.sb_ops.push(SbOp::DeleteMacBinding(mac_binding.uuid));
            }
        }
    }
}

// Writes the southbound port-binding rows. Runs after the HA-chassis-group
// synthesizer so redirect and external ports can reference their southbound
// group, and after IPAM so dynamic addresses land in the "mac" column.
pub(crate) fn update_sb(
    nb: &NbSnapshot,
    sb: &SbSnapshot,
    model: &mut Model,
    ha_groups: &BTreeMap<String, Uuid>,
    queues: &mut QueueIdAllocator,
    txn: &mut Transaction,
) {
    allocate_queue_ids(sb, model, queues);

    for index in 0..model.ports.len() {
        let port = &model.ports[index];
        if port.tunnel_key == 0 || port.sb_uuid.is_nil() {
            continue;
        }

        let observed = sb.port_bindings.get(&port.sb_uuid);
        let mut row = PortBinding {
            uuid: port.sb_uuid,
            logical_port: port.name.clone(),
            datapath: model.datapaths[port.dp].sb_uuid,
            tunnel_key: port.tunnel_key,
            chassis: observed.and_then(|row| row.chassis.clone()),
            ..Default::default()
        };

        match &port.kind {
            PortKind::Lsp(lsp) => {
                fill_lsp_binding(nb, model, index, lsp, ha_groups, &mut row);
            }
            PortKind::Lrp(lrp) => {
                row.port_type =
                    if model.datapaths[port.dp].is_gateway_router() {
                        "l3gateway".to_owned()
                    } else {
                        "patch".to_owned()
                    };
                row.options = lrp.options.clone();
                row.options.remove("redirect-chassis");
                if let Some(peer) = port.peer {
                    row.options.insert(
                        "peer".to_owned(),
                        model.ports[peer].name.clone(),
                    );
                }
                row.mac.push(lrp.networks.to_lrp_string());
                row.external_ids = lrp.external_ids.clone();
            }
            PortKind::LrpRedirect(redirect) => {
                let lrp = &model.ports[redirect.lrp];
                row.port_type = "chassisredirect".to_owned();
                row.options.insert(
                    "distributed-port".to_owned(),
                    lrp.name.clone(),
                );
                if let Some(lrp_data) = lrp.kind.as_lrp() {
                    row.mac.push(lrp_data.networks.to_lrp_string());
                    if let Some(group_name) =
                        ha_group_name(&lrp.name, &lrp_data.gateway, nb)
                    {
                        row.ha_chassis_group =
                            ha_groups.get(&group_name).copied();
                    }
                }
            }
        }

        match observed {
            Some(observed) if binding_equal(observed, &row) => {}
            Some(_) => txn.sb_ops.push(SbOp::UpdatePortBinding(row)),
            None => txn.sb_ops.push(SbOp::InsertPortBinding(row)),
        }
    }
}

fn fill_lsp_binding(
    nb: &NbSnapshot,
    model: &Model,
    index: PortIndex,
    lsp: &LspData,
    ha_groups: &BTreeMap<String, Uuid>,
    row: &mut PortBinding,
) {
    let port = &model.ports[index];
    row.port_type = match lsp.lsp_type {
        LspType::Regular => String::new(),
        LspType::Router => "patch".to_owned(),
        LspType::Localnet => "localnet".to_owned(),
        LspType::Vtep => "vtep".to_owned(),
        LspType::L2Gateway => "l2gateway".to_owned(),
        LspType::Virtual => "virtual".to_owned(),
        LspType::External => "external".to_owned(),
    };
    row.options = lsp.options.clone();
    row.parent_port = lsp.parent_name.clone();
    row.tag = lsp.tag;
    row.external_ids = lsp.external_ids.clone();

    if let Some(queue_id) = lsp.queue_id {
        row.options
            .insert("qdisc_queue_id".to_owned(), queue_id.to_string());
    }

    if lsp.lsp_type == LspType::Router {
        if let Some(peer) = port.peer {
            row.options
                .insert("peer".to_owned(), model.ports[peer].name.clone());
            if let Some(nat) = nat_addresses(nb, model, index, peer) {
                row.nat_addresses = nat;
            }
        }
    }

    if lsp.lsp_type == LspType::External {
        if let Some(group) = lsp.ha_chassis_group {
            if let Some(nb_group) = nb.ha_chassis_groups.get(&group) {
                row.ha_chassis_group =
                    ha_groups.get(&nb_group.name).copied();
            }
        }
    }

    // The "mac" column carries the effective address list: static entries
    // verbatim, plus the dynamic assignment.
    row.mac = port_address_entries(lsp);
}

// Effective address strings for the southbound "mac" column.
fn port_address_entries(lsp: &LspData) -> Vec<String> {
    let mut entries = Vec::new();
    for addresses in &lsp.addresses {
        entries.push(addresses.to_string());
    }
    if let Some(dynamic) = &lsp.dynamic {
        entries.push(dynamic.to_string());
    }
    if lsp.has_unknown {
        entries.push("unknown".to_owned());
    }
    if lsp.has_router_addresses {
        entries.push("router".to_owned());
    }
    entries
}

// Gratuitous-ARP publication set for a router-type switch port whose options
// request "nat-addresses=router": the peer router port's MAC followed by its
// NAT external addresses and load-balancer VIPs. On a distributed gateway
// router the set is scoped to the chassis owning the redirect port.
fn nat_addresses(
    nb: &NbSnapshot,
    model: &Model,
    index: PortIndex,
    peer: PortIndex,
) -> Option<Vec<String>> {
    let port = &model.ports[index];
    let lsp = port.kind.as_lsp()?;
    if lsp.options.get("nat-addresses").map(String::as_str) != Some("router")
    {
        return None;
    }

    let lrp = &model.ports[peer];
    let lrp_data = lrp.kind.as_lrp()?;
    let router_dp = &model.datapaths[lrp.dp];
    let router = nb.routers.get(&router_dp.nb_uuid)?;
    let router_data = router_dp.kind.as_router()?;

    let mut addresses: BTreeSet<String> = BTreeSet::new();
    for nat_uuid in &router.nat {
        let Some(nat) = nb.nat_rules.get(nat_uuid) else {
            continue;
        };
        // SNAT external addresses are owned by the gateway; DNAT addresses
        // are announced so ingress traffic finds the chassis.
        if matches!(nat.nat_type, NatType::Snat | NatType::DnatAndSnat) {
            addresses.insert(nat.external_ip.clone());
        }
    }
    for lb_uuid in &router.load_balancer {
        let Some(lb) = nb.load_balancers.get(lb_uuid) else {
            continue;
        };
        for vip in lb.vips.keys() {
            let ip = vip.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(vip);
            addresses.insert(ip.to_owned());
        }
    }

    if addresses.is_empty() {
        return None;
    }

    let mut entry = lrp_data.mac.to_string();
    for address in addresses {
        entry.push(' ');
        entry.push_str(&address);
    }
    if let Some(redirect) = router_data.l3redirect_port {
        entry.push_str(&format!(
            " is_chassis_resident({})",
            model.ports[redirect].json_name
        ));
    }
    Some(vec![entry])
}

// QoS queue ids live on the chassis hosting the port. Existing assignments
// are kept when still wanted; ports gaining QoS options get the first free
// id on their chassis.
fn allocate_queue_ids(
    sb: &SbSnapshot,
    model: &mut Model,
    queues: &mut QueueIdAllocator,
) {
    // Seed with assignments already present in the southbound.
    for binding in sb.port_bindings.values() {
        let (Some(chassis), Some(queue_id)) = (
            binding.chassis.as_deref(),
            binding
                .options
                .get("qdisc_queue_id")
                .and_then(|id| id.parse::<u32>().ok()),
        ) else {
            continue;
        };
        queues.mark(chassis, queue_id);
    }

    for index in 0..model.ports.len() {
        let port = &model.ports[index];
        let Some(lsp) = port.kind.as_lsp() else {
            continue;
        };
        let wants_qos = lsp.options.contains_key("qos_max_rate")
            || lsp.options.contains_key("qos_burst");
        if !wants_qos {
            continue;
        }
        let Some(binding) = sb.port_bindings.get(&port.sb_uuid) else {
            continue;
        };
        let Some(chassis) = binding.chassis.clone() else {
            continue;
        };

        let queue_id = match binding
            .options
            .get("qdisc_queue_id")
            .and_then(|id| id.parse::<u32>().ok())
        {
            Some(queue_id) => queue_id,
            None => {
                let queue_id = queues.allocate(&chassis);
                if queue_id == 0 {
                    continue;
                }
                queue_id
            }
        };
        if let PortKind::Lsp(lsp) = &mut model.ports[index].kind {
            lsp.queue_id = Some(queue_id);
        }
    }
}

fn binding_equal(a: &PortBinding, b: &PortBinding) -> bool {
    a.logical_port == b.logical_port
        && a.datapath == b.datapath
        && a.tunnel_key == b.tunnel_key
        && a.port_type == b.port_type
        && a.parent_port == b.parent_port
        && a.tag == b.tag
        && a.mac == b.mac
        && a.nat_addresses == b.nat_addresses
        && a.options == b.options
        && a.ha_chassis_group == b.ha_chassis_group
        && a.external_ids == b.external_ids
}

// Resolves the HA-chassis-group name a gateway declaration maps to.
pub(crate) fn ha_group_name(
    lrp_name: &str,
    gateway: &Option<GatewayDecl>,
    nb: &NbSnapshot,
) -> Option<String> {
    match gateway.as_ref()? {
        GatewayDecl::HaChassisGroup(group) => {
            nb.ha_chassis_groups.get(group).map(|group| group.name.clone())
        }
        GatewayDecl::GatewayChassis(_) => Some(lrp_name.to_owned()),
        GatewayDecl::RedirectChassis(chassis) => {
            Some(format!("{lrp_name}_{chassis}"))
        }
    }
}
