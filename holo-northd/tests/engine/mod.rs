//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod allocator;
mod ipam;
mod router;
mod switch;
mod sync;

use std::collections::BTreeMap;

use holo_northd::engine::Engine;
use holo_northd::nb::{
    Acl, AclAction, AclDirection, GatewayChassis, LbProtocol, LoadBalancer,
    LogicalRouter, LogicalRouterPort, LogicalSwitch, LogicalSwitchPort,
    NatRule, NatType, NbSnapshot, PortGroup, StaticRoute,
};
use holo_northd::sb::{SbSnapshot, Transaction};
use uuid::Uuid;

// The MAC prefix used by every test, so allocations are reproducible.
pub const MAC_PREFIX: &str = "0a:00:02";

// A northbound/southbound database pair driven through a persistent engine,
// with committed transactions applied to both mirrors.
pub struct Fixture {
    pub engine: Engine,
    pub nb: NbSnapshot,
    pub sb: SbSnapshot,
}

#[allow(dead_code)]
impl Fixture {
    pub fn new() -> Fixture {
        let mut nb = NbSnapshot::default();
        nb.global
            .options
            .insert("mac_prefix".to_owned(), MAC_PREFIX.to_owned());
        Fixture {
            engine: Engine::new(),
            nb,
            sb: SbSnapshot::default(),
        }
    }

    // Runs one reconciliation pass and applies the result.
    pub fn run(&mut self) -> Transaction {
        let txn = self.engine.run_pass(&self.nb, &self.sb);
        self.sb.apply(&txn);
        self.nb.apply(&txn);
        txn
    }

    // ===== northbound builders =====

    pub fn add_switch(&mut self, name: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        self.nb.switches.insert(
            uuid,
            LogicalSwitch {
                uuid,
                name: name.to_owned(),
                ..Default::default()
            },
        );
        uuid
    }

    pub fn set_subnet(&mut self, switch: Uuid, subnet: &str) {
        let switch = self.nb.switches.get_mut(&switch).unwrap();
        switch
            .other_config
            .insert("subnet".to_owned(), subnet.to_owned());
    }

    pub fn set_exclude_ips(&mut self, switch: Uuid, exclude: &str) {
        let switch = self.nb.switches.get_mut(&switch).unwrap();
        switch
            .other_config
            .insert("exclude_ips".to_owned(), exclude.to_owned());
    }

    pub fn add_switch_port(
        &mut self,
        switch: Uuid,
        name: &str,
        addresses: &[&str],
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        self.nb.switch_ports.insert(
            uuid,
            LogicalSwitchPort {
                uuid,
                name: name.to_owned(),
                addresses: addresses
                    .iter()
                    .map(|entry| (*entry).to_owned())
                    .collect(),
                ..Default::default()
            },
        );
        self.nb.switches.get_mut(&switch).unwrap().ports.push(uuid);
        uuid
    }

    pub fn add_router(&mut self, name: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        self.nb.routers.insert(
            uuid,
            LogicalRouter {
                uuid,
                name: name.to_owned(),
                ..Default::default()
            },
        );
        uuid
    }

    pub fn add_router_port(
        &mut self,
        router: Uuid,
        name: &str,
        mac: &str,
        networks: &[&str],
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        self.nb.router_ports.insert(
            uuid,
            LogicalRouterPort {
                uuid,
                name: name.to_owned(),
                mac: mac.to_owned(),
                networks: networks
                    .iter()
                    .map(|network| (*network).to_owned())
                    .collect(),
                ..Default::default()
            },
        );
        self.nb.routers.get_mut(&router).unwrap().ports.push(uuid);
        uuid
    }

    // Connects a router port to a switch through a "router"-type port.
    pub fn connect(&mut self, switch: Uuid, lrp_name: &str) -> Uuid {
        let name = format!("{lrp_name}-attach");
        let uuid = self.add_switch_port(switch, &name, &["router"]);
        let port = self.nb.switch_ports.get_mut(&uuid).unwrap();
        port.port_type = "router".to_owned();
        port.options
            .insert("router-port".to_owned(), lrp_name.to_owned());
        uuid
    }

    pub fn add_gateway_chassis(
        &mut self,
        lrp: Uuid,
        chassis_name: &str,
        priority: u16,
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        let lrp = self.nb.router_ports.get_mut(&lrp).unwrap();
        self.nb.gateway_chassis.insert(
            uuid,
            GatewayChassis {
                uuid,
                name: format!("{}-{}", lrp.name, chassis_name),
                chassis_name: chassis_name.to_owned(),
                priority,
                external_ids: Default::default(),
            },
        );
        lrp.gateway_chassis.push(uuid);
        uuid
    }

    pub fn add_nat(
        &mut self,
        router: Uuid,
        nat_type: NatType,
        external_ip: &str,
        logical_ip: &str,
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        self.nb.nat_rules.insert(
            uuid,
            NatRule {
                uuid,
                nat_type,
                external_ip: external_ip.to_owned(),
                external_mac: None,
                logical_ip: logical_ip.to_owned(),
                logical_port: None,
                options: Default::default(),
            },
        );
        self.nb.routers.get_mut(&router).unwrap().nat.push(uuid);
        uuid
    }

    pub fn add_static_route(
        &mut self,
        router: Uuid,
        ip_prefix: &str,
        nexthop: &str,
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        self.nb.static_routes.insert(
            uuid,
            StaticRoute {
                uuid,
                ip_prefix: ip_prefix.to_owned(),
                nexthop: nexthop.to_owned(),
                output_port: None,
                policy: None,
            },
        );
        self.nb
            .routers
            .get_mut(&router)
            .unwrap()
            .static_routes
            .push(uuid);
        uuid
    }

    pub fn add_acl(
        &mut self,
        switch: Uuid,
        direction: AclDirection,
        priority: u16,
        match_: &str,
        action: AclAction,
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        self.nb.acls.insert(
            uuid,
            Acl {
                uuid,
                direction,
                priority,
                match_: match_.to_owned(),
                action,
                log: false,
                name: None,
                severity: None,
                meter: None,
            },
        );
        self.nb.switches.get_mut(&switch).unwrap().acls.push(uuid);
        uuid
    }

    pub fn add_load_balancer(
        &mut self,
        switch: Uuid,
        vip: &str,
        backends: &str,
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        let mut vips = BTreeMap::new();
        vips.insert(vip.to_owned(), backends.to_owned());
        self.nb.load_balancers.insert(
            uuid,
            LoadBalancer {
                uuid,
                name: "lb0".to_owned(),
                vips,
                protocol: Some(LbProtocol::Tcp),
            },
        );
        self.nb
            .switches
            .get_mut(&switch)
            .unwrap()
            .load_balancer
            .push(uuid);
        uuid
    }

    pub fn add_port_group(&mut self, name: &str, ports: &[Uuid]) -> Uuid {
        let uuid = Uuid::new_v4();
        self.nb.port_groups.insert(
            uuid,
            PortGroup {
                uuid,
                name: name.to_owned(),
                ports: ports.to_vec(),
                acls: Vec::new(),
            },
        );
        uuid
    }

    // ===== southbound lookups =====

    // Southbound datapath row uuid for a named switch or router.
    pub fn dp(&self, name: &str) -> Uuid {
        self.sb
            .datapaths
            .values()
            .find(|dp| dp.external_ids.get("name").map(String::as_str) == Some(name))
            .map(|dp| dp.uuid)
            .unwrap_or_else(|| panic!("no datapath binding for {name}"))
    }

    pub fn port_binding(
        &self,
        name: &str,
    ) -> Option<&holo_northd::sb::PortBinding> {
        self.sb
            .port_bindings
            .values()
            .find(|binding| binding.logical_port == name)
    }

    pub fn has_flow(
        &self,
        dp: Uuid,
        stage: &str,
        priority: u16,
        match_: &str,
    ) -> bool {
        self.flow_actions(dp, stage, priority, match_).is_some()
    }

    pub fn flow_actions(
        &self,
        dp: Uuid,
        stage: &str,
        priority: u16,
        match_: &str,
    ) -> Option<String> {
        self.sb
            .logical_flows
            .values()
            .find(|flow| {
                flow.datapath == dp
                    && flow.external_ids.get("stage-name").map(String::as_str)
                        == Some(stage)
                    && flow.priority == priority
                    && flow.match_ == match_
            })
            .map(|flow| flow.actions.clone())
    }

    // All flows of one stage, as (priority, match, actions) tuples.
    pub fn stage_flows(
        &self,
        dp: Uuid,
        stage: &str,
    ) -> Vec<(u16, String, String)> {
        self.sb
            .logical_flows
            .values()
            .filter(|flow| {
                flow.datapath == dp
                    && flow.external_ids.get("stage-name").map(String::as_str)
                        == Some(stage)
            })
            .map(|flow| {
                (flow.priority, flow.match_.clone(), flow.actions.clone())
            })
            .collect()
    }
}
