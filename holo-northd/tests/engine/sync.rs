//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use holo_northd::sb::{Chassis, LogicalFlowRow, SbOp};
use uuid::Uuid;

use crate::Fixture;

fn small_topology(fixture: &mut Fixture) {
    let ls0 = fixture.add_switch("ls0");
    fixture.set_subnet(ls0, "10.0.0.0/24");
    fixture.add_switch_port(ls0, "p1", &["dynamic"]);
    fixture.add_switch_port(ls0, "p2", &["02:00:00:00:00:10 10.0.0.50"]);
    let lr0 = fixture.add_router("lr0");
    fixture.add_router_port(
        lr0,
        "lr0-sw",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.connect(ls0, "lr0-sw");
}

// For every northbound switch, router and port there is exactly one
// southbound binding, and a second pass writes nothing.
#[test]
fn bijection_and_convergence() {
    let mut fixture = Fixture::new();
    small_topology(&mut fixture);
    fixture.run();

    assert_eq!(fixture.sb.datapaths.len(), 2);
    assert_eq!(fixture.sb.port_bindings.len(), 4);
    for name in ["p1", "p2", "lr0-sw", "lr0-sw-attach", "cr-lr0-sw"] {
        let expected = name != "cr-lr0-sw";
        assert_eq!(
            fixture.port_binding(name).is_some(),
            expected,
            "binding presence mismatch for {name}"
        );
    }

    let txn = fixture.run();
    assert!(txn.is_empty(), "unexpected writes: {:?}", txn.sb_ops);
}

// Manual damage to the flow table is repaired on the next pass.
#[test]
fn flow_diff_repairs_drift() {
    let mut fixture = Fixture::new();
    small_topology(&mut fixture);
    fixture.run();

    // Remove one row and plant a bogus one.
    let victim = *fixture.sb.logical_flows.keys().next().unwrap();
    fixture.sb.logical_flows.remove(&victim);
    let bogus = Uuid::new_v4();
    fixture.sb.logical_flows.insert(
        bogus,
        LogicalFlowRow {
            uuid: bogus,
            datapath: fixture.dp("ls0"),
            pipeline: "ingress".to_owned(),
            table_id: 0,
            priority: 12345,
            match_: "ip4.dst == 192.0.2.1".to_owned(),
            actions: "drop;".to_owned(),
            external_ids: Default::default(),
        },
    );

    let txn = fixture.run();
    let inserts = txn
        .sb_ops
        .iter()
        .filter(|op| matches!(op, SbOp::InsertLogicalFlow(_)))
        .count();
    let deletes = txn
        .sb_ops
        .iter()
        .filter(|op| matches!(op, SbOp::DeleteLogicalFlow(uuid) if *uuid == bogus))
        .count();
    assert_eq!(inserts, 1);
    assert_eq!(deletes, 1);

    // And the pass after that is quiet again.
    let txn = fixture.run();
    assert!(txn.is_empty());
}

// Tunnel keys are stable for entities that persist across passes.
#[test]
fn key_stability() {
    let mut fixture = Fixture::new();
    small_topology(&mut fixture);
    fixture.run();

    let dp_keys: Vec<(Uuid, u32)> = fixture
        .sb
        .datapaths
        .values()
        .map(|dp| (dp.uuid, dp.tunnel_key))
        .collect();
    let port_keys: Vec<(String, u32)> = fixture
        .sb
        .port_bindings
        .values()
        .map(|binding| (binding.logical_port.clone(), binding.tunnel_key))
        .collect();

    // Grow the topology and reconcile again.
    let ls1 = fixture.add_switch("ls1");
    fixture.add_switch_port(ls1, "p3", &["02:00:00:00:00:20 10.0.1.3"]);
    fixture.run();

    for (uuid, key) in dp_keys {
        assert_eq!(fixture.sb.datapaths.get(&uuid).unwrap().tunnel_key, key);
    }
    for (name, key) in port_keys {
        assert_eq!(fixture.port_binding(&name).unwrap().tunnel_key, key);
    }

    // New keys are inside the documented ranges.
    for dp in fixture.sb.datapaths.values() {
        assert!(dp.tunnel_key >= 1 && dp.tunnel_key < (1 << 24));
    }
    for binding in fixture.sb.port_bindings.values() {
        assert!(binding.tunnel_key >= 1 && binding.tunnel_key < (1 << 15));
    }
}

// Stale southbound rows disappear when their northbound objects do.
#[test]
fn orphan_cleanup() {
    let mut fixture = Fixture::new();
    small_topology(&mut fixture);
    fixture.run();

    // Drop the whole switch.
    let ls0 = *fixture
        .nb
        .switches
        .iter()
        .find(|(_, switch)| switch.name == "ls0")
        .map(|(uuid, _)| uuid)
        .unwrap();
    let ports = fixture.nb.switches.get(&ls0).unwrap().ports.clone();
    fixture.nb.switches.remove(&ls0);
    for port in ports {
        fixture.nb.switch_ports.remove(&port);
    }
    fixture.run();

    assert_eq!(fixture.sb.datapaths.len(), 1);
    assert!(fixture.port_binding("p1").is_none());
    assert!(fixture.port_binding("p2").is_none());
    // No flows reference the deleted datapath anymore.
    let remaining = fixture.dp("lr0");
    assert!(fixture
        .sb
        .logical_flows
        .values()
        .all(|flow| flow.datapath == remaining));
}

// The downstream agent role carries exactly the documented permission
// matrix, and manual drift is corrected.
#[test]
fn rbac_exactness() {
    let mut fixture = Fixture::new();
    fixture.run();

    let role = fixture
        .sb
        .rbac_roles
        .values()
        .find(|role| role.name == "ovn-controller")
        .expect("role");
    assert_eq!(role.permissions.len(), 4);
    assert_eq!(fixture.sb.rbac_permissions.len(), 4);

    let chassis = fixture
        .sb
        .rbac_permissions
        .get(role.permissions.get("Chassis").unwrap())
        .unwrap();
    assert_eq!(chassis.authorization, vec!["name"]);
    assert!(chassis.insert_delete);
    assert_eq!(
        chassis.update,
        vec!["nb_cfg", "external_ids", "encaps", "vtep_logical_switches"]
    );

    let port_binding = fixture
        .sb
        .rbac_permissions
        .get(role.permissions.get("Port_Binding").unwrap())
        .unwrap();
    assert_eq!(port_binding.authorization, vec![""]);
    assert!(!port_binding.insert_delete);
    assert_eq!(port_binding.update, vec!["chassis"]);

    // Tamper with one permission; the next pass recreates it.
    let victim = *role.permissions.get("MAC_Binding").unwrap();
    fixture
        .sb
        .rbac_permissions
        .get_mut(&victim)
        .unwrap()
        .insert_delete = false;
    fixture.run();

    let role = fixture
        .sb
        .rbac_roles
        .values()
        .find(|role| role.name == "ovn-controller")
        .unwrap();
    let mac_binding = fixture
        .sb
        .rbac_permissions
        .get(role.permissions.get("MAC_Binding").unwrap())
        .unwrap();
    assert!(mac_binding.insert_delete);
    assert_eq!(fixture.sb.rbac_permissions.len(), 4);
}

// An unchanged gateway configuration produces no HA-group writes.
#[test]
fn ha_group_idempotence() {
    let mut fixture = Fixture::new();
    let lr0 = fixture.add_router("lr0");
    let a = fixture.add_router_port(
        lr0,
        "lr0-a",
        "40:00:00:00:00:01",
        &["10.0.0.1/24"],
    );
    fixture.add_gateway_chassis(a, "hv1", 20);
    fixture.add_gateway_chassis(a, "hv2", 10);
    fixture.run();

    let group = fixture
        .sb
        .ha_chassis_groups
        .values()
        .find(|group| group.name == "lr0-a")
        .expect("group");
    assert_eq!(group.ha_chassis.len(), 2);
    // Ordered by descending priority.
    assert_eq!(group.ha_chassis[0].chassis, "hv1");
    assert_eq!(group.ha_chassis[0].priority, 20);

    let txn = fixture.run();
    assert!(txn.is_empty(), "unexpected writes: {:?}", txn.sb_ops);

    // Dropping the declaration removes the group.
    fixture
        .nb
        .router_ports
        .get_mut(&a)
        .unwrap()
        .gateway_chassis
        .clear();
    fixture.run();
    assert!(fixture.sb.ha_chassis_groups.is_empty());
}

// Meters mirror by name with band multiset equality.
#[test]
fn meter_sync() {
    let mut fixture = Fixture::new();
    let uuid = Uuid::new_v4();
    fixture.nb.meters.insert(
        uuid,
        holo_northd::nb::Meter {
            uuid,
            name: "event-elb".to_owned(),
            unit: "kbps".to_owned(),
            bands: vec![holo_northd::nb::MeterBand {
                action: "drop".to_owned(),
                rate: 100,
                burst_size: 50,
            }],
        },
    );
    fixture.run();

    let meter = fixture
        .sb
        .meters
        .values()
        .find(|meter| meter.name == "event-elb")
        .expect("meter");
    assert_eq!(meter.unit, "kbps");
    assert_eq!(meter.bands.len(), 1);

    let txn = fixture.run();
    assert!(txn.is_empty());

    fixture.nb.meters.remove(&uuid);
    fixture.run();
    assert!(fixture.sb.meters.is_empty());
}

// The DHCP option catalogs are pinned to the supported set.
#[test]
fn dhcp_option_catalogs() {
    let mut fixture = Fixture::new();
    fixture.run();

    assert_eq!(
        fixture.sb.dhcp_options.len(),
        holo_northd::sync::DHCPV4_OPTION_DEFS.len()
    );
    assert_eq!(
        fixture.sb.dhcpv6_options.len(),
        holo_northd::sync::DHCPV6_OPTION_DEFS.len()
    );
    assert!(fixture
        .sb
        .dhcp_options
        .values()
        .any(|def| def.name == "lease_time"
            && def.code == 51
            && def.option_type == "uint32"));

    // Unknown rows are removed on the next pass.
    let bogus = Uuid::new_v4();
    fixture.sb.dhcp_options.insert(
        bogus,
        holo_northd::sb::DhcpOptionDef {
            uuid: bogus,
            name: "bogus".to_owned(),
            code: 250,
            option_type: "str".to_owned(),
        },
    );
    fixture.run();
    assert!(!fixture.sb.dhcp_options.contains_key(&bogus));
}

// nb_cfg propagates down, hv_cfg aggregates the chassis minimum.
#[test]
fn config_sequence_numbers() {
    let mut fixture = Fixture::new();
    for (name, nb_cfg) in [("hv1", 4), ("hv2", 7)] {
        let uuid = Uuid::new_v4();
        fixture.sb.chassis.insert(
            uuid,
            Chassis {
                uuid,
                name: name.to_owned(),
                hostname: name.to_owned(),
                nb_cfg,
                external_ids: Default::default(),
            },
        );
    }
    fixture.nb.global.nb_cfg = 9;
    fixture.run();

    assert_eq!(fixture.sb.global.nb_cfg, 9);
    assert_eq!(fixture.nb.global.sb_cfg, 9);
    assert_eq!(fixture.nb.global.hv_cfg, 4);
}
