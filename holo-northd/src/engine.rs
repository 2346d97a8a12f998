//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// The reconciliation engine. One pass is a pure function from a northbound
// and a southbound snapshot to a transaction; only the MAC-address set, the
// MAC prefix and the datapath key hint survive across passes.

use std::collections::HashMap;

use holo_utils::mac_addr::MacPrefix;
use uuid::Uuid;

use crate::allocator::{
    MacSet, QueueIdAllocator, TagAllocator, TnlKeySpace, DP_TNL_KEY_MAX,
    DP_TNL_KEY_MIN,
};
use crate::datapath::{self, Datapath, DatapathKind, DpIndex};
use crate::debug::Debug;
use crate::error::Error;
use crate::lflow::{self, LflowSet};
use crate::multicast::{self, IgmpAggregate, McGroups};
use crate::nb::{AclAction, NbSnapshot};
use crate::port::{self, Port, PortIndex};
use crate::sb::{NbOp, SbSnapshot, Transaction};
use crate::{ha, ipam, rbac, sync};

// In-memory model of one reconciliation pass: flat arenas for datapaths and
// ports, with relationships held as indices.
#[derive(Debug, Default)]
pub struct Model {
    pub datapaths: Vec<Datapath>,
    pub dp_by_nb: HashMap<Uuid, DpIndex>,
    pub dp_by_sb: HashMap<Uuid, DpIndex>,
    pub ports: Vec<Port>,
    pub port_by_name: HashMap<String, PortIndex>,
    pub port_by_nb: HashMap<Uuid, PortIndex>,
    pub router_groups: Vec<Vec<DpIndex>>,
    pub igmp_aggregates: Vec<IgmpAggregate>,
}

#[derive(Debug, Default)]
pub struct Engine {
    // Every MAC handed out under the configured prefix, across passes.
    macs: Option<MacSet>,
    // Where datapath key allocation resumes.
    dp_key_hint: u32,
}

// ===== impl Engine =====

impl Engine {
    pub fn new() -> Engine {
        Default::default()
    }

    // Runs one full reconciliation pass over consistent snapshots of both
    // databases and returns the writes needed to converge.
    pub fn run_pass(
        &mut self,
        nb: &NbSnapshot,
        sb: &SbSnapshot,
    ) -> Transaction {
        Debug::PassStart.log();
        let mut txn = Transaction::default();
        let mut model = Model::default();

        let prefix = self.ensure_mac_prefix(nb, &mut txn);
        match &self.macs {
            Some(macs) if macs.prefix() == prefix => {}
            _ => self.macs = Some(MacSet::new(prefix)),
        }
        let macs = self.macs.as_mut().expect("MAC set initialized above");

        // Datapaths and ports, with their tunnel keys.
        let mut dp_keys =
            TnlKeySpace::new("datapath", DP_TNL_KEY_MIN, DP_TNL_KEY_MAX);
        dp_keys.set_hint(self.dp_key_hint);
        datapath::build(nb, sb, &mut model, &mut dp_keys, &mut txn);
        self.dp_key_hint = dp_keys.hint();

        let mut tags = TagAllocator::default();
        port::build(nb, sb, &mut model, &mut tags, &mut txn);

        // Address management runs only once all peering is in place.
        ipam::run(&mut model, macs, &mut txn);

        // Gateway high availability and multicast.
        ha::build_router_groups(&mut model);
        let ha_groups = ha::sync_groups(nb, sb, &model, &mut txn);
        let mut mc = McGroups::default();
        multicast::build(sb, &mut model, &mut mc);

        prepare_acl_lb_state(nb, &mut model);

        let mut queues = QueueIdAllocator::default();
        port::update_sb(nb, sb, &mut model, &ha_groups, &mut queues, &mut txn);

        // The logical-flow program.
        let mut lflows = LflowSet::new();
        lflow::switch::build(nb, &model, &mc, &mut lflows);
        lflow::router::build(nb, &model, &mut lflows);
        Debug::FlowsComputed(lflows.len()).log();

        // Diff against the observed southbound state.
        sync::flows(sb, &lflows, &mut txn);
        sync::multicast_groups(sb, &model, &mc, &mut txn);
        sync::igmp_groups(sb, &model, &mut txn);
        sync::address_sets(nb, &model, sb, &mut txn);
        sync::port_groups(nb, &model, sb, &mut txn);
        sync::meters(nb, sb, &mut txn);
        sync::dns(nb, &model, sb, &mut txn);
        sync::dhcp_option_defs(sb, &mut txn);
        sync::ip_multicast(&model, sb, &mut txn);
        rbac::check(sb, &mut txn);
        sync::globals(nb, sb, &mut txn);

        Debug::PassEnd(txn.sb_ops.len(), txn.nb_ops.len()).log();
        txn
    }

    // The 24-bit MAC prefix comes from the global options; on first run a
    // random locally-administered prefix is generated and persisted.
    fn ensure_mac_prefix(
        &mut self,
        nb: &NbSnapshot,
        txn: &mut Transaction,
    ) -> MacPrefix {
        if let Some(prefix) = nb
            .global
            .options
            .get("mac_prefix")
            .and_then(|value| value.parse::<MacPrefix>().ok())
        {
            return prefix;
        }

        if let Some(macs) = &self.macs {
            // Already generated in an earlier pass whose write-back has not
            // been observed yet.
            return macs.prefix();
        }

        let mut bytes: [u8; 3] = rand::random();
        // Unicast, locally administered.
        bytes[0] = (bytes[0] & 0xfc) | 0x02;
        let prefix = MacPrefix::from(bytes);
        txn.nb_ops.push(NbOp::SetMacPrefix(prefix.to_string()));
        prefix
    }
}

// ===== helper functions =====

// Pre-computes the ACL and load-balancer derived switch state: which port
// groups touch each switch, whether any applicable ACL is stateful, and
// whether any VIP is configured.
fn prepare_acl_lb_state(nb: &NbSnapshot, model: &mut Model) {
    for pg in nb.port_groups.values() {
        for port_uuid in &pg.ports {
            let Some(&port_index) = model.port_by_nb.get(port_uuid) else {
                Error::MissingPortGroupPort(
                    pg.name.clone(),
                    port_uuid.to_string(),
                )
                .log();
                continue;
            };
            let dp_index = model.ports[port_index].dp;
            if let DatapathKind::Switch(switch) =
                &mut model.datapaths[dp_index].kind
            {
                switch.port_groups.insert(pg.uuid);
            }
        }
    }

    for dp in &mut model.datapaths {
        let nb_uuid = dp.nb_uuid;
        let DatapathKind::Switch(switch) = &mut dp.kind else {
            continue;
        };
        switch.has_stateful_acl =
            lflow::switch::switch_acls(nb, &nb_uuid, &switch.port_groups)
                .iter()
                .any(|acl| acl.action == AclAction::AllowRelated);
        switch.has_lb_vip = nb
            .switches
            .get(&nb_uuid)
            .map(|nbs| {
                nbs.load_balancer
                    .iter()
                    .filter_map(|lb| nb.load_balancers.get(lb))
                    .any(|lb| !lb.vips.is_empty())
            })
            .unwrap_or(false);
    }
}
