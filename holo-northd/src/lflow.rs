//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
// Logical-flow program representation.
//
// A logical flow is identified by (datapath, stage, priority, match,
// actions); the identity hash is computed once at construction and kept
// with the flow, with field-by-field comparison only on collision.

pub mod router;
pub mod switch;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

// Conntrack and result register bits used by the switch pipelines.
pub const REGBIT_CONNTRACK_DEFRAG: &str = "reg0[0]";
pub const REGBIT_CONNTRACK_COMMIT: &str = "reg0[1]";
pub const REGBIT_CONNTRACK_NAT: &str = "reg0[2]";
pub const REGBIT_DHCP_OPTS_RESULT: &str = "reg0[3]";
pub const REGBIT_DNS_LOOKUP_RESULT: &str = "reg0[4]";
pub const REGBIT_ND_RA_OPTS_RESULT: &str = "reg0[5]";

// Router pipeline registers: next-hop and source-address selection plus the
// control bits carried between stages.
pub const REG_NEXT_HOP_IPV4: &str = "reg0";
pub const REG_NEXT_HOP_IPV6: &str = "xxreg0";
pub const REG_SRC_IPV4: &str = "reg1";
pub const REG_SRC_IPV6: &str = "xxreg1";
pub const REGBIT_NAT_REDIRECT: &str = "reg9[0]";
pub const REGBIT_EGRESS_LOOPBACK: &str = "reg9[1]";
pub const REGBIT_PKT_LARGER: &str = "reg9[2]";
pub const REGBIT_LOOKUP_NEIGHBOR_RESULT: &str = "reg9[4]";
pub const REGBIT_SKIP_LOOKUP_NEIGHBOR: &str = "reg9[5]";

pub const ETH_ADDR_ZERO: &str = "00:00:00:00:00:00";

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Pipeline {
    Ingress,
    Egress,
}

// A flow-table stage. The encoding packs (datapath kind, pipeline, table)
// into 16 bits; it is private and all users go through the accessors.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Stage(u16);

#[derive(Clone, Debug)]
pub struct Lflow {
    pub dp: Uuid,
    pub stage: Stage,
    pub priority: u16,
    pub match_: String,
    pub actions: String,
    // Diagnostic hint: the first 32 bits of the originating northbound
    // object's identity, as hex.
    pub hint: Option<String>,
    pub source: &'static str,
    hash: u64,
}

// The computed flow set of one reconciliation pass.
#[derive(Debug, Default)]
pub struct LflowSet {
    flows: HashSet<Lflow>,
}

// Small helper for building match and action strings piecewise.
#[derive(Debug, Default)]
pub struct DsBuilder {
    buf: String,
}

// Adds a logical flow, capturing the emitting source location.
#[macro_export]
macro_rules! lflow_add {
    ($set:expr, $dp:expr, $stage:expr, $prio:expr, $match_:expr,
     $actions:expr) => {
        $set.add(
            $dp,
            $stage,
            $prio,
            $match_,
            $actions,
            None,
            concat!(file!(), ":", line!()),
        )
    };
    ($set:expr, $dp:expr, $stage:expr, $prio:expr, $match_:expr,
     $actions:expr, $hint:expr) => {
        $set.add(
            $dp,
            $stage,
            $prio,
            $match_,
            $actions,
            Some($hint),
            concat!(file!(), ":", line!()),
        )
    };
}

// ===== impl Pipeline =====

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Ingress => "ingress",
            Pipeline::Egress => "egress",
        }
    }
}

// ===== impl Stage =====

const KIND_SWITCH: u16 = 0;
const KIND_ROUTER: u16 = 1;

impl Stage {
    const fn new(kind: u16, pipeline: Pipeline, table: u8) -> Stage {
        let pipeline = match pipeline {
            Pipeline::Ingress => 0,
            Pipeline::Egress => 1,
        };
        Stage((kind << 9) | (pipeline << 8) | table as u16)
    }

    const fn sw_in(table: u8) -> Stage {
        Stage::new(KIND_SWITCH, Pipeline::Ingress, table)
    }

    const fn sw_out(table: u8) -> Stage {
        Stage::new(KIND_SWITCH, Pipeline::Egress, table)
    }

    const fn lr_in(table: u8) -> Stage {
        Stage::new(KIND_ROUTER, Pipeline::Ingress, table)
    }

    const fn lr_out(table: u8) -> Stage {
        Stage::new(KIND_ROUTER, Pipeline::Egress, table)
    }

    // Switch ingress pipeline.
    pub const SWITCH_IN_PORT_SEC_L2: Stage = Stage::sw_in(0);
    pub const SWITCH_IN_PORT_SEC_IP: Stage = Stage::sw_in(1);
    pub const SWITCH_IN_PORT_SEC_ND: Stage = Stage::sw_in(2);
    pub const SWITCH_IN_PRE_ACL: Stage = Stage::sw_in(3);
    pub const SWITCH_IN_PRE_LB: Stage = Stage::sw_in(4);
    pub const SWITCH_IN_PRE_STATEFUL: Stage = Stage::sw_in(5);
    pub const SWITCH_IN_ACL: Stage = Stage::sw_in(6);
    pub const SWITCH_IN_QOS_MARK: Stage = Stage::sw_in(7);
    pub const SWITCH_IN_QOS_METER: Stage = Stage::sw_in(8);
    pub const SWITCH_IN_LB: Stage = Stage::sw_in(9);
    pub const SWITCH_IN_STATEFUL: Stage = Stage::sw_in(10);
    pub const SWITCH_IN_ARP_ND_RSP: Stage = Stage::sw_in(11);
    pub const SWITCH_IN_DHCP_OPTIONS: Stage = Stage::sw_in(12);
    pub const SWITCH_IN_DHCP_RESPONSE: Stage = Stage::sw_in(13);
    pub const SWITCH_IN_DNS_LOOKUP: Stage = Stage::sw_in(14);
    pub const SWITCH_IN_DNS_RESPONSE: Stage = Stage::sw_in(15);
    pub const SWITCH_IN_EXTERNAL_PORT: Stage = Stage::sw_in(16);
    pub const SWITCH_IN_L2_LKUP: Stage = Stage::sw_in(17);

    // Switch egress pipeline.
    pub const SWITCH_OUT_PRE_LB: Stage = Stage::sw_out(0);
    pub const SWITCH_OUT_PRE_ACL: Stage = Stage::sw_out(1);
    pub const SWITCH_OUT_PRE_STATEFUL: Stage = Stage::sw_out(2);
    pub const SWITCH_OUT_LB: Stage = Stage::sw_out(3);
    pub const SWITCH_OUT_ACL: Stage = Stage::sw_out(4);
    pub const SWITCH_OUT_QOS_MARK: Stage = Stage::sw_out(5);
    pub const SWITCH_OUT_QOS_METER: Stage = Stage::sw_out(6);
    pub const SWITCH_OUT_STATEFUL: Stage = Stage::sw_out(7);
    pub const SWITCH_OUT_PORT_SEC_IP: Stage = Stage::sw_out(8);
    pub const SWITCH_OUT_PORT_SEC_L2: Stage = Stage::sw_out(9);

    // Router ingress pipeline.
    pub const ROUTER_IN_ADMISSION: Stage = Stage::lr_in(0);
    pub const ROUTER_IN_LOOKUP_NEIGHBOR: Stage = Stage::lr_in(1);
    pub const ROUTER_IN_LEARN_NEIGHBOR: Stage = Stage::lr_in(2);
    pub const ROUTER_IN_IP_INPUT: Stage = Stage::lr_in(3);
    pub const ROUTER_IN_DEFRAG: Stage = Stage::lr_in(4);
    pub const ROUTER_IN_UNSNAT: Stage = Stage::lr_in(5);
    pub const ROUTER_IN_DNAT: Stage = Stage::lr_in(6);
    pub const ROUTER_IN_ND_RA_OPTIONS: Stage = Stage::lr_in(7);
    pub const ROUTER_IN_ND_RA_RESPONSE: Stage = Stage::lr_in(8);
    pub const ROUTER_IN_IP_ROUTING: Stage = Stage::lr_in(9);
    pub const ROUTER_IN_POLICY: Stage = Stage::lr_in(10);
    pub const ROUTER_IN_ARP_RESOLVE: Stage = Stage::lr_in(11);
    pub const ROUTER_IN_CHK_PKT_LEN: Stage = Stage::lr_in(12);
    pub const ROUTER_IN_LARGER_PKTS: Stage = Stage::lr_in(13);
    pub const ROUTER_IN_GW_REDIRECT: Stage = Stage::lr_in(14);
    pub const ROUTER_IN_ARP_REQUEST: Stage = Stage::lr_in(15);

    // Router egress pipeline.
    pub const ROUTER_OUT_UNDNAT: Stage = Stage::lr_out(0);
    pub const ROUTER_OUT_SNAT: Stage = Stage::lr_out(1);
    pub const ROUTER_OUT_EGR_LOOP: Stage = Stage::lr_out(2);
    pub const ROUTER_OUT_DELIVERY: Stage = Stage::lr_out(3);

    pub fn pipeline(&self) -> Pipeline {
        if self.0 & (1 << 8) == 0 {
            Pipeline::Ingress
        } else {
            Pipeline::Egress
        }
    }

    pub fn table(&self) -> u8 {
        self.0 as u8
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Stage::SWITCH_IN_PORT_SEC_L2 => "ls_in_port_sec_l2",
            Stage::SWITCH_IN_PORT_SEC_IP => "ls_in_port_sec_ip",
            Stage::SWITCH_IN_PORT_SEC_ND => "ls_in_port_sec_nd",
            Stage::SWITCH_IN_PRE_ACL => "ls_in_pre_acl",
            Stage::SWITCH_IN_PRE_LB => "ls_in_pre_lb",
            Stage::SWITCH_IN_PRE_STATEFUL => "ls_in_pre_stateful",
            Stage::SWITCH_IN_ACL => "ls_in_acl",
            Stage::SWITCH_IN_QOS_MARK => "ls_in_qos_mark",
            Stage::SWITCH_IN_QOS_METER => "ls_in_qos_meter",
            Stage::SWITCH_IN_LB => "ls_in_lb",
            Stage::SWITCH_IN_STATEFUL => "ls_in_stateful",
            Stage::SWITCH_IN_ARP_ND_RSP => "ls_in_arp_rsp",
            Stage::SWITCH_IN_DHCP_OPTIONS => "ls_in_dhcp_options",
            Stage::SWITCH_IN_DHCP_RESPONSE => "ls_in_dhcp_response",
            Stage::SWITCH_IN_DNS_LOOKUP => "ls_in_dns_lookup",
            Stage::SWITCH_IN_DNS_RESPONSE => "ls_in_dns_response",
            Stage::SWITCH_IN_EXTERNAL_PORT => "ls_in_external_port",
            Stage::SWITCH_IN_L2_LKUP => "ls_in_l2_lkup",
            Stage::SWITCH_OUT_PRE_LB => "ls_out_pre_lb",
            Stage::SWITCH_OUT_PRE_ACL => "ls_out_pre_acl",
            Stage::SWITCH_OUT_PRE_STATEFUL => "ls_out_pre_stateful",
            Stage::SWITCH_OUT_LB => "ls_out_lb",
            Stage::SWITCH_OUT_ACL => "ls_out_acl",
            Stage::SWITCH_OUT_QOS_MARK => "ls_out_qos_mark",
            Stage::SWITCH_OUT_QOS_METER => "ls_out_qos_meter",
            Stage::SWITCH_OUT_STATEFUL => "ls_out_stateful",
            Stage::SWITCH_OUT_PORT_SEC_IP => "ls_out_port_sec_ip",
            Stage::SWITCH_OUT_PORT_SEC_L2 => "ls_out_port_sec_l2",
            Stage::ROUTER_IN_ADMISSION => "lr_in_admission",
            Stage::ROUTER_IN_LOOKUP_NEIGHBOR => "lr_in_lookup_neighbor",
            Stage::ROUTER_IN_LEARN_NEIGHBOR => "lr_in_learn_neighbor",
            Stage::ROUTER_IN_IP_INPUT => "lr_in_ip_input",
            Stage::ROUTER_IN_DEFRAG => "lr_in_defrag",
            Stage::ROUTER_IN_UNSNAT => "lr_in_unsnat",
            Stage::ROUTER_IN_DNAT => "lr_in_dnat",
            Stage::ROUTER_IN_ND_RA_OPTIONS => "lr_in_nd_ra_options",
            Stage::ROUTER_IN_ND_RA_RESPONSE => "lr_in_nd_ra_response",
            Stage::ROUTER_IN_IP_ROUTING => "lr_in_ip_routing",
            Stage::ROUTER_IN_POLICY => "lr_in_policy",
            Stage::ROUTER_IN_ARP_RESOLVE => "lr_in_arp_resolve",
            Stage::ROUTER_IN_CHK_PKT_LEN => "lr_in_chk_pkt_len",
            Stage::ROUTER_IN_LARGER_PKTS => "lr_in_larger_pkts",
            Stage::ROUTER_IN_GW_REDIRECT => "lr_in_gw_redirect",
            Stage::ROUTER_IN_ARP_REQUEST => "lr_in_arp_request",
            Stage::ROUTER_OUT_UNDNAT => "lr_out_undnat",
            Stage::ROUTER_OUT_SNAT => "lr_out_snat",
            Stage::ROUTER_OUT_EGR_LOOP => "lr_out_egr_loop",
            Stage::ROUTER_OUT_DELIVERY => "lr_out_delivery",
            _ => "unknown",
        }
    }
}

// ===== impl Lflow =====

impl Lflow {
    fn compute_hash(
        dp: &Uuid,
        stage: Stage,
        priority: u16,
        match_: &str,
        actions: &str,
    ) -> u64 {
        let mut hasher = DefaultHasher::new();
        dp.hash(&mut hasher);
        stage.0.hash(&mut hasher);
        priority.hash(&mut hasher);
        match_.hash(&mut hasher);
        actions.hash(&mut hasher);
        hasher.finish()
    }

    pub fn identity_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for Lflow {
    fn eq(&self, other: &Lflow) -> bool {
        self.dp == other.dp
            && self.stage == other.stage
            && self.priority == other.priority
            && self.match_ == other.match_
            && self.actions == other.actions
    }
}

impl Eq for Lflow {}

impl Hash for Lflow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

// ===== impl LflowSet =====

impl LflowSet {
    pub fn new() -> LflowSet {
        Default::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        dp: Uuid,
        stage: Stage,
        priority: u16,
        match_: impl Into<String>,
        actions: impl Into<String>,
        hint: Option<Uuid>,
        source: &'static str,
    ) {
        let match_ = match_.into();
        let actions = actions.into();
        let hash =
            Lflow::compute_hash(&dp, stage, priority, &match_, &actions);
        self.flows.insert(Lflow {
            dp,
            stage,
            priority,
            match_,
            actions,
            hint: hint.map(uuid_hint),
            source,
            hash,
        });
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lflow> {
        self.flows.iter()
    }

    pub fn contains(
        &self,
        dp: &Uuid,
        stage: Stage,
        priority: u16,
        match_: &str,
        actions: &str,
    ) -> bool {
        let hash =
            Lflow::compute_hash(dp, stage, priority, match_, actions);
        let probe = Lflow {
            dp: *dp,
            stage,
            priority,
            match_: match_.to_owned(),
            actions: actions.to_owned(),
            hint: None,
            source: "",
            hash,
        };
        self.flows.contains(&probe)
    }
}

// First 32 bits of the originating object's identity, as eight hex digits.
fn uuid_hint(uuid: Uuid) -> String {
    let bytes = uuid.as_bytes();
    format!("{:02x}{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}

// ===== impl DsBuilder =====

impl DsBuilder {
    pub fn new() -> DsBuilder {
        Default::default()
    }

    pub fn push(&mut self, s: &str) -> &mut DsBuilder {
        self.buf.push_str(s);
        self
    }

    // Removes a trailing separator, typically ", ".
    pub fn strip_suffix(&mut self, suffix: &str) -> &mut DsBuilder {
        if self.buf.ends_with(suffix) {
            let len = self.buf.len() - suffix.len();
            self.buf.truncate(len);
        }
        self
    }

    pub fn build(self) -> String {
        self.buf
    }
}

impl std::fmt::Write for DsBuilder {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.buf.push_str(s);
        Ok(())
    }
}
