//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::debug;
use uuid::Uuid;

// Translator debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    PassStart,
    PassEnd(usize, usize),
    DatapathCreate(&'a str, u32),
    DatapathDelete(Uuid),
    PortBindingCreate(&'a str, u32),
    PortBindingDelete(&'a str),
    DynamicAddressAssign(&'a str, &'a str),
    TagAllocate(&'a str, u16),
    HaGroupSync(&'a str),
    IgmpGroupLearn(&'a str, &'a str),
    FlowsComputed(usize),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::PassStart => {
                debug!("{}", self);
            }
            Debug::PassEnd(sb_ops, nb_ops) => {
                debug!(%sb_ops, %nb_ops, "{}", self);
            }
            Debug::DatapathCreate(name, tunnel_key) => {
                debug!(%name, %tunnel_key, "{}", self);
            }
            Debug::DatapathDelete(uuid) => {
                debug!(%uuid, "{}", self);
            }
            Debug::PortBindingCreate(name, tunnel_key) => {
                debug!(%name, %tunnel_key, "{}", self);
            }
            Debug::PortBindingDelete(name) => {
                debug!(%name, "{}", self);
            }
            Debug::DynamicAddressAssign(port, addresses) => {
                debug!(%port, %addresses, "{}", self);
            }
            Debug::TagAllocate(port, tag) => {
                debug!(%port, %tag, "{}", self);
            }
            Debug::HaGroupSync(name) => {
                debug!(%name, "{}", self);
            }
            Debug::IgmpGroupLearn(datapath, address) => {
                debug!(%datapath, %address, "{}", self);
            }
            Debug::FlowsComputed(count) => {
                debug!(%count, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::PassStart => {
                write!(f, "reconciliation pass started")
            }
            Debug::PassEnd(..) => {
                write!(f, "reconciliation pass finished")
            }
            Debug::DatapathCreate(..) => {
                write!(f, "datapath binding created")
            }
            Debug::DatapathDelete(..) => {
                write!(f, "datapath binding deleted")
            }
            Debug::PortBindingCreate(..) => {
                write!(f, "port binding created")
            }
            Debug::PortBindingDelete(..) => {
                write!(f, "port binding deleted")
            }
            Debug::DynamicAddressAssign(..) => {
                write!(f, "dynamic addresses assigned")
            }
            Debug::TagAllocate(..) => {
                write!(f, "tag allocated")
            }
            Debug::HaGroupSync(..) => {
                write!(f, "HA chassis group synchronized")
            }
            Debug::IgmpGroupLearn(..) => {
                write!(f, "IGMP group learned")
            }
            Debug::FlowsComputed(..) => {
                write!(f, "logical flows computed")
            }
        }
    }
}
